//! CLI argument parsing for crashlab

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crashlab_app::{Config, ConfirmMode};

/// crashlab - Trap process faults, diagnose them and write build-tagged snapshots
#[derive(Parser, Debug)]
#[command(name = "crashlab")]
#[command(about = "Trap process faults, diagnose them and write build-tagged snapshots")]
#[command(version)]
pub struct Cli {
    /// Config file (default: config.toml in the platform config directory)
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Directory for snapshot artifacts (overrides the config)
    #[arg(short = 'o', long = "out-dir", global = true)]
    pub out_dir: Option<PathBuf>,

    /// Log level (overrides the config; RUST_LOG wins over both)
    #[arg(long = "log-level", global = true)]
    pub log_level: Option<String>,

    /// Snapshot confirmation: always, never or prompt
    #[arg(long = "confirm", global = true)]
    pub confirm: Option<ConfirmMode>,

    /// Resume after a handled debug break
    #[arg(long = "resume-breakpoints", global = true)]
    pub resume_breakpoints: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Run a synthetic fault through the gate without faulting
    Simulate {
        #[arg(value_enum)]
        kind: FaultKind,
    },

    /// Install the gate and raise a real fault
    Trigger {
        #[arg(value_enum)]
        kind: FaultKind,
    },

    /// Print the embedded build identity
    Identity {
        /// Also check that the executable file carries the tag
        #[arg(long = "verify")]
        verify: bool,
    },

    /// Print the contents of a snapshot artifact
    Inspect {
        /// Artifact to read
        path: PathBuf,
    },
}

/// Fault scenarios understood by `simulate` and `trigger`
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    NullDeref,
    LowAddress,
    FreedMemory,
    Execute,
    DivideByZero,
    StackOverflow,
    IllegalInstruction,
    Breakpoint,
    Unknown,
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Apply command-line overrides on top of the loaded config
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(ref dir) = self.out_dir {
            config.snapshot.output_dir = Some(dir.clone());
        }
        if let Some(ref level) = self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(mode) = self.confirm {
            config.gate.confirm = mode;
        }
        if self.resume_breakpoints {
            config.gate.resume_breakpoints = true;
        }
    }
}
