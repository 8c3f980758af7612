//! crashlab - fault gate driver
//!
//! Loads the configuration, installs the build identity and then simulates
//! or triggers faults, prints the embedded identity, or inspects snapshot
//! artifacts.

mod cli;
mod faults;

use std::path::Path;

use anyhow::Context;

use cli::{Cli, Command, FaultKind};
use crashlab_app::{
    confirmer_for, install_fault_gate, load_config, load_config_from, Config, GateOptions,
};
use crashlab_core::{classify, find_tag, read_snapshot, BuildIdentity, FaultGate, TrapOutcome};

/// Build tag baked into the executable, findable with `strings` or
/// [`find_tag`] in the file and in any memory image of the process.
#[used]
#[no_mangle]
pub static CRASHLAB_BUILD_TAG: &str = concat!(
    "<<<BUILDTAG>>> Rev:",
    env!("CRASHLAB_BUILD_REVISION"),
    " Branch:",
    env!("CRASHLAB_BUILD_BRANCH"),
    " Built:",
    env!("CRASHLAB_BUILD_TIMESTAMP"),
    " <<<END_BUILDTAG>>>"
);

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    let (mut config, config_warning) = match cli.config {
        Some(ref path) => (
            load_config_from(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None,
        ),
        None => match load_config() {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        },
    };
    cli.apply_to(&mut config);

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();
    if let Some(e) = config_warning {
        log::warn!("Using default configuration: {}", e);
    }

    let identity = BuildIdentity::install(BuildIdentity::new(
        env!("CRASHLAB_BUILD_REVISION"),
        env!("CRASHLAB_BUILD_BRANCH"),
        env!("CRASHLAB_BUILD_TIMESTAMP"),
    ))?;
    log::debug!("Embedded tag: {}", CRASHLAB_BUILD_TAG);

    match cli.command {
        Command::Simulate { kind } => simulate(kind, identity, &config),
        Command::Trigger { kind } => trigger(kind, identity, &config),
        Command::Identity { verify } => print_identity(identity, verify),
        Command::Inspect { ref path } => inspect(path),
    }
}

fn gate_options(config: &Config) -> GateOptions {
    GateOptions {
        writer: config.snapshot.writer(),
        out_dir: config.snapshot.output_dir.clone(),
        resume_breakpoints: config.gate.resume_breakpoints,
    }
}

/// Feed a synthetic descriptor to a private, uninstalled gate
fn simulate(kind: FaultKind, identity: &BuildIdentity, config: &Config) -> anyhow::Result<()> {
    let options = gate_options(config);
    let gate = FaultGate::new(
        identity.clone(),
        confirmer_for(config.gate.confirm, config.gate.prompt_default),
    )
    .with_writer(options.writer)
    .with_out_dir(options.out_dir);

    let d = kind.descriptor(u64::from(std::process::id()));
    let outcome = gate.on_trap(&d)?;
    print_outcome(&outcome);

    if outcome.is_resumable() && options.resume_breakpoints {
        gate.rearm(&outcome)?;
        println!("Gate re-armed");
    }
    Ok(())
}

/// Install the gate and fault for real
fn trigger(kind: FaultKind, identity: &'static BuildIdentity, config: &Config) -> anyhow::Result<()> {
    let handle = install_fault_gate(
        identity,
        confirmer_for(config.gate.confirm, config.gate.prompt_default),
        gate_options(config),
    )?;

    kind.trigger()?;

    println!("Resumed after {:?}, gate is {:?}", kind, handle.gate().state());
    Ok(())
}

fn print_outcome(outcome: &TrapOutcome<'_>) {
    println!("{}", outcome.report.summary());
    println!("Outcome:   {:?}", outcome.disposition);
    match outcome.artifact {
        Some(ref artifact) if artifact.success => {
            println!("Snapshot:  {}", artifact.path.display());
        }
        Some(ref artifact) => println!(
            "Snapshot:  failed ({})",
            artifact.error.as_deref().unwrap_or("unknown error")
        ),
        None => println!("Snapshot:  none"),
    }
}

fn print_identity(identity: &BuildIdentity, verify: bool) -> anyhow::Result<()> {
    println!("{}", identity.tag());
    println!("Revision:  {}", identity.revision());
    println!("Branch:    {}", identity.branch());
    println!("Built:     {}", identity.timestamp());

    if verify {
        let exe = std::env::current_exe().context("Cannot locate the executable")?;
        let bytes = std::fs::read(&exe)
            .with_context(|| format!("Failed to read {}", exe.display()))?;
        match find_tag(&bytes) {
            Some(tag) if tag == identity.tag() => println!("Verified:  {}", exe.display()),
            Some(tag) => anyhow::bail!("Executable carries a different tag: {}", tag),
            None => anyhow::bail!("No build tag found in {}", exe.display()),
        }
    }
    Ok(())
}

fn inspect(path: &Path) -> anyhow::Result<()> {
    let record = read_snapshot(path)
        .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
    let d = record.descriptor();
    let report = classify(&d);

    println!("{}", record.build_tag);
    println!("Format:    {} v{}", record.format, record.format_version);
    println!("Revision:  {}", record.build.revision);
    println!("Branch:    {}", record.build.branch);
    println!("Built:     {}", record.build.timestamp);
    println!("Process:   {}", record.process_id);
    println!("Captured:  {}", record.captured_at);
    println!("{}", report.summary());
    for reg in record.registers.iter() {
        println!("  {:<8} 0x{:016X}", reg.name, reg.value);
    }
    Ok(())
}
