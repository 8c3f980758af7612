//! crashlab-app: host integration for the fault gate
//!
//! Loads configuration, provides the console confirmation prompt, and
//! installs the gate behind the platform's fault delivery mechanism.

pub mod config;
pub mod confirm;
pub mod trap;

pub use config::{load_config, load_config_from, Config, ConfigError, ConfirmMode};
pub use confirm::ConsolePrompt;
pub use trap::{install_fault_gate, uninstall_fault_gate, GateHandle, GateOptions, TrapError};

use crashlab_core::{FixedPolicy, UserConfirmation};

/// Build the confirmer selected by `mode`
pub fn confirmer_for(mode: ConfirmMode, prompt_default: bool) -> Box<dyn UserConfirmation> {
    match mode {
        ConfirmMode::Always => Box::new(FixedPolicy::always()),
        ConfirmMode::Never => Box::new(FixedPolicy::never()),
        ConfirmMode::Prompt => Box::new(ConsolePrompt::stdio(prompt_default)),
    }
}
