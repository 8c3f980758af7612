//! Platform fault delivery
//!
//! Installs exactly one [`FaultGate`] behind the operating system's trap
//! mechanism: POSIX signal handlers on Unix, the unhandled-exception filter
//! on Windows. The installed gate lives behind a process-wide atomic pointer
//! owned by the platform module; [`GateHandle`] is the only way to remove it.

use std::path::PathBuf;
use std::ptr::NonNull;

use thiserror::Error;

use crashlab_core::{BuildIdentity, FaultGate, SnapshotWriter, UserConfirmation};

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use self::unix as platform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use self::windows as platform;

/// Trap installation errors
#[derive(Error, Debug)]
pub enum TrapError {
    #[error("A fault gate is already installed")]
    AlreadyInstalled,

    #[error("Failed to install fault handler: {0}")]
    Os(#[from] std::io::Error),

    #[error("Fault trapping is not supported on this platform")]
    Unsupported,
}

/// How the installed gate writes snapshots and treats debug breaks
#[derive(Debug, Clone, Default)]
pub struct GateOptions {
    pub writer: SnapshotWriter,
    /// Snapshot directory; the current directory when unset
    pub out_dir: Option<PathBuf>,
    /// Resume after a handled debug break instead of terminating
    pub resume_breakpoints: bool,
}

/// Keeps the gate installed; dropping it restores the previous handlers.
///
/// The Unix alternate signal stack belongs to the installing thread, so the
/// handle cannot leave it.
#[must_use = "dropping the handle uninstalls the fault gate"]
pub struct GateHandle {
    gate: NonNull<FaultGate>,
}

impl GateHandle {
    /// The installed gate
    pub fn gate(&self) -> &FaultGate {
        // SAFETY: the platform module keeps the gate allocated until this
        // handle is dropped.
        unsafe { self.gate.as_ref() }
    }
}

impl Drop for GateHandle {
    fn drop(&mut self) {
        platform::uninstall();
        log::debug!("Fault gate uninstalled");
    }
}

impl std::fmt::Debug for GateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateHandle")
            .field("gate", self.gate())
            .finish()
    }
}

/// Install a gate for `identity` behind the platform trap mechanism
pub fn install_fault_gate(
    identity: &'static BuildIdentity,
    confirmer: Box<dyn UserConfirmation>,
    options: GateOptions,
) -> Result<GateHandle, TrapError> {
    let gate = FaultGate::new(identity.clone(), confirmer)
        .with_writer(options.writer)
        .with_out_dir(options.out_dir);
    let gate = platform::install(gate, options.resume_breakpoints)?;
    log::info!("Fault gate installed for {}", identity.tag());
    Ok(GateHandle { gate })
}

/// Remove the gate and restore the previous handlers
pub fn uninstall_fault_gate(handle: GateHandle) {
    drop(handle);
}

#[cfg(not(any(unix, windows)))]
mod platform {
    use std::ptr::NonNull;

    use super::TrapError;
    use crashlab_core::FaultGate;

    pub(super) fn install(
        _gate: FaultGate,
        _resume_breakpoints: bool,
    ) -> Result<NonNull<FaultGate>, TrapError> {
        Err(TrapError::Unsupported)
    }

    pub(super) fn uninstall() {}
}
