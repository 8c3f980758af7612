//! Fault gate
//!
//! The gate drives one trapped fault from diagnosis to disposition:
//! classify, optionally ask for confirmation, capture a snapshot, then
//! decide whether the fault is [`Disposition::Handled`] here or
//! [`Disposition::Propagated`] to the next handler.
//!
//! It runs synchronously on the faulting thread, usually from inside a
//! signal handler or an exception filter, so it takes no locks. Threads
//! currently inside the gate are tracked in a fixed table of atomic slots;
//! a second fault on a thread already in the table is a nested fault.
//!
//! For every category except [`Category::DebugBreak`] a handled fault is
//! terminal: the trap layer ends the process and no code after the trap
//! point in the faulting thread runs again.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use thiserror::Error;

use crate::classify::{classify, Category, DiagnosisReport};
use crate::confirm::UserConfirmation;
use crate::fault::FaultDescriptor;
use crate::identity::BuildIdentity;
use crate::snapshot::{SnapshotArtifact, SnapshotWriter};

/// Maximum number of threads tracked inside the gate at once
const MAX_ACTIVE_THREADS: usize = 16;

/// Marks a free slot in the active-thread table
const NO_THREAD: u64 = u64::MAX;

/// Gate lifecycle
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Installed, waiting for a fault
    Armed = 0,
    /// A fault is being handled
    Triggered = 1,
    /// The last fault was claimed by this gate
    Handled = 2,
    /// The last fault was passed on to the next handler
    Propagated = 3,
}

impl GateState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => GateState::Armed,
            1 => GateState::Triggered,
            2 => GateState::Handled,
            _ => GateState::Propagated,
        }
    }
}

/// Final decision for one trapped fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Evidence captured; the faulting context ends here
    Handled,
    /// Not claimed; the next handler in the chain decides
    Propagated,
}

/// Everything the gate produced for one fault
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrapOutcome<'a> {
    pub disposition: Disposition,
    pub report: DiagnosisReport<'a>,
    /// `None` when no snapshot was attempted
    pub artifact: Option<SnapshotArtifact>,
}

impl TrapOutcome<'_> {
    /// Whether the host may resume the faulting thread
    pub fn is_resumable(&self) -> bool {
        self.disposition == Disposition::Handled && self.report.category.is_resumable()
    }
}

/// Gate errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("Nested fault on thread {thread_id} while its previous fault was being handled")]
    NestedFault { thread_id: u64 },

    #[error("A {category} fault is not resumable")]
    NotResumable { category: Category },
}

/// Orchestrates classification, confirmation and snapshot capture
pub struct FaultGate {
    identity: BuildIdentity,
    confirmer: Box<dyn UserConfirmation>,
    writer: SnapshotWriter,
    out_dir: Option<PathBuf>,
    state: AtomicU8,
    active: [AtomicU64; MAX_ACTIVE_THREADS],
}

impl FaultGate {
    /// Create an armed gate with the default snapshot writer
    pub fn new(identity: BuildIdentity, confirmer: Box<dyn UserConfirmation>) -> Self {
        Self {
            identity,
            confirmer,
            writer: SnapshotWriter::default(),
            out_dir: None,
            state: AtomicU8::new(GateState::Armed as u8),
            active: std::array::from_fn(|_| AtomicU64::new(NO_THREAD)),
        }
    }

    pub fn with_writer(mut self, writer: SnapshotWriter) -> Self {
        self.writer = writer;
        self
    }

    /// Directory for snapshots; the current directory when unset
    pub fn with_out_dir(mut self, out_dir: Option<PathBuf>) -> Self {
        self.out_dir = out_dir;
        self
    }

    pub fn identity(&self) -> &BuildIdentity {
        &self.identity
    }

    pub fn writer(&self) -> &SnapshotWriter {
        &self.writer
    }

    pub fn out_dir(&self) -> Option<&Path> {
        self.out_dir.as_deref()
    }

    pub fn state(&self) -> GateState {
        GateState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: GateState) {
        let previous = GateState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        log::debug!("Fault gate: {:?} -> {:?}", previous, state);
    }

    /// Handle one trapped fault.
    ///
    /// Always reaches a terminal state unless the faulting thread is already
    /// inside the gate, in which case [`GateError::NestedFault`] is returned
    /// and the caller must terminate the process.
    pub fn on_trap<'a>(&self, d: &'a FaultDescriptor) -> Result<TrapOutcome<'a>, GateError> {
        let slot = self.enter(d.thread_id)?;
        self.set_state(GateState::Triggered);

        let report = classify(d);
        log::error!(
            "Fault on thread {} at 0x{:X}: {} [{}]",
            d.thread_id,
            d.instruction_address,
            report.message,
            report.category
        );

        let (disposition, artifact) = if report.category == Category::Unclassified {
            log::warn!("{} is not claimed, passing it to the next handler", d.code);
            (Disposition::Propagated, None)
        } else if self.ask(&report) {
            let artifact = self.writer.capture(d, &self.identity, self.out_dir());
            if let Some(ref e) = artifact.error {
                log::warn!("Continuing without a snapshot: {}", e);
            }
            (Disposition::Handled, Some(artifact))
        } else {
            log::info!("Snapshot declined, keeping the diagnosis only");
            (Disposition::Handled, None)
        };

        self.set_state(match disposition {
            Disposition::Handled => GateState::Handled,
            Disposition::Propagated => GateState::Propagated,
        });
        self.leave(slot);

        Ok(TrapOutcome {
            disposition,
            report,
            artifact,
        })
    }

    /// Return to [`GateState::Armed`] after `outcome`, a resumable fault,
    /// was handled.
    ///
    /// Resumability comes from the outcome, not from the gate state, which
    /// only tracks the most recent trap. A fault still in flight on another
    /// thread keeps the gate Triggered until it settles.
    pub fn rearm(&self, outcome: &TrapOutcome<'_>) -> Result<(), GateError> {
        if !outcome.is_resumable() {
            return Err(GateError::NotResumable {
                category: outcome.report.category,
            });
        }
        for settled in [GateState::Handled, GateState::Propagated] {
            if self
                .state
                .compare_exchange(
                    settled as u8,
                    GateState::Armed as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                log::debug!("Fault gate: {:?} -> {:?}", settled, GateState::Armed);
                break;
            }
        }
        Ok(())
    }

    fn ask(&self, report: &DiagnosisReport<'_>) -> bool {
        let answer = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.confirmer.confirm(report)
        }));
        answer.unwrap_or_else(|_| {
            log::warn!("Confirmation failed, skipping the snapshot");
            false
        })
    }

    /// Record `thread_id` as inside the gate. Returns the slot index, or
    /// `None` when the table is full and the thread is handled untracked.
    fn enter(&self, thread_id: u64) -> Result<Option<usize>, GateError> {
        if self
            .active
            .iter()
            .any(|slot| slot.load(Ordering::Acquire) == thread_id)
        {
            log::error!("Nested fault on thread {}", thread_id);
            return Err(GateError::NestedFault { thread_id });
        }
        let claimed = self.active.iter().position(|slot| {
            slot.compare_exchange(NO_THREAD, thread_id, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        });
        if claimed.is_none() {
            log::warn!("Too many concurrent faults, thread {} is untracked", thread_id);
        }
        Ok(claimed)
    }

    fn leave(&self, slot: Option<usize>) {
        if let Some(index) = slot {
            self.active[index].store(NO_THREAD, Ordering::Release);
        }
    }
}

impl std::fmt::Debug for FaultGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultGate")
            .field("identity", &self.identity.tag())
            .field("writer", &self.writer)
            .field("out_dir", &self.out_dir)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::FixedPolicy;
    use crate::fault::{AccessKind, FaultCode};
    use std::sync::{Arc, Mutex, OnceLock};
    use tempfile::TempDir;

    fn identity() -> BuildIdentity {
        BuildIdentity::new("0badc0de", "main", "2024-05-01T10:00:00")
    }

    fn gate(confirm: bool, dir: &TempDir) -> FaultGate {
        FaultGate::new(identity(), Box::new(FixedPolicy(confirm)))
            .with_out_dir(Some(dir.path().to_path_buf()))
    }

    #[test]
    fn test_initial_state() {
        let dir = TempDir::new().unwrap();
        assert_eq!(gate(true, &dir).state(), GateState::Armed);
    }

    #[test]
    fn test_handled_with_snapshot() {
        let dir = TempDir::new().unwrap();
        let gate = gate(true, &dir);
        let d = FaultDescriptor::memory_access(AccessKind::Write, 0, 1);

        let outcome = gate.on_trap(&d).unwrap();
        assert_eq!(outcome.disposition, Disposition::Handled);
        assert_eq!(outcome.report.category, Category::NullDereference);
        assert!(outcome.artifact.unwrap().success);
        assert_eq!(gate.state(), GateState::Handled);
    }

    #[test]
    fn test_declined_snapshot_still_handled() {
        let dir = TempDir::new().unwrap();
        let gate = gate(false, &dir);
        let d = FaultDescriptor::new(FaultCode::IntegerDivideByZero, 1);

        let outcome = gate.on_trap(&d).unwrap();
        assert_eq!(outcome.disposition, Disposition::Handled);
        assert!(outcome.artifact.is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_unclassified_propagates() {
        let dir = TempDir::new().unwrap();
        let gate = gate(true, &dir);
        let d = FaultDescriptor::new(FaultCode::Unknown(0xE06D_7363), 1);

        let outcome = gate.on_trap(&d).unwrap();
        assert_eq!(outcome.disposition, Disposition::Propagated);
        assert_eq!(outcome.report.category, Category::Unclassified);
        assert!(outcome.artifact.is_none());
        assert_eq!(gate.state(), GateState::Propagated);
    }

    #[test]
    fn test_rearm_after_breakpoint() {
        let dir = TempDir::new().unwrap();
        let gate = gate(false, &dir);

        let d = FaultDescriptor::new(FaultCode::Breakpoint, 1);
        let outcome = gate.on_trap(&d).unwrap();
        assert!(outcome.is_resumable());
        assert_eq!(gate.state(), GateState::Handled);
        gate.rearm(&outcome).unwrap();
        assert_eq!(gate.state(), GateState::Armed);
        // re-arming an armed gate is a no-op
        gate.rearm(&outcome).unwrap();
        assert_eq!(gate.state(), GateState::Armed);
    }

    #[test]
    fn test_rearm_refused_for_fatal_fault() {
        let dir = TempDir::new().unwrap();
        let gate = gate(false, &dir);
        let d = FaultDescriptor::new(FaultCode::StackOverflow, 1);
        let outcome = gate.on_trap(&d).unwrap();
        assert!(!outcome.is_resumable());
        assert_eq!(
            gate.rearm(&outcome),
            Err(GateError::NotResumable {
                category: Category::StackOverflow
            })
        );
        assert_eq!(gate.state(), GateState::Handled);
    }

    /// Faults again on the same thread from inside the confirmation step
    struct Refaulting {
        gate: Arc<OnceLock<Arc<FaultGate>>>,
        nested: Arc<Mutex<Option<Result<Disposition, GateError>>>>,
    }

    impl UserConfirmation for Refaulting {
        fn confirm(&self, report: &DiagnosisReport<'_>) -> bool {
            let inner = FaultDescriptor::new(FaultCode::IllegalInstruction, report.descriptor.thread_id);
            if let Some(gate) = self.gate.get() {
                let result = gate.on_trap(&inner).map(|o| o.disposition);
                *self.nested.lock().unwrap() = Some(result);
            }
            false
        }
    }

    #[test]
    fn test_nested_fault_detected() {
        let slot = Arc::new(OnceLock::new());
        let nested = Arc::new(Mutex::new(None));
        let gate = Arc::new(FaultGate::new(
            identity(),
            Box::new(Refaulting {
                gate: slot.clone(),
                nested: nested.clone(),
            }),
        ));
        slot.set(gate.clone()).unwrap();

        let d = FaultDescriptor::memory_access(AccessKind::Read, 0, 99);
        let outcome = gate.on_trap(&d).unwrap();
        assert_eq!(outcome.disposition, Disposition::Handled);
        assert_eq!(
            nested.lock().unwrap().clone(),
            Some(Err(GateError::NestedFault { thread_id: 99 }))
        );

        // the thread left the gate, so a later fault is handled normally
        let again = FaultDescriptor::new(FaultCode::IntegerDivideByZero, 99);
        assert!(gate.on_trap(&again).is_ok());
    }

    struct Panicking;

    impl UserConfirmation for Panicking {
        fn confirm(&self, _report: &DiagnosisReport<'_>) -> bool {
            panic!("prompt surface went away");
        }
    }

    #[test]
    fn test_confirmation_panic_is_absorbed() {
        let gate = FaultGate::new(identity(), Box::new(Panicking));
        let d = FaultDescriptor::new(FaultCode::IllegalInstruction, 3);
        let outcome = gate.on_trap(&d).unwrap();
        assert_eq!(outcome.disposition, Disposition::Handled);
        assert!(outcome.artifact.is_none());
    }

    #[test]
    fn test_rearm_survives_later_fatal_fault() {
        let dir = TempDir::new().unwrap();
        let gate = gate(false, &dir);
        let bp = FaultDescriptor::new(FaultCode::Breakpoint, 1);
        let breakpoint = gate.on_trap(&bp).unwrap();

        // another thread's fatal fault settles before the breakpoint re-arms
        let av = FaultDescriptor::memory_access(AccessKind::Write, 0, 2);
        let fatal = gate.on_trap(&av).unwrap();
        assert!(!fatal.is_resumable());

        gate.rearm(&breakpoint).unwrap();
        assert_eq!(gate.state(), GateState::Armed);
        assert!(gate.rearm(&fatal).is_err());
    }

    #[test]
    fn test_concurrent_threads_are_independent() {
        let gate = Arc::new(FaultGate::new(identity(), Box::new(FixedPolicy::never())));
        let handles: Vec<_> = (1..=8u64)
            .map(|tid| {
                let gate = gate.clone();
                std::thread::spawn(move || {
                    let d = FaultDescriptor::memory_access(AccessKind::Read, 0x20, tid);
                    gate.on_trap(&d).map(|o| o.disposition)
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Ok(Disposition::Handled));
        }
    }
}
