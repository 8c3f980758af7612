//! crashlab-core: Fault classification and snapshot capture
//!
//! This crate holds the platform-independent half of the fault gate:
//! - Fault descriptors and register snapshots
//! - Classification of faults into diagnosis categories
//! - Build identity embedding and lookup
//! - Snapshot artifacts named after the build
//! - The gate state machine tying them together

pub mod classify;
pub mod confirm;
pub mod fault;
pub mod gate;
pub mod identity;
pub mod sanitize;
pub mod snapshot;

pub use classify::{classify, Category, DiagnosisReport};
pub use confirm::{FixedPolicy, UserConfirmation};
pub use fault::{AccessKind, FaultCode, FaultDescriptor, Register, RegisterSet};
pub use gate::{Disposition, FaultGate, GateError, GateState, TrapOutcome};
pub use identity::{find_tag, BuildIdentity, IdentityError};
pub use sanitize::sanitize;
pub use snapshot::{
    read_snapshot, ExistingPolicy, SnapshotArtifact, SnapshotError, SnapshotRecord, SnapshotWriter,
};
