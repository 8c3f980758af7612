//! End-to-end gate tests
//!
//! Drive synthetic descriptors through a gate the way the trap layer does
//! and check the diagnosis, disposition and artifact together.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crashlab_core::{
    find_tag, read_snapshot, AccessKind, BuildIdentity, Category, DiagnosisReport, Disposition,
    FaultCode, FaultDescriptor, FaultGate, FixedPolicy, GateState, SnapshotWriter,
    UserConfirmation,
};
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn identity() -> BuildIdentity {
    BuildIdentity::new("9f8e7d6", "feature/crash-gate", "2024-05-01T10:00:00")
}

fn null_write(thread_id: u64) -> FaultDescriptor {
    let regs = [("rip", 0x55_0000_1234u64), ("rsp", 0x7ffc_1000), ("rbp", 0x7ffc_1040)]
        .into_iter()
        .collect();
    FaultDescriptor::memory_access(AccessKind::Write, 0, thread_id)
        .with_instruction_address(0x55_0000_1234)
        .with_registers(regs)
}

/// Counts how often it was asked
struct Counting {
    calls: Arc<AtomicUsize>,
    answer: bool,
}

impl UserConfirmation for Counting {
    fn confirm(&self, _report: &DiagnosisReport<'_>) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer
    }
}

#[test]
fn null_dereference_is_handled_with_artifact() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let gate = FaultGate::new(identity(), Box::new(FixedPolicy::always()))
        .with_out_dir(Some(dir.path().to_path_buf()));
    assert_eq!(gate.state(), GateState::Armed);

    let d = null_write(77);
    let outcome = gate.on_trap(&d).unwrap();

    assert_eq!(outcome.disposition, Disposition::Handled);
    assert_eq!(outcome.report.category, Category::NullDereference);
    assert!(outcome.report.message.contains("null pointer"));
    assert_eq!(gate.state(), GateState::Handled);

    let artifact = outcome.artifact.expect("snapshot attempted");
    assert!(artifact.success, "{:?}", artifact.error);
    let name = artifact.path.file_name().unwrap().to_str().unwrap();
    assert_eq!(name, "CrashDump_9f8e7d6_feature_crash-gate.dmp");

    let record = read_snapshot(&artifact.path).unwrap();
    assert_eq!(record.thread_id, 77);
    assert_eq!(record.fault_code(), FaultCode::AccessViolation);
    assert_eq!(record.registers.len(), 3);
    assert_eq!(record.build_tag, identity().tag());

    let raw = std::fs::read(&artifact.path).unwrap();
    let tag = find_tag(&raw).unwrap();
    assert_eq!(BuildIdentity::from_tag(tag), Some(identity()));
}

#[test]
fn unwritable_directory_still_handled() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("occupied");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let gate = FaultGate::new(identity(), Box::new(FixedPolicy::always()))
        .with_out_dir(Some(blocker.join("crashes")));

    let d = null_write(5);
    let outcome = gate.on_trap(&d).unwrap();

    assert_eq!(outcome.disposition, Disposition::Handled);
    assert_eq!(outcome.report.category, Category::NullDereference);
    let artifact = outcome.artifact.unwrap();
    assert!(!artifact.success);
    assert!(artifact.error.is_some());
    assert_eq!(gate.state(), GateState::Handled);
}

#[test]
fn confirmation_is_skipped_for_unclassified_faults() {
    init_logging();
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = FaultGate::new(
        identity(),
        Box::new(Counting {
            calls: calls.clone(),
            answer: true,
        }),
    );

    let d = FaultDescriptor::new(FaultCode::from_raw(0xC000_0409), 1);
    let outcome = gate.on_trap(&d).unwrap();
    assert_eq!(outcome.disposition, Disposition::Propagated);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn declined_confirmation_keeps_diagnosis() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = FaultGate::new(
        identity(),
        Box::new(Counting {
            calls: calls.clone(),
            answer: false,
        }),
    )
    .with_out_dir(Some(dir.path().to_path_buf()));

    let d = FaultDescriptor::memory_access(AccessKind::Read, 0x800, 2);
    let outcome = gate.on_trap(&d).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.disposition, Disposition::Handled);
    assert_eq!(outcome.report.category, Category::LowAddressAccess);
    assert!(outcome.artifact.is_none());
}

#[test]
fn custom_writer_names_artifact() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let gate = FaultGate::new(identity(), Box::new(FixedPolicy::always()))
        .with_writer(SnapshotWriter::new().with_prefix("GameCrash"))
        .with_out_dir(Some(dir.path().to_path_buf()));

    let first = gate.on_trap(&null_write(1)).unwrap().artifact.unwrap();
    let second = gate.on_trap(&null_write(1)).unwrap().artifact.unwrap();
    assert!(first.success && second.success);
    assert_eq!(first.path, second.path);
    assert!(first
        .path
        .ends_with("GameCrash_9f8e7d6_feature_crash-gate.dmp"));
}
