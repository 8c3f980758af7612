//! Windows unhandled-exception filter
//!
//! The gate is consulted from a top-level exception filter. Returning
//! `EXCEPTION_EXECUTE_HANDLER` ends the process; `EXCEPTION_CONTINUE_SEARCH`
//! hands the exception to the previous filter or the system.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use winapi::shared::ntdef::LONG;
use winapi::um::errhandlingapi::SetUnhandledExceptionFilter;
use winapi::um::processthreadsapi::GetCurrentThreadId;
use winapi::um::winnt::EXCEPTION_POINTERS;
use winapi::vc::excpt::{
    EXCEPTION_CONTINUE_EXECUTION, EXCEPTION_CONTINUE_SEARCH, EXCEPTION_EXECUTE_HANDLER,
};

use crashlab_core::{
    AccessKind, Disposition, FaultCode, FaultDescriptor, FaultGate, RegisterSet,
};

use super::TrapError;

type Filter = unsafe extern "system" fn(*mut EXCEPTION_POINTERS) -> LONG;

struct Installed {
    gate: FaultGate,
    resume_breakpoints: bool,
    previous: Option<Filter>,
}

static INSTALLED: AtomicPtr<Installed> = AtomicPtr::new(ptr::null_mut());
static CLAIMED: AtomicBool = AtomicBool::new(false);

pub(super) fn install(
    gate: FaultGate,
    resume_breakpoints: bool,
) -> Result<NonNull<FaultGate>, TrapError> {
    if CLAIMED
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(TrapError::AlreadyInstalled);
    }

    let installed = Box::into_raw(Box::new(Installed {
        gate,
        resume_breakpoints,
        previous: None,
    }));
    INSTALLED.store(installed, Ordering::Release);

    // SAFETY: `on_exception` matches the filter signature and stays valid
    // for the life of the process.
    let previous = unsafe { SetUnhandledExceptionFilter(Some(on_exception)) };
    // SAFETY: `installed` is exclusively ours until the handle is dropped.
    unsafe {
        (*installed).previous = previous;
        Ok(NonNull::from(&(*installed).gate))
    }
}

pub(super) fn uninstall() {
    let installed = INSTALLED.load(Ordering::Acquire);
    if installed.is_null() {
        return;
    }
    // SAFETY: `installed` came from Box::into_raw in `install`.
    unsafe {
        SetUnhandledExceptionFilter((*installed).previous);
        INSTALLED.store(ptr::null_mut(), Ordering::Release);
        drop(Box::from_raw(installed));
    }
    CLAIMED.store(false, Ordering::Release);
}

unsafe extern "system" fn on_exception(pointers: *mut EXCEPTION_POINTERS) -> LONG {
    let installed = INSTALLED.load(Ordering::Acquire);
    if installed.is_null() || pointers.is_null() || (*pointers).ExceptionRecord.is_null() {
        return EXCEPTION_CONTINUE_SEARCH;
    }
    let installed = &*installed;

    let descriptor = describe_exception(&*pointers);
    let outcome = match installed.gate.on_trap(&descriptor) {
        Ok(outcome) => outcome,
        Err(e) => {
            log::error!("Fault gate failed: {}", e);
            return EXCEPTION_EXECUTE_HANDLER;
        }
    };

    match outcome.disposition {
        Disposition::Handled => {
            if outcome.is_resumable() && installed.resume_breakpoints && resume(&*pointers) {
                if installed.gate.rearm(&outcome).is_ok() {
                    log::info!("Resuming after {}", outcome.report.category);
                    return EXCEPTION_CONTINUE_EXECUTION;
                }
            }
            log::logger().flush();
            EXCEPTION_EXECUTE_HANDLER
        }
        Disposition::Propagated => match installed.previous {
            Some(previous) => previous(pointers),
            None => EXCEPTION_CONTINUE_SEARCH,
        },
    }
}

/// Step over the breakpoint instruction
#[cfg(target_arch = "x86_64")]
unsafe fn resume(pointers: &EXCEPTION_POINTERS) -> bool {
    if pointers.ContextRecord.is_null() {
        return false;
    }
    let record = &*pointers.ExceptionRecord;
    let context = &mut *pointers.ContextRecord;
    // int3 is one byte; Rip still points at it
    if context.Rip == record.ExceptionAddress as u64 {
        context.Rip += 1;
    }
    true
}

#[cfg(not(target_arch = "x86_64"))]
unsafe fn resume(_pointers: &EXCEPTION_POINTERS) -> bool {
    false
}

unsafe fn describe_exception(pointers: &EXCEPTION_POINTERS) -> FaultDescriptor {
    let record = &*pointers.ExceptionRecord;
    let code = FaultCode::from_raw(record.ExceptionCode);
    let mut d = FaultDescriptor::new(code, u64::from(GetCurrentThreadId()))
        .with_instruction_address(record.ExceptionAddress as u64);

    // Access violations carry [read/write/execute flag, target address]
    if code == FaultCode::AccessViolation && record.NumberParameters >= 2 {
        if let Some(access) = AccessKind::from_raw(record.ExceptionInformation[0] as u64) {
            d = d.with_access(access);
        }
        d = d.with_target(record.ExceptionInformation[1] as u64);
    }

    if !pointers.ContextRecord.is_null() {
        d = d.with_registers(registers(&*pointers.ContextRecord));
    }
    d
}

#[cfg(target_arch = "x86_64")]
fn registers(context: &winapi::um::winnt::CONTEXT) -> RegisterSet {
    [
        ("rip", context.Rip),
        ("rsp", context.Rsp),
        ("rbp", context.Rbp),
        ("rax", context.Rax),
        ("rbx", context.Rbx),
        ("rcx", context.Rcx),
        ("rdx", context.Rdx),
        ("rsi", context.Rsi),
        ("rdi", context.Rdi),
    ]
    .into_iter()
    .collect()
}

#[cfg(not(target_arch = "x86_64"))]
fn registers(_context: &winapi::um::winnt::CONTEXT) -> RegisterSet {
    RegisterSet::new()
}
