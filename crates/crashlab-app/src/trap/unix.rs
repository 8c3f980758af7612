//! POSIX signal trap
//!
//! Synchronous fault signals are routed to the installed gate through
//! `sigaction` handlers running on an alternate signal stack, so a fault
//! caused by stack exhaustion on the installing thread can still be
//! diagnosed.
//!
//! The gate logs, allocates and writes the snapshot from inside the handler.
//! None of that is async-signal-safe; it is accepted because every handled
//! fault except a resumed debug break ends in `_exit`.

use std::io;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use libc::{c_int, c_void, siginfo_t};

use crashlab_core::{
    AccessKind, Disposition, FaultCode, FaultDescriptor, FaultGate, GateError, RegisterSet,
};

use super::TrapError;

const TRAPPED_SIGNALS: [c_int; 5] = [
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGFPE,
    libc::SIGILL,
    libc::SIGTRAP,
];

const ALT_STACK_SIZE: usize = 256 * 1024;

/// A memory fault this close to the stack pointer is a guard page hit
const STACK_OVERFLOW_WINDOW: u64 = 64 * 1024;

/// x86 page fault error code bits
const PF_WRITE: u64 = 0x2;
const PF_INSTR: u64 = 0x10;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod si_code {
    pub const FPE_INTDIV: i32 = 1;
    pub const FPE_FLTDIV: i32 = 3;
    pub const ILL_PRVOPC: i32 = 5;

    /// Sent by `kill`, `raise` or `sigqueue` rather than the CPU
    pub fn user_raised(code: i32) -> bool {
        code <= 0
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
mod si_code {
    pub const FPE_INTDIV: i32 = 7;
    pub const FPE_FLTDIV: i32 = 1;
    pub const ILL_PRVOPC: i32 = 3;

    const SI_USER: i32 = 0x10001;
    const SI_MESGQ: i32 = 0x10005;

    /// Sent by `kill`, `raise` or `sigqueue` rather than the CPU
    pub fn user_raised(code: i32) -> bool {
        code == 0 || (SI_USER..=SI_MESGQ).contains(&code)
    }
}

struct Installed {
    gate: FaultGate,
    resume_breakpoints: bool,
    previous: [libc::sigaction; TRAPPED_SIGNALS.len()],
    alt_stack: AltStack,
}

impl Installed {
    fn previous_action(&self, sig: c_int) -> Option<&libc::sigaction> {
        TRAPPED_SIGNALS
            .iter()
            .position(|&s| s == sig)
            .map(|i| &self.previous[i])
    }
}

/// The one installed gate; null when none is installed
static INSTALLED: AtomicPtr<Installed> = AtomicPtr::new(ptr::null_mut());

/// Held from the start of install until uninstall completes
static CLAIMED: AtomicBool = AtomicBool::new(false);

struct AltStack {
    _memory: Box<[u8]>,
    previous: libc::stack_t,
}

impl AltStack {
    fn install() -> io::Result<Self> {
        let mut memory = vec![0u8; ALT_STACK_SIZE].into_boxed_slice();
        let stack = libc::stack_t {
            ss_sp: memory.as_mut_ptr().cast(),
            ss_flags: 0,
            ss_size: memory.len(),
        };
        // SAFETY: zeroed stack_t is a valid out-parameter.
        let mut previous: libc::stack_t = unsafe { mem::zeroed() };
        // SAFETY: `memory` outlives the registration; `restore` runs before
        // it is freed.
        if unsafe { libc::sigaltstack(&stack, &mut previous) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            _memory: memory,
            previous,
        })
    }

    fn restore(&self) {
        // SAFETY: `previous` was returned by sigaltstack.
        if unsafe { libc::sigaltstack(&self.previous, ptr::null_mut()) } != 0 {
            log::warn!(
                "Failed to restore the previous signal stack: {}",
                io::Error::last_os_error()
            );
        }
    }
}

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

    // SAFETY: the claim above gives this call exclusive use of INSTALLED.
    let result = unsafe { install_claimed(gate, resume_breakpoints) };
    if result.is_err() {
        CLAIMED.store(false, Ordering::Release);
    }
    result
}

unsafe fn install_claimed(
    gate: FaultGate,
    resume_breakpoints: bool,
) -> Result<NonNull<FaultGate>, TrapError> {
    let mut previous: [libc::sigaction; TRAPPED_SIGNALS.len()] = mem::zeroed();
    for (&sig, slot) in TRAPPED_SIGNALS.iter().zip(previous.iter_mut()) {
        if libc::sigaction(sig, ptr::null(), slot) != 0 {
            return Err(io::Error::last_os_error().into());
        }
    }

    let alt_stack = AltStack::install()?;
    let installed = Box::into_raw(Box::new(Installed {
        gate,
        resume_breakpoints,
        previous,
        alt_stack,
    }));
    INSTALLED.store(installed, Ordering::Release);

    let mut action: libc::sigaction = mem::zeroed();
    action.sa_sigaction = on_signal as *const () as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_NODEFER;
    libc::sigemptyset(&mut action.sa_mask);

    for &sig in TRAPPED_SIGNALS.iter() {
        if libc::sigaction(sig, &action, ptr::null_mut()) != 0 {
            let err = io::Error::last_os_error();
            teardown();
            return Err(err.into());
        }
        log::debug!("Trapping signal {}", sig);
    }

    Ok(NonNull::from(&(*installed).gate))
}

pub(super) fn uninstall() {
    // SAFETY: only reached through the handle returned by a successful install.
    unsafe { teardown() };
    CLAIMED.store(false, Ordering::Release);
}

/// Restore the previous actions and stack, then free the gate
unsafe fn teardown() {
    let installed = INSTALLED.load(Ordering::Acquire);
    if installed.is_null() {
        return;
    }

    for (&sig, action) in TRAPPED_SIGNALS.iter().zip((*installed).previous.iter()) {
        if libc::sigaction(sig, action, ptr::null_mut()) != 0 {
            log::warn!(
                "Failed to restore handler for signal {}: {}",
                sig,
                io::Error::last_os_error()
            );
        }
    }
    INSTALLED.store(ptr::null_mut(), Ordering::Release);

    let installed = Box::from_raw(installed);
    installed.alt_stack.restore();
}

extern "C" fn on_signal(sig: c_int, info: *mut siginfo_t, context: *mut c_void) {
    let installed = INSTALLED.load(Ordering::Acquire);
    if installed.is_null() {
        // SAFETY: the kernel passes a valid siginfo.
        unsafe { forward(sig, info, None) };
        return;
    }
    // SAFETY: non-null INSTALLED stays valid until teardown, which restores
    // the previous handlers first.
    let installed = unsafe { &*installed };

    // SAFETY: arguments come straight from the kernel.
    let descriptor = unsafe { describe_signal(sig, info, context) };
    let outcome = match installed.gate.on_trap(&descriptor) {
        Ok(outcome) => outcome,
        Err(GateError::NestedFault { .. }) => {
            // SAFETY: _exit is async-signal-safe.
            unsafe { libc::_exit(128 + sig) }
        }
        Err(e) => {
            log::error!("Fault gate failed: {}", e);
            // SAFETY: _exit is async-signal-safe.
            unsafe { libc::_exit(128 + sig) }
        }
    };

    match outcome.disposition {
        Disposition::Handled => {
            if outcome.is_resumable() && installed.resume_breakpoints {
                match installed.gate.rearm(&outcome) {
                    Ok(()) => {
                        log::info!("Resuming after {}", outcome.report.category);
                        return;
                    }
                    Err(e) => log::warn!("Cannot resume: {}", e),
                }
            }
            log::logger().flush();
            // SAFETY: _exit is async-signal-safe.
            unsafe { libc::_exit(128 + sig) }
        }
        Disposition::Propagated => {
            // SAFETY: the kernel passes a valid siginfo.
            unsafe { forward(sig, info, installed.previous_action(sig)) }
        }
    }
}

/// Hand the signal to the previous action, or the default one.
///
/// A CPU fault re-executes the faulting instruction once the handler
/// returns, which delivers it to the restored action. A raised signal has
/// no instruction to repeat, so it is raised again.
unsafe fn forward(sig: c_int, info: *const siginfo_t, previous: Option<&libc::sigaction>) {
    match previous {
        Some(action) => {
            libc::sigaction(sig, action, ptr::null_mut());
        }
        None => {
            libc::signal(sig, libc::SIG_DFL);
        }
    }
    if info.is_null() || si_code::user_raised((*info).si_code) {
        libc::raise(sig);
    }
}

unsafe fn describe_signal(
    sig: c_int,
    info: *const siginfo_t,
    context: *mut c_void,
) -> FaultDescriptor {
    let (code, fault_address) = if info.is_null() {
        (0, 0)
    } else {
        ((*info).si_code, (*info).si_addr() as u64)
    };
    describe(
        sig,
        code,
        fault_address,
        CpuState::capture(context),
        current_thread_id(),
    )
}

/// Processor state at the fault
#[derive(Debug, Default)]
struct CpuState {
    pc: u64,
    sp: u64,
    /// x86 page fault error code, when the platform exposes it
    error_code: Option<u64>,
    registers: RegisterSet,
}

impl CpuState {
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    unsafe fn capture(context: *mut c_void) -> Self {
        // Indices into `gregs`, from <sys/ucontext.h>
        const REG_R8: usize = 0;
        const REG_RDI: usize = 8;
        const REG_RSI: usize = 9;
        const REG_RBP: usize = 10;
        const REG_RBX: usize = 11;
        const REG_RDX: usize = 12;
        const REG_RAX: usize = 13;
        const REG_RCX: usize = 14;
        const REG_RSP: usize = 15;
        const REG_RIP: usize = 16;
        const REG_EFL: usize = 17;
        const REG_ERR: usize = 19;

        if context.is_null() {
            return Self::default();
        }
        let uc = &*(context as *const libc::ucontext_t);
        let gregs = &uc.uc_mcontext.gregs;
        let reg = |i: usize| gregs[i] as u64;

        let mut registers: RegisterSet = [
            ("rip", reg(REG_RIP)),
            ("rsp", reg(REG_RSP)),
            ("rbp", reg(REG_RBP)),
            ("rax", reg(REG_RAX)),
            ("rbx", reg(REG_RBX)),
            ("rcx", reg(REG_RCX)),
            ("rdx", reg(REG_RDX)),
            ("rsi", reg(REG_RSI)),
            ("rdi", reg(REG_RDI)),
        ]
        .into_iter()
        .collect();
        for n in 0..8 {
            registers.push(format!("r{}", n + 8), reg(REG_R8 + n));
        }
        registers.push("eflags", reg(REG_EFL));

        Self {
            pc: reg(REG_RIP),
            sp: reg(REG_RSP),
            error_code: Some(reg(REG_ERR)),
            registers,
        }
    }

    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    unsafe fn capture(context: *mut c_void) -> Self {
        if context.is_null() {
            return Self::default();
        }
        let uc = &*(context as *const libc::ucontext_t);
        let mc = &uc.uc_mcontext;

        let mut registers: RegisterSet = [
            ("pc", mc.pc),
            ("sp", mc.sp),
            ("fp", mc.regs[29]),
            ("lr", mc.regs[30]),
        ]
        .into_iter()
        .collect();
        for (n, value) in mc.regs.iter().take(29).enumerate() {
            registers.push(format!("x{}", n), *value);
        }

        Self {
            pc: mc.pc,
            sp: mc.sp,
            error_code: None,
            registers,
        }
    }

    #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
    unsafe fn capture(context: *mut c_void) -> Self {
        if context.is_null() {
            return Self::default();
        }
        let uc = &*(context as *const libc::ucontext_t);
        if uc.uc_mcontext.is_null() {
            return Self::default();
        }
        let mc = &*uc.uc_mcontext;
        let ss = &mc.__ss;

        let registers: RegisterSet = [
            ("rip", ss.__rip),
            ("rsp", ss.__rsp),
            ("rbp", ss.__rbp),
            ("rax", ss.__rax),
            ("rbx", ss.__rbx),
            ("rcx", ss.__rcx),
            ("rdx", ss.__rdx),
            ("rsi", ss.__rsi),
            ("rdi", ss.__rdi),
            ("rflags", ss.__rflags),
        ]
        .into_iter()
        .collect();

        Self {
            pc: ss.__rip,
            sp: ss.__rsp,
            error_code: Some(u64::from(mc.__es.__err)),
            registers,
        }
    }

    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    unsafe fn capture(context: *mut c_void) -> Self {
        if context.is_null() {
            return Self::default();
        }
        let uc = &*(context as *const libc::ucontext_t);
        if uc.uc_mcontext.is_null() {
            return Self::default();
        }
        let ss = &(*uc.uc_mcontext).__ss;

        let mut registers: RegisterSet = [
            ("pc", ss.__pc),
            ("sp", ss.__sp),
            ("fp", ss.__fp),
            ("lr", ss.__lr),
        ]
        .into_iter()
        .collect();
        for (n, value) in ss.__x.iter().enumerate() {
            registers.push(format!("x{}", n), *value);
        }

        Self {
            pc: ss.__pc,
            sp: ss.__sp,
            error_code: None,
            registers,
        }
    }

    #[cfg(not(any(
        all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")),
        all(target_os = "macos", any(target_arch = "x86_64", target_arch = "aarch64")),
    )))]
    unsafe fn capture(_context: *mut c_void) -> Self {
        Self::default()
    }
}

fn current_thread_id() -> u64 {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        // SAFETY: gettid has no preconditions.
        unsafe { libc::syscall(libc::SYS_gettid) as u64 }
    }
    #[cfg(target_os = "macos")]
    {
        let mut tid = 0u64;
        // SAFETY: pthread_self is always a valid thread handle.
        unsafe { libc::pthread_threadid_np(libc::pthread_self(), &mut tid) };
        tid
    }
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
    {
        // SAFETY: pthread_self has no preconditions.
        unsafe { libc::pthread_self() as usize as u64 }
    }
}

/// Build the descriptor for one delivered signal
fn describe(
    sig: c_int,
    code: c_int,
    fault_address: u64,
    cpu: CpuState,
    thread_id: u64,
) -> FaultDescriptor {
    let fault = fault_code(sig, code, fault_address, cpu.sp);
    let mut d = FaultDescriptor::new(fault, thread_id)
        .with_signal(sig)
        .with_instruction_address(cpu.pc);

    if fault == FaultCode::AccessViolation && !si_code::user_raised(code) {
        d = d.with_target(fault_address);
        if let Some(access) = access_kind(fault_address, &cpu) {
            d = d.with_access(access);
        }
    }

    d.with_registers(cpu.registers)
}

fn fault_code(sig: c_int, code: c_int, fault_address: u64, sp: u64) -> FaultCode {
    let raised = si_code::user_raised(code);
    match sig {
        libc::SIGSEGV | libc::SIGBUS => {
            if !raised && near_stack_pointer(fault_address, sp) {
                FaultCode::StackOverflow
            } else {
                FaultCode::AccessViolation
            }
        }
        libc::SIGFPE => match code {
            si_code::FPE_INTDIV => FaultCode::IntegerDivideByZero,
            si_code::FPE_FLTDIV => FaultCode::FloatDivideByZero,
            _ if raised => FaultCode::IntegerDivideByZero,
            _ => FaultCode::FloatingPoint,
        },
        libc::SIGILL if code == si_code::ILL_PRVOPC => FaultCode::PrivilegedInstruction,
        libc::SIGILL => FaultCode::IllegalInstruction,
        libc::SIGTRAP => FaultCode::Breakpoint,
        other => FaultCode::Unknown(other as u32),
    }
}

fn near_stack_pointer(fault_address: u64, sp: u64) -> bool {
    sp != 0 && fault_address != 0 && fault_address.abs_diff(sp) <= STACK_OVERFLOW_WINDOW
}

fn access_kind(fault_address: u64, cpu: &CpuState) -> Option<AccessKind> {
    match cpu.error_code {
        Some(err) if err & PF_INSTR != 0 => Some(AccessKind::Execute),
        Some(err) if err & PF_WRITE != 0 => Some(AccessKind::Write),
        Some(_) => Some(AccessKind::Read),
        None if cpu.pc != 0 && cpu.pc == fault_address => Some(AccessKind::Execute),
        None => None,
    }
}
