//! Fault descriptors
//!
//! A [`FaultDescriptor`] is the immutable record the trap layer builds when
//! the platform reports a fault. Codes use the structured-exception
//! numbering; Unix signals are mapped onto the same codes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of trapped fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultCode {
    /// Read, write or execute of memory the process may not touch
    AccessViolation,
    IntegerDivideByZero,
    FloatDivideByZero,
    /// Any other floating point trap (overflow, invalid operation, ...)
    FloatingPoint,
    StackOverflow,
    IllegalInstruction,
    PrivilegedInstruction,
    Breakpoint,
    /// A raw code with no known meaning
    Unknown(u32),
}

impl FaultCode {
    pub const ACCESS_VIOLATION: u32 = 0xC000_0005;
    pub const INT_DIVIDE_BY_ZERO: u32 = 0xC000_0094;
    pub const FLT_DIVIDE_BY_ZERO: u32 = 0xC000_008E;
    pub const FLT_INVALID_OPERATION: u32 = 0xC000_0090;
    pub const STACK_OVERFLOW: u32 = 0xC000_00FD;
    pub const ILLEGAL_INSTRUCTION: u32 = 0xC000_001D;
    pub const PRIV_INSTRUCTION: u32 = 0xC000_0096;
    pub const BREAKPOINT: u32 = 0x8000_0003;

    /// Map a raw code; every value is representable
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            Self::ACCESS_VIOLATION => FaultCode::AccessViolation,
            Self::INT_DIVIDE_BY_ZERO => FaultCode::IntegerDivideByZero,
            Self::FLT_DIVIDE_BY_ZERO => FaultCode::FloatDivideByZero,
            Self::FLT_INVALID_OPERATION => FaultCode::FloatingPoint,
            Self::STACK_OVERFLOW => FaultCode::StackOverflow,
            Self::ILLEGAL_INSTRUCTION => FaultCode::IllegalInstruction,
            Self::PRIV_INSTRUCTION => FaultCode::PrivilegedInstruction,
            Self::BREAKPOINT => FaultCode::Breakpoint,
            other => FaultCode::Unknown(other),
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            FaultCode::AccessViolation => Self::ACCESS_VIOLATION,
            FaultCode::IntegerDivideByZero => Self::INT_DIVIDE_BY_ZERO,
            FaultCode::FloatDivideByZero => Self::FLT_DIVIDE_BY_ZERO,
            FaultCode::FloatingPoint => Self::FLT_INVALID_OPERATION,
            FaultCode::StackOverflow => Self::STACK_OVERFLOW,
            FaultCode::IllegalInstruction => Self::ILLEGAL_INSTRUCTION,
            FaultCode::PrivilegedInstruction => Self::PRIV_INSTRUCTION,
            FaultCode::Breakpoint => Self::BREAKPOINT,
            FaultCode::Unknown(raw) => raw,
        }
    }

    /// Symbolic name, e.g. `EXCEPTION_ACCESS_VIOLATION`
    pub fn name(self) -> &'static str {
        match self {
            FaultCode::AccessViolation => "EXCEPTION_ACCESS_VIOLATION",
            FaultCode::IntegerDivideByZero => "EXCEPTION_INT_DIVIDE_BY_ZERO",
            FaultCode::FloatDivideByZero => "EXCEPTION_FLT_DIVIDE_BY_ZERO",
            FaultCode::FloatingPoint => "EXCEPTION_FLT_INVALID_OPERATION",
            FaultCode::StackOverflow => "EXCEPTION_STACK_OVERFLOW",
            FaultCode::IllegalInstruction => "EXCEPTION_ILLEGAL_INSTRUCTION",
            FaultCode::PrivilegedInstruction => "EXCEPTION_PRIV_INSTRUCTION",
            FaultCode::Breakpoint => "EXCEPTION_BREAKPOINT",
            FaultCode::Unknown(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:08X})", self.name(), self.raw())
    }
}

/// How the faulting instruction touched memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

impl AccessKind {
    /// Decode the first parameter of an access-violation record
    /// (0 = read, 1 = write, 8 = execute)
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(AccessKind::Read),
            1 => Some(AccessKind::Write),
            8 => Some(AccessKind::Execute),
            _ => None,
        }
    }

    pub fn verb(self) -> &'static str {
        match self {
            AccessKind::Read => "Read",
            AccessKind::Write => "Write",
            AccessKind::Execute => "Execute",
        }
    }
}

/// A single saved register
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Register {
    pub name: String,
    pub value: u64,
}

/// Register state of the faulting thread, in capture order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegisterSet(Vec<Register>);

impl RegisterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: u64) {
        self.0.push(Register {
            name: name.into(),
            value,
        });
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.0.iter().find(|r| r.name == name).map(|r| r.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Register> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<N: Into<String>> FromIterator<(N, u64)> for RegisterSet {
    fn from_iter<I: IntoIterator<Item = (N, u64)>>(iter: I) -> Self {
        let mut set = RegisterSet::new();
        for (name, value) in iter {
            set.push(name, value);
        }
        set
    }
}

/// Immutable record of one trapped fault
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultDescriptor {
    pub code: FaultCode,
    /// Address of the faulting instruction
    pub instruction_address: u64,
    /// Access kind, for memory-access faults when the platform reports it
    pub access: Option<AccessKind>,
    /// Address the instruction tried to touch, for memory-access faults
    pub target_address: Option<u64>,
    /// Originating signal number, when trapped through a POSIX signal
    pub signal: Option<i32>,
    pub registers: RegisterSet,
    pub thread_id: u64,
}

impl FaultDescriptor {
    /// Start a descriptor for `code` raised on `thread_id`
    pub fn new(code: FaultCode, thread_id: u64) -> Self {
        Self {
            code,
            instruction_address: 0,
            access: None,
            target_address: None,
            signal: None,
            registers: RegisterSet::new(),
            thread_id,
        }
    }

    /// Memory-access fault touching `target` with `access`
    pub fn memory_access(access: AccessKind, target: u64, thread_id: u64) -> Self {
        Self::new(FaultCode::AccessViolation, thread_id)
            .with_access(access)
            .with_target(target)
    }

    pub fn with_instruction_address(mut self, address: u64) -> Self {
        self.instruction_address = address;
        self
    }

    pub fn with_access(mut self, access: AccessKind) -> Self {
        self.access = Some(access);
        self
    }

    pub fn with_target(mut self, target: u64) -> Self {
        self.target_address = Some(target);
        self
    }

    pub fn with_signal(mut self, signal: i32) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_registers(mut self, registers: RegisterSet) -> Self {
        self.registers = registers;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_codes_round_trip() {
        for code in [
            FaultCode::AccessViolation,
            FaultCode::IntegerDivideByZero,
            FaultCode::FloatDivideByZero,
            FaultCode::FloatingPoint,
            FaultCode::StackOverflow,
            FaultCode::IllegalInstruction,
            FaultCode::PrivilegedInstruction,
            FaultCode::Breakpoint,
        ] {
            assert_eq!(FaultCode::from_raw(code.raw()), code);
        }
    }

    #[test]
    fn test_unknown_code_is_representable() {
        let code = FaultCode::from_raw(0xE06D_7363);
        assert_eq!(code, FaultCode::Unknown(0xE06D_7363));
        assert_eq!(code.raw(), 0xE06D_7363);
        assert_eq!(code.to_string(), "UNKNOWN (0xE06D7363)");
    }

    #[test]
    fn test_display() {
        assert_eq!(
            FaultCode::AccessViolation.to_string(),
            "EXCEPTION_ACCESS_VIOLATION (0xC0000005)"
        );
    }

    #[test]
    fn test_access_kind_from_raw() {
        assert_eq!(AccessKind::from_raw(0), Some(AccessKind::Read));
        assert_eq!(AccessKind::from_raw(1), Some(AccessKind::Write));
        assert_eq!(AccessKind::from_raw(8), Some(AccessKind::Execute));
        assert_eq!(AccessKind::from_raw(3), None);
    }

    #[test]
    fn test_register_set() {
        let regs: RegisterSet = [("rip", 0x1000u64), ("rsp", 0x7ff0)].into_iter().collect();
        assert_eq!(regs.len(), 2);
        assert_eq!(regs.get("rsp"), Some(0x7ff0));
        assert_eq!(regs.get("rax"), None);
        let names: Vec<&str> = regs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["rip", "rsp"]);
    }

    #[test]
    fn test_descriptor_builder() {
        let d = FaultDescriptor::memory_access(AccessKind::Write, 0, 42)
            .with_instruction_address(0x4010)
            .with_signal(11);
        assert_eq!(d.code, FaultCode::AccessViolation);
        assert_eq!(d.access, Some(AccessKind::Write));
        assert_eq!(d.target_address, Some(0));
        assert_eq!(d.instruction_address, 0x4010);
        assert_eq!(d.signal, Some(11));
        assert_eq!(d.thread_id, 42);
    }
}
