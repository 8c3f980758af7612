//! Fault classification
//!
//! Turns a [`FaultDescriptor`] into a [`DiagnosisReport`]: a closed
//! [`Category`] used verbatim by downstream reporting, plus an advisory
//! message and remediation hint meant for humans.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::fault::{AccessKind, FaultCode, FaultDescriptor};

/// Addresses below this are treated as member offsets from a null base
pub const LOW_ADDRESS_LIMIT: u64 = 0x10000;

/// Diagnosis category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    NullDereference,
    LowAddressAccess,
    FreedOrInvalidMemory,
    ExecuteProtectionViolation,
    ArithmeticFault,
    StackOverflow,
    IllegalInstruction,
    DebugBreak,
    Unclassified,
}

impl Category {
    /// Stable name used in logs and artifacts
    pub fn as_str(self) -> &'static str {
        match self {
            Category::NullDereference => "null-dereference",
            Category::LowAddressAccess => "low-address-access",
            Category::FreedOrInvalidMemory => "freed-or-invalid-memory",
            Category::ExecuteProtectionViolation => "execute-protection-violation",
            Category::ArithmeticFault => "arithmetic-fault",
            Category::StackOverflow => "stack-overflow",
            Category::IllegalInstruction => "illegal-instruction",
            Category::DebugBreak => "debug-break",
            Category::Unclassified => "unclassified",
        }
    }

    /// Whether execution may continue after the trap
    pub fn is_resumable(self) -> bool {
        matches!(self, Category::DebugBreak)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifier output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosisReport<'a> {
    pub category: Category,
    pub message: String,
    pub hint: Option<&'static str>,
    pub descriptor: &'a FaultDescriptor,
}

impl DiagnosisReport<'_> {
    /// Multi-line summary in the layout of the console crash box
    pub fn summary(&self) -> String {
        let d = self.descriptor;
        let mut out = format!(
            "Code:      {}\nAddress:   0x{:X}\nThread:    {}\nCategory:  {}\nDiagnosis: {}",
            d.code, d.instruction_address, d.thread_id, self.category, self.message
        );
        if let Some(hint) = self.hint {
            out.push_str("\nHint:      ");
            out.push_str(hint);
        }
        out
    }
}

/// Classify a trapped fault. Never fails: unknown codes become
/// [`Category::Unclassified`].
pub fn classify(d: &FaultDescriptor) -> DiagnosisReport<'_> {
    let (category, message, hint) = match d.code {
        FaultCode::AccessViolation => classify_memory_access(d),
        FaultCode::IntegerDivideByZero => (
            Category::ArithmeticFault,
            "Integer division by zero".to_string(),
            Some("Add a zero check before the division."),
        ),
        FaultCode::FloatDivideByZero => (
            Category::ArithmeticFault,
            "Floating point division by zero".to_string(),
            Some("Check the divisor or mask floating point traps."),
        ),
        FaultCode::FloatingPoint => (
            Category::ArithmeticFault,
            "Floating point exception".to_string(),
            Some("Check for overflow or invalid operands."),
        ),
        FaultCode::StackOverflow => (
            Category::StackOverflow,
            "Stack memory exhausted".to_string(),
            Some("Look for unbounded recursion or very large stack allocations."),
        ),
        FaultCode::IllegalInstruction => (
            Category::IllegalInstruction,
            "Invalid CPU instruction".to_string(),
            Some("Function pointer error or memory corruption."),
        ),
        FaultCode::PrivilegedInstruction => (
            Category::IllegalInstruction,
            "Privileged instruction executed in user mode".to_string(),
            Some("Function pointer error or memory corruption."),
        ),
        FaultCode::Breakpoint => (
            Category::DebugBreak,
            "Debug break or assertion failure".to_string(),
            Some("Check the assert condition."),
        ),
        FaultCode::Unknown(raw) => (
            Category::Unclassified,
            format!("Unclassified fault code 0x{:08X}", raw),
            None,
        ),
    };

    DiagnosisReport {
        category,
        message,
        hint,
        descriptor: d,
    }
}

fn classify_memory_access(d: &FaultDescriptor) -> (Category, String, Option<&'static str>) {
    let Some(target) = d.target_address else {
        let message = match d.access {
            Some(access) => format!("Invalid memory access ({})", access.verb()),
            None => "Invalid memory access".to_string(),
        };
        let category = if d.access == Some(AccessKind::Execute) {
            Category::ExecuteProtectionViolation
        } else {
            Category::FreedOrInvalidMemory
        };
        return (category, message, Some("Inspect pointers used at the faulting address."));
    };

    let action = d.access.map(AccessKind::verb).unwrap_or("Access");
    let location = format!("{} at 0x{:X}", action, target);

    if target == 0 {
        (
            Category::NullDereference,
            format!("{}: null pointer dereference", location),
            Some("Check pointer initialization."),
        )
    } else if d.access == Some(AccessKind::Execute) {
        (
            Category::ExecuteProtectionViolation,
            format!("{}: executing non-executable memory", location),
            Some("Data executed as code; check function pointers and vtables."),
        )
    } else if target < LOW_ADDRESS_LIMIT {
        (
            Category::LowAddressAccess,
            format!("{}: low address, likely a member of a null base pointer", location),
            Some("The base pointer may be null while accessing a struct member."),
        )
    } else {
        (
            Category::FreedOrInvalidMemory,
            format!("{}: freed or invalid memory", location),
            Some("Check object lifetimes and dangling pointers."),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn av(access: AccessKind, target: u64) -> FaultDescriptor {
        FaultDescriptor::memory_access(access, target, 1)
    }

    #[test]
    fn test_null_write() {
        let d = av(AccessKind::Write, 0);
        let report = classify(&d);
        assert_eq!(report.category, Category::NullDereference);
        assert!(report.message.contains("null pointer"));
        assert!(report.message.starts_with("Write at 0x0"));
        assert_eq!(report.descriptor, &d);
    }

    #[test]
    fn test_low_address_read() {
        let d = av(AccessKind::Read, 0x800);
        let report = classify(&d);
        assert_eq!(report.category, Category::LowAddressAccess);
        assert!(report.message.contains("Read at 0x800"));
    }

    #[test]
    fn test_low_address_boundary() {
        assert_eq!(
            classify(&av(AccessKind::Read, 0xFFFF)).category,
            Category::LowAddressAccess
        );
        assert_eq!(
            classify(&av(AccessKind::Read, 0x10000)).category,
            Category::FreedOrInvalidMemory
        );
    }

    #[test]
    fn test_freed_memory() {
        let d = av(AccessKind::Write, 0xDDDD_DDDD_DDDD);
        let report = classify(&d);
        assert_eq!(report.category, Category::FreedOrInvalidMemory);
    }

    #[test]
    fn test_execute_violation() {
        let d = av(AccessKind::Execute, 0x7ffd_0000_1000);
        let report = classify(&d);
        assert_eq!(report.category, Category::ExecuteProtectionViolation);
        assert!(report.message.starts_with("Execute at"));
        // low target with execute access is still a protection violation
        assert_eq!(
            classify(&av(AccessKind::Execute, 0x40)).category,
            Category::ExecuteProtectionViolation
        );
        // calling through a null pointer is a null dereference
        assert_eq!(
            classify(&av(AccessKind::Execute, 0)).category,
            Category::NullDereference
        );
    }

    #[test]
    fn test_memory_access_without_parameters() {
        let d = FaultDescriptor::new(FaultCode::AccessViolation, 1);
        let report = classify(&d);
        assert_eq!(report.category, Category::FreedOrInvalidMemory);
        assert_eq!(report.message, "Invalid memory access");
    }

    #[test]
    fn test_arithmetic() {
        let d = FaultDescriptor::new(FaultCode::IntegerDivideByZero, 1);
        assert_eq!(classify(&d).category, Category::ArithmeticFault);
        let d = FaultDescriptor::new(FaultCode::FloatDivideByZero, 1);
        assert_eq!(classify(&d).category, Category::ArithmeticFault);
    }

    #[test]
    fn test_other_codes() {
        let cases = [
            (FaultCode::StackOverflow, Category::StackOverflow),
            (FaultCode::IllegalInstruction, Category::IllegalInstruction),
            (FaultCode::PrivilegedInstruction, Category::IllegalInstruction),
            (FaultCode::Breakpoint, Category::DebugBreak),
        ];
        for (code, expected) in cases {
            let d = FaultDescriptor::new(code, 1);
            let report = classify(&d);
            assert_eq!(report.category, expected, "{:?}", code);
            assert!(report.hint.is_some());
        }
    }

    #[test]
    fn test_total_over_raw_codes() {
        let known = [
            FaultCode::ACCESS_VIOLATION,
            FaultCode::INT_DIVIDE_BY_ZERO,
            FaultCode::FLT_DIVIDE_BY_ZERO,
            FaultCode::FLT_INVALID_OPERATION,
            FaultCode::STACK_OVERFLOW,
            FaultCode::ILLEGAL_INSTRUCTION,
            FaultCode::PRIV_INSTRUCTION,
            FaultCode::BREAKPOINT,
        ];
        let samples = [0u32, 1, 0xC000_0006, 0xE06D_7363, 0x4001_0005, u32::MAX];
        for raw in samples.into_iter().chain(known) {
            let d = FaultDescriptor::new(FaultCode::from_raw(raw), 1);
            let report = classify(&d);
            if known.contains(&raw) {
                assert_ne!(report.category, Category::Unclassified);
            } else {
                assert_eq!(report.category, Category::Unclassified);
                assert!(report.message.contains(&format!("{:08X}", raw)));
            }
        }
    }

    #[test]
    fn test_category_names() {
        assert_eq!(Category::NullDereference.to_string(), "null-dereference");
        assert_eq!(Category::LowAddressAccess.as_str(), "low-address-access");
        assert!(Category::DebugBreak.is_resumable());
        assert!(!Category::NullDereference.is_resumable());
    }

    #[test]
    fn test_summary_includes_hint() {
        let d = av(AccessKind::Read, 0).with_instruction_address(0x1234);
        let summary = classify(&d).summary();
        assert!(summary.contains("EXCEPTION_ACCESS_VIOLATION"));
        assert!(summary.contains("0x1234"));
        assert!(summary.contains("Check pointer initialization."));
    }
}
