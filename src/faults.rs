//! Fault scenarios
//!
//! Each [`FaultKind`] can be simulated (a synthetic descriptor fed straight
//! to a gate) or triggered (a real fault raised with the platform's own
//! primitives while the gate is installed).

use std::hint::black_box;

use anyhow::bail;

use crashlab_core::{AccessKind, FaultCode, FaultDescriptor};

use crate::cli::FaultKind;

/// Fill pattern of freed heap blocks in debug allocators
const FREED_FILL: u64 = 0xFEEE_FEEE_FEEE_FEEE;

/// Typical member offset off a null base pointer
const MEMBER_OFFSET: usize = 0x18;

/// Code of an exception no category claims (a foreign language runtime's)
const FOREIGN_EXCEPTION: u32 = 0xE06D_7363;

impl FaultKind {
    /// Synthetic descriptor for this scenario, raised on `thread_id`
    pub fn descriptor(self, thread_id: u64) -> FaultDescriptor {
        let d = match self {
            FaultKind::NullDeref => FaultDescriptor::memory_access(AccessKind::Write, 0, thread_id),
            FaultKind::LowAddress => {
                FaultDescriptor::memory_access(AccessKind::Read, MEMBER_OFFSET as u64, thread_id)
            }
            FaultKind::FreedMemory => {
                FaultDescriptor::memory_access(AccessKind::Read, FREED_FILL, thread_id)
            }
            FaultKind::Execute => {
                FaultDescriptor::memory_access(AccessKind::Execute, 0x7fff_0000_1000, thread_id)
            }
            FaultKind::DivideByZero => FaultDescriptor::new(FaultCode::IntegerDivideByZero, thread_id),
            FaultKind::StackOverflow => FaultDescriptor::new(FaultCode::StackOverflow, thread_id),
            FaultKind::IllegalInstruction => {
                FaultDescriptor::new(FaultCode::IllegalInstruction, thread_id)
            }
            FaultKind::Breakpoint => FaultDescriptor::new(FaultCode::Breakpoint, thread_id),
            FaultKind::Unknown => {
                FaultDescriptor::new(FaultCode::from_raw(FOREIGN_EXCEPTION), thread_id)
            }
        };

        let pc = FaultKind::descriptor as *const () as usize as u64;
        let marker = 0u8;
        let sp = black_box(&marker) as *const u8 as u64;
        d.with_instruction_address(pc)
            .with_registers([("pc", pc), ("sp", sp)].into_iter().collect())
    }

    /// Raise this fault for real. Returns only if the gate resumed.
    pub fn trigger(self) -> anyhow::Result<()> {
        log::info!("Triggering {:?}", self);
        match self {
            FaultKind::LowAddress => {
                let target = black_box(MEMBER_OFFSET) as *const u64;
                // SAFETY: deliberately faults; the installed gate takes over.
                black_box(unsafe { std::ptr::read_volatile(target) });
            }
            FaultKind::StackOverflow => {
                black_box(recurse(0));
            }
            FaultKind::Unknown => {
                bail!("No real fault maps to an unclassified code; use `simulate unknown`")
            }
            other => platform::trigger(other)?,
        }
        Ok(())
    }
}

#[inline(never)]
fn recurse(depth: u64) -> u64 {
    let frame = black_box([depth; 64]);
    if depth == u64::MAX {
        return frame[0];
    }
    black_box(recurse(depth + 1)).wrapping_add(frame[1])
}

#[cfg(unix)]
mod platform {
    use std::hint::black_box;
    use std::io;
    use std::ptr;

    use anyhow::Context;

    use crate::cli::FaultKind;

    /// Map an anonymous read-write page; returns its address and size
    fn map_page() -> io::Result<(*mut libc::c_void, usize)> {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        // SAFETY: anonymous private mapping with no fixed address.
        let page = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if page == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok((page, size))
    }

    pub(super) fn trigger(kind: FaultKind) -> anyhow::Result<()> {
        match kind {
            FaultKind::NullDeref => {
                // Rust rejects null in its own pointer writes, so let libc
                // perform the store.
                let target = black_box(ptr::null_mut::<libc::c_void>());
                // SAFETY: deliberately faults; the installed gate takes over.
                unsafe { libc::memset(target, 0x2A, 1) };
            }
            FaultKind::FreedMemory => {
                let (page, size) = map_page().context("Failed to map a page")?;
                // SAFETY: `page` was mapped above with this size.
                if unsafe { libc::munmap(page, size) } != 0 {
                    return Err(io::Error::last_os_error()).context("Failed to unmap the page");
                }
                // SAFETY: deliberately faults on the released page.
                black_box(unsafe { ptr::read_volatile(page as *const u64) });
            }
            FaultKind::Execute => {
                let (page, _) = map_page().context("Failed to map a page")?;
                // SAFETY: deliberately faults; the page is not executable.
                let code: extern "C" fn() = unsafe { std::mem::transmute(black_box(page)) };
                code();
            }
            FaultKind::DivideByZero => raise(libc::SIGFPE)?,
            FaultKind::IllegalInstruction => raise(libc::SIGILL)?,
            FaultKind::Breakpoint => raise(libc::SIGTRAP)?,
            other => anyhow::bail!("{:?} is not raised by the platform layer", other),
        }
        Ok(())
    }

    fn raise(sig: libc::c_int) -> anyhow::Result<()> {
        // SAFETY: raise has no preconditions.
        if unsafe { libc::raise(sig) } != 0 {
            return Err(io::Error::last_os_error()).context("Failed to raise signal");
        }
        Ok(())
    }
}

#[cfg(not(unix))]
mod platform {
    use crate::cli::FaultKind;

    pub(super) fn trigger(kind: FaultKind) -> anyhow::Result<()> {
        anyhow::bail!("Triggering {:?} is only supported on Unix", kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crashlab_core::{classify, Category};

    fn category(kind: FaultKind) -> Category {
        let d = kind.descriptor(1);
        classify(&d).category
    }

    #[test]
    fn test_simulated_categories() {
        assert_eq!(category(FaultKind::NullDeref), Category::NullDereference);
        assert_eq!(category(FaultKind::LowAddress), Category::LowAddressAccess);
        assert_eq!(category(FaultKind::FreedMemory), Category::FreedOrInvalidMemory);
        assert_eq!(category(FaultKind::Execute), Category::ExecuteProtectionViolation);
        assert_eq!(category(FaultKind::DivideByZero), Category::ArithmeticFault);
        assert_eq!(category(FaultKind::StackOverflow), Category::StackOverflow);
        assert_eq!(category(FaultKind::IllegalInstruction), Category::IllegalInstruction);
        assert_eq!(category(FaultKind::Breakpoint), Category::DebugBreak);
        assert_eq!(category(FaultKind::Unknown), Category::Unclassified);
    }

    #[test]
    fn test_descriptor_carries_context() {
        let d = FaultKind::NullDeref.descriptor(42);
        assert_eq!(d.thread_id, 42);
        assert_ne!(d.instruction_address, 0);
        assert_eq!(d.registers.get("pc"), Some(d.instruction_address));
        assert!(d.registers.get("sp").is_some());
    }

    #[test]
    fn test_unknown_cannot_be_triggered() {
        assert!(FaultKind::Unknown.trigger().is_err());
    }
}
