// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! CPU contexts.

use std::collections::HashSet;

/// Errors encountered while adapting a foreign context record.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// The OS handed us a null context record.
    #[error("no context record was provided")]
    MissingContext,
    /// The captured registers belong to a CPU this crate cannot walk.
    #[error("unsupported CPU architecture")]
    UnsupportedCpu,
}

/// Information about which registers are valid in an [`ExecutionContext`].
///
/// The context a fault handler captures has every register; contexts derived
/// by the unwinder recover only the registers the frame step could compute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextValidity {
    /// All registers are valid.
    All,
    /// Only the named registers are valid.
    Some(HashSet<&'static str>),
}

impl ContextValidity {
    /// Whether the named register holds a meaningful value.
    pub fn contains(&self, reg: &str) -> bool {
        match self {
            ContextValidity::All => true,
            ContextValidity::Some(which) => which.contains(reg),
        }
    }
}

/// x86_64 registers relevant to stack walking.
///
/// Only the instruction pointer, the stack and frame pointers, and the
/// sysv callee-saved registers are carried; nothing in the walk reads the
/// volatile registers of a faulting thread.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ContextX86_64 {
    pub rip: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

/// aarch64 registers relevant to stack walking.
///
/// The link register is included because the innermost caller's return
/// address lives there, not on the stack.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ContextAarch64 {
    pub pc: u64,
    pub sp: u64,
    /// x29
    pub fp: u64,
    /// x30
    pub lr: u64,
}

/// The CPU-specific register snapshot.
#[derive(Debug, Clone)]
pub enum RawContext {
    X86_64(ContextX86_64),
    Aarch64(ContextAarch64),
    /// The unmodified OS context record.
    ///
    /// Virtual unwinding needs the full nonvolatile register file, so on
    /// Windows the native record is kept rather than a portable subset.
    #[cfg(windows)]
    Native(WindowsContext),
}

/// A snapshot of a thread's registers at a specific moment.
///
/// The snapshot is owned by whoever captured it (usually a signal handler or
/// exception filter); the unwinder only ever reads it.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// The raw CPU register state.
    pub raw: RawContext,
    /// Which registers are valid in `raw`.
    pub valid: ContextValidity,
}

impl ExecutionContext {
    /// Wrap a raw register snapshot, marking every register valid.
    pub fn from_raw(raw: RawContext) -> ExecutionContext {
        ExecutionContext {
            raw,
            valid: ContextValidity::All,
        }
    }

    /// The address of the faulting (or, for derived frames, calling)
    /// instruction.
    pub fn get_instruction_pointer(&self) -> u64 {
        match &self.raw {
            RawContext::X86_64(ctx) => ctx.rip,
            RawContext::Aarch64(ctx) => ctx.pc,
            #[cfg(windows)]
            RawContext::Native(ctx) => ctx.instruction_pointer(),
        }
    }

    /// The stack pointer at the moment of the snapshot.
    pub fn get_stack_pointer(&self) -> u64 {
        match &self.raw {
            RawContext::X86_64(ctx) => ctx.rsp,
            RawContext::Aarch64(ctx) => ctx.sp,
            #[cfg(windows)]
            RawContext::Native(ctx) => ctx.stack_pointer(),
        }
    }

    /// The frame pointer at the moment of the snapshot.
    pub fn get_frame_pointer(&self) -> u64 {
        match &self.raw {
            RawContext::X86_64(ctx) => ctx.rbp,
            RawContext::Aarch64(ctx) => ctx.fp,
            #[cfg(windows)]
            RawContext::Native(ctx) => ctx.frame_pointer(),
        }
    }

    /// Adapt the `ucontext_t` a posix signal handler receives as its third
    /// argument.
    ///
    /// # Safety
    ///
    /// `uc` must either be null or point to a live `ucontext_t`, which is
    /// what the OS guarantees for a handler installed with `SA_SIGINFO`.
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    pub unsafe fn from_ucontext(uc: *const libc::ucontext_t) -> Result<ExecutionContext, ContextError> {
        let uc = uc.as_ref().ok_or(ContextError::MissingContext)?;
        let gregs = &uc.uc_mcontext.gregs;
        Ok(ExecutionContext::from_raw(RawContext::X86_64(ContextX86_64 {
            rip: gregs[libc::REG_RIP as usize] as u64,
            rsp: gregs[libc::REG_RSP as usize] as u64,
            rbp: gregs[libc::REG_RBP as usize] as u64,
            rbx: gregs[libc::REG_RBX as usize] as u64,
            r12: gregs[libc::REG_R12 as usize] as u64,
            r13: gregs[libc::REG_R13 as usize] as u64,
            r14: gregs[libc::REG_R14 as usize] as u64,
            r15: gregs[libc::REG_R15 as usize] as u64,
        })))
    }

    /// Adapt the `ucontext_t` a posix signal handler receives as its third
    /// argument.
    ///
    /// # Safety
    ///
    /// `uc` must either be null or point to a live `ucontext_t`, which is
    /// what the OS guarantees for a handler installed with `SA_SIGINFO`.
    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    pub unsafe fn from_ucontext(uc: *const libc::ucontext_t) -> Result<ExecutionContext, ContextError> {
        let uc = uc.as_ref().ok_or(ContextError::MissingContext)?;
        let mc = &uc.uc_mcontext;
        Ok(ExecutionContext::from_raw(RawContext::Aarch64(ContextAarch64 {
            pc: mc.pc,
            sp: mc.sp,
            fp: mc.regs[29],
            lr: mc.regs[30],
        })))
    }
}

#[cfg(windows)]
pub use self::windows::WindowsContext;

#[cfg(windows)]
mod windows {
    use super::{ContextError, ExecutionContext, RawContext};
    use windows_sys::Win32::System::Diagnostics::Debug::{CONTEXT, EXCEPTION_POINTERS};

    /// The native Windows `CONTEXT` record for the target architecture.
    ///
    /// `CONTEXT` demands 16-byte alignment, which the wrapper re-states so a
    /// copied-out value stays usable with the virtual-unwind APIs.
    #[repr(C, align(16))]
    #[derive(Clone, Copy)]
    pub struct WindowsContext(pub CONTEXT);

    impl std::fmt::Debug for WindowsContext {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("WindowsContext")
                .field("ip", &self.instruction_pointer())
                .field("sp", &self.stack_pointer())
                .finish()
        }
    }

    impl WindowsContext {
        #[cfg(target_arch = "x86_64")]
        pub fn instruction_pointer(&self) -> u64 {
            self.0.Rip
        }

        #[cfg(target_arch = "x86_64")]
        pub fn stack_pointer(&self) -> u64 {
            self.0.Rsp
        }

        #[cfg(target_arch = "x86_64")]
        pub fn frame_pointer(&self) -> u64 {
            self.0.Rbp
        }

        #[cfg(target_arch = "aarch64")]
        pub fn instruction_pointer(&self) -> u64 {
            self.0.Pc
        }

        #[cfg(target_arch = "aarch64")]
        pub fn stack_pointer(&self) -> u64 {
            self.0.Sp
        }

        #[cfg(target_arch = "aarch64")]
        pub fn frame_pointer(&self) -> u64 {
            unsafe { self.0.Anonymous.Anonymous.Fp }
        }
    }

    impl ExecutionContext {
        /// Snapshot the context record of a structured exception.
        ///
        /// # Safety
        ///
        /// `info` must either be null or point to the `EXCEPTION_POINTERS`
        /// the OS passed to a vectored/unhandled exception filter; the
        /// context record is copied out before the filter returns.
        pub unsafe fn from_exception_pointers(
            info: *const EXCEPTION_POINTERS,
        ) -> Result<ExecutionContext, ContextError> {
            let info = info.as_ref().ok_or(ContextError::MissingContext)?;
            let ctx = info.ContextRecord.as_ref().ok_or(ContextError::MissingContext)?;
            Ok(ExecutionContext::from_windows_context(ctx))
        }

        /// Wrap a native `CONTEXT` record (copying it).
        pub fn from_windows_context(ctx: &CONTEXT) -> ExecutionContext {
            ExecutionContext::from_raw(RawContext::Native(WindowsContext(*ctx)))
        }
    }
}
