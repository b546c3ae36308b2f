// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Unwind the stack of a faulting thread.
//!
//! Given an [`ExecutionContext`] captured by a fault handler, [`unwind`]
//! enumerates caller return addresses outward from the faulting instruction
//! and hands each one to a [`FrameVisitor`]. The walk itself allocates
//! nothing, takes no locks, and performs no I/O, so it can run inside a
//! signal handler or exception filter where ordinary services are off
//! limits. There is no error channel either: a stack that cannot be walked
//! simply yields a short (possibly empty) sequence of frames.
//!
//! A walk operates only on its arguments -- there is no global state --
//! so walks on different threads with their own visitors never interact.
//!
//! Two backends implement the same contract:
//!
//! * a frame-pointer walker for posix-style targets, implemented per CPU
//!   architecture and driven through a [`StackMemory`] snapshot so it never
//!   dereferences a recovered pointer directly;
//! * a virtual-unwind walker for Windows (the `windows` module) that
//!   recovers caller contexts from compiler-emitted unwind metadata, since
//!   the code generator there routinely omits frame pointers.
//!
//! Consumers that need a materialized sequence rather than callbacks use
//! [`FrameBuffer`], a fixed-capacity accumulator that also never allocates.

use crashwalk::{ExecutionContext, ModuleMap, RawContext, StackMemory};

mod aarch64;
mod unwind;
mod visitor;
#[cfg(windows)]
pub mod windows;
mod x86_64;

pub use crate::visitor::{FrameBuffer, FrameVisitor};

use crate::unwind::Unwind;

/// The hard upper bound on frames computed in one walk.
///
/// A corrupted stack can present an arbitrarily long, even cyclic, chain of
/// plausible-looking frames; the cap bounds worst-case work in a context
/// where we cannot afford to loop.
pub const MAX_FRAMES: usize = 256;

/// Indicates how a frame's instruction pointer was recovered. Since the
/// walker can resort to stack scanning, it can wind up with dubious frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTrust {
    /// Unknown.
    None,
    /// Scanned the stack, found this.
    Scan,
    /// Derived from the previous frame's frame pointer.
    FramePointer,
    /// Derived from compiler-emitted unwind metadata.
    CallFrameInfo,
    /// Given as instruction pointer in a context.
    Context,
}

impl FrameTrust {
    /// A string describing how the frame was found.
    pub fn description(&self) -> &'static str {
        match *self {
            FrameTrust::Context => "given as instruction pointer in context",
            FrameTrust::CallFrameInfo => "unwind metadata",
            FrameTrust::FramePointer => "previous frame's frame pointer",
            FrameTrust::Scan => "stack scanning",
            FrameTrust::None => "unknown",
        }
    }
}

impl Default for FrameTrust {
    fn default() -> FrameTrust {
        FrameTrust::None
    }
}

/// One level of the call stack, as delivered to a [`FrameVisitor`].
///
/// Frames are transient: the walker computes one, hands it to the visitor,
/// and forgets it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawFrame {
    /// The program counter for this frame.
    ///
    /// For the innermost frame this is the exact faulting instruction. For
    /// every other frame it is the saved return address adjusted back into
    /// the call instruction, so that a later symbol lookup reports the call
    /// site rather than the line control would resume on.
    pub instruction: u64,
    /// The stack pointer at this frame.
    pub stack_pointer: u64,
    /// How the frame was recovered.
    pub trust: FrameTrust,
}

/// Intermediate state for one unwinding step: the register snapshot that
/// describes a frame, plus how much we trust it.
#[derive(Debug, Clone)]
pub struct StackFrame {
    /// The program counter for this frame; see [`RawFrame::instruction`].
    pub instruction: u64,
    /// How this frame's context was recovered.
    pub trust: FrameTrust,
    /// The registers recovered for this frame.
    pub context: ExecutionContext,
}

impl StackFrame {
    /// Create a `StackFrame` from a register snapshot.
    pub fn from_context(context: ExecutionContext, trust: FrameTrust) -> StackFrame {
        StackFrame {
            instruction: context.get_instruction_pointer(),
            trust,
            context,
        }
    }

    fn raw(&self) -> RawFrame {
        RawFrame {
            instruction: self.instruction,
            stack_pointer: self.context.get_stack_pointer(),
            trust: self.trust,
        }
    }
}

fn get_caller_frame(
    frame: &StackFrame,
    stack_memory: Option<&StackMemory<'_>>,
    modules: &ModuleMap,
) -> Option<StackFrame> {
    let stack = stack_memory?;
    match &frame.context.raw {
        RawContext::X86_64(ctx) => ctx.get_caller_frame(frame, stack, modules),
        RawContext::Aarch64(ctx) => ctx.get_caller_frame(frame, stack, modules),
        // Native contexts are walked by the virtual unwinder instead.
        #[cfg(windows)]
        RawContext::Native(_) => None,
    }
}

/// Walk outward from `context`, delivering one [`RawFrame`] per logical
/// stack frame to `visitor`.
///
/// Frames `[0, skip)` are computed but not delivered; skipping more frames
/// than exist simply ends the walk with zero visits. The walk stops at the
/// first of: no caller frame, an invalid or non-advancing frame, the visitor
/// returning `false`, or [`MAX_FRAMES`].
///
/// This is the portable frame-pointer engine; it only reads memory through
/// `stack_memory`, so it can also be used after the fact against a stack
/// snapshot taken on another machine. Without stack memory the walk ends at
/// frame 0.
pub fn walk_stack<V>(
    context: &ExecutionContext,
    stack_memory: Option<&StackMemory<'_>>,
    modules: &ModuleMap,
    skip: usize,
    visitor: &mut V,
) where
    V: FrameVisitor + ?Sized,
{
    // Begin with the context frame, and keep asking for callers until there
    // are no more.
    let mut maybe_frame = Some(StackFrame::from_context(context.clone(), FrameTrust::Context));
    let mut index = 0;
    while let Some(frame) = maybe_frame {
        if index >= skip && !visitor.visit_frame(&frame.raw()) {
            return;
        }
        index += 1;
        if index >= MAX_FRAMES {
            return;
        }
        maybe_frame = get_caller_frame(&frame, stack_memory, modules);
    }
}

/// Unwind with the backend native to this platform.
///
/// On posix-style targets this is the frame-pointer walker; on Windows,
/// contexts wrapping the native record are walked with the OS
/// virtual-unwind facility (which reads live memory itself and ignores
/// `stack_memory` and `modules`).
#[cfg(not(windows))]
pub fn unwind<V>(
    context: &ExecutionContext,
    stack_memory: Option<&StackMemory<'_>>,
    modules: &ModuleMap,
    skip: usize,
    visitor: &mut V,
) where
    V: FrameVisitor + ?Sized,
{
    walk_stack(context, stack_memory, modules, skip, visitor)
}

/// Unwind with the backend native to this platform.
///
/// On posix-style targets this is the frame-pointer walker; on Windows,
/// contexts wrapping the native record are walked with the OS
/// virtual-unwind facility (which reads live memory itself and ignores
/// `stack_memory` and `modules`).
#[cfg(windows)]
pub fn unwind<V>(
    context: &ExecutionContext,
    stack_memory: Option<&StackMemory<'_>>,
    modules: &ModuleMap,
    skip: usize,
    visitor: &mut V,
) where
    V: FrameVisitor + ?Sized,
{
    match &context.raw {
        RawContext::Native(_) => self::windows::walk_stack(context, skip, visitor),
        _ => walk_stack(context, stack_memory, modules, skip, visitor),
    }
}

#[cfg(test)]
mod aarch64_unittest;
#[cfg(test)]
mod x86_64_unittest;
