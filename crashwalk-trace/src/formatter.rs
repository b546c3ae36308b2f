// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Drive the unwinder and assemble a printable trace.

use crashwalk::{ExecutionContext, ModuleMap, StackMemory};
use crashwalk_unwind::{unwind, FrameBuffer, RawFrame};
use tracing::trace;

use crate::symbols::SymbolProvider;
use crate::trace::{CallTrace, TraceFrame, TraceInfo};

/// How many frames one trace can hold.
const TRACE_CAPACITY: usize = crashwalk_unwind::MAX_FRAMES;

/// Produces [`CallTrace`]s from captured contexts.
///
/// An invocation moves through three stages: unwinding (addresses arrive
/// from the platform walker into a fixed buffer), symbolicating (each
/// collected address is resolved, independently and without retries), and
/// formatting. Only the first stage is bound by crash-time constraints;
/// the formatter itself is expected to run deferred, outside the fault
/// handler, where allocation and I/O are allowed again.
pub struct TraceFormatter<P: SymbolProvider> {
    modules: ModuleMap,
    symbols: P,
    skip: usize,
}

impl<P: SymbolProvider> TraceFormatter<P> {
    pub fn new(modules: ModuleMap, symbols: P) -> TraceFormatter<P> {
        TraceFormatter {
            modules,
            symbols,
            skip: 0,
        }
    }

    /// Hide the first `skip` frames of every walk.
    ///
    /// Useful when the formatter runs on the faulting thread itself and its
    /// own frames (and the fault dispatcher's) would otherwise lead every
    /// report.
    pub fn with_skip(mut self, skip: usize) -> TraceFormatter<P> {
        self.skip = skip;
        self
    }

    /// Unwind `context` and symbolicate every collected frame.
    pub fn collect(
        &self,
        context: &ExecutionContext,
        stack_memory: Option<&StackMemory<'_>>,
    ) -> CallTrace {
        let mut buffer = FrameBuffer::<TRACE_CAPACITY>::new();
        unwind(
            context,
            stack_memory,
            &self.modules,
            self.skip,
            &mut |frame: &RawFrame| buffer.push(frame),
        );
        trace!("unwound {} frames", buffer.len());

        let mut frames = Vec::with_capacity(buffer.len());
        for raw in buffer.frames() {
            frames.push(self.symbolicate(raw));
        }

        let info = if buffer.is_full() {
            TraceInfo::TruncatedAtCapacity
        } else if stack_memory.is_none() && frames.len() <= 1 {
            TraceInfo::MissingMemory
        } else {
            TraceInfo::Ok
        };
        CallTrace { frames, info }
    }

    fn symbolicate(&self, raw: &RawFrame) -> TraceFrame {
        let mut frame = TraceFrame::from_raw(raw);
        match self.symbols.resolve(raw.instruction) {
            Some(symbol) => frame.apply_symbol(symbol),
            None => trace!(
                "no symbol for {:#x}, the raw address will be emitted",
                raw.instruction
            ),
        }
        frame
    }

    /// Produce the printable trace for `context`: one line per frame,
    /// innermost first.
    ///
    /// Never fails; a context whose stack cannot be walked at all yields
    /// the `<no frames>` sentinel rather than an empty string.
    pub fn format_trace(
        &self,
        context: &ExecutionContext,
        stack_memory: Option<&StackMemory<'_>>,
    ) -> String {
        let trace = self.collect(context, stack_memory);
        let mut out = Vec::new();
        // Writing into a Vec cannot fail.
        let _ = trace.print_brief(&mut out);
        String::from_utf8_lossy(&out).into_owned()
    }
}
