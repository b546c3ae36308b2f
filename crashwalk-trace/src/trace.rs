// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! The formatted-trace data model.

use std::io;
use std::io::prelude::*;

use crashwalk_unwind::{FrameTrust, RawFrame};
use serde_json::json;

use crate::symbols::{basename, FrameSymbol};

/// Information about the results of producing a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceInfo {
    /// Everything went great.
    Ok,
    /// No stack memory was provided, so nothing past the context frame
    /// could be recovered.
    MissingMemory,
    /// The walk filled the collection buffer; deeper frames were dropped.
    TruncatedAtCapacity,
}

/// A single stack frame, symbolicated as far as possible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    /// The program counter location as an absolute virtual address.
    ///
    /// For the innermost frame this is the exact faulting instruction; for
    /// every other frame it points within the call instruction that created
    /// its callee, so the source lookup names the call site.
    pub instruction: u64,
    /// The stack pointer at this frame.
    pub stack_pointer: u64,
    /// Amount of trust the walker has in the instruction pointer of this
    /// frame.
    pub trust: FrameTrust,
    /// The name of the module the instruction lives in, if known.
    pub module: Option<String>,
    /// The module's load address.
    pub module_base: Option<u64>,
    /// The function name, omitted when debug symbols don't cover the
    /// address.
    pub function: Option<String>,
    /// The start address of the function.
    pub function_base: Option<u64>,
    /// The source file name that produced the instruction.
    pub source_file: Option<String>,
    /// The (1-based) source line number.
    pub source_line: Option<u32>,
}

impl TraceFrame {
    /// Create a `TraceFrame` from a delivered frame, with no symbol
    /// information yet.
    pub fn from_raw(raw: &RawFrame) -> TraceFrame {
        TraceFrame {
            instruction: raw.instruction,
            stack_pointer: raw.stack_pointer,
            trust: raw.trust,
            module: None,
            module_base: None,
            function: None,
            function_base: None,
            source_file: None,
            source_line: None,
        }
    }

    pub(crate) fn apply_symbol(&mut self, symbol: FrameSymbol) {
        self.module = symbol.module;
        self.module_base = symbol.module_base;
        self.function = symbol.function;
        self.function_base = symbol.function_base;
        self.source_file = symbol.source_file;
        self.source_line = symbol.source_line;
    }

    /// One human-readable line for this frame, without the index column.
    ///
    /// The most detailed of these forms the available information allows:
    ///
    /// ```text
    /// app!doWork (x.cc:42)
    /// app!doWork + 0x12
    /// app + 0x1012
    /// 0x7400c0001012
    /// ```
    pub fn describe(&self) -> String {
        match (&self.module, &self.function) {
            (Some(module), Some(function)) => {
                if let (Some(file), Some(line)) = (&self.source_file, self.source_line) {
                    format!("{}!{} ({}:{})", module, function, basename(file), line)
                } else {
                    let offset = self.function_base.map(|base| self.instruction - base);
                    match offset {
                        Some(offset) => format!("{}!{} + {:#x}", module, function, offset),
                        None => format!("{}!{}", module, function),
                    }
                }
            }
            (Some(module), None) => match self.module_base {
                Some(base) => format!("{} + {:#x}", module, self.instruction - base),
                None => format!("{}", module),
            },
            _ => format!("{:#x}", self.instruction),
        }
    }
}

/// A symbolicated stack, innermost frame first.
#[derive(Debug, Clone)]
pub struct CallTrace {
    /// The frames, in delivery order.
    pub frames: Vec<TraceFrame>,
    /// Information about this trace.
    pub info: TraceInfo,
}

impl CallTrace {
    /// Write the one-line-per-frame form of the trace to `f`.
    ///
    /// Every delivered frame produces exactly one line; a frame nothing
    /// could symbolicate is printed as its raw address rather than dropped.
    pub fn print_brief<T: Write>(&self, f: &mut T) -> io::Result<()> {
        if self.frames.is_empty() {
            writeln!(f, "<no frames>")?;
        }
        for (i, frame) in self.frames.iter().enumerate() {
            writeln!(f, "{:2}  {}", i, frame.describe())?;
        }
        Ok(())
    }

    /// Write a verbose description of the trace to `f`, annotating each
    /// frame with how the walker found it.
    pub fn print<T: Write>(&self, f: &mut T) -> io::Result<()> {
        if self.frames.is_empty() {
            writeln!(f, "<no frames>")?;
        }
        for (i, frame) in self.frames.iter().enumerate() {
            writeln!(f, "{:2}  {}", i, frame.describe())?;
            writeln!(f, "    Found by: {}", frame.trust.description())?;
        }
        Ok(())
    }

    /// Write the trace as JSON, one object per frame.
    pub fn print_json<T: Write>(&self, f: &mut T, pretty: bool) -> Result<(), serde_json::Error> {
        let frames: Vec<serde_json::Value> = self
            .frames
            .iter()
            .enumerate()
            .map(|(i, frame)| {
                json!({
                    "frame": i,
                    "instruction": format!("{:#018x}", frame.instruction),
                    "trust": trust_json_name(frame.trust),
                    "module": frame.module.clone(),
                    "function": frame.function.clone(),
                    "file": frame.source_file.clone(),
                    "line": frame.source_line,
                })
            })
            .collect();
        let output = json!({
            "truncated": self.info == TraceInfo::TruncatedAtCapacity,
            "frames": frames,
        });

        if pretty {
            serde_json::to_writer_pretty(f, &output)
        } else {
            serde_json::to_writer(f, &output)
        }
    }
}

fn trust_json_name(trust: FrameTrust) -> &'static str {
    match trust {
        FrameTrust::Context => "context",
        FrameTrust::CallFrameInfo => "cfi",
        FrameTrust::FramePointer => "frame_pointer",
        FrameTrust::Scan => "scan",
        FrameTrust::None => "none",
    }
}
