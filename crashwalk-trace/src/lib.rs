// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Turn captured execution contexts into readable stack traces.
//!
//! This crate sits on top of [`crashwalk_unwind`]: the walk collects raw
//! return addresses under crash-time constraints, and everything here runs
//! afterwards, free to allocate, lock, read files, and log. The usual flow:
//!
//! ```no_run
//! use crashwalk::ModuleMap;
//! use crashwalk_trace::{Symbolizer, TraceFormatter};
//! # let context: crashwalk::ExecutionContext = unimplemented!();
//! let modules = ModuleMap::from_loaded_modules();
//! let symbols = Symbolizer::new(modules.clone());
//! let formatter = TraceFormatter::new(modules, symbols);
//! let report = formatter.format_trace(&context, None);
//! ```
//!
//! Symbolication is strictly best-effort: an address nobody can resolve is
//! printed raw rather than dropped, so a trace is never silently truncated
//! by missing debug info.

mod formatter;
mod sym_file;
mod symbols;
mod trace;

pub use crate::formatter::*;
pub use crate::sym_file::{Function, PublicSymbol, SourceLine, SymbolError, SymbolFile};
pub use crate::symbols::*;
pub use crate::trace::*;
