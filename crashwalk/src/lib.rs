// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Data model for crash-time stack walking.
//!
//! This crate defines the types a fault handler hands to the unwinder:
//!
//! * [`ExecutionContext`] — a snapshot of a thread's registers at the moment
//!   of a fault, either captured portably per architecture or wrapped from
//!   the native OS context record.
//! * [`StackMemory`] — a borrowed view of the faulting thread's stack with
//!   bounds-checked typed reads.
//! * [`ModuleMap`] — the address ranges of loaded code, used to judge
//!   whether a recovered instruction pointer is plausible.
//!
//! None of these types own OS resources and none of their read paths
//! allocate, so they are usable from inside a fault handler. Capturing a
//! context in the first place (installing signal handlers or exception
//! filters) is the caller's business; this crate only adapts what the OS
//! already delivered via [`ExecutionContext::from_ucontext`] and friends.

mod context;
mod memory;
mod modules;

pub use crate::context::*;
pub use crate::memory::*;
pub use crate::modules::*;
