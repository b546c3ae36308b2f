// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use crate::StackFrame;
use crashwalk::{ModuleMap, StackMemory};

/// A trait for register snapshots that can unwind to a caller.
pub trait Unwind {
    /// Get the caller frame of `callee`, or `None` if the walk is over.
    fn get_caller_frame(
        &self,
        callee: &StackFrame,
        stack_memory: &StackMemory<'_>,
        modules: &ModuleMap,
    ) -> Option<StackFrame>;
}
