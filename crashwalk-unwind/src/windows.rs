// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Stack walking on Windows via the OS virtual-unwind facility.
//!
//! Windows code generators routinely omit frame pointers, so instead of
//! chasing a chain of saved registers the walker asks the OS to compute
//! "the context of the caller of this context" from the unwind metadata
//! every module carries: `RtlLookupFunctionEntry` finds the metadata for
//! the current instruction, `RtlVirtualUnwind` applies it. Both are
//! documented as safe to call from an exception dispatcher.

use crate::visitor::FrameVisitor;
use crate::{FrameTrust, RawFrame, MAX_FRAMES};
use crashwalk::{ExecutionContext, RawContext};
use std::ffi::c_void;
use std::ptr;
use windows_sys::Win32::System::Diagnostics::Debug::{
    RtlLookupFunctionEntry, RtlVirtualUnwind, CONTEXT,
};

const UNW_FLAG_NHANDLER: u32 = 0;

#[cfg(target_arch = "x86_64")]
fn context_ip(ctx: &CONTEXT) -> u64 {
    ctx.Rip
}

#[cfg(target_arch = "x86_64")]
fn context_sp(ctx: &CONTEXT) -> u64 {
    ctx.Rsp
}

#[cfg(target_arch = "aarch64")]
fn context_ip(ctx: &CONTEXT) -> u64 {
    ctx.Pc
}

#[cfg(target_arch = "aarch64")]
fn context_sp(ctx: &CONTEXT) -> u64 {
    ctx.Sp
}

// How far to pull a return address back so it points into the call
// instruction for symbol lookups.
#[cfg(target_arch = "x86_64")]
const INSTRUCTION_ADJUST: u64 = 1;
#[cfg(target_arch = "aarch64")]
const INSTRUCTION_ADJUST: u64 = 4;

/// Walk outward from a [`RawContext::Native`] context, delivering one
/// [`RawFrame`] per frame to `visitor`.
///
/// Same contract as the portable walker: frames `[0, skip)` are computed
/// but not delivered, and the walk stops at the first of: no unwind
/// metadata for the current instruction, a null or non-advancing caller
/// context, the visitor returning `false`, or [`MAX_FRAMES`].
pub fn walk_stack<V>(context: &ExecutionContext, skip: usize, visitor: &mut V)
where
    V: FrameVisitor + ?Sized,
{
    let mut ctx: CONTEXT = match &context.raw {
        RawContext::Native(native) => native.0,
        _ => return,
    };

    let mut index = 0;
    let mut last_sp = 0;
    loop {
        let ip = context_ip(&ctx);
        let sp = context_sp(&ctx);
        if ip == 0 {
            return;
        }
        // Enforce progress, as the frame-pointer walkers do.
        if index > 0 && sp <= last_sp {
            return;
        }
        last_sp = sp;

        if index >= skip {
            let instruction = if index == 0 { ip } else { ip - INSTRUCTION_ADJUST };
            let trust = if index == 0 {
                FrameTrust::Context
            } else {
                FrameTrust::CallFrameInfo
            };
            let frame = RawFrame {
                instruction,
                stack_pointer: sp,
                trust,
            };
            if !visitor.visit_frame(&frame) {
                return;
            }
        }
        index += 1;
        if index >= MAX_FRAMES {
            return;
        }

        // Ask the OS for the caller's context.
        unsafe {
            let mut image_base = 0;
            let function_entry = RtlLookupFunctionEntry(ip, &mut image_base, ptr::null_mut());
            if function_entry.is_null() {
                // No module owns this instruction; the walk is over.
                return;
            }
            let mut handler_data: *mut c_void = ptr::null_mut();
            let mut establisher_frame = 0;
            RtlVirtualUnwind(
                UNW_FLAG_NHANDLER,
                image_base,
                ip,
                function_entry,
                &mut ctx,
                &mut handler_data,
                &mut establisher_frame,
                ptr::null_mut(),
            );
        }
    }
}
