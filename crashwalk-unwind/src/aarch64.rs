// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use crate::unwind::Unwind;
use crate::{FrameTrust, StackFrame};
use crashwalk::{ContextAarch64, ContextValidity, ExecutionContext, ModuleMap, RawContext, StackMemory};
use std::collections::HashSet;

type Pointer = u64;
const POINTER_WIDTH: Pointer = 8;
const PROGRAM_COUNTER: &str = "pc";
const STACK_POINTER: &str = "sp";
const FRAME_POINTER: &str = "fp";
const LINK_REGISTER: &str = "lr";

fn get_caller_by_frame_pointer(
    ctx: &ContextAarch64,
    valid: &ContextValidity,
    stack_memory: &StackMemory<'_>,
    modules: &ModuleMap,
) -> Option<StackFrame> {
    // Assume the standard aarch64 frame-record convention is in use. The
    // quirk of this ABI is that the return address never needs to be read
    // from the stack for the innermost frame -- it's already in the link
    // register -- but lr itself gets saved in the frame record so that the
    // *caller's* return address can be recovered:
    //
    //   pc := lr
    //   sp := fp + ptr*2
    //   lr := *(fp + ptr)
    //   fp := *fp
    if !valid.contains(FRAME_POINTER) || !valid.contains(STACK_POINTER) {
        return None;
    }
    if !valid.contains(LINK_REGISTER) {
        return None;
    }
    let last_fp = ctx.fp;
    let last_sp = ctx.sp;
    let last_lr = ctx.lr;

    if last_fp >= u64::MAX - POINTER_WIDTH * 2 {
        // The code below would wrap around; a frame pointer this high up is
        // garbage anyway.
        return None;
    }

    let (caller_fp, caller_lr, caller_sp) = if last_fp == 0 {
        // A zero frame pointer is the end of the chain; produce a frame
        // whose stack pointer fails the progress check so the walk stops.
        (0, 0, last_sp)
    } else {
        (
            stack_memory.get_memory_at_address(last_fp)?,
            stack_memory.get_memory_at_address(last_fp + POINTER_WIDTH)?,
            last_fp + POINTER_WIDTH * 2,
        )
    };
    let caller_pc = last_lr;

    // Don't accept obviously wrong instruction pointers.
    if is_non_canonical(caller_pc) {
        return None;
    }
    if last_fp != 0 && !instruction_seems_valid(caller_pc, modules) {
        return None;
    }

    let caller_ctx = ContextAarch64 {
        pc: caller_pc,
        sp: caller_sp,
        fp: caller_fp,
        lr: caller_lr,
    };
    let mut valid = HashSet::new();
    valid.insert(PROGRAM_COUNTER);
    valid.insert(STACK_POINTER);
    valid.insert(FRAME_POINTER);
    valid.insert(LINK_REGISTER);
    let context = ExecutionContext {
        raw: RawContext::Aarch64(caller_ctx),
        valid: ContextValidity::Some(valid),
    };
    let mut frame = StackFrame::from_context(context, FrameTrust::FramePointer);
    adjust_instruction(&mut frame, caller_pc);
    Some(frame)
}

fn get_caller_by_scan(
    ctx: &ContextAarch64,
    valid: &ContextValidity,
    trust: FrameTrust,
    stack_memory: &StackMemory<'_>,
    modules: &ModuleMap,
) -> Option<StackFrame> {
    // Walk up from the end of the frame looking for a value that's an
    // address inside one of our modules, and assume it's a return address
    // spilled by the callee's prologue.
    if !valid.contains(STACK_POINTER) {
        return None;
    }
    let last_sp = ctx.sp;

    let default_scan_range = 40;
    let extended_scan_range = default_scan_range * 4;

    let scan_range = if let FrameTrust::Context = trust {
        extended_scan_range
    } else {
        default_scan_range
    };

    for i in 0..scan_range {
        let address_of_pc = last_sp.checked_add(i * POINTER_WIDTH)?;
        let caller_pc = stack_memory.get_memory_at_address(address_of_pc)?;
        if instruction_seems_valid(caller_pc, modules) {
            let caller_sp = address_of_pc.checked_add(POINTER_WIDTH)?;

            let caller_ctx = ContextAarch64 {
                pc: caller_pc,
                sp: caller_sp,
                fp: 0,
                lr: 0,
            };
            let mut valid = HashSet::new();
            valid.insert(PROGRAM_COUNTER);
            valid.insert(STACK_POINTER);
            let context = ExecutionContext {
                raw: RawContext::Aarch64(caller_ctx),
                valid: ContextValidity::Some(valid),
            };
            let mut frame = StackFrame::from_context(context, FrameTrust::Scan);
            adjust_instruction(&mut frame, caller_pc);
            return Some(frame);
        }
    }

    None
}

fn instruction_seems_valid(instruction: Pointer, modules: &ModuleMap) -> bool {
    if is_non_canonical(instruction) {
        return false;
    }
    modules.module_at_address(instruction).is_some()
}

fn adjust_instruction(frame: &mut StackFrame, caller_pc: Pointer) {
    // A caller's pc is the return address, one instruction past the branch
    // that got us into the callee. aarch64 instructions are 4 bytes wide,
    // so point back into the branch itself for symbol lookups.
    if caller_pc >= 4 {
        frame.instruction = caller_pc - 4;
    }
}

fn is_non_canonical(ptr: Pointer) -> bool {
    // aarch64 kernels hand out user addresses from a 48-bit space with the
    // high bits clear (or all set, for kernel addresses).
    ptr > 0x7FFF_FFFF_FFFF && ptr < 0xFFFF_8000_0000_0000
}

impl Unwind for ContextAarch64 {
    fn get_caller_frame(
        &self,
        callee: &StackFrame,
        stack_memory: &StackMemory<'_>,
        modules: &ModuleMap,
    ) -> Option<StackFrame> {
        let valid = &callee.context.valid;
        get_caller_by_frame_pointer(self, valid, stack_memory, modules)
            .or_else(|| get_caller_by_scan(self, valid, callee.trust, stack_memory, modules))
            .and_then(|frame| {
                // If the instruction is within the first page of memory it's
                // basically null, and unwinding is complete.
                if frame.context.get_instruction_pointer() < 4096 {
                    return None;
                }
                // The stack pointer must advance -- except that a leaf
                // function may never have touched the stack, thanks to the
                // link register, so the very first step is allowed to leave
                // sp where it was.
                let sp = frame.context.get_stack_pointer();
                if sp <= self.sp {
                    let is_leaf = callee.trust == FrameTrust::Context && sp == self.sp;
                    if !is_leaf {
                        return None;
                    }
                }
                Some(frame)
            })
    }
}
