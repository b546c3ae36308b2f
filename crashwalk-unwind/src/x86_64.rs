// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use crate::unwind::Unwind;
use crate::{FrameTrust, StackFrame};
use crashwalk::{ContextValidity, ContextX86_64, ExecutionContext, ModuleMap, RawContext, StackMemory};
use std::collections::HashSet;

type Pointer = u64;
const POINTER_WIDTH: Pointer = 8;
const INSTRUCTION_REGISTER: &str = "rip";
const STACK_POINTER_REGISTER: &str = "rsp";
const FRAME_POINTER_REGISTER: &str = "rbp";

fn get_caller_by_frame_pointer(
    ctx: &ContextX86_64,
    valid: &ContextValidity,
    stack_memory: &StackMemory<'_>,
    modules: &ModuleMap,
) -> Option<StackFrame> {
    if !valid.contains(FRAME_POINTER_REGISTER) || !valid.contains(STACK_POINTER_REGISTER) {
        return None;
    }

    let last_bp = ctx.rbp;
    let last_sp = ctx.rsp;

    // Assume the standard %bp-using x64 calling convention is in use: CALL
    // pushed the return address, then the callee pushed the caller's %bp and
    // copied %sp into %bp. Unwinding one frame is therefore:
    //
    //   %ip_new = *(%bp_old + ptr)
    //   %sp_new = %bp_old + ptr*2
    //   %bp_new = *(%bp_old)

    if last_bp >= u64::MAX - POINTER_WIDTH * 2 {
        // The code below would wrap around; a frame pointer this high up is
        // garbage anyway.
        return None;
    }

    let caller_ip = stack_memory.get_memory_at_address(last_bp + POINTER_WIDTH)?;
    let caller_bp = stack_memory.get_memory_at_address(last_bp)?;
    let caller_sp = last_bp + POINTER_WIDTH * 2;

    // Since we're assuming coherent frame pointers, check that the frame
    // pointers and stack pointers are well-ordered.
    if caller_sp <= last_bp || caller_bp < caller_sp {
        return None;
    }
    // ...and that the resulting frame pointer is still inside stack memory.
    let _: Pointer = stack_memory.get_memory_at_address(caller_bp)?;
    // Don't accept obviously wrong instruction pointers.
    if !instruction_seems_valid(caller_ip, modules) {
        return None;
    }
    // Don't accept obviously wrong stack pointers.
    if !stack_seems_valid(caller_sp, last_sp, stack_memory) {
        return None;
    }

    let caller_ctx = ContextX86_64 {
        rip: caller_ip,
        rsp: caller_sp,
        rbp: caller_bp,
        ..ContextX86_64::default()
    };
    let mut valid = HashSet::new();
    valid.insert(INSTRUCTION_REGISTER);
    valid.insert(STACK_POINTER_REGISTER);
    valid.insert(FRAME_POINTER_REGISTER);
    let context = ExecutionContext {
        raw: RawContext::X86_64(caller_ctx),
        valid: ContextValidity::Some(valid),
    };
    let mut frame = StackFrame::from_context(context, FrameTrust::FramePointer);
    adjust_instruction(&mut frame, caller_ip);
    Some(frame)
}

fn get_caller_by_scan(
    ctx: &ContextX86_64,
    valid: &ContextValidity,
    trust: FrameTrust,
    stack_memory: &StackMemory<'_>,
    modules: &ModuleMap,
) -> Option<StackFrame> {
    // Stack scanning is just walking from the end of the frame until we
    // encounter a value on the stack that looks like a pointer into some
    // code (it's an address in a range covered by one of our modules). If we
    // find one, assume it's the ip pushed by the CALL that created the
    // current frame; the next frame then ends just before it.
    if !valid.contains(STACK_POINTER_REGISTER) {
        return None;
    }
    let last_bp = if valid.contains(FRAME_POINTER_REGISTER) {
        Some(ctx.rbp)
    } else {
        None
    };
    let last_sp = ctx.rsp;

    // Number of pointer-sized values to scan through in our search.
    let default_scan_range = 40;
    let extended_scan_range = default_scan_range * 4;

    // The first frame of an unwind can be really messed up and benefits
    // from a longer scan.
    let scan_range = if let FrameTrust::Context = trust {
        extended_scan_range
    } else {
        default_scan_range
    };

    for i in 0..scan_range {
        let address_of_ip = last_sp.checked_add(i * POINTER_WIDTH)?;
        let caller_ip = stack_memory.get_memory_at_address(address_of_ip)?;
        if instruction_seems_valid(caller_ip, modules) {
            // ip was pushed by CALL, so sp is just above it.
            let caller_sp = address_of_ip.checked_add(POINTER_WIDTH)?;

            // Try to restore bp as well. Two cases are plausible:
            //
            // 1. The callee had the standard prologue, so the caller's bp
            //    was pushed immediately below the return address and the
            //    current bp points at it.
            //
            // 2. The callee never touched bp, so it still holds the
            //    caller's value and should simply survive the frame.
            //
            // Bogus-looking candidates are discarded with "is a valid stack
            // address" checks.
            let mut caller_bp = None;

            // 128 KB is an extremely generous upper bound for one frame.
            const MAX_REASONABLE_GAP_BETWEEN_FRAMES: Pointer = 128 * 1024;

            if let Some(last_bp) = last_bp {
                let address_of_bp = address_of_ip.checked_sub(POINTER_WIDTH)?;
                // This resolves because we already walked over it while
                // checking address_of_ip values.
                let bp: Pointer = stack_memory.get_memory_at_address(address_of_bp)?;
                if last_bp == address_of_bp
                    && bp > address_of_ip
                    && bp - address_of_bp <= MAX_REASONABLE_GAP_BETWEEN_FRAMES
                {
                    if stack_memory.get_memory_at_address::<Pointer>(bp).is_some() {
                        caller_bp = Some(bp);
                    }
                } else if last_bp >= caller_sp
                    && stack_memory.get_memory_at_address::<Pointer>(last_bp).is_some()
                {
                    caller_bp = Some(last_bp);
                }
            }

            let caller_ctx = ContextX86_64 {
                rip: caller_ip,
                rsp: caller_sp,
                rbp: caller_bp.unwrap_or(0),
                ..ContextX86_64::default()
            };
            let mut valid = HashSet::new();
            valid.insert(INSTRUCTION_REGISTER);
            valid.insert(STACK_POINTER_REGISTER);
            if caller_bp.is_some() {
                valid.insert(FRAME_POINTER_REGISTER);
            }
            let context = ExecutionContext {
                raw: RawContext::X86_64(caller_ctx),
                valid: ContextValidity::Some(valid),
            };
            let mut frame = StackFrame::from_context(context, FrameTrust::Scan);
            adjust_instruction(&mut frame, caller_ip);
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

fn stack_seems_valid(
    caller_sp: Pointer,
    callee_sp: Pointer,
    stack_memory: &StackMemory<'_>,
) -> bool {
    // The stack shouldn't *grow* when we unwind.
    if caller_sp <= callee_sp {
        return false;
    }

    // The stack pointer should be in the stack.
    stack_memory.get_memory_at_address::<Pointer>(caller_sp).is_some()
}

fn adjust_instruction(frame: &mut StackFrame, caller_ip: Pointer) {
    // A caller's ip is the return address, which is the instruction after
    // the CALL that got us into the callee. Point one byte back, into the
    // CALL itself, so symbol lookups report the call site.
    if caller_ip > 0 {
        frame.instruction = caller_ip - 1;
    }
}

fn is_non_canonical(ptr: Pointer) -> bool {
    // x64 pointers only use 48 bits, with bit 47 sign-extended through the
    // high bits. Anything in the hole between the two canonical ranges
    // cannot be a valid return address.
    ptr > 0x7FFF_FFFF_FFFF && ptr < 0xFFFF_8000_0000_0000
}

impl Unwind for ContextX86_64 {
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
                // Treat an instruction address of 0 as end-of-stack.
                if frame.context.get_instruction_pointer() == 0 {
                    return None;
                }
                // If the new stack pointer is at a lower address than the
                // old, that's clearly incorrect. Treat it as end-of-stack to
                // enforce progress and avoid infinite loops.
                if frame.context.get_stack_pointer() <= self.rsp {
                    return None;
                }
                Some(frame)
            })
    }
}
