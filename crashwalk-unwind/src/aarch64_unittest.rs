// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use crate::*;
use crashwalk::{
    ContextAarch64, ContextValidity, ExecutionContext, ModuleInfo, ModuleMap, RawContext,
    StackMemory,
};
use test_assembler::*;

struct TestFixture {
    pub raw: ContextAarch64,
    pub modules: ModuleMap,
}

impl TestFixture {
    pub fn new() -> TestFixture {
        TestFixture {
            raw: ContextAarch64::default(),
            modules: ModuleMap::from_modules(vec![
                ModuleInfo::new(0x0000_7400_c000_0000, 0x10000, "module1"),
                ModuleInfo::new(0x0000_7500_b000_0000, 0x10000, "module2"),
            ]),
        }
    }

    pub fn walk_stack(&self, stack: Section, skip: usize) -> Vec<RawFrame> {
        let base = stack.start().value().unwrap();
        let bytes = stack.get_contents().unwrap();
        let context = ExecutionContext {
            raw: RawContext::Aarch64(self.raw.clone()),
            valid: ContextValidity::All,
        };
        let stack_memory = StackMemory::new(base, &bytes);
        let mut frames = Vec::new();
        walk_stack(
            &context,
            Some(&stack_memory),
            &self.modules,
            skip,
            &mut |frame: &RawFrame| {
                frames.push(*frame);
                true
            },
        );
        frames
    }
}

#[test]
fn test_leaf_frame_from_link_register() {
    // A leaf function may never touch the stack: its caller's address is
    // only in lr, and fp still describes the caller's (empty) chain. The
    // first step is allowed to leave sp unchanged; after that the walk must
    // make progress, so the zero frame pointer ends it.
    let mut f = TestFixture::new();
    let mut stack = Section::new();
    let stack_start = 0x8000_0000_8000_0000u64;
    stack.start().set_const(stack_start);
    stack = stack.append_repeated(32, 0);

    let return_caller = 0x0000_7400_c000_1020u64;
    f.raw.pc = 0x0000_7400_c000_0200;
    f.raw.sp = stack_start;
    f.raw.fp = 0;
    f.raw.lr = return_caller;

    let frames = f.walk_stack(stack, 0);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].instruction, 0x0000_7400_c000_0200);
    assert_eq!(frames[0].trust, FrameTrust::Context);
    assert_eq!(frames[1].instruction, return_caller - 4);
    assert_eq!(frames[1].stack_pointer, stack_start);
    assert_eq!(frames[1].trust, FrameTrust::FramePointer);
}

#[test]
fn test_walk_frame_records() {
    // Two real frame records: fp points at (saved fp, saved lr) pairs, and
    // each caller's pc comes from the callee's lr.
    let mut f = TestFixture::new();
    let mut stack = Section::new();
    let stack_start = 0x8000_0000_8000_0000u64;
    stack.start().set_const(stack_start);

    let return_b = 0x0000_7400_c000_1020u64; // B, in module1
    let return_a = 0x0000_7500_b000_0110u64; // A, in module2

    let frame0_fp = Label::new();
    let frame1_fp = Label::new();

    stack = stack
        // frame 0 (C) body
        .append_repeated(16, 0)
        .mark(&frame0_fp)
        .D64(&frame1_fp) // saved fp
        .D64(return_a) // saved lr: A's return address
        // frame 1 (B) body
        .append_repeated(16, 0)
        .mark(&frame1_fp)
        .D64(0) // end of the chain
        .D64(0)
        .append_repeated(16, 0);

    f.raw.pc = 0x0000_7400_c000_0200;
    f.raw.sp = stack_start;
    f.raw.fp = frame0_fp.value().unwrap();
    f.raw.lr = return_b;

    let frames = f.walk_stack(stack, 0);
    assert_eq!(frames.len(), 3);

    assert_eq!(frames[0].instruction, 0x0000_7400_c000_0200);
    assert_eq!(frames[0].trust, FrameTrust::Context);

    assert_eq!(frames[1].instruction, return_b - 4);
    assert_eq!(frames[1].stack_pointer, frame0_fp.value().unwrap() + 16);
    assert_eq!(frames[1].trust, FrameTrust::FramePointer);

    assert_eq!(frames[2].instruction, return_a - 4);
    assert_eq!(frames[2].stack_pointer, frame1_fp.value().unwrap() + 16);
    assert_eq!(frames[2].trust, FrameTrust::FramePointer);
}

#[test]
fn test_skip_semantics() {
    let mut f = TestFixture::new();
    let mut stack = Section::new();
    let stack_start = 0x8000_0000_8000_0000u64;
    stack.start().set_const(stack_start);

    let frame0_fp = Label::new();
    stack = stack
        .append_repeated(16, 0)
        .mark(&frame0_fp)
        .D64(0)
        .D64(0)
        .append_repeated(16, 0);

    f.raw.pc = 0x0000_7400_c000_0200;
    f.raw.sp = stack_start;
    f.raw.fp = frame0_fp.value().unwrap();
    f.raw.lr = 0x0000_7400_c000_1020;

    // Depth is 2 here: the context frame and the lr frame.
    assert_eq!(f.walk_stack(stack, 0).len(), 2);

    let mut stack = Section::new();
    stack.start().set_const(stack_start);
    let frame0_fp = Label::new();
    stack = stack
        .append_repeated(16, 0)
        .mark(&frame0_fp)
        .D64(0)
        .D64(0)
        .append_repeated(16, 0);
    let skipped = f.walk_stack(stack, 1);
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].instruction, 0x0000_7400_c000_1020 - 4);

    let mut stack = Section::new();
    stack.start().set_const(stack_start);
    let frame0_fp = Label::new();
    stack = stack
        .append_repeated(16, 0)
        .mark(&frame0_fp)
        .D64(0)
        .D64(0)
        .append_repeated(16, 0);
    assert_eq!(f.walk_stack(stack, 5).len(), 0);
}

#[test]
fn test_corrupt_frame_record_truncates() {
    // fp points below the snapshot and the stack holds nothing that looks
    // like a return address, so neither the chain nor the scan gets past
    // the context frame.
    let mut f = TestFixture::new();
    let mut stack = Section::new();
    let stack_start = 0x8000_0000_8000_0000u64;
    stack.start().set_const(stack_start);
    stack = stack
        .append_repeated(16, 0)
        .D64(0x0000_7400_b000_0000) // junk that's not
        .D64(0x0000_7500_d000_0000) // a return address
        .append_repeated(16, 0);

    f.raw.pc = 0x0000_7400_c000_0200;
    f.raw.sp = stack_start;
    f.raw.fp = 0x2000;
    f.raw.lr = 0x0000_7400_b000_0000; // plausible-looking, but in no module

    let frames = f.walk_stack(stack, 0);
    assert_eq!(frames.len(), 1);
}

#[test]
fn test_scan_fallback() {
    // With a trashed frame pointer, a return address sitting on the stack
    // is still recovered by scanning.
    let mut f = TestFixture::new();
    let mut stack = Section::new();
    let stack_start = 0x8000_0000_8000_0000u64;
    stack.start().set_const(stack_start);

    let return_address = 0x0000_7500_b000_0100u64;
    let frame1_sp = Label::new();
    stack = stack
        .append_repeated(16, 0)
        .D64(0x0000_7500_d000_0000) // junk
        .D64(return_address)
        .mark(&frame1_sp)
        .append_repeated(32, 0);

    f.raw.pc = 0x0000_7400_c000_0200;
    f.raw.sp = stack_start;
    f.raw.fp = 0x2000;
    f.raw.lr = 0x0000_7400_b000_0000; // in no module, so the fp path fails

    let frames = f.walk_stack(stack, 0);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].instruction, return_address - 4);
    assert_eq!(frames[1].stack_pointer, frame1_sp.value().unwrap());
    assert_eq!(frames[1].trust, FrameTrust::Scan);
}
