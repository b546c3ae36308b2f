// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use crate::*;
use crashwalk::{
    ContextValidity, ContextX86_64, ExecutionContext, ModuleInfo, ModuleMap, RawContext,
    StackMemory,
};
use test_assembler::*;

struct TestFixture {
    pub raw: ContextX86_64,
    pub modules: ModuleMap,
}

impl TestFixture {
    pub fn new() -> TestFixture {
        TestFixture {
            raw: ContextX86_64::default(),
            // Give the two modules reasonable standard locations and names
            // for tests to play with.
            modules: ModuleMap::from_modules(vec![
                ModuleInfo::new(0x0000_7400_c000_0000, 0x10000, "module1"),
                ModuleInfo::new(0x0000_7500_b000_0000, 0x10000, "module2"),
            ]),
        }
    }

    pub fn walk_stack(&self, stack: Section, skip: usize) -> Vec<RawFrame> {
        let base = stack.start().value().unwrap();
        let bytes = stack.get_contents().unwrap();
        self.walk_bytes(base, &bytes, skip)
    }

    pub fn walk_bytes(&self, base: u64, bytes: &[u8], skip: usize) -> Vec<RawFrame> {
        let context = ExecutionContext {
            raw: RawContext::X86_64(self.raw.clone()),
            valid: ContextValidity::All,
        };
        let stack_memory = StackMemory::new(base, bytes);
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

/// A three-level call chain `A -> B -> C` (C innermost), standard prologues
/// everywhere. Returns the section plus the context registers and the
/// expected delivered frames.
fn make_chain() -> (Section, ContextX86_64, Vec<RawFrame>) {
    let mut stack = Section::new();
    let stack_start = 0x8000_0000_8000_0000u64;
    stack.start().set_const(stack_start);

    // C is executing in module1; B's and A's return addresses live in
    // module1 and module2 respectively.
    let ip_c = 0x0000_7400_c000_0200u64;
    let return_b = 0x0000_7400_c000_1020u64;
    let return_a = 0x0000_7500_b000_0110u64;

    let frame0_rbp = Label::new();
    let frame1_sp = Label::new();
    let frame1_rbp = Label::new();
    let frame2_sp = Label::new();
    let frame2_rbp = Label::new();

    stack = stack
        // frame 0 (C)
        .append_repeated(16, 0) // space
        .mark(&frame0_rbp)
        .D64(&frame1_rbp) // caller-pushed %rbp
        .D64(return_b) // return address into B
        // frame 1 (B)
        .mark(&frame1_sp)
        .append_repeated(16, 0) // body of B's frame
        .mark(&frame1_rbp)
        .D64(&frame2_rbp)
        .D64(return_a) // return address into A
        // frame 2 (A)
        .mark(&frame2_sp)
        .append_repeated(16, 0) // body of A's frame
        .mark(&frame2_rbp)
        .D64(0) // end of chain
        .D64(0)
        .D64(0);

    let raw = ContextX86_64 {
        rip: ip_c,
        rsp: stack_start,
        rbp: frame0_rbp.value().unwrap(),
        ..ContextX86_64::default()
    };

    let expected = vec![
        RawFrame {
            instruction: ip_c,
            stack_pointer: stack_start,
            trust: FrameTrust::Context,
        },
        RawFrame {
            instruction: return_b - 1,
            stack_pointer: frame1_sp.value().unwrap(),
            trust: FrameTrust::FramePointer,
        },
        RawFrame {
            instruction: return_a - 1,
            stack_pointer: frame2_sp.value().unwrap(),
            trust: FrameTrust::FramePointer,
        },
    ];

    (stack, raw, expected)
}

#[test]
fn test_simple() {
    let mut f = TestFixture::new();
    let stack = Section::new();
    stack.start().set_const(0x8000_0000_8000_0000);
    // There is nothing on the stack to follow or scan, so the walk is just
    // the context frame.
    f.raw.rip = 0x0000_7400_c000_0200;
    f.raw.rsp = 0x8000_0000_8000_0000;
    f.raw.rbp = 0x8000_0000_9000_0000;

    let frames = f.walk_stack(stack, 0);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].instruction, 0x0000_7400_c000_0200);
    assert_eq!(frames[0].trust, FrameTrust::Context);
}

#[test]
fn test_walk_three_frames() {
    let mut f = TestFixture::new();

    let (stack, raw, expected) = make_chain();
    f.raw = raw;
    assert_eq!(f.walk_stack(stack, 0), expected);

    let (stack, raw, expected) = make_chain();
    f.raw = raw;
    assert_eq!(f.walk_stack(stack, 1), &expected[1..]);

    let (stack, raw, _) = make_chain();
    f.raw = raw;
    assert_eq!(f.walk_stack(stack, 3), vec![]);

    // Skipping further than the stack goes is not an error.
    let (stack, raw, _) = make_chain();
    f.raw = raw;
    assert_eq!(f.walk_stack(stack, 10), vec![]);
}

#[test]
fn test_visitor_stops_walk() {
    let mut f = TestFixture::new();
    let (stack, raw, expected) = make_chain();
    f.raw = raw;

    let base = stack.start().value().unwrap();
    let bytes = stack.get_contents().unwrap();
    let context = ExecutionContext {
        raw: RawContext::X86_64(f.raw.clone()),
        valid: ContextValidity::All,
    };
    let stack_memory = StackMemory::new(base, &bytes);

    let mut frames = Vec::new();
    walk_stack(
        &context,
        Some(&stack_memory),
        &f.modules,
        0,
        &mut |frame: &RawFrame| {
            frames.push(*frame);
            frames.len() < 2
        },
    );

    // No frame may arrive after the visitor declines.
    assert_eq!(frames, &expected[..2]);
}

#[test]
fn test_corrupt_frame_pointer_truncates() {
    // A chain that is nominally five frames deep, with the frame record at
    // depth 2 stomped: its saved frame pointer points backwards and its
    // return-address slot holds a value outside any module. The walk must
    // deliver exactly the two intact frames and stop.
    let mut f = TestFixture::new();
    let mut stack = Section::new();
    let stack_start = 0x8000_0000_8000_0000u64;
    stack.start().set_const(stack_start);

    let return_b = 0x0000_7400_c000_1020u64;

    let frame0_rbp = Label::new();
    let frame1_rbp = Label::new();

    stack = stack
        // frame 0: intact
        .append_repeated(16, 0)
        .mark(&frame0_rbp)
        .D64(&frame1_rbp)
        .D64(return_b)
        // frame 1: stomped record
        .append_repeated(16, 0)
        .mark(&frame1_rbp)
        .D64(0x2000) // "saved rbp" pointing below the stack
        .D64(0x0000_7400_b000_0000) // junk that's not a return address
        // frames 2..4: bodies whose values resemble nothing in any module
        .append_repeated(48, 0)
        .D64(0x0000_7500_d000_0000)
        .append_repeated(48, 0);

    f.raw.rip = 0x0000_7400_c000_0200;
    f.raw.rsp = stack_start;
    f.raw.rbp = frame0_rbp.value().unwrap();

    let frames = f.walk_stack(stack, 0);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].instruction, return_b - 1);
    assert_eq!(frames[1].trust, FrameTrust::FramePointer);
}

#[test]
fn test_scan_recovers_broken_chain() {
    // When the walker resorts to scanning, only addresses located within
    // loaded modules count as return addresses. Force scanning through two
    // frames to make sure the stack pointer is set properly along the way.
    let mut f = TestFixture::new();
    let mut stack = Section::new();
    let stack_start = 0x8000_0000_8000_0000u64;
    stack.start().set_const(stack_start);

    let return_address1 = 0x0000_7500_b000_0100u64;
    let return_address2 = 0x0000_7500_b000_0900u64;

    let frame1_sp = Label::new();
    let frame2_sp = Label::new();
    let frame1_rbp = Label::new();
    stack = stack
        // frame 0
        .append_repeated(16, 0) // space
        .D64(0x0000_7400_b000_0000) // junk that's not
        .D64(0x0000_7500_d000_0000) // a return address
        .D64(return_address1) // actual return address
        // frame 1
        .mark(&frame1_sp)
        .append_repeated(16, 0) // space
        .D64(0x0000_7400_b000_0000) // more junk
        .D64(0x0000_7500_d000_0000)
        .mark(&frame1_rbp)
        .D64(stack_start) // in the right place for a saved rbp, but bogus
        .D64(return_address2) // actual return address
        // frame 2
        .mark(&frame2_sp)
        .append_repeated(32, 0); // end of stack

    f.raw.rip = 0x0000_7400_c000_0200;
    f.raw.rbp = frame1_rbp.value().unwrap();
    f.raw.rsp = stack_start;

    let frames = f.walk_stack(stack, 0);
    assert_eq!(frames.len(), 3);

    assert_eq!(frames[0].trust, FrameTrust::Context);

    assert_eq!(frames[1].trust, FrameTrust::Scan);
    assert_eq!(frames[1].instruction, return_address1 - 1);
    assert_eq!(frames[1].stack_pointer, frame1_sp.value().unwrap());

    assert_eq!(frames[2].trust, FrameTrust::Scan);
    assert_eq!(frames[2].instruction, return_address2 - 1);
    assert_eq!(frames[2].stack_pointer, frame2_sp.value().unwrap());
}

#[test]
fn test_max_depth_guard() {
    // A pathologically deep (but individually valid) chain of frame records
    // must be cut off at MAX_FRAMES rather than walked to the end.
    let mut f = TestFixture::new();
    let base = 0x10000u64;
    let depth = MAX_FRAMES + 50;

    let mut bytes = Vec::with_capacity(depth * 16 + 16);
    for i in 0..depth {
        let next_bp = base + (i as u64 + 1) * 16;
        bytes.extend_from_slice(&next_bp.to_le_bytes());
        bytes.extend_from_slice(&0x0000_7400_c000_0300u64.to_le_bytes());
    }
    // Tail so the final record's frame pointer still reads in-bounds.
    bytes.extend_from_slice(&[0u8; 16]);

    f.raw.rip = 0x0000_7400_c000_0200;
    f.raw.rsp = base;
    f.raw.rbp = base;

    let frames = f.walk_bytes(base, &bytes, 0);
    assert_eq!(frames.len(), MAX_FRAMES);
}
