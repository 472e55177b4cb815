//! Logical call stack reconstruction
//!
//! Chases saved frame pointers from the current stop, mapping each return
//! address back to a DWARF function. Frame sizes outside a sane window
//! fall back to a fixed recovery size, and a walk always stops at the
//! entry function.

use crate::controller::TraceeMem;
use crate::errors::Result;
use crate::registers::FrameSnapshot;
use rankdb_dwarf::{DwarfIndex, FunctionId};
use tracing::{debug, warn};

/// Name of the program entry function, where every walk terminates.
pub const ENTRY_FUNCTION: &str = "main";

const PTR_SIZE: u64 = 8;
/// A frame larger than this means the base pointer is corrupt or
/// optimized away.
const MAX_FRAME_SIZE: u64 = 1024;
/// Recovery frame size used when the computed one is implausible.
const FALLBACK_FRAME_SIZE: u64 = 32;
/// Hard bound on walk depth.
const MAX_FRAMES: usize = 128;

/// Reconstruct the call chain at a stop, innermost first.
pub fn walk_stack(
    mem: &impl TraceeMem,
    index: &DwarfIndex,
    frame: FrameSnapshot,
) -> Result<Vec<FunctionId>> {
    let mut stack_pointer = frame.rsp;
    let mut base_pointer = frame.rbp;

    let mut stack = Vec::new();
    match index.pc_to_function(frame.rip) {
        Some(fid) => stack.push(fid),
        None => warn!("no function found for stop address {:#x}", frame.rip),
    }

    loop {
        if stack.len() >= MAX_FRAMES {
            warn!("stack walk aborted after {} frames", MAX_FRAMES);
            break;
        }

        let mut frame_size = base_pointer
            .wrapping_sub(stack_pointer)
            .wrapping_add(PTR_SIZE);
        if frame_size > MAX_FRAME_SIZE || frame_size <= PTR_SIZE {
            debug!(
                "implausible frame size {} at sp {:#x}, using recovery size",
                frame_size, stack_pointer
            );
            frame_size = FALLBACK_FRAME_SIZE;
        }

        let frame_data = mem.peek(stack_pointer, frame_size as usize)?;

        // First slot of the frame: the return address.
        let return_address = read_word(&frame_data, 0);
        let mut function = index.pc_to_function(return_address);

        if function.is_none() && frame_size >= 2 * PTR_SIZE {
            // Salvage heuristic: some frames keep the return address one
            // slot further in. Over-eager on optimized binaries.
            debug!("return address {:#x} unresolved, trying second slot", return_address);
            let second = read_word(&frame_data, PTR_SIZE as usize);
            function = index.pc_to_function(second);
        }

        let Some(fid) = function else {
            debug!("no matching function for frame return address, ending walk");
            break;
        };
        stack.push(fid);

        // Last pointer-sized slot of the frame holds the saved base pointer.
        base_pointer = read_word(&frame_data, (frame_size - PTR_SIZE) as usize);

        if index.function(fid).name == ENTRY_FUNCTION {
            break;
        }

        stack_pointer += frame_size;
    }

    Ok(stack)
}

/// Render a walked stack as `innermost <- ... <- main`.
pub fn render_stack(index: &DwarfIndex, stack: &[FunctionId]) -> String {
    stack
        .iter()
        .map(|&fid| index.function(fid).name.as_str())
        .collect::<Vec<_>>()
        .join(" <- ")
}

fn read_word(frame_data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&frame_data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rankdb_dwarf::{
        BaseType, DwarfIndex, Function, LineRow, Module, ModuleId, MpiData, Variable,
    };
    use std::collections::HashMap;

    /// Flat fake stack memory starting at `base`.
    struct FakeStack {
        base: u64,
        bytes: Vec<u8>,
    }

    impl FakeStack {
        fn new(base: u64, size: usize) -> Self {
            FakeStack {
                base,
                bytes: vec![0; size],
            }
        }

        fn write_word(&mut self, addr: u64, value: u64) {
            let offset = (addr - self.base) as usize;
            self.bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        }
    }

    impl TraceeMem for FakeStack {
        fn peek(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
            let offset = (addr - self.base) as usize;
            Ok(self.bytes[offset..offset + len].to_vec())
        }

        fn poke(&mut self, addr: u64, data: &[u8]) -> Result<()> {
            let offset = (addr - self.base) as usize;
            self.bytes[offset..offset + data.len()].copy_from_slice(data);
            Ok(())
        }
    }

    fn function(name: &str, low_pc: u64) -> Function {
        Function {
            name: name.to_string(),
            module: ModuleId(0),
            file: 1,
            decl_line: 0,
            decl_column: 0,
            low_pc,
            high_pc: low_pc + 0x100,
            parameters: Vec::new(),
        }
    }

    /// An index with main at 0x1000, f at 0x1100 and g at 0x1200.
    fn call_chain_index() -> DwarfIndex {
        let functions = vec![
            function("main", 0x1000),
            function("f", 0x1100),
            function("g", 0x1200),
        ];
        let modules = vec![Module {
            name: "prog.c".to_string(),
            start_address: 0x1000,
            end_address: 0x1300,
            files: HashMap::from([(1, "/src/prog.c".to_string())]),
            entries: Vec::<LineRow>::new(),
            functions: (0..functions.len()).map(FunctionId).collect(),
            variables: Vec::new(),
        }];
        DwarfIndex {
            modules,
            functions,
            variables: Vec::<Variable>::new(),
            types: Vec::<BaseType>::new(),
            mpi: MpiData::default(),
        }
    }

    #[test]
    fn walks_a_three_frame_chain() {
        let index = call_chain_index();
        let mut mem = FakeStack::new(0x7000, 0x400);

        // Stopped in g. g's frame: rsp 0x7000, rbp 0x7018.
        //   [0x7000] return address into f
        //   [0x7018] saved rbp of f's frame (0x7058)
        // f's frame: rsp 0x7020 (0x7000 + 0x20), rbp 0x7058.
        //   [0x7020] return address into main
        //   [0x7058] saved rbp of main
        mem.write_word(0x7000, 0x1150); // ret into f
        mem.write_word(0x7018, 0x7058); // saved rbp
        mem.write_word(0x7020, 0x1050); // ret into main
        mem.write_word(0x7058, 0x7100); // saved rbp of main

        let frame = FrameSnapshot {
            rip: 0x1210,
            rsp: 0x7000,
            rbp: 0x7018,
        };
        let stack = walk_stack(&mem, &index, frame).unwrap();
        assert_eq!(render_stack(&index, &stack), "g <- f <- main");
    }

    #[test]
    fn corrupt_base_pointer_falls_back_to_recovery_frame() {
        let index = call_chain_index();
        let mut mem = FakeStack::new(0x7000, 0x400);

        // rbp far below rsp: computed frame size underflows, so the walk
        // uses the 32-byte recovery frame.
        mem.write_word(0x7000, 0x1050); // ret into main at the first slot
        let frame = FrameSnapshot {
            rip: 0x1210,
            rsp: 0x7000,
            rbp: 0x100,
        };
        let stack = walk_stack(&mem, &index, frame).unwrap();
        assert_eq!(render_stack(&index, &stack), "g <- main");
    }

    #[test]
    fn second_slot_salvage_resolves_skewed_frames() {
        let index = call_chain_index();
        let mut mem = FakeStack::new(0x7000, 0x400);

        mem.write_word(0x7000, 0xdead_beef); // not a function address
        mem.write_word(0x7008, 0x1050); // second slot: ret into main
        let frame = FrameSnapshot {
            rip: 0x1210,
            rsp: 0x7000,
            rbp: 0x7018,
        };
        let stack = walk_stack(&mem, &index, frame).unwrap();
        assert_eq!(render_stack(&index, &stack), "g <- main");
    }

    #[test]
    fn unresolvable_return_address_terminates_the_walk() {
        let index = call_chain_index();
        let mem = FakeStack::new(0x7000, 0x400); // all zeroes
        let frame = FrameSnapshot {
            rip: 0x1210,
            rsp: 0x7000,
            rbp: 0x7018,
        };
        let stack = walk_stack(&mem, &index, frame).unwrap();
        assert_eq!(render_stack(&index, &stack), "g");
    }

    #[test]
    fn walk_depth_is_bounded() {
        // A self-referential stack that would loop forever: every frame's
        // return address points back into g and the saved base pointer
        // keeps the frame size constant.
        let index = call_chain_index();
        let mut mem = FakeStack::new(0x7000, 0x8000);
        for frame_start in (0x7000..0xf000u64).step_by(32) {
            mem.write_word(frame_start, 0x1210); // ret into g, never main
        }
        let frame = FrameSnapshot {
            rip: 0x1210,
            rsp: 0x7000,
            rbp: 0x100, // forces the 32-byte recovery frame every round
        };
        let stack = walk_stack(&mem, &index, frame).unwrap();
        assert_eq!(stack.len(), MAX_FRAMES);
    }
}
