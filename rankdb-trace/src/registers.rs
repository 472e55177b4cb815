//! General-purpose register snapshot of the tracee

use rankdb_dwarf::{regnum, DwarfRegisters};
use std::fmt;

/// Snapshot of the tracee's general-purpose registers.
#[derive(Clone, Copy)]
pub struct Registers {
    pub(crate) raw: libc::user_regs_struct,
}

impl Registers {
    pub(crate) fn new(raw: libc::user_regs_struct) -> Self {
        Registers { raw }
    }

    pub fn rip(&self) -> u64 {
        self.raw.rip
    }

    pub fn rsp(&self) -> u64 {
        self.raw.rsp
    }

    pub fn rbp(&self) -> u64 {
        self.raw.rbp
    }

    pub fn set_rip(&mut self, rip: u64) {
        self.raw.rip = rip;
    }

    /// The three registers the stack walker chases.
    pub fn frame(&self) -> FrameSnapshot {
        FrameSnapshot {
            rip: self.raw.rip,
            rsp: self.raw.rsp,
            rbp: self.raw.rbp,
        }
    }

    /// Snapshot in DWARF register numbering for location evaluation.
    ///
    /// The frame base is approximated as `rbp + 16`: with frame pointers
    /// enabled the canonical frame address sits two slots above the saved
    /// base pointer (saved RBP and the return address).
    pub fn to_dwarf(&self) -> DwarfRegisters {
        let mut regs = DwarfRegisters::default();
        regs.set(regnum::RAX, self.raw.rax);
        regs.set(regnum::RDX, self.raw.rdx);
        regs.set(regnum::RCX, self.raw.rcx);
        regs.set(regnum::RBX, self.raw.rbx);
        regs.set(regnum::RSI, self.raw.rsi);
        regs.set(regnum::RDI, self.raw.rdi);
        regs.set(regnum::RBP, self.raw.rbp);
        regs.set(regnum::RSP, self.raw.rsp);
        regs.set(regnum::R8, self.raw.r8);
        regs.set(regnum::R9, self.raw.r9);
        regs.set(regnum::R10, self.raw.r10);
        regs.set(regnum::R11, self.raw.r11);
        regs.set(regnum::R12, self.raw.r12);
        regs.set(regnum::R13, self.raw.r13);
        regs.set(regnum::R14, self.raw.r14);
        regs.set(regnum::R15, self.raw.r15);
        regs.set(regnum::RIP, self.raw.rip);
        regs.frame_base = Some(self.raw.rbp.wrapping_add(16));
        regs
    }
}

impl fmt::Debug for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registers")
            .field("rip", &format_args!("{:#x}", self.raw.rip))
            .field("rsp", &format_args!("{:#x}", self.raw.rsp))
            .field("rbp", &format_args!("{:#x}", self.raw.rbp))
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "RIP {:#018x}  RSP {:#018x}  RBP {:#018x}", self.raw.rip, self.raw.rsp, self.raw.rbp)?;
        writeln!(f, "RAX {:#018x}  RBX {:#018x}  RCX {:#018x}", self.raw.rax, self.raw.rbx, self.raw.rcx)?;
        writeln!(f, "RDX {:#018x}  RSI {:#018x}  RDI {:#018x}", self.raw.rdx, self.raw.rsi, self.raw.rdi)?;
        writeln!(f, "R8  {:#018x}  R9  {:#018x}  R10 {:#018x}", self.raw.r8, self.raw.r9, self.raw.r10)?;
        writeln!(f, "R11 {:#018x}  R12 {:#018x}  R13 {:#018x}", self.raw.r11, self.raw.r12, self.raw.r13)?;
        write!(f, "R14 {:#018x}  R15 {:#018x}  FLG {:#018x}", self.raw.r14, self.raw.r15, self.raw.eflags)
    }
}

/// The registers a stack walk starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSnapshot {
    pub rip: u64,
    pub rsp: u64,
    pub rbp: u64,
}
