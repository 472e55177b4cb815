//! Breakpoint bookkeeping
//!
//! Two maps: user breakpoints keyed by source line, MPI wrapper
//! breakpoints keyed by instruction address. Each entry carries the
//! original byte displaced by the trap instruction. A PC belongs to at
//! most one map at any time.
//!
//! Lifecycle per breakpoint: Armed -> Hit -> Disarmed (byte restored, IP
//! rewound) -> optionally re-armed by stepping past the restored
//! instruction and re-inserting the trap.

use crate::controller::{StopReason, TraceeController, TraceeMem};
use crate::errors::{Result, TraceError};
use rankdb_dwarf::{DwarfIndex, FunctionId};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// x86 software trap opcode (INT3).
pub const INT3: u8 = 0xCC;

#[derive(Debug, Clone, Copy)]
struct UserBreakpoint {
    address: u64,
    original_byte: u8,
}

#[derive(Debug, Clone, Copy)]
struct MpiBreakpoint {
    original_byte: u8,
    function: FunctionId,
}

/// What a caught trap resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointHit {
    pub address: u64,
    pub kind: HitKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitKind {
    /// A user breakpoint on this source line.
    User { line: i64 },
    /// An auto-inserted breakpoint on an MPI wrapper function.
    Mpi { function: FunctionId },
}

#[derive(Default)]
pub struct BreakpointTable {
    /// User-inserted breakpoints, keyed by source line number.
    user: HashMap<i64, UserBreakpoint>,
    /// Auto-inserted MPI breakpoints, keyed by address.
    mpi: HashMap<u64, MpiBreakpoint>,
    /// A breakpoint whose byte has been restored and which should be
    /// re-armed before the tracee next runs past it.
    disarmed: Option<BreakpointHit>,
}

impl BreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a user breakpoint whose line resolved to `pc`.
    pub fn install_user(&mut self, mem: &mut impl TraceeMem, line: i64, pc: u64) -> Result<()> {
        if self.owner_of(pc).is_some() || self.user.contains_key(&line) {
            return Err(TraceError::BreakpointExists { address: pc });
        }
        let original_byte = self.write_trap(mem, pc)?;
        self.user.insert(
            line,
            UserBreakpoint {
                address: pc,
                original_byte,
            },
        );
        info!("user breakpoint installed at line {} ({:#x})", line, pc);
        Ok(())
    }

    /// Install breakpoints at the entry of every recognized MPI wrapper
    /// function. Returns how many were installed.
    pub fn install_mpi_set(
        &mut self,
        mem: &mut impl TraceeMem,
        index: &DwarfIndex,
    ) -> Result<usize> {
        let mut installed = 0;
        for &fid in &index.mpi.functions {
            let function = index.function(fid);
            let pc = function.low_pc;
            if self.owner_of(pc).is_some() {
                warn!(
                    "skipping MPI breakpoint for {}: {:#x} already armed",
                    function.name, pc
                );
                continue;
            }
            let original_byte = self.write_trap(mem, pc)?;
            self.mpi.insert(
                pc,
                MpiBreakpoint {
                    original_byte,
                    function: fid,
                },
            );
            debug!("MPI breakpoint installed on {} at {:#x}", function.name, pc);
            installed += 1;
        }
        Ok(installed)
    }

    /// Which map, if any, owns `pc`.
    pub fn owner_of(&self, pc: u64) -> Option<BreakpointHit> {
        if let Some((line, bp)) = self.user.iter().find(|(_, bp)| bp.address == pc) {
            return Some(BreakpointHit {
                address: bp.address,
                kind: HitKind::User { line: *line },
            });
        }
        self.mpi.get(&pc).map(|bp| BreakpointHit {
            address: pc,
            kind: HitKind::Mpi {
                function: bp.function,
            },
        })
    }

    /// Restore the original byte at a trapped PC.
    ///
    /// The PC must be owned by exactly one of the maps; a trap anywhere
    /// else is a stray and surfaces as [`TraceError::StrayTrap`]. The
    /// breakpoint is left disarmed until [`Self::prepare_resume`] re-arms
    /// it.
    pub fn restore_at(&mut self, mem: &mut impl TraceeMem, pc: u64) -> Result<BreakpointHit> {
        let hit = self.owner_of(pc).ok_or(TraceError::StrayTrap { address: pc })?;
        let original_byte = match hit.kind {
            HitKind::User { line } => self.user[&line].original_byte,
            HitKind::Mpi { .. } => self.mpi[&pc].original_byte,
        };
        mem.poke(pc, &[original_byte])?;
        self.disarmed = Some(hit);
        debug!("breakpoint at {:#x} disarmed, original byte restored", pc);
        Ok(hit)
    }

    /// Catch a trap-at-breakpoint stop: rewind the tracee's IP onto the
    /// breakpoint address and restore the displaced byte.
    pub fn catch_and_restore(&mut self, ctl: &mut TraceeController) -> Result<BreakpointHit> {
        let regs = ctl.registers(true)?;
        let pc = regs.rip();
        let hit = self.restore_at(ctl, pc)?;
        ctl.set_registers(&regs)?;
        Ok(hit)
    }

    /// Re-arm a disarmed breakpoint before resuming: single-step past the
    /// restored instruction, then re-insert the trap.
    ///
    /// Returns the stop reason of the step when one was taken, so callers
    /// notice a tracee that exits mid-step.
    pub fn prepare_resume(&mut self, ctl: &mut TraceeController) -> Result<Option<StopReason>> {
        let Some(hit) = self.disarmed.take() else {
            return Ok(None);
        };
        let reason = ctl.single_step()?;
        if let StopReason::Exited(_) = reason {
            return Ok(Some(reason));
        }
        ctl.poke(hit.address, &[INT3])?;
        debug!("breakpoint at {:#x} re-armed", hit.address);
        Ok(Some(reason))
    }

    pub fn user_breakpoint_lines(&self) -> Vec<i64> {
        let mut lines: Vec<i64> = self.user.keys().copied().collect();
        lines.sort_unstable();
        lines
    }

    fn write_trap(&self, mem: &mut impl TraceeMem, pc: u64) -> Result<u8> {
        let original = mem.peek(pc, 1)?[0];
        mem.poke(pc, &[INT3])?;
        Ok(original)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    /// Sparse fake tracee memory.
    #[derive(Default)]
    struct FakeMem {
        bytes: Map<u64, u8>,
    }

    impl FakeMem {
        fn with_code(code: &[(u64, u8)]) -> Self {
            FakeMem {
                bytes: code.iter().copied().collect(),
            }
        }
    }

    impl TraceeMem for FakeMem {
        fn peek(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
            Ok((0..len as u64)
                .map(|i| self.bytes.get(&(addr + i)).copied().unwrap_or(0))
                .collect())
        }

        fn poke(&mut self, addr: u64, data: &[u8]) -> Result<()> {
            for (i, byte) in data.iter().enumerate() {
                self.bytes.insert(addr + i as u64, *byte);
            }
            Ok(())
        }
    }

    #[test]
    fn install_saves_original_byte_and_writes_trap() {
        let mut mem = FakeMem::with_code(&[(0x1000, 0x55)]);
        let mut table = BreakpointTable::new();

        table.install_user(&mut mem, 7, 0x1000).unwrap();
        assert_eq!(mem.peek(0x1000, 1).unwrap(), vec![INT3]);
    }

    #[test]
    fn restore_round_trips_the_original_byte() {
        let mut mem = FakeMem::with_code(&[(0x1000, 0x55), (0x1001, 0x48)]);
        let mut table = BreakpointTable::new();
        table.install_user(&mut mem, 7, 0x1000).unwrap();

        let hit = table.restore_at(&mut mem, 0x1000).unwrap();
        assert_eq!(hit.address, 0x1000);
        assert_eq!(hit.kind, HitKind::User { line: 7 });
        // Breakpoint transparency: the original bytes read back intact.
        assert_eq!(mem.peek(0x1000, 2).unwrap(), vec![0x55, 0x48]);
    }

    #[test]
    fn a_pc_belongs_to_at_most_one_map() {
        let mut mem = FakeMem::with_code(&[(0x1000, 0x55)]);
        let mut table = BreakpointTable::new();
        table.install_user(&mut mem, 7, 0x1000).unwrap();

        // A second user line resolving to the same PC is rejected.
        assert!(matches!(
            table.install_user(&mut mem, 8, 0x1000),
            Err(TraceError::BreakpointExists { address: 0x1000 })
        ));
        // And so is re-breaking the same line.
        assert!(matches!(
            table.install_user(&mut mem, 7, 0x2000),
            Err(TraceError::BreakpointExists { .. })
        ));
    }

    #[test]
    fn stray_trap_is_surfaced() {
        let mut mem = FakeMem::default();
        let mut table = BreakpointTable::new();
        assert!(matches!(
            table.restore_at(&mut mem, 0xdead),
            Err(TraceError::StrayTrap { address: 0xdead })
        ));
    }
}
