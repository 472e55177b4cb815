//! The debug session loop
//!
//! Wires the DWARF index, the tracee controller and the breakpoint table
//! together and dispatches REPL commands. Startup failures (no DWARF, no
//! spawn) are fatal; everything after that recovers to the prompt.

use crate::repl;
use crate::reporter::Reporter;
use anyhow::{Context, Result};
use rankdb_dwarf::{
    dwarf_reg_name, evaluate, BaseType, DwarfError, DwarfIndex, Location, PieceLocation,
};
use rankdb_protocol::{Command, CommandResult};
use rankdb_trace::{
    render_stack, walk_stack, BreakpointTable, HitKind, StopReason, TraceError, TraceeController,
    TraceeMem, ENTRY_FUNCTION,
};
use std::path::Path;
use tracing::{debug, error, info, warn};

pub struct DebugSession {
    source_file: String,
    index: DwarfIndex,
    ctl: TraceeController,
    breakpoints: BreakpointTable,
    reporter: Reporter,
}

impl DebugSession {
    /// Load debug info, spawn the target under tracing, arm the MPI
    /// wrapper breakpoints and register with the orchestrator.
    pub fn launch(target: &Path, mut reporter: Reporter) -> Result<DebugSession> {
        let index = DwarfIndex::load(target).context("loading debug information")?;
        let source_file = index
            .source_file_of(ENTRY_FUNCTION)
            .context("locating the entry function")?
            .to_string();

        let mut ctl = TraceeController::spawn(target).context("spawning the target")?;

        let mut breakpoints = BreakpointTable::new();
        let installed = breakpoints.install_mpi_set(&mut ctl, &index)?;
        if installed > 0 {
            info!("{} MPI wrapper breakpoints armed", installed);
        }

        reporter.register(ctl.pid().as_raw());

        Ok(DebugSession {
            source_file,
            index,
            ctl,
            breakpoints,
            reporter,
        })
    }

    /// Drive the command loop until the tracee is gone.
    pub fn run(&mut self) -> Result<()> {
        repl::print_instructions();

        loop {
            let command = repl::ask_for_input();

            let result = match self.handle(&command) {
                Ok(result) => result,
                Err(e) => {
                    // Runtime errors abort the command, not the session.
                    error!("command failed: {e:#}");
                    CommandResult::running()
                }
            };

            self.reporter.report(&command, &result);

            if result.exited {
                if let Some(code) = result.exit_code {
                    info!("target exited with code {}", code);
                }
                return Ok(());
            }

            if command.is_progress_command() {
                self.after_progress(&command);
            }
        }
    }

    fn handle(&mut self, command: &Command) -> Result<CommandResult> {
        match command {
            Command::Step => self.step(),
            Command::Continue => self.cont(),
            Command::Break { line } => {
                self.insert_breakpoint(*line);
                Ok(CommandResult::running())
            }
            Command::Stack => {
                self.print_stack()?;
                Ok(CommandResult::running())
            }
            Command::Registers => {
                let regs = self.ctl.registers(false)?;
                println!("{regs}");
                Ok(CommandResult::running())
            }
            Command::Print { variable } => {
                self.print_variable(variable);
                Ok(CommandResult::running())
            }
            Command::Quit => {
                self.ctl.kill()?;
                Ok(CommandResult::exited(None))
            }
            Command::Help => {
                repl::print_instructions();
                Ok(CommandResult::running())
            }
        }
    }

    /// Execute one instruction. If a caught breakpoint is pending re-arm,
    /// the re-arming step *is* the requested step.
    fn step(&mut self) -> Result<CommandResult> {
        if let Some(reason) = self.breakpoints.prepare_resume(&mut self.ctl)? {
            return Ok(Self::classify(reason));
        }
        let reason = self.ctl.single_step()?;
        Ok(Self::classify(reason))
    }

    fn cont(&mut self) -> Result<CommandResult> {
        if let Some(StopReason::Exited(code)) = self.breakpoints.prepare_resume(&mut self.ctl)? {
            return Ok(CommandResult::exited(Some(code)));
        }
        let reason = self.ctl.cont()?;
        Ok(Self::classify(reason))
    }

    fn classify(reason: StopReason) -> CommandResult {
        match reason {
            StopReason::Exited(code) => CommandResult::exited(Some(code)),
            StopReason::Signalled(signal) => {
                warn!("tracee stopped by signal {:?}", signal);
                CommandResult::running()
            }
            StopReason::Trap | StopReason::Other => CommandResult::running(),
        }
    }

    fn insert_breakpoint(&mut self, line: i64) {
        let pc = match self.index.line_to_pc(&self.source_file, line) {
            Ok(pc) => pc,
            Err(e @ DwarfError::NoAddressForLine { .. }) => {
                warn!("{e}");
                return;
            }
            Err(e) => {
                error!("breakpoint lookup failed: {e}");
                return;
            }
        };
        match self.breakpoints.install_user(&mut self.ctl, line, pc) {
            Ok(()) => println!("breakpoint set at line {line} ({pc:#x})"),
            Err(e @ TraceError::BreakpointExists { .. }) => warn!("{e}"),
            Err(e) => error!("failed to install breakpoint: {e}"),
        }
    }

    fn print_stack(&mut self) -> Result<()> {
        let regs = self.ctl.registers(false)?;
        let stack = walk_stack(&self.ctl, &self.index, regs.frame())?;
        println!("{}", render_stack(&self.index, &stack));
        Ok(())
    }

    fn print_variable(&mut self, name: &str) {
        let Some(vid) = self.index.lookup_variable(name) else {
            println!("no variable named {name}");
            return;
        };
        let variable = self.index.variable(vid);
        let Some(expression) = variable.location.clone() else {
            println!("{name} has no location (optimized out?)");
            return;
        };
        let base_type = self.index.base_type(variable.base_type).clone();

        let regs = match self.ctl.registers(false) {
            Ok(regs) => regs,
            Err(e) => {
                error!("cannot read registers: {e}");
                return;
            }
        };

        match evaluate(&expression, &regs.to_dwarf()) {
            Ok(Location::Address(address)) => {
                let size = base_type.byte_size.clamp(1, 8) as usize;
                match self.ctl.peek(address, size) {
                    Ok(bytes) => println!(
                        "{name} = {} ({} @ {address:#x})",
                        render_value(&bytes, &base_type),
                        base_type.name
                    ),
                    Err(e) => error!("cannot read {name} at {address:#x}: {e}"),
                }
            }
            Ok(Location::Register(register)) => {
                let reg_name = dwarf_reg_name(register).unwrap_or("?");
                match regs.to_dwarf().get(register) {
                    Some(value) => println!("{name} = {value} (in register {reg_name})"),
                    None => println!("{name} lives in register {reg_name}"),
                }
            }
            Ok(Location::Pieces(pieces)) => {
                println!("{name} is split across {} location pieces", pieces.len());
                for piece in pieces {
                    match piece.location {
                        PieceLocation::Register(r) => {
                            println!("  {} bits in register {}", piece.size_in_bits, dwarf_reg_name(r).unwrap_or("?"))
                        }
                        PieceLocation::Address(a) => {
                            println!("  {} bits at {a:#x}", piece.size_in_bits)
                        }
                    }
                }
            }
            Err(e) => error!("cannot evaluate location of {name}: {e}"),
        }
    }

    /// After a command that advanced the tracee: restore a caught
    /// breakpoint and emit the registers diagnostic.
    fn after_progress(&mut self, command: &Command) {
        match self.breakpoints.catch_and_restore(&mut self.ctl) {
            Ok(hit) => match hit.kind {
                HitKind::User { line } => info!("hit breakpoint at line {}", line),
                HitKind::Mpi { function } => {
                    info!("hit MPI call {}", self.index.function(function).name)
                }
            },
            Err(TraceError::StrayTrap { address }) => {
                // A single step routinely stops at a PC no breakpoint
                // owns; only a continue stop there is suspicious.
                if matches!(command, Command::Continue) {
                    warn!("stray trap at {address:#x}");
                } else {
                    debug!("stop at {address:#x} is not a breakpoint");
                }
            }
            Err(e) => error!("breakpoint restore failed: {e}"),
        }

        self.log_registers_state();
    }

    /// Registers diagnostic: IP, mapped source coordinate and a 4-byte
    /// memory snapshot at the IP.
    fn log_registers_state(&mut self) {
        let regs = match self.ctl.registers(false) {
            Ok(regs) => regs,
            Err(e) => {
                debug!("registers unavailable: {e}");
                return;
            }
        };

        match self.index.pc_to_line(regs.rip()) {
            Ok((line, file, _)) => {
                info!("instruction pointer: {:#x} (line {} in {})", regs.rip(), line, file)
            }
            Err(_) => match self.index.line_for_pc_near(regs.rip()) {
                Some((line, file)) => info!(
                    "instruction pointer: {:#x} (near line {} in {})",
                    regs.rip(),
                    line,
                    file
                ),
                None => info!("instruction pointer: {:#x}", regs.rip()),
            },
        }

        if let Ok(bytes) = self.ctl.peek(regs.rip(), 4) {
            info!("ip pointing to: {:02x?}", bytes);
        }
    }
}

/// Render a peeked value according to its base type encoding.
fn render_value(bytes: &[u8], base_type: &BaseType) -> String {
    use rankdb_dwarf::{
        DW_ATE_boolean, DW_ATE_float, DW_ATE_signed, DW_ATE_signed_char, DW_ATE_unsigned,
        DW_ATE_unsigned_char,
    };

    let mut word = [0u8; 8];
    word[..bytes.len().min(8)].copy_from_slice(&bytes[..bytes.len().min(8)]);
    let raw = u64::from_le_bytes(word);

    match base_type.encoding {
        DW_ATE_signed | DW_ATE_signed_char => {
            let shift = 64 - 8 * bytes.len().min(8) as u32;
            (((raw << shift) as i64) >> shift).to_string()
        }
        DW_ATE_boolean => (raw != 0).to_string(),
        DW_ATE_float => match bytes.len() {
            4 => f32::from_le_bytes(bytes.try_into().unwrap_or([0; 4])).to_string(),
            8 => f64::from_le_bytes(word).to_string(),
            _ => format!("{bytes:02x?}"),
        },
        DW_ATE_unsigned | DW_ATE_unsigned_char => raw.to_string(),
        _ => format!("{bytes:02x?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::render_value;
    use rankdb_dwarf::{BaseType, DwAte};

    fn typed(name: &str, byte_size: u64, encoding: DwAte) -> BaseType {
        BaseType {
            name: name.to_string(),
            byte_size,
            encoding,
        }
    }

    #[test]
    fn renders_signed_values_with_sign_extension() {
        let int = typed("int", 4, rankdb_dwarf::DW_ATE_signed);
        assert_eq!(render_value(&(-7i32).to_le_bytes(), &int), "-7");
        assert_eq!(render_value(&42i32.to_le_bytes(), &int), "42");
    }

    #[test]
    fn renders_unsigned_and_bool() {
        let uint = typed("unsigned int", 4, rankdb_dwarf::DW_ATE_unsigned);
        assert_eq!(render_value(&0xffff_fff0u32.to_le_bytes(), &uint), "4294967280");

        let boolean = typed("_Bool", 1, rankdb_dwarf::DW_ATE_boolean);
        assert_eq!(render_value(&[1], &boolean), "true");
        assert_eq!(render_value(&[0], &boolean), "false");
    }

    #[test]
    fn unknown_encodings_fall_back_to_hex() {
        let opaque = typed("unknown type", 0, rankdb_dwarf::DW_ATE_void);
        assert_eq!(render_value(&[0xde, 0xad], &opaque), "[de, ad]");
    }
}
