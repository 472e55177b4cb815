//! The tracee process controller
//!
//! Sole owner of the child process. Spawns the target with tracing
//! enabled, waits for the initial stop, and exposes the ptrace primitives
//! everything else is built from: register access, memory peek/poke,
//! single-step, continue and stop classification.
//!
//! Every operation requires the tracee to be stopped; the controller is
//! used from exactly one thread for the whole session, which is also what
//! the kernel demands of a tracer.

use crate::errors::{Result, TraceError};
use crate::registers::Registers;
use nix::sys::personality::{self, Persona};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execv, fork, ForkResult, Pid};
use std::ffi::CString;
use std::path::Path;
use tracing::{debug, info, warn};

/// Classification of a tracee stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// SIGTRAP: a software trap or a completed single-step.
    Trap,
    /// The tracee exited with the given code.
    Exited(i32),
    /// The tracee was stopped or terminated by another signal.
    Signalled(Signal),
    /// Any other wait status.
    Other,
}

/// Memory access seam between the controller and the components that read
/// or patch tracee memory (stack walker, breakpoint table).
pub trait TraceeMem {
    /// Read `len` bytes at `addr`.
    fn peek(&self, addr: u64, len: usize) -> Result<Vec<u8>>;
    /// Write `data` at `addr`.
    fn poke(&mut self, addr: u64, data: &[u8]) -> Result<()>;
}

pub struct TraceeController {
    pid: Pid,
}

impl TraceeController {
    /// Launch the target under tracing, inheriting stdout/stderr, and wait
    /// for the initial exec stop.
    ///
    /// The child pins its address space layout (no randomization) so the
    /// link-time addresses in the DWARF index equal runtime addresses for
    /// non-PIE targets.
    pub fn spawn(path: &Path) -> Result<TraceeController> {
        let program = CString::new(path.to_string_lossy().as_bytes()).map_err(|e| {
            TraceError::Spawn {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
        })?;

        match unsafe { fork() }? {
            ForkResult::Child => {
                if let Ok(persona) = personality::get() {
                    let _ = personality::set(persona | Persona::ADDR_NO_RANDOMIZE);
                }
                if let Err(e) = ptrace::traceme() {
                    eprintln!("traceme failed: {e}");
                    std::process::exit(127);
                }
                let _ = execv(&program, &[program.clone()]);
                eprintln!("exec of {} failed", path.display());
                std::process::exit(127);
            }
            ForkResult::Parent { child } => {
                let controller = TraceeController { pid: child };
                match controller.wait()? {
                    StopReason::Trap => {
                        info!("target started (pid {}), waiting for continuation", child);
                    }
                    StopReason::Exited(code) => {
                        return Err(TraceError::Spawn {
                            path: path.display().to_string(),
                            reason: format!("target exited immediately with code {code}"),
                        });
                    }
                    other => {
                        warn!("unexpected initial stop: {:?}", other);
                    }
                }
                Ok(controller)
            }
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Read the general-purpose registers.
    ///
    /// With `rewind_ip` the instruction pointer is wound back by one byte:
    /// after a software trap the trap instruction itself has executed, so
    /// the reported IP sits one past the breakpoint address.
    pub fn registers(&self, rewind_ip: bool) -> Result<Registers> {
        let mut raw = ptrace::getregs(self.pid)?;
        if rewind_ip {
            raw.rip -= 1;
        }
        Ok(Registers::new(raw))
    }

    pub fn set_registers(&self, regs: &Registers) -> Result<()> {
        ptrace::setregs(self.pid, regs.raw)?;
        Ok(())
    }

    /// Execute one machine instruction, then block until the stop.
    pub fn single_step(&self) -> Result<StopReason> {
        ptrace::step(self.pid, None)?;
        self.wait()
    }

    /// Resume the tracee and block until the next stop.
    pub fn cont(&self) -> Result<StopReason> {
        ptrace::cont(self.pid, None)?;
        self.wait()
    }

    /// Block until the tracee stops and classify the stop.
    pub fn wait(&self) -> Result<StopReason> {
        let status = waitpid(self.pid, None)?;
        let reason = match status {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => StopReason::Trap,
            WaitStatus::Stopped(_, signal) => StopReason::Signalled(signal),
            WaitStatus::Exited(_, code) => StopReason::Exited(code),
            WaitStatus::Signaled(_, signal, _) => StopReason::Signalled(signal),
            other => {
                debug!("unclassified wait status: {:?}", other);
                StopReason::Other
            }
        };
        debug!("tracee stop: {:?}", reason);
        Ok(reason)
    }

    /// Terminate the tracee and reap it.
    pub fn kill(&self) -> Result<()> {
        match ptrace::kill(self.pid) {
            Ok(()) => {
                let _ = waitpid(self.pid, None);
                Ok(())
            }
            // Already gone.
            Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl TraceeMem for TraceeController {
    fn peek(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(len + 8);
        let mut cursor = addr;
        while data.len() < len {
            let word = ptrace::read(self.pid, cursor as ptrace::AddressType)?;
            data.extend_from_slice(&word.to_le_bytes());
            cursor += 8;
        }
        data.truncate(len);
        Ok(data)
    }

    fn poke(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let mut offset = 0usize;
        while offset < data.len() {
            let cursor = addr + offset as u64;
            let remaining = data.len() - offset;
            let word = if remaining >= 8 {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&data[offset..offset + 8]);
                i64::from_le_bytes(bytes)
            } else {
                // Partial word: read-modify-write to preserve the
                // neighbouring bytes.
                let existing = ptrace::read(self.pid, cursor as ptrace::AddressType)?;
                let mut bytes = existing.to_le_bytes();
                bytes[..remaining].copy_from_slice(&data[offset..]);
                i64::from_le_bytes(bytes)
            };
            ptrace::write(self.pid, cursor as ptrace::AddressType, word)?;
            offset += 8.min(remaining);
        }
        Ok(())
    }
}
