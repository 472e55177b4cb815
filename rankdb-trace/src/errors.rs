//! Error types for tracee control

#[derive(thiserror::Error, Debug)]
pub enum TraceError {
    /// ptrace/wait/fork failures while driving the tracee.
    #[error("tracee IO error: {0}")]
    TraceeIo(#[from] nix::errno::Errno),
    #[error("failed to spawn target {path}: {reason}")]
    Spawn { path: String, reason: String },
    /// A trap fired at a PC no breakpoint map owns.
    #[error("stray trap at {address:#x}, not owned by any breakpoint")]
    StrayTrap { address: u64 },
    /// Single-ownership invariant: one PC belongs to at most one map.
    #[error("breakpoint already installed at {address:#x}")]
    BreakpointExists { address: u64 },
    #[error(transparent)]
    Dwarf(#[from] rankdb_dwarf::DwarfError),
}

pub type Result<T> = std::result::Result<T, TraceError>;
