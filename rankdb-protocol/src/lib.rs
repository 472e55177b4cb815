//! Wire types shared between the rankdb debugger and the orchestrator
//!
//! The orchestrator speaks line-delimited JSON over TCP: one request per
//! line, one reply per line. Every type here is plain data; the transport
//! lives with its users.

use serde::{Deserialize, Serialize};

/// Debugger commands, as dispatched by the session loop.
///
/// A closed set with per-case payloads, so dispatch is exhaustive and new
/// commands cannot be half-wired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    /// Execute a single machine instruction.
    Step,
    /// Resume until the next breakpoint or exit.
    Continue,
    /// Insert a breakpoint at this source line.
    Break { line: i64 },
    /// Print the reconstructed call stack.
    Stack,
    /// Print the general-purpose registers.
    Registers,
    /// Print the value of a variable.
    Print { variable: String },
    /// Terminate the tracee and end the session.
    Quit,
    /// Reprint the instruction banner.
    Help,
}

impl Command {
    /// Whether this command advances the tracee. Progress commands are
    /// followed by breakpoint catch-and-restore and a registers
    /// diagnostic.
    pub fn is_progress_command(&self) -> bool {
        matches!(self, Command::Step | Command::Continue | Command::Quit)
    }
}

/// Outcome of one executed command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// True when the tracee is gone after this command.
    pub exited: bool,
    /// Exit code, when `exited` and the tracee exited normally.
    pub exit_code: Option<i32>,
}

impl CommandResult {
    pub fn running() -> Self {
        CommandResult::default()
    }

    pub fn exited(code: Option<i32>) -> Self {
        CommandResult {
            exited: true,
            exit_code: code,
        }
    }
}

/// Requests a debugger node sends to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Announce a new rank node; the reply assigns its node id.
    Register { pid: i32 },
    /// Report the outcome of a command executed on a node.
    ReportResult {
        node_id: u32,
        command: Command,
        result: CommandResult,
    },
}

/// Orchestrator replies, one per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Registered { node_id: u32 },
    Ack,
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_commands_are_the_tracee_advancing_ones() {
        assert!(Command::Step.is_progress_command());
        assert!(Command::Continue.is_progress_command());
        assert!(Command::Quit.is_progress_command());
        assert!(!Command::Stack.is_progress_command());
        assert!(!Command::Break { line: 7 }.is_progress_command());
    }

    #[test]
    fn requests_round_trip_through_json() {
        let request = Request::ReportResult {
            node_id: 3,
            command: Command::Continue,
            result: CommandResult::exited(Some(0)),
        };
        let line = serde_json::to_string(&request).unwrap();
        let back: Request = serde_json::from_str(&line).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn register_request_wire_shape_is_stable() {
        let line = serde_json::to_string(&Request::Register { pid: 42 }).unwrap();
        assert_eq!(line, r#"{"type":"register","pid":42}"#);
    }
}
