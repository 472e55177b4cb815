//! Orchestrator client
//!
//! Registers this rank's tracee pid with the orchestrator and reports
//! every command result. The reporter degrades to a no-op when no
//! orchestrator is configured or the connection is lost; a debugging
//! session never depends on the orchestrator being reachable.

use anyhow::{anyhow, Context, Result};
use rankdb_protocol::{Command, CommandResult, Reply, Request};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use tracing::{info, warn};

pub struct Reporter {
    conn: Option<Connection>,
    node_id: Option<u32>,
}

struct Connection {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Reporter {
    pub fn disabled() -> Self {
        Reporter {
            conn: None,
            node_id: None,
        }
    }

    /// Connect to the orchestrator; failures log a warning and produce a
    /// disabled reporter.
    pub fn connect(addr: &str) -> Self {
        match Connection::open(addr) {
            Ok(conn) => {
                info!("connected to orchestrator at {}", addr);
                Reporter {
                    conn: Some(conn),
                    node_id: None,
                }
            }
            Err(e) => {
                warn!("orchestrator at {} unreachable, reporting disabled: {e:#}", addr);
                Reporter::disabled()
            }
        }
    }

    /// Announce the tracee and obtain this rank's node id.
    pub fn register(&mut self, pid: i32) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        match conn.round_trip(&Request::Register { pid }) {
            Ok(Reply::Registered { node_id }) => {
                info!("registered with orchestrator as node {}", node_id);
                self.node_id = Some(node_id);
            }
            Ok(other) => {
                warn!("unexpected registration reply: {:?}", other);
                self.conn = None;
            }
            Err(e) => {
                warn!("orchestrator registration failed: {e:#}");
                self.conn = None;
            }
        }
    }

    /// Report one executed command's outcome.
    pub fn report(&mut self, command: &Command, result: &CommandResult) {
        let (Some(conn), Some(node_id)) = (self.conn.as_mut(), self.node_id) else {
            return;
        };
        let request = Request::ReportResult {
            node_id,
            command: command.clone(),
            result: result.clone(),
        };
        match conn.round_trip(&request) {
            Ok(Reply::Ack) => {}
            Ok(other) => warn!("unexpected report reply: {:?}", other),
            Err(e) => {
                warn!("orchestrator report failed, disabling reporting: {e:#}");
                self.conn = None;
            }
        }
    }
}

impl Connection {
    fn open(addr: &str) -> Result<Connection> {
        let writer = TcpStream::connect(addr).context("connect")?;
        let reader = BufReader::new(writer.try_clone().context("clone stream")?);
        Ok(Connection { writer, reader })
    }

    fn round_trip(&mut self, request: &Request) -> Result<Reply> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes())?;

        let mut reply = String::new();
        let n = self.reader.read_line(&mut reply)?;
        if n == 0 {
            return Err(anyhow!("orchestrator closed the connection"));
        }
        Ok(serde_json::from_str(reply.trim())?)
    }
}
