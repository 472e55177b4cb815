//! The rankdb orchestrator
//!
//! Collects the debugger instances of a distributed MPI session: each
//! rank registers its tracee pid and receives a monotonically increasing
//! node id, then reports every executed command. When the last node
//! exits, the orchestrator shuts itself down after a short grace period.
//!
//! Protocol: line-delimited JSON over TCP, one `Request` per line, one
//! `Reply` per line (see `rankdb-protocol`).

use anyhow::Result;
use clap::Parser;
use rankdb_protocol::{CommandResult, Reply, Request};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rankdb-orchestrator")]
#[command(about = "Registration and result-reporting service for distributed rankdb sessions")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:7077", value_name = "ADDR")]
    listen: String,
}

/// Registered rank nodes. Held behind a mutex and handed to every
/// connection handler; there is no module-scope state.
#[derive(Default)]
struct Registry {
    next_id: u32,
    nodes: HashMap<u32, i32>,
}

impl Registry {
    fn register(&mut self, pid: i32) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.nodes.insert(id, pid);
        id
    }

    /// Record a command result; returns true when this removal emptied
    /// the registry.
    fn report(&mut self, node_id: u32, result: &CommandResult) -> bool {
        if result.exited {
            self.nodes.remove(&node_id);
            info!("node {} exited", node_id);
            return self.nodes.is_empty();
        }
        false
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let listener = TcpListener::bind(&args.listen).await?;
    info!("orchestrator listening on {}", args.listen);

    let registry = Arc::new(Mutex::new(Registry::default()));

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("debugger connected from {}", peer);
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, registry).await {
                warn!("connection from {} failed: {e:#}", peer);
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, registry: Arc<Mutex<Registry>>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<Request>(&line) {
            Ok(request) => dispatch(request, &registry).await,
            Err(e) => Reply::Error {
                message: format!("malformed request: {e}"),
            },
        };
        let mut encoded = serde_json::to_string(&reply)?;
        encoded.push('\n');
        writer.write_all(encoded.as_bytes()).await?;
    }
    Ok(())
}

async fn dispatch(request: Request, registry: &Arc<Mutex<Registry>>) -> Reply {
    match request {
        Request::Register { pid } => {
            let node_id = registry.lock().await.register(pid);
            info!("added process {} (pid: {}) to process list", node_id, pid);
            Reply::Registered { node_id }
        }
        Request::ReportResult {
            node_id,
            command,
            result,
        } => {
            info!("node {} executed command {:?}", node_id, command);
            let emptied = registry.lock().await.report(node_id, &result);
            if emptied {
                schedule_shutdown(Arc::clone(registry));
            }
            Reply::Ack
        }
    }
}

/// Shut down half a second after the registry empties, unless a new node
/// registered in the meantime.
fn schedule_shutdown(registry: Arc<Mutex<Registry>>) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        if registry.lock().await.nodes.is_empty() {
            info!("all nodes exited, shutting down");
            std::process::exit(0);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_increase_monotonically() {
        let mut registry = Registry::default();
        assert_eq!(registry.register(100), 0);
        assert_eq!(registry.register(101), 1);
        assert_eq!(registry.register(102), 2);
    }

    #[test]
    fn exit_reports_remove_nodes_and_detect_emptiness() {
        let mut registry = Registry::default();
        let a = registry.register(100);
        let b = registry.register(101);

        assert!(!registry.report(a, &CommandResult::running()));
        assert!(!registry.report(a, &CommandResult::exited(Some(0))));
        assert!(registry.report(b, &CommandResult::exited(Some(0))));
    }
}
