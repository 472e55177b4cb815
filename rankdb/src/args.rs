use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "rankdb")]
#[command(about = "A source-level debugger for MPI programs, one instance per rank")]
#[command(version)]
pub struct Args {
    /// Target binary to debug: a path, or one of the bundled demo
    /// shortcuts `mpi`, `c`, `go`
    pub target: String,

    /// Orchestrator address to register this rank with (host:port)
    #[arg(long, value_name = "ADDR")]
    pub orchestrator: Option<String>,
}

/// Resolve the target argument to an on-disk binary, honoring the
/// reserved demo shortcuts.
pub fn resolve_target(raw: &str) -> Result<PathBuf> {
    let path = match raw {
        "mpi" => {
            info!("mpi specified, loading example mpi binary");
            PathBuf::from("demos/hello_mpi_c/hello")
        }
        "c" => {
            info!("c specified, loading example c binary");
            PathBuf::from("demos/hello_c/hello")
        }
        "go" => {
            info!("go specified, loading example go binary");
            PathBuf::from("demos/hello_go/hello")
        }
        other => PathBuf::from(other),
    };

    if !path.exists() {
        bail!("target binary does not exist: {}", path.display());
    }
    Ok(path)
}
