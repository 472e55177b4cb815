mod args;
mod logging;
mod repl;
mod reporter;
mod session;

use anyhow::Result;
use clap::Parser;
use session::DebugSession;
use tracing::error;

fn main() -> Result<()> {
    let args = args::Args::parse();
    logging::initialize_logging();

    let target = args::resolve_target(&args.target)?;

    let reporter = match args.orchestrator.as_deref() {
        Some(addr) => reporter::Reporter::connect(addr),
        None => reporter::Reporter::disabled(),
    };

    // A target without usable DWARF cannot be debugged; failures here are
    // fatal by design.
    let mut session = match DebugSession::launch(&target, reporter) {
        Ok(session) => session,
        Err(e) => {
            error!("failed to start debug session: {e:#}");
            std::process::exit(1);
        }
    };

    session.run()
}
