//! Command-line shim around the streaming engine.
//!
//! Reads `uuid_audio_stream` command lines from stdin, one per line, and
//! writes the `+OK` / `-ERR` response for each to stdout. Host-side events
//! are printed to stdout as single-line JSON records prefixed with
//! `EVENT`. The telephony platform integration proper lives out of tree;
//! this shim exists for operating and exercising the engine directly.

use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use callstream::{CommandSurface, EngineConfig, EventSink, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "callstream", about = "Realtime call audio streaming engine")]
struct Args {
    /// Log filter, e.g. "info" or "callstream=debug"
    #[arg(long, default_value = "info")]
    log: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = EngineConfig::from_env();
    let events: EventSink = Arc::new(|event| {
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(
            stdout,
            "EVENT {} {} {}",
            event.kind,
            event.call_id,
            event.payload
        );
    });

    let supervisor = Arc::new(Supervisor::new(config, events)?);
    let surface = CommandSurface::new(supervisor.clone());

    info!("callstream ready, reading commands from stdin");

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = surface.dispatch(&line);
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{response}")?;
        stdout.flush()?;
    }

    info!("stdin closed, shutting down");
    drop(surface);
    if let Ok(supervisor) = Arc::try_unwrap(supervisor) {
        supervisor.shutdown();
    }
    Ok(())
}
