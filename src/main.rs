//! matrix-server: a shared 3x3 integer matrix over TCP
//!
//! Clients send fixed 15-byte frames (`GET`, `SET`, `SUM` plus row, col and
//! value) and receive a 4-byte integer back. All clients share one matrix,
//! served from a single-threaded readiness loop.
//!
//! Features:
//! - Non-blocking multiplexed I/O via mio
//! - Partial and pipelined frames buffered per connection
//! - Clean shutdown on SIGINT/SIGTERM
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocol;
mod runtime;
mod storage;

use config::Config;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::flag;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        backlog = config.backlog,
        max_connections = ?config.max_connections,
        "Starting matrix-server"
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGINT, Arc::clone(&shutdown))?;
    flag::register(SIGTERM, Arc::clone(&shutdown))?;

    runtime::run(config, shutdown)?;

    info!("Server stopped");
    Ok(())
}
