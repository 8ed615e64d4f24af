//! fetchd: a single-threaded file retrieval server
//!
//! A client connects, sends a file path terminated by `\r\n` or `\n`, and
//! receives the file's bytes before the server closes the connection.
//!
//! Features:
//! - One thread multiplexing every connection over epoll/kqueue
//! - Requests reassembled from arbitrarily fragmented reads
//! - Responses streamed one bounded chunk per readiness event
//! - Request and response deadlines, with a periodic idle sweep
//! - Configuration via CLI arguments or TOML file

mod config;
mod runtime;
mod stopwatch;

use config::Config;
use tracing::{error, info};
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
        host = %config.host,
        port = config.port,
        backlog = config.backlog,
        chunk_size = config.chunk_size,
        max_path_len = config.max_path_len,
        "Starting fetchd server"
    );

    if let Err(e) = runtime::run(&config) {
        error!(error = %e, "Server stopped");
        return Err(e.into());
    }
    Ok(())
}
