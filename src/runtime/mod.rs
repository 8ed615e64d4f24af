//! Readiness-driven runtime for serving files.
//!
//! A single thread owns everything:
//! - `Reactor`: mio poll loop, listener, and dispatch
//! - `ConnectionTable`: slab of live connections keyed by mio token
//! - `Connection`: per-socket state machine (request in, file out)
//! - `TimeoutPolicy`: request and response deadlines

mod connection;
mod error;
mod event_loop;
mod listener;
mod request;
mod timeout;

#[cfg(test)]
mod testing;

pub use event_loop::Reactor;

use crate::config::Config;
use tracing::info;

/// Bind the listener and serve until the event loop fails.
pub fn run(config: &Config) -> std::io::Result<()> {
    let mut reactor = Reactor::bind(config)?;
    info!(
        max_connections = config.max_connections,
        sweep_interval_ms = config.sweep_interval.map(|d| d.as_millis() as u64),
        "Using mio runtime (epoll/kqueue)"
    );
    reactor.run()
}
