//! Monotonic stopwatch used to time the request and response phases of a
//! connection.

use std::time::{Duration, Instant};

/// Start/stop timer over the monotonic clock.
///
/// A fresh or reset stopwatch reports zero elapsed time.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stopwatch {
    started: Option<Instant>,
    stopped: Option<Instant>,
    running: bool,
}

impl Stopwatch {
    /// Create a stopped stopwatch with no recorded interval.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a stopwatch that is already running.
    pub fn started() -> Self {
        let mut watch = Self::new();
        watch.start();
        watch
    }

    /// Start (or restart) timing from now.
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
        self.stopped = None;
        self.running = true;
    }

    /// Stop timing. Has no effect on a stopwatch that is not running.
    pub fn stop(&mut self) {
        if self.running {
            self.stopped = Some(Instant::now());
            self.running = false;
        }
    }

    /// Elapsed time of the recorded interval.
    ///
    /// A running stopwatch is stopped first, so repeated calls return the
    /// same value until the stopwatch is started again.
    pub fn elapsed(&mut self) -> Duration {
        if self.running {
            self.stop();
        }
        self.lap()
    }

    /// Elapsed time without stopping a running stopwatch.
    pub fn lap(&self) -> Duration {
        match (self.started, self.stopped) {
            (Some(start), _) if self.is_running() => start.elapsed(),
            (Some(start), Some(stop)) => stop.saturating_duration_since(start),
            _ => Duration::ZERO,
        }
    }

    /// Clear the recorded interval and stop.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}
