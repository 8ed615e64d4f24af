//! Phase deadlines.
//!
//! A connection awaiting its request is held to the request deadline, measured
//! from when it was accepted. A connection streaming a file is held to the
//! response deadline, measured from when the file was opened. Every other
//! phase lasts at most one pass of the event loop and is never timed out.

use crate::config::Config;
use crate::runtime::connection::{Connection, Phase};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Request,
    Response,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Request => write!(f, "request"),
            TimeoutKind::Response => write!(f, "response"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    pub request: Duration,
    pub response: Duration,
}

impl TimeoutPolicy {
    pub fn new(request: Duration, response: Duration) -> Self {
        Self { request, response }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.request_timeout, config.response_timeout)
    }

    /// Deadline that governs `phase`, if any.
    pub fn deadline(&self, phase: &Phase) -> Option<(TimeoutKind, Duration)> {
        match phase {
            Phase::Unknown | Phase::Reading(_) => Some((TimeoutKind::Request, self.request)),
            Phase::Writing { .. } => Some((TimeoutKind::Response, self.response)),
            _ => None,
        }
    }

    /// Which deadline, if any, `elapsed` has reached in `phase`.
    pub fn check(&self, phase: &Phase, elapsed: Duration) -> Option<TimeoutKind> {
        self.deadline(phase)
            .filter(|&(_, limit)| elapsed >= limit)
            .map(|(kind, _)| kind)
    }

    pub fn expired(&self, conn: &Connection) -> Option<TimeoutKind> {
        self.check(conn.phase(), conn.timer().lap())
    }
}
