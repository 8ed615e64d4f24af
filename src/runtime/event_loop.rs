//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! ## Fairness
//!
//! Every ready connection gets at most one bounded unit of I/O per pass: one
//! socket read while the request is arriving, one chunk of file content while
//! the response is streaming. mio readiness is edge-triggered, so a connection
//! that made progress without reaching `WouldBlock` is carried over and
//! dispatched again on the next pass, which is then polled without blocking.
//!
//! ## Pass snapshot
//!
//! The set of connections to service, and whether each is serviced for read
//! or write, is fixed before any handler runs. A connection flipped from read
//! to write interest during a pass is not written to in the same pass, and
//! new connections are accepted only after every existing one has been
//! serviced so a slot freed by an eviction cannot be handed a stale event.

use crate::config::Config;
use crate::runtime::connection::{ConnectionTable, Direction, Phase, ReadStatus, WriteStatus};
use crate::runtime::error::ConnError;
use crate::runtime::listener;
use crate::runtime::timeout::{TimeoutKind, TimeoutPolicy};
use mio::event::Event;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Longest wait before retrying an accept that failed with connections still
/// queued.
const ACCEPT_RETRY: Duration = Duration::from_millis(50);

/// Readiness of one connection as captured at the start of a pass.
#[derive(Debug, Clone, Copy)]
struct Ready {
    token: Token,
    readable: bool,
    writable: bool,
}

/// Single-threaded reactor owning the listener, the poller, and every
/// connection.
pub struct Reactor {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    connections: ConnectionTable,
    policy: TimeoutPolicy,
    chunk_size: usize,
    max_path_len: usize,
    sweep_interval: Option<Duration>,
    last_sweep: Instant,
    /// Connections that made progress last pass without reaching `WouldBlock`.
    carry: Vec<Token>,
    /// The last accept failed before draining the backlog.
    accept_pending: bool,
}

impl Reactor {
    /// Bind the listening socket described by `config`.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let addr = listener::resolve(&config.host, config.port)?;
        let listener = listener::bind(addr, config.backlog)?;
        Self::with_listener(TcpListener::from_std(listener), config)
    }

    /// Build a reactor around an already bound, non-blocking listener.
    pub fn with_listener(mut listener: TcpListener, config: &Config) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(config.events_capacity),
            listener,
            connections: ConnectionTable::new(config.max_connections),
            policy: TimeoutPolicy::from_config(config),
            chunk_size: config.chunk_size,
            max_path_len: config.max_path_len,
            sweep_interval: config.sweep_interval,
            last_sweep: Instant::now(),
            carry: Vec::new(),
            accept_pending: false,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[cfg(test)]
    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    /// Service connections until polling fails.
    pub fn run(&mut self) -> io::Result<()> {
        info!(
            addr = %self.local_addr()?,
            chunk_size = self.chunk_size,
            max_path_len = self.max_path_len,
            request_timeout_ms = self.policy.request.as_millis() as u64,
            response_timeout_ms = self.policy.response.as_millis() as u64,
            "Server listening"
        );

        loop {
            self.turn()?;
        }
    }

    /// Run one pass: poll, service ready connections, accept, sweep.
    pub fn turn(&mut self) -> io::Result<()> {
        let timeout = self.poll_timeout();
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                debug!("poll interrupted by a signal");
                return Ok(());
            }
            error!(error = %e, "poll failed");
            return Err(e);
        }

        let (ready, accept) = self.snapshot();
        for entry in ready {
            self.dispatch(entry);
        }

        if accept || self.accept_pending {
            self.accept_connections();
        }

        self.sweep_if_due();
        Ok(())
    }

    fn poll_timeout(&self) -> Option<Duration> {
        if !self.carry.is_empty() {
            return Some(Duration::ZERO);
        }
        let sweep = self
            .sweep_interval
            .map(|interval| interval.saturating_sub(self.last_sweep.elapsed()));
        if self.accept_pending {
            return Some(sweep.map_or(ACCEPT_RETRY, |wait| wait.min(ACCEPT_RETRY)));
        }
        sweep
    }

    /// Fix this pass's work: polled events plus carried-over connections,
    /// ascending by token, masked by each connection's current interest.
    fn snapshot(&mut self) -> (Vec<Ready>, bool) {
        let mut ready: BTreeMap<usize, Ready> = BTreeMap::new();
        let mut accept = false;

        for event in self.events.iter() {
            let token = event.token();
            if token == LISTENER_TOKEN {
                accept = true;
                continue;
            }
            if let Some(conn) = self.connections.get(token) {
                let entry = ready.entry(token.0).or_insert(Ready {
                    token,
                    readable: false,
                    writable: false,
                });
                match conn.direction() {
                    Direction::Read => entry.readable |= read_ready(event),
                    Direction::Write => entry.writable |= write_ready(event),
                }
            }
        }

        for token in self.carry.drain(..) {
            if let Some(conn) = self.connections.get(token) {
                let entry = ready.entry(token.0).or_insert(Ready {
                    token,
                    readable: false,
                    writable: false,
                });
                match conn.direction() {
                    Direction::Read => entry.readable = true,
                    Direction::Write => entry.writable = true,
                }
            }
        }

        (ready.into_values().collect(), accept)
    }

    fn dispatch(&mut self, ready: Ready) {
        let token = ready.token;

        if ready.readable {
            if let Some(kind) = self.timed_out(token) {
                self.evict(token, kind);
                return;
            }
            self.on_read_ready(token);
        }

        if ready.writable && self.connections.contains(token) {
            if let Some(kind) = self.timed_out(token) {
                self.evict(token, kind);
                return;
            }
            self.on_write_ready(token);
        }
    }

    fn timed_out(&self, token: Token) -> Option<TimeoutKind> {
        self.connections
            .get(token)
            .and_then(|conn| self.policy.expired(conn))
    }

    fn on_read_ready(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(token) else {
            return;
        };

        match conn.do_read(self.max_path_len) {
            Ok(ReadStatus::WouldBlock) => {}
            Ok(ReadStatus::Partial) => self.carry.push(token),
            Ok(ReadStatus::Complete) => {
                if let Phase::ReadComplete { path } = conn.phase() {
                    debug!(
                        conn_id = token.0,
                        path = %path.display(),
                        "Request complete, sending file"
                    );
                }
                conn.begin_response();

                match self
                    .connections
                    .set_direction(self.poll.registry(), token, Direction::Write)
                {
                    Ok(()) => self.carry.push(token),
                    Err(e) => self.fail(token, ConnError::Io(e)),
                }
            }
            Err(e) => self.fail(token, e),
        }
    }

    fn on_write_ready(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(token) else {
            return;
        };

        match conn.do_write(self.chunk_size) {
            Ok(WriteStatus::Sent(_)) => self.carry.push(token),
            Ok(WriteStatus::WouldBlock) => {}
            Ok(WriteStatus::Complete) => {
                if let Phase::WriteComplete { path, sent } = conn.phase() {
                    debug!(
                        conn_id = token.0,
                        path = %path.display(),
                        bytes = sent,
                        "File sent"
                    );
                }
            }
            Err(e) => {
                self.fail(token, e);
                return;
            }
        }

        if self
            .connections
            .get(token)
            .is_some_and(|conn| !conn.is_streaming())
        {
            self.connections.close(self.poll.registry(), token);
        }
    }

    fn fail(&mut self, token: Token, e: ConnError) {
        if let Some(conn) = self.connections.get_mut(token) {
            debug!(
                conn_id = token.0,
                peer = %conn.peer(),
                kind = e.kind(),
                error = %e,
                "Connection error"
            );
            conn.fail();
        }
        self.connections.close(self.poll.registry(), token);
    }

    fn evict(&mut self, token: Token, kind: TimeoutKind) {
        self.fail(token, ConnError::Timeout(kind));
    }

    /// Accept until the backlog is drained. Listener readiness is
    /// edge-triggered, so a failure leaves the accept owed to the next pass.
    fn accept_connections(&mut self) {
        self.accept_pending = false;
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    match self.connections.insert(self.poll.registry(), stream, peer) {
                        Ok(Some(token)) => {
                            debug!(
                                conn_id = token.0,
                                peer = %peer,
                                active = self.connections.len(),
                                "Accepted connection"
                            );
                        }
                        Ok(None) => warn!(peer = %peer, "Connection limit reached"),
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "Failed to register connection")
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    debug!("accept interrupted by a signal");
                }
                Err(e) => {
                    error!(error = %e, "Accept error, retrying next pass");
                    self.accept_pending = true;
                    break;
                }
            }
        }
    }

    /// Evict every connection past its deadline, ready or not.
    fn sweep_if_due(&mut self) {
        let Some(interval) = self.sweep_interval else {
            return;
        };
        if self.last_sweep.elapsed() < interval {
            return;
        }
        self.last_sweep = Instant::now();
        if self.connections.is_empty() {
            return;
        }

        let expired = self.connections.expired(&self.policy);
        if !expired.is_empty() {
            trace!(count = expired.len(), "Sweeping expired connections");
        }
        for (token, kind) in expired {
            self.evict(token, kind);
        }
    }
}

fn read_ready(event: &Event) -> bool {
    event.is_readable() || event.is_read_closed() || event.is_error()
}

fn write_ready(event: &Event) -> bool {
    event.is_writable() || event.is_write_closed() || event.is_error()
}
