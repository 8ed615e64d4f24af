//! Connection state machine and the table that owns every live connection.
//!
//! Each connection moves through a fixed sequence of phases:
//!
//! ```text
//! Unknown -> Reading -> ReadComplete -> WriteReady -> Writing -> WriteComplete
//! ```
//!
//! with `Error` reachable from any of them. Data only meaningful in one phase
//! lives inside that phase's variant: the request buffer exists only while the
//! request is being read and the file handle only while it is being streamed.

use crate::runtime::error::ConnError;
use crate::runtime::request::{path_from_bytes, ParseResult, RequestBuf};
use crate::runtime::timeout::{TimeoutKind, TimeoutPolicy};
use crate::stopwatch::Stopwatch;
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use slab::Slab;
use std::fs::File;
use std::io::{self, Read, Write};
use std::mem;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{debug, trace};

/// Current phase of a connection.
#[derive(Debug)]
pub enum Phase {
    /// Accepted, no request bytes seen yet.
    Unknown,
    /// Request line partially received.
    Reading(RequestBuf),
    /// Request line parsed; the path is known.
    ReadComplete { path: PathBuf },
    /// Registered for write readiness; the file is opened on the next event.
    WriteReady { path: PathBuf },
    /// Streaming file contents.
    Writing {
        path: PathBuf,
        file: File,
        /// Bytes read from the file but not yet accepted by the socket.
        chunk: BytesMut,
        sent: u64,
    },
    /// Whole file sent; the file is closed.
    WriteComplete { path: PathBuf, sent: u64 },
    Error,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Unknown => "unknown",
            Phase::Reading(_) => "reading",
            Phase::ReadComplete { .. } => "read_complete",
            Phase::WriteReady { .. } => "write_ready",
            Phase::Writing { .. } => "writing",
            Phase::WriteComplete { .. } => "write_complete",
            Phase::Error => "error",
        }
    }
}

/// Which readiness a connection is registered for. Never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub fn interest(self) -> Interest {
        match self {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
        }
    }
}

/// Result of one `do_read` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Nothing to read right now.
    WouldBlock,
    /// Bytes arrived but the terminator has not.
    Partial,
    /// The request line is complete.
    Complete,
}

/// Result of one `do_write` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// The socket cannot take more bytes; any pending chunk is kept.
    WouldBlock,
    /// This many bytes were written.
    Sent(usize),
    /// End of file reached; the file is closed.
    Complete,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    phase: Phase,
    direction: Direction,
    timer: Stopwatch,
}

impl Connection {
    /// Create a connection awaiting its request. Starts the request timer.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            phase: Phase::Unknown,
            direction: Direction::Read,
            timer: Stopwatch::started(),
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn timer(&self) -> &Stopwatch {
        &self.timer
    }

    /// Still owes the peer file bytes.
    pub fn is_streaming(&self) -> bool {
        matches!(self.phase, Phase::Writing { .. })
    }

    /// Perform one non-blocking read of request bytes.
    ///
    /// The terminator is searched for over the whole accumulated buffer, so it
    /// may be split across any number of reads. On error the phase is `Error`.
    pub fn do_read(&mut self, max_path_len: usize) -> Result<ReadStatus, ConnError> {
        let (mut request, fresh) = match mem::replace(&mut self.phase, Phase::Error) {
            Phase::Unknown => (RequestBuf::new(max_path_len), true),
            Phase::Reading(request) => (request, false),
            other => {
                self.phase = other;
                return Ok(ReadStatus::WouldBlock);
            }
        };

        let n = loop {
            match self.stream.read(request.spare_mut()) {
                Ok(0) => return Err(ConnError::PeerClosed),
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.phase = if fresh {
                        Phase::Unknown
                    } else {
                        Phase::Reading(request)
                    };
                    return Ok(ReadStatus::WouldBlock);
                }
                Err(e) => return Err(ConnError::Io(e)),
            }
        };

        request.commit(n);
        trace!(peer = %self.peer, bytes = n, filled = request.filled(), "Read request bytes");

        match request.parse() {
            ParseResult::Incomplete => {
                self.phase = Phase::Reading(request);
                Ok(ReadStatus::Partial)
            }
            ParseResult::TooLong => Err(ConnError::PathTooLong {
                limit: max_path_len,
            }),
            ParseResult::Complete { path_len } => {
                let raw = request.into_path(path_len);
                let waited = self.timer.elapsed();
                trace!(peer = %self.peer, waited_ms = waited.as_millis() as u64, "Request received");
                self.phase = Phase::ReadComplete {
                    path: path_from_bytes(&raw),
                };
                Ok(ReadStatus::Complete)
            }
        }
    }

    /// Move a parsed request on to the response phase.
    ///
    /// Returns false if the request was not complete.
    pub fn begin_response(&mut self) -> bool {
        match mem::replace(&mut self.phase, Phase::Error) {
            Phase::ReadComplete { path } => {
                self.phase = Phase::WriteReady { path };
                true
            }
            other => {
                self.phase = other;
                false
            }
        }
    }

    /// Perform at most one read-then-write cycle of file content.
    ///
    /// The first call opens the file and restarts the timer for the response
    /// deadline. A chunk the socket would not take is kept and retried on the
    /// next call before any more of the file is read. On error the phase is
    /// `Error` and the file is closed.
    pub fn do_write(&mut self, chunk_size: usize) -> Result<WriteStatus, ConnError> {
        let (path, mut file, mut chunk, mut sent) =
            match mem::replace(&mut self.phase, Phase::Error) {
                Phase::WriteReady { path } => {
                    let file = match File::open(&path) {
                        Ok(file) => file,
                        Err(source) => return Err(ConnError::Open { path, source }),
                    };
                    self.timer.reset();
                    self.timer.start();
                    debug!(peer = %self.peer, path = %path.display(), "Streaming file");
                    (path, file, BytesMut::with_capacity(chunk_size), 0)
                }
                Phase::Writing {
                    path,
                    file,
                    chunk,
                    sent,
                } => (path, file, chunk, sent),
                other => {
                    self.phase = other;
                    return Ok(WriteStatus::WouldBlock);
                }
            };

        if chunk.is_empty() {
            chunk.resize(chunk_size, 0);
            let n = loop {
                match file.read(&mut chunk[..]) {
                    Ok(n) => break n,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(ConnError::Io(e)),
                }
            };
            chunk.truncate(n);

            if n == 0 {
                drop(file);
                let took = self.timer.elapsed();
                trace!(peer = %self.peer, sent, took_ms = took.as_millis() as u64, "Reached end of file");
                self.phase = Phase::WriteComplete { path, sent };
                return Ok(WriteStatus::Complete);
            }
        }

        let n = loop {
            match self.stream.write(&chunk) {
                Ok(0) => return Err(ConnError::WriteZero),
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.phase = Phase::Writing {
                        path,
                        file,
                        chunk,
                        sent,
                    };
                    return Ok(WriteStatus::WouldBlock);
                }
                Err(e) => return Err(ConnError::Io(e)),
            }
        };

        chunk.advance(n);
        sent += n as u64;
        trace!(peer = %self.peer, bytes = n, sent, "Wrote chunk");

        self.phase = Phase::Writing {
            path,
            file,
            chunk,
            sent,
        };
        Ok(WriteStatus::Sent(n))
    }

    /// Mark the connection failed, closing any open file.
    pub fn fail(&mut self) {
        self.phase = Phase::Error;
    }
}

/// Registry of live connections using slab allocation.
///
/// The slab key is the connection's mio token. `close` is the only way a
/// connection leaves the table, and it drops the socket and any open file
/// together.
pub struct ConnectionTable {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionTable {
    /// Create a new table with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert a newly accepted socket and register it for read readiness.
    ///
    /// Returns `Ok(None)` and drops the socket if the table is at capacity.
    pub fn insert(
        &mut self,
        registry: &Registry,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> io::Result<Option<Token>> {
        if self.connections.len() >= self.max_connections {
            return Ok(None);
        }

        let entry = self.connections.vacant_entry();
        let token = Token(entry.key());
        let mut conn = Connection::new(stream, peer);
        registry.register(&mut conn.stream, token, Direction::Read.interest())?;
        entry.insert(conn);
        Ok(Some(token))
    }

    pub fn get(&self, token: Token) -> Option<&Connection> {
        self.connections.get(token.0)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Connection> {
        self.connections.get_mut(token.0)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.connections.contains(token.0)
    }

    /// Re-register a connection for the other kind of readiness.
    pub fn set_direction(
        &mut self,
        registry: &Registry,
        token: Token,
        direction: Direction,
    ) -> io::Result<()> {
        let conn = self
            .connections
            .get_mut(token.0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;
        registry.reregister(&mut conn.stream, token, direction.interest())?;
        conn.direction = direction;
        Ok(())
    }

    /// Deregister and drop a connection, closing its socket and any open file.
    pub fn close(&mut self, registry: &Registry, token: Token) -> bool {
        match self.connections.try_remove(token.0) {
            Some(mut conn) => {
                let _ = registry.deregister(&mut conn.stream);
                debug!(
                    conn_id = token.0,
                    peer = %conn.peer,
                    phase = conn.phase.name(),
                    "Connection closed"
                );
                true
            }
            None => false,
        }
    }

    /// Connections whose phase deadline has passed.
    pub fn expired(&self, policy: &TimeoutPolicy) -> Vec<(Token, TimeoutKind)> {
        self.connections
            .iter()
            .filter_map(|(key, conn)| policy.expired(conn).map(|kind| (Token(key), kind)))
            .collect()
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{pattern, ScratchDir};
    use mio::Poll;
    use std::net::TcpListener as StdListener;
    use std::net::TcpStream as StdStream;
    use std::thread;
    use std::time::Duration;

    fn socket_pair() -> (StdStream, TcpStream, SocketAddr) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let client = StdStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (client, TcpStream::from_std(server), peer)
    }

    fn connection() -> (StdStream, Connection) {
        let (client, server, peer) = socket_pair();
        (client, Connection::new(server, peer))
    }

    /// Call `do_read` until it reports something other than `WouldBlock`.
    fn read_step(conn: &mut Connection, max_path_len: usize) -> Result<ReadStatus, ConnError> {
        for _ in 0..200 {
            match conn.do_read(max_path_len) {
                Ok(ReadStatus::WouldBlock) => thread::sleep(Duration::from_millis(5)),
                other => return other,
            }
        }
        panic!("no request bytes arrived");
    }

    fn send(client: &mut StdStream, bytes: &[u8]) {
        client.write_all(bytes).unwrap();
        client.flush().unwrap();
    }

    #[test]
    fn test_fragmented_request() {
        let (mut client, mut conn) = connection();
        assert!(matches!(conn.phase(), Phase::Unknown));
        assert_eq!(conn.do_read(256).unwrap(), ReadStatus::WouldBlock);
        assert!(matches!(conn.phase(), Phase::Unknown));

        send(&mut client, b"rep");
        assert_eq!(read_step(&mut conn, 256).unwrap(), ReadStatus::Partial);
        assert!(matches!(conn.phase(), Phase::Reading(_)));

        send(&mut client, b"ort.txt\r");
        assert_eq!(read_step(&mut conn, 256).unwrap(), ReadStatus::Partial);

        send(&mut client, b"\n");
        assert_eq!(read_step(&mut conn, 256).unwrap(), ReadStatus::Complete);
        match conn.phase() {
            Phase::ReadComplete { path } => assert_eq!(path, &PathBuf::from("report.txt")),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!conn.timer().is_running());
    }

    #[test]
    fn test_peer_closed_before_request() {
        let (mut client, mut conn) = connection();
        send(&mut client, b"partial");
        assert_eq!(read_step(&mut conn, 256).unwrap(), ReadStatus::Partial);

        drop(client);
        assert!(matches!(
            read_step(&mut conn, 256),
            Err(ConnError::PeerClosed)
        ));
        assert!(matches!(conn.phase(), Phase::Error));
    }

    #[test]
    fn test_path_too_long() {
        let (mut client, mut conn) = connection();
        send(&mut client, b"abcdefghijkl\r\n");

        let result = loop {
            match read_step(&mut conn, 8) {
                Ok(ReadStatus::Partial) => continue,
                other => break other,
            }
        };
        assert!(matches!(result, Err(ConnError::PathTooLong { limit: 8 })));
        assert!(matches!(conn.phase(), Phase::Error));
    }

    #[test]
    fn test_streams_whole_file_in_chunks() {
        let scratch = ScratchDir::new();
        let data = pattern(20_000);
        let path = scratch.file("conn-stream", &data);
        let (mut client, mut conn) = connection();

        send(&mut client, format!("{}\n", path.display()).as_bytes());
        assert_eq!(read_step(&mut conn, 4096).unwrap(), ReadStatus::Complete);
        assert!(conn.begin_response());
        assert!(matches!(conn.phase(), Phase::WriteReady { .. }));

        let mut writes = 0;
        loop {
            match conn.do_write(8192).unwrap() {
                WriteStatus::Sent(n) => {
                    assert!(n <= 8192);
                    assert!(conn.is_streaming());
                    writes += 1;
                }
                WriteStatus::WouldBlock => thread::sleep(Duration::from_millis(5)),
                WriteStatus::Complete => break,
            }
        }
        assert!(writes >= 3);
        match conn.phase() {
            Phase::WriteComplete { sent, .. } => assert_eq!(*sent, 20_000),
            other => panic!("unexpected: {:?}", other),
        }

        drop(conn);
        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        assert_eq!(received, data);
    }

    #[test]
    fn test_open_failure() {
        let (mut client, mut conn) = connection();
        send(&mut client, b"/nonexistent/fetchd/missing.txt\r\n");
        assert_eq!(read_step(&mut conn, 256).unwrap(), ReadStatus::Complete);
        assert!(conn.begin_response());

        assert!(matches!(conn.do_write(8192), Err(ConnError::Open { .. })));
        assert!(matches!(conn.phase(), Phase::Error));
        assert!(!conn.is_streaming());
    }

    #[test]
    fn test_file_open_restarts_timer() {
        let scratch = ScratchDir::new();
        let path = scratch.file("conn-timer", &pattern(100));
        let (mut client, mut conn) = connection();
        let policy = TimeoutPolicy::new(Duration::from_millis(50), Duration::from_millis(50));

        thread::sleep(Duration::from_millis(60));
        assert_eq!(policy.expired(&conn), Some(TimeoutKind::Request));

        send(&mut client, format!("{}\r\n", path.display()).as_bytes());
        assert_eq!(read_step(&mut conn, 4096).unwrap(), ReadStatus::Complete);
        assert_eq!(policy.expired(&conn), None);

        conn.begin_response();
        assert!(matches!(conn.do_write(64).unwrap(), WriteStatus::Sent(_)));
        assert!(conn.timer().is_running());
        assert!(conn.timer().lap() < Duration::from_millis(50));

        thread::sleep(Duration::from_millis(60));
        assert_eq!(policy.expired(&conn), Some(TimeoutKind::Response));
    }

    #[test]
    fn test_table_insert_and_close() {
        let poll = Poll::new().unwrap();
        let mut table = ConnectionTable::new(1);

        let (_c1, s1, p1) = socket_pair();
        let (_c2, s2, p2) = socket_pair();

        let token = table.insert(poll.registry(), s1, p1).unwrap().unwrap();
        assert!(table.contains(token));
        assert_eq!(table.get(token).unwrap().direction(), Direction::Read);

        // At capacity
        assert!(table.insert(poll.registry(), s2, p2).unwrap().is_none());

        table
            .set_direction(poll.registry(), token, Direction::Write)
            .unwrap();
        assert_eq!(table.get(token).unwrap().direction(), Direction::Write);

        assert!(table.close(poll.registry(), token));
        assert!(!table.close(poll.registry(), token));
        assert!(table.is_empty());
    }

    #[test]
    fn test_close_drops_socket() {
        let poll = Poll::new().unwrap();
        let mut table = ConnectionTable::new(4);
        let (mut client, server, peer) = socket_pair();

        let token = table.insert(poll.registry(), server, peer).unwrap().unwrap();
        table.close(poll.registry(), token);

        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }
}
