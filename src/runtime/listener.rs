//! Listening socket bootstrap.

use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};

/// Resolve `host:port` into a bind address. `host` may be an IP literal or a
/// name; the first resolved address is used.
pub fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no address for host '{host}'"),
        )
    })
}

/// Create a non-blocking TCP listener with SO_REUSEADDR and a bounded backlog.
pub fn bind(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        assert_eq!(
            resolve("0.0.0.0", 2013).unwrap(),
            "0.0.0.0:2013".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            resolve("::1", 80).unwrap(),
            "[::1]:80".parse::<SocketAddr>().unwrap()
        );
        assert!(resolve("localhost", 8080).unwrap().ip().is_loopback());
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let listener = bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        // Non-blocking: no pending connection means WouldBlock, not a hang.
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
