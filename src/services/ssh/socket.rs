//! Small cross-platform socket helpers.

use super::error::SocketError;
use mio::net::TcpListener;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

/// Backlog for tunnel listening sockets.
pub const LISTEN_BACKLOG: i32 = 5;

/// A freshly bound listening socket and the port the OS picked for it.
#[derive(Debug)]
pub struct SockInfo {
    pub listener: TcpListener,
    pub port: u16,
}

/// Create a non-blocking listening socket on an OS-assigned port.
///
/// On failure the partially configured socket is closed before returning.
pub fn create_listening_socket(bind_host: &str) -> Result<SockInfo, SocketError> {
    let addr = resolve(bind_host)?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| SocketError::new("socket", e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| SocketError::new("setsockopt(SO_REUSEADDR)", e))?;
    set_non_blocking(&socket)?;
    socket
        .bind(&addr.into())
        .map_err(|e| SocketError::new("bind", e))?;

    let port = socket
        .local_addr()
        .map_err(|e| SocketError::new("getsockname", e))?
        .as_socket()
        .map(|a| a.port())
        .ok_or_else(|| {
            SocketError::new(
                "getsockname",
                io::Error::new(io::ErrorKind::InvalidData, "not an inet address"),
            )
        })?;

    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|e| SocketError::new("listen", e))?;

    tracing::debug!("Listening socket bound to {}:{}", bind_host, port);

    let listener: std::net::TcpListener = socket.into();
    Ok(SockInfo {
        listener: TcpListener::from_std(listener),
        port,
    })
}

/// Put a socket into non-blocking mode. Calling it twice is harmless.
pub fn set_non_blocking<'s, S>(socket: &'s S) -> Result<(), SocketError>
where
    SockRef<'s>: From<&'s S>,
{
    SockRef::from(socket)
        .set_nonblocking(true)
        .map_err(|e| SocketError::new("set_nonblocking", e))
}

/// Format a network error with the operation that produced it.
pub fn describe_error(op: &str, err: &io::Error) -> String {
    match err.raw_os_error() {
        Some(code) if !err.to_string().contains("os error") => {
            format!("{} failed: {} (os error {})", op, err, code)
        }
        _ => format!("{} failed: {}", op, err),
    }
}

/// Would-block or interrupted: the call can simply be retried later.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Name of the OS readiness primitive behind the poller.
pub fn multiplex_primitive() -> &'static str {
    if cfg!(any(target_os = "linux", target_os = "android", target_os = "illumos")) {
        "epoll"
    } else if cfg!(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    )) {
        "kqueue"
    } else if cfg!(windows) {
        "wepoll (IOCP)"
    } else {
        "poll"
    }
}

fn resolve(bind_host: &str) -> Result<SocketAddr, SocketError> {
    (bind_host, 0)
        .to_socket_addrs()
        .map_err(|e| SocketError::new("resolve", e))?
        .next()
        .ok_or_else(|| {
            SocketError::new(
                "resolve",
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no address for {}", bind_host),
                ),
            )
        })
}
