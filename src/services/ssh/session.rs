//! The secure session seen from the tunnel core.
//!
//! The tunnel core does not speak SSH. It consumes an already established
//! session through [`SecureSession`], which can open `direct-tcpip`
//! forwarding channels and expose one event source for the poller. The
//! optional `libssh2` backend implements it on top of the `ssh2` crate.

use super::error::{ChannelOpenError, SessionError};
use super::types::{ConnectionConfig, Credentials};
use mio::{Registry, Token};
use parking_lot::Mutex;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

/// Lifecycle of a secure session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    Failed,
}

/// Result of a connect attempt that did not fail outright.
///
/// Host key problems are outcomes rather than errors: the caller usually
/// asks the user whether to trust the fingerprint and tries again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    FingerprintUnknown {
        fingerprint: String,
        known_hosts_missing: bool,
    },
    FingerprintChanged {
        fingerprint: String,
    },
    FingerprintMismatch {
        fingerprint: String,
    },
    InvalidAuthData(String),
    ConnectionFailure(String),
}

impl ConnectOutcome {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectOutcome::Connected)
    }
}

impl fmt::Display for ConnectOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectOutcome::Connected => write!(f, "connected"),
            ConnectOutcome::FingerprintUnknown {
                fingerprint,
                known_hosts_missing,
            } => {
                write!(f, "unknown host key {}", fingerprint)?;
                if *known_hosts_missing {
                    write!(f, " (known_hosts file missing)")?;
                }
                Ok(())
            }
            ConnectOutcome::FingerprintChanged { fingerprint } => {
                write!(f, "host key changed, server sent {}", fingerprint)
            }
            ConnectOutcome::FingerprintMismatch { fingerprint } => {
                write!(f, "host key type mismatch, server sent {}", fingerprint)
            }
            ConnectOutcome::InvalidAuthData(msg) => write!(f, "invalid auth data: {}", msg),
            ConnectOutcome::ConnectionFailure(msg) => write!(f, "connection failure: {}", msg),
        }
    }
}

/// One forwarding channel: a bidirectional byte stream to the remote target.
///
/// `read` and `write` must not block; they return
/// [`io::ErrorKind::WouldBlock`] when nothing can be done right now. A read
/// of `0` bytes only means end of stream when [`is_closed`](Self::is_closed)
/// agrees.
pub trait ForwardChannel: Read + Write + Send {
    fn is_closed(&self) -> bool;

    /// Tell the remote end nothing more will be written. Reading continues
    /// until the remote closes its side.
    fn send_eof(&mut self) -> io::Result<()>;

    fn close(&mut self);

    /// Register a channel-specific event source, if the channel has one.
    /// Channels multiplexed over the session socket have nothing to add.
    fn register(&mut self, _registry: &Registry, _token: Token) -> io::Result<()> {
        Ok(())
    }

    fn deregister(&mut self, _registry: &Registry) -> io::Result<()> {
        Ok(())
    }
}

/// An authenticated SSH session able to open forwarding channels.
pub trait SecureSession: Send {
    fn connect(
        &mut self,
        config: &ConnectionConfig,
        credentials: &Credentials,
    ) -> Result<ConnectOutcome, SessionError>;

    fn disconnect(&mut self);

    /// Re-establish a dropped session with the last config and credentials.
    fn reconnect(&mut self) -> Result<(), SessionError>;

    fn is_connected(&self) -> bool;

    fn state(&self) -> SessionState;

    fn config(&self) -> &ConnectionConfig;

    /// Open a `direct-tcpip` channel to `remote_host:remote_port` on behalf
    /// of the client at `bind_host:bind_port`.
    ///
    /// [`ChannelOpenError::Retry`] means the session could not finish the
    /// request without blocking; the caller decides how long to keep trying.
    fn open_forward_channel(
        &mut self,
        remote_host: &str,
        remote_port: u16,
        bind_host: &str,
        bind_port: u16,
    ) -> Result<Box<dyn ForwardChannel>, ChannelOpenError>;

    /// Register the session's own event source (its socket) with a poller.
    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()>;

    fn deregister(&mut self, registry: &Registry) -> io::Result<()>;

    /// Housekeeping after a poll round (keepalives, liveness). An error here
    /// is a session-level failure.
    fn process_events(&mut self) -> Result<(), SessionError>;
}

/// A session shared between the caller that connected it and the handler
/// that forwards through it.
pub type SharedSession = Arc<Mutex<Box<dyn SecureSession>>>;

pub fn share<S: SecureSession + 'static>(session: S) -> SharedSession {
    Arc::new(Mutex::new(Box::new(session)))
}

/// Format a host key hash the way `ssh-keygen -l` prints legacy hashes.
pub fn format_fingerprint(hash: &[u8]) -> String {
    let hex = hex::encode(hash);
    hex.as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(":")
}
