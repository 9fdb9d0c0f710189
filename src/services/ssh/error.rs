//! Error types for the tunnel core.
//!
//! Each type maps to the scope it is fatal to: a socket operation, one
//! pending client, one client/channel pair, one handler's session, or the
//! caller's request.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Local OS socket failure. Fatal to the operation attempting it.
#[derive(Debug, Error)]
#[error("{op} failed: {source}")]
pub struct SocketError {
    /// The socket call that failed (`socket`, `bind`, `listen`, ...)
    pub op: &'static str,
    #[source]
    pub source: io::Error,
}

impl SocketError {
    pub fn new(op: &'static str, source: io::Error) -> Self {
        Self { op, source }
    }
}

/// A forwarding channel could not be opened. Fatal to one pending client.
#[derive(Debug, Error)]
pub enum ChannelOpenError {
    /// The session could not open the channel yet; try again shortly.
    #[error("channel to {0} not ready yet")]
    Retry(String),

    #[error("channel open rejected: {0}")]
    Rejected(String),

    #[error("no channel to {target} within {budget:?}")]
    TimedOut { target: String, budget: Duration },

    #[error("session is not connected")]
    NotConnected,
}

impl ChannelOpenError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChannelOpenError::Retry(_))
    }
}

/// I/O failure on one client/channel pair. Fatal to that pair only.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("reading from client failed: {0}")]
    ClientRead(#[source] io::Error),

    #[error("writing to client failed: {0}")]
    ClientWrite(#[source] io::Error),

    #[error("reading from channel failed: {0}")]
    ChannelRead(#[source] io::Error),

    #[error("writing to channel failed: {0}")]
    ChannelWrite(#[source] io::Error),
}

/// Secure-session or multiplexer failure. Triggers a reconnect.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("polling failed: {0}")]
    Poll(#[source] io::Error),

    #[error("session socket hung up")]
    Hangup,

    #[error("session I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("host key rejected: {0}")]
    HostKey(String),

    #[error("session is not connected")]
    NotConnected,

    #[error("{0}")]
    Protocol(String),
}

impl SessionError {
    /// Whether another reconnect attempt could succeed.
    ///
    /// Authentication and host key problems will not fix themselves, so
    /// reconnect loops give up on them immediately.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, SessionError::Auth(_) | SessionError::HostKey(_))
    }
}

/// Invalid tunnel configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    #[error("{0} must not be 0")]
    ZeroValue(&'static str),

    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),
}

/// Caller-facing errors from the tunnel manager.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("SSH session to {0} is not connected")]
    SessionNotConnected(String),

    #[error("tunnel manager is shutting down")]
    ShuttingDown,

    #[error("invalid tunnel config: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error("tunnel handler failed to start: {0}")]
    HandlerStart(#[source] io::Error),
}
