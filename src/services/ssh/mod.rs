//! SSH tunnel multiplexing.
//!
//! This module provides:
//! - `TunnelManager` - Registry of tunnels and the thread accepting their clients
//! - `TunnelHandler` - One listening port forwarded through one SSH session
//! - `SecureSession` / `ForwardChannel` - What the tunnel core needs from SSH
//! - `Ssh2Session` - libssh2 session backend (`libssh2` feature)

mod error;
mod handler;
#[cfg(feature = "libssh2")]
mod libssh2;
mod manager;
mod pending;
mod reconnect;
mod session;
mod socket;
mod state;
#[cfg(test)]
mod testing;
mod types;

pub use error::{
    ChannelOpenError, ConfigError, SessionError, SocketError, TransferError, TunnelError,
};
pub use handler::{POLL_INTERVAL, TunnelHandler};
#[cfg(feature = "libssh2")]
pub use libssh2::{Ssh2Channel, Ssh2Session};
pub use manager::{TunnelManager, TunnelStatus, WAKE_ACK_TIMEOUT};
pub use pending::PendingQueue;
pub use reconnect::{CHANNEL_OPEN_STEP, ExponentialBackoff, ReconnectConfig, RetryBudget};
pub use session::{
    ConnectOutcome, ForwardChannel, SecureSession, SessionState, SharedSession,
    format_fingerprint, share,
};
pub use socket::{
    LISTEN_BACKLOG, SockInfo, create_listening_socket, describe_error, is_transient,
    multiplex_primitive, set_non_blocking,
};
pub use state::{EventSink, TunnelEvent, TunnelEventKind, TunnelId, TunnelState};
pub use types::{
    ConnectionConfig, Credentials, DEFAULT_BUFFER_SIZE, DEFAULT_LOCAL_HOST, DEFAULT_SSH_PORT,
    SshAuthMethod, TunnelKey, parse_endpoint,
};
