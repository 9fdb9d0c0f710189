//! Observable tunnel lifecycle and the event stream callers subscribe to.

use async_channel::{Receiver, Sender};
use mio::Token;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Events one subscriber can fall behind by before the oldest are dropped.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Identifies a tunnel inside one manager. It is also the poll token of
/// the tunnel's listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelId(pub usize);

impl TunnelId {
    pub fn token(self) -> Token {
        Token(self.0)
    }

    pub fn from_token(token: Token) -> Self {
        TunnelId(token.0)
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Tunnel lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    /// Handler created, loop not running yet
    Starting,
    /// Accepting and forwarding clients
    Listening { local_port: u16 },
    /// Session dropped, attempting reconnect
    Reconnecting { attempt: u32, max_attempts: u32 },
    /// Session could not be recovered
    Failed { error: String },
    /// Tunnel was stopped
    Closed,
}

impl TunnelState {
    /// Returns true if the tunnel forwards new clients
    pub fn is_listening(&self) -> bool {
        matches!(self, TunnelState::Listening { .. })
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelState::Starting => write!(f, "starting"),
            TunnelState::Listening { local_port } => write!(f, "listening on port {}", local_port),
            TunnelState::Reconnecting {
                attempt,
                max_attempts,
            } => write!(f, "reconnecting ({}/{})", attempt, max_attempts),
            TunnelState::Failed { error } => write!(f, "failed: {}", error),
            TunnelState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEventKind {
    StateChanged(TunnelState),
    ClientAccepted { peer: SocketAddr },
    ChannelOpened { peer: SocketAddr },
    ChannelOpenFailed { peer: SocketAddr, error: String },
    ClientClosed { peer: SocketAddr },
}

/// Something that happened on one tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEvent {
    pub tunnel: TunnelId,
    pub local_port: u16,
    pub kind: TunnelEventKind,
}

/// Fans tunnel events out to every subscriber.
///
/// Each subscriber gets its own bounded channel. When a subscriber falls
/// behind, its oldest queued event is dropped to make room, so the newest
/// lifecycle changes always get through. Events emitted while nobody is
/// subscribed are not kept.
#[derive(Clone, Default)]
pub struct EventSink {
    subscribers: Arc<Mutex<Vec<Sender<TunnelEvent>>>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> Receiver<TunnelEvent> {
        let (tx, rx) = async_channel::bounded(EVENT_CHANNEL_CAPACITY);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Publish without blocking. A dropped receiver is forgotten.
    pub fn emit(&self, tunnel: TunnelId, local_port: u16, kind: TunnelEventKind) {
        let event = TunnelEvent {
            tunnel,
            local_port,
            kind,
        };
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.force_send(event.clone()) {
            Ok(None) => true,
            Ok(Some(dropped)) => {
                tracing::trace!("Subscriber lagging, dropped {:?}", dropped.kind);
                true
            }
            Err(_) => false,
        });
    }

    pub fn state_changed(&self, tunnel: TunnelId, local_port: u16, state: TunnelState) {
        self.emit(tunnel, local_port, TunnelEventKind::StateChanged(state));
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
