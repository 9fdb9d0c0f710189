//! Registry of tunnels and the thread that accepts clients for all of them.
//!
//! Callers on any thread create, look up and disconnect tunnels. One
//! background thread polls every tunnel's listening socket plus a waker and
//! hands accepted clients to the owning [`TunnelHandler`]. After changing
//! the registry a caller rings the doorbell: it wakes the poll and waits
//! until the loop has re-read the registry, so a tunnel returned to the
//! caller is already being watched.

use super::error::TunnelError;
use super::handler::TunnelHandler;
use super::reconnect::ReconnectConfig;
use super::session::SharedSession;
use super::socket::create_listening_socket;
use super::state::{EventSink, TunnelEvent, TunnelId, TunnelState};
use super::types::{ConnectionConfig, TunnelKey};
use async_channel::Receiver;
use mio::{Events, Poll, Registry, Token, Waker};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How long a caller waits for the loop to pick up a registry change.
pub const WAKE_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// How long `create_tunnel` waits for a busy session to answer whether it is
/// connected.
const SESSION_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

const WAKER: Token = Token(0);
const FIRST_TUNNEL_ID: usize = 1;

/// Outcome of [`TunnelManager::create_tunnel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    /// A new tunnel was started
    Created { local_port: u16 },
    /// A running tunnel with the same route already existed
    Reused { local_port: u16 },
}

impl TunnelStatus {
    pub fn local_port(&self) -> u16 {
        match self {
            TunnelStatus::Created { local_port } | TunnelStatus::Reused { local_port } => {
                *local_port
            }
        }
    }

    pub fn is_reused(&self) -> bool {
        matches!(self, TunnelStatus::Reused { .. })
    }
}

struct TunnelTable {
    handlers: HashMap<TunnelId, Arc<TunnelHandler>>,
    by_key: HashMap<TunnelKey, TunnelId>,
    next_id: usize,
}

impl TunnelTable {
    fn find(&self, config: &ConnectionConfig) -> Option<Arc<TunnelHandler>> {
        let id = self.by_key.get(&config.key())?;
        self.handlers.get(id).cloned()
    }

    fn insert(&mut self, handler: Arc<TunnelHandler>) {
        self.by_key.insert(handler.config().key(), handler.id());
        self.handlers.insert(handler.id(), handler);
    }

    fn remove(&mut self, id: TunnelId) -> Option<Arc<TunnelHandler>> {
        let handler = self.handlers.remove(&id)?;
        self.by_key.remove(&handler.config().key());
        Some(handler)
    }

    fn drain(&mut self) -> Vec<Arc<TunnelHandler>> {
        self.by_key.clear();
        self.handlers.drain().map(|(_, handler)| handler).collect()
    }
}

/// Wakeup counters: callers ring, the loop marks what it has served.
#[derive(Default)]
struct Doorbell {
    rung: u64,
    served: u64,
}

struct Inner {
    tunnels: Mutex<TunnelTable>,
    registry: Registry,
    waker: Waker,
    doorbell: Mutex<Doorbell>,
    doorbell_cv: Condvar,
    stop: AtomicBool,
    running: AtomicBool,
    events: EventSink,
    reconnect: ReconnectConfig,
}

impl Inner {
    /// Ring the doorbell and wait until the loop has seen the change.
    fn poke(&self) {
        let rung = {
            let mut bell = self.doorbell.lock();
            bell.rung += 1;
            bell.rung
        };
        if let Err(err) = self.waker.wake() {
            tracing::warn!("Tunnel manager wakeup failed: {}", err);
            return;
        }

        let deadline = Instant::now() + WAKE_ACK_TIMEOUT;
        let mut bell = self.doorbell.lock();
        while bell.served < rung && self.running.load(Ordering::SeqCst) {
            if self.doorbell_cv.wait_until(&mut bell, deadline).timed_out() {
                tracing::warn!(
                    "Tunnel manager did not pick up a change within {:?}",
                    WAKE_ACK_TIMEOUT
                );
                break;
            }
        }
    }

    /// Sync the loop's view of the registry: watch new listeners, forget
    /// removed ones.
    fn rebuild(&self, live: &mut HashSet<TunnelId>) {
        let rung = self.doorbell.lock().rung;

        {
            let tunnels = self.tunnels.lock();
            live.retain(|id| tunnels.handlers.contains_key(id));
            for (id, handler) in tunnels.handlers.iter() {
                if live.contains(id) {
                    continue;
                }
                match handler.register_listener(&self.registry) {
                    Ok(()) => {
                        live.insert(*id);
                    }
                    Err(err) => tracing::warn!(
                        "SSH tunnel {} listener could not be watched: {}",
                        handler.local_port(),
                        err
                    ),
                }
            }
        }

        let mut bell = self.doorbell.lock();
        bell.served = bell.served.max(rung);
        self.doorbell_cv.notify_all();
    }

    /// Stop a handler, close its listener and drop it from the registry.
    fn remove_locked(&self, tunnels: &mut TunnelTable, id: TunnelId) -> bool {
        let Some(handler) = tunnels.remove(id) else {
            return false;
        };
        handler.stop();
        handler.close_listener(&self.registry);
        tracing::debug!("Removed SSH tunnel {} from manager", handler.local_port());
        true
    }

    /// Stop every handler before closing its listener.
    fn teardown(&self) {
        let handlers = self.tunnels.lock().drain();
        for handler in &handlers {
            handler.stop();
            handler.close_listener(&self.registry);
        }
        if !handlers.is_empty() {
            tracing::info!("All SSH tunnels shut down");
        }

        let mut bell = self.doorbell.lock();
        bell.served = bell.rung;
        self.doorbell_cv.notify_all();
    }

    fn run(&self, mut poll: Poll, ready: async_channel::Sender<()>) {
        let mut live = HashSet::new();
        let mut events = Events::with_capacity(256);

        self.running.store(true, Ordering::SeqCst);
        self.rebuild(&mut live);
        let _ = ready.send_blocking(());
        tracing::debug!("Tunnel manager loop started");

        while !self.stop.load(Ordering::SeqCst) {
            if let Err(err) = poll.poll(&mut events, None) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!("Tunnel manager poll failed: {}", err);
                self.stop.store(true, Ordering::SeqCst);
                break;
            }

            for event in events.iter() {
                if event.token() == WAKER {
                    continue;
                }
                let id = TunnelId::from_token(event.token());
                let handler = self.tunnels.lock().handlers.get(&id).cloned();
                match handler {
                    Some(handler) => handler.handle_new_connection(),
                    None => {
                        // The registry and the watched set disagree.
                        tracing::error!(
                            "Tunnel manager got an event for unregistered tunnel {} \
                             (watched: {}), stopping",
                            id,
                            live.contains(&id)
                        );
                        self.stop.store(true, Ordering::SeqCst);
                    }
                }
            }
            if self.stop.load(Ordering::SeqCst) {
                break;
            }

            self.rebuild(&mut live);
        }

        self.running.store(false, Ordering::SeqCst);
        self.teardown();
        tracing::debug!("Tunnel manager loop exited");
    }
}

/// Owns every tunnel of the application.
///
/// Dropping the manager shuts it down.
pub struct TunnelManager {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelManager {
    /// Start a manager with the default reconnect policy.
    pub fn init() -> io::Result<Self> {
        Self::init_with(ReconnectConfig::default())
    }

    pub fn init_with(reconnect: ReconnectConfig) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let events = EventSink::new();

        let inner = Arc::new(Inner {
            tunnels: Mutex::new(TunnelTable {
                handlers: HashMap::new(),
                by_key: HashMap::new(),
                next_id: FIRST_TUNNEL_ID,
            }),
            registry,
            waker,
            doorbell: Mutex::new(Doorbell::default()),
            doorbell_cv: Condvar::new(),
            stop: AtomicBool::new(false),
            running: AtomicBool::new(false),
            events,
            reconnect,
        });

        let (ready_tx, ready_rx) = async_channel::bounded(1);
        let loop_inner = inner.clone();
        let handle = thread::Builder::new()
            .name("tunnel-manager".into())
            .spawn(move || loop_inner.run(poll, ready_tx))?;
        ready_rx
            .recv_blocking()
            .map_err(|_| io::Error::other("tunnel manager loop exited during startup"))?;

        tracing::info!(
            "Tunnel manager started ({})",
            super::socket::multiplex_primitive()
        );

        Ok(Self {
            inner,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Return the local port of a tunnel for `config`, starting one if no
    /// running tunnel routes the same way.
    pub fn create_tunnel(
        &self,
        config: &ConnectionConfig,
        session: SharedSession,
    ) -> Result<TunnelStatus, TunnelError> {
        if self.inner.stop.load(Ordering::SeqCst) {
            return Err(TunnelError::ShuttingDown);
        }
        config.validate()?;

        let connected = session
            .try_lock_for(SESSION_CHECK_TIMEOUT)
            .is_some_and(|session| session.is_connected());
        if !connected {
            return Err(TunnelError::SessionNotConnected(config.ssh_endpoint()));
        }

        let local_port = {
            let mut tunnels = self.inner.tunnels.lock();

            if let Some(existing) = tunnels.find(config) {
                if existing.is_running() {
                    tracing::debug!(
                        "Reusing SSH tunnel {} for {}",
                        existing.local_port(),
                        config.remote_endpoint()
                    );
                    return Ok(TunnelStatus::Reused {
                        local_port: existing.local_port(),
                    });
                }
                tracing::info!(
                    "SSH tunnel {} is no longer running, replacing it",
                    existing.local_port()
                );
                self.inner.remove_locked(&mut tunnels, existing.id());
            }

            let sock = create_listening_socket(&config.local_host)?;
            let id = TunnelId(tunnels.next_id);
            tunnels.next_id += 1;

            let handler = TunnelHandler::new(
                id,
                config.clone(),
                session,
                sock,
                self.inner.events.clone(),
            )
            .with_reconnect(self.inner.reconnect.clone());
            handler.start().map_err(TunnelError::HandlerStart)?;

            let local_port = handler.local_port();
            tunnels.insert(Arc::new(handler));
            local_port
        };

        self.inner.poke();
        tracing::info!(
            "SSH tunnel created: localhost:{} -> {} via {}",
            local_port,
            config.remote_endpoint(),
            config.ssh_endpoint()
        );
        Ok(TunnelStatus::Created { local_port })
    }

    /// Local port of the running tunnel for `config`, or 0 if there is none.
    ///
    /// A matching tunnel that has stopped is removed.
    pub fn lookup_tunnel(&self, config: &ConnectionConfig) -> u16 {
        let mut tunnels = self.inner.tunnels.lock();
        let Some(handler) = tunnels.find(config) else {
            return 0;
        };
        if handler.is_running() {
            return handler.local_port();
        }

        tracing::info!(
            "SSH tunnel {} is no longer running, removing it",
            handler.local_port()
        );
        self.inner.remove_locked(&mut tunnels, handler.id());
        drop(tunnels);
        self.inner.poke();
        0
    }

    /// Stop and remove the tunnel for `config`. Returns false if there was
    /// none.
    pub fn disconnect(&self, config: &ConnectionConfig) -> bool {
        let removed = {
            let mut tunnels = self.inner.tunnels.lock();
            match tunnels.find(config) {
                Some(handler) => self.inner.remove_locked(&mut tunnels, handler.id()),
                None => false,
            }
        };
        if removed {
            self.inner.poke();
            tracing::info!("SSH tunnel to {} closed", config.remote_endpoint());
        }
        removed
    }

    pub fn handler(&self, config: &ConnectionConfig) -> Option<Arc<TunnelHandler>> {
        self.inner.tunnels.lock().find(config)
    }

    /// Every tunnel with its local port and state, oldest first.
    pub fn tunnels(&self) -> Vec<(TunnelId, u16, TunnelState)> {
        let mut list: Vec<_> = self
            .inner
            .tunnels
            .lock()
            .handlers
            .values()
            .map(|handler| (handler.id(), handler.local_port(), handler.state()))
            .collect();
        list.sort_by_key(|(id, _, _)| *id);
        list
    }

    pub fn tunnel_count(&self) -> usize {
        self.inner.tunnels.lock().handlers.len()
    }

    /// Subscribe to tunnel events emitted from now on. Every subscriber
    /// gets every event.
    pub fn subscribe(&self) -> Receiver<TunnelEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst) && !self.inner.stop.load(Ordering::SeqCst)
    }

    /// Stop every tunnel and the manager loop. Safe to call more than once.
    pub fn shutdown(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        if let Err(err) = self.inner.waker.wake() {
            tracing::warn!("Tunnel manager wakeup failed: {}", err);
        }

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("Tunnel manager thread panicked");
            }
            self.inner.teardown();
            tracing::info!("Tunnel manager shut down");
        }
    }
}

impl Drop for TunnelManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
