//! One tunnel: a local listening socket forwarded through one SSH session.
//!
//! The manager thread accepts clients on the listening socket and hands them
//! over through a [`PendingQueue`]. The handler's own thread opens a
//! forwarding channel for each of them and pumps bytes in both directions,
//! waiting on the session's event source, every client stream and a waker in
//! a single poll.

use super::error::{ChannelOpenError, SessionError, TransferError};
use super::pending::PendingQueue;
use super::reconnect::{CHANNEL_OPEN_STEP, ExponentialBackoff, ReconnectConfig, RetryBudget};
use super::session::{ForwardChannel, SharedSession};
use super::socket::{SockInfo, describe_error, is_transient};
use super::state::{EventSink, TunnelEventKind, TunnelId, TunnelState};
use super::types::ConnectionConfig;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Upper bound on one poll of the handler loop.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

const SESSION: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CLIENT_TOKEN: usize = 2;

/// Passes over all connections per loop iteration while data keeps moving.
const MAX_PUMP_PASSES: usize = 8;
/// Chunks moved per direction in one pass, so one busy client cannot
/// starve the others.
const MAX_CHUNKS_PER_PASS: usize = 16;

/// A client accepted by the manager, not yet given a channel.
struct PendingClient {
    stream: TcpStream,
    peer: SocketAddr,
}

/// State shared between the handler object and its thread.
struct Shared {
    pending: PendingQueue<PendingClient>,
    stop: AtomicBool,
    running: AtomicBool,
    state: Mutex<TunnelState>,
    connections: AtomicUsize,
}

pub struct TunnelHandler {
    id: TunnelId,
    config: ConnectionConfig,
    local_port: u16,
    session: SharedSession,
    listener: Mutex<Option<TcpListener>>,
    events: EventSink,
    reconnect: ReconnectConfig,
    shared: Arc<Shared>,
    waker: Mutex<Option<Arc<Waker>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelHandler {
    pub fn new(
        id: TunnelId,
        config: ConnectionConfig,
        session: SharedSession,
        sock: SockInfo,
        events: EventSink,
    ) -> Self {
        Self {
            id,
            config,
            local_port: sock.port,
            session,
            listener: Mutex::new(Some(sock.listener)),
            events,
            reconnect: ReconnectConfig::default(),
            shared: Arc::new(Shared {
                pending: PendingQueue::new(),
                stop: AtomicBool::new(false),
                running: AtomicBool::new(false),
                state: Mutex::new(TunnelState::Starting),
                connections: AtomicUsize::new(0),
            }),
            waker: Mutex::new(None),
            thread: Mutex::new(None),
        }
    }

    /// Set how the handler retries a dropped session.
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Spawn the handler loop and wait until it is ready to forward.
    pub fn start(&self) -> io::Result<()> {
        let mut thread_slot = self.thread.lock();
        if thread_slot.is_some() {
            return Ok(());
        }
        if self.shared.stop.load(Ordering::SeqCst) {
            return Err(io::Error::other("tunnel handler was already stopped"));
        }

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        *self.waker.lock() = Some(waker);

        let worker = Worker {
            id: self.id,
            local_port: self.local_port,
            config: self.config.clone(),
            session: self.session.clone(),
            shared: self.shared.clone(),
            events: self.events.clone(),
            reconnect: self.reconnect.clone(),
            poll,
            connections: HashMap::new(),
            next_token: FIRST_CLIENT_TOKEN,
            failed: false,
        };

        let (ready_tx, ready_rx) = async_channel::bounded(1);
        let handle = thread::Builder::new()
            .name(format!("tunnel-{}", self.local_port))
            .spawn(move || worker.run(ready_tx))?;

        let ready = ready_rx
            .recv_blocking()
            .map_err(|_| io::Error::other("tunnel handler exited before it was ready"))
            .and_then(|registered| registered);

        if let Err(err) = ready {
            let _ = handle.join();
            return Err(err);
        }

        *thread_slot = Some(handle);
        Ok(())
    }

    /// Stop the loop and wait for its thread to exit. Safe to call more than
    /// once.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.wake();

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("SSH tunnel {} handler thread panicked", self.local_port);
            }
        }
    }

    /// Accept every client waiting on the listening socket and queue it for
    /// the handler loop. Runs on the manager thread.
    pub fn handle_new_connection(&self) {
        let guard = self.listener.lock();
        let Some(listener) = guard.as_ref() else {
            return;
        };

        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if !self.is_running() {
                        tracing::debug!(
                            "SSH tunnel {} is not running, dropping client {}",
                            self.local_port,
                            peer
                        );
                        continue;
                    }
                    tracing::debug!("SSH tunnel {} accepted client {}", self.local_port, peer);
                    self.events
                        .emit(self.id, self.local_port, TunnelEventKind::ClientAccepted { peer });
                    self.shared.pending.push(PendingClient { stream, peer });
                    self.wake();
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if is_transient(&err) => return,
                Err(err) => {
                    tracing::warn!(
                        "SSH tunnel {}: {}",
                        self.local_port,
                        describe_error("accept", &err)
                    );
                    return;
                }
            }
        }
    }

    /// Register the listening socket with the manager's poll.
    pub fn register_listener(&self, registry: &Registry) -> io::Result<()> {
        match self.listener.lock().as_mut() {
            Some(listener) => registry.register(listener, self.id.token(), Interest::READABLE),
            None => Ok(()),
        }
    }

    /// Deregister and close the listening socket. Only the manager calls
    /// this, after [`stop`](Self::stop).
    pub fn close_listener(&self, registry: &Registry) {
        if let Some(mut listener) = self.listener.lock().take() {
            let _ = registry.deregister(&mut listener);
            tracing::debug!("SSH tunnel {} listener closed", self.local_port);
        }
    }

    pub fn id(&self) -> TunnelId {
        self.id
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> TunnelState {
        self.shared.state.lock().clone()
    }

    /// Client/channel pairs currently being forwarded.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    fn wake(&self) {
        if let Some(waker) = self.waker.lock().as_ref() {
            if let Err(err) = waker.wake() {
                tracing::warn!("SSH tunnel {} wakeup failed: {}", self.local_port, err);
            }
        }
    }
}

impl Drop for TunnelHandler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One direction of a client/channel pair with at most one chunk in flight.
struct Transfer {
    buf: Vec<u8>,
    pos: usize,
    len: usize,
    stalled_since: Option<Instant>,
}

#[derive(Debug, Default)]
struct Progress {
    moved: bool,
    eof: bool,
}

impl Transfer {
    fn new(size: usize) -> Self {
        Self {
            buf: vec![0; size],
            pos: 0,
            len: 0,
            stalled_since: None,
        }
    }

    /// Move bytes from `src` to `dst` until either side would block.
    ///
    /// A chunk the destination refuses for longer than `timeout` is an error
    /// for this pair.
    fn run<R, W>(
        &mut self,
        src: &mut R,
        dst: &mut W,
        timeout: Duration,
        read_err: fn(io::Error) -> TransferError,
        write_err: fn(io::Error) -> TransferError,
    ) -> Result<Progress, TransferError>
    where
        R: Read + ?Sized,
        W: Write + ?Sized,
    {
        let mut progress = Progress::default();

        for _ in 0..MAX_CHUNKS_PER_PASS {
            while self.pos < self.len {
                match dst.write(&self.buf[self.pos..self.len]) {
                    Ok(0) => return Err(write_err(io::ErrorKind::WriteZero.into())),
                    Ok(n) => {
                        self.pos += n;
                        self.stalled_since = None;
                        progress.moved = true;
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        let since = *self.stalled_since.get_or_insert_with(Instant::now);
                        if since.elapsed() >= timeout {
                            return Err(write_err(io::Error::new(
                                io::ErrorKind::TimedOut,
                                format!("peer accepted no data for {:?}", timeout),
                            )));
                        }
                        return Ok(progress);
                    }
                    Err(err) => return Err(write_err(err)),
                }
            }

            match src.read(&mut self.buf) {
                Ok(0) => {
                    progress.eof = true;
                    return Ok(progress);
                }
                Ok(n) => {
                    self.pos = 0;
                    self.len = n;
                    progress.moved = true;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(progress),
                Err(err) => return Err(read_err(err)),
            }
        }

        Ok(progress)
    }
}

struct Connection {
    client: TcpStream,
    channel: Box<dyn ForwardChannel>,
    peer: SocketAddr,
    upstream: Transfer,
    downstream: Transfer,
    /// The client shut down its sending side
    client_eof: bool,
    eof_sent: bool,
}

enum Flow {
    Idle,
    Moved,
    Closed,
}

impl Connection {
    /// Move what both sides allow. A client that stops sending still gets
    /// the rest of the reply: the channel is half-closed and the pair lives
    /// until the remote closes too.
    fn pump(&mut self, timeout: Duration) -> Result<Flow, TransferError> {
        let mut moved = false;
        if !self.client_eof {
            let up = self.upstream.run(
                &mut self.client,
                &mut *self.channel,
                timeout,
                TransferError::ClientRead,
                TransferError::ChannelWrite,
            )?;
            moved = up.moved;
            self.client_eof = up.eof;
        }
        if self.client_eof && !self.eof_sent {
            match self.channel.send_eof() {
                Ok(()) => self.eof_sent = true,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(TransferError::ChannelWrite(err)),
            }
        }

        let down = self.downstream.run(
            &mut *self.channel,
            &mut self.client,
            timeout,
            TransferError::ChannelRead,
            TransferError::ClientWrite,
        )?;
        if down.eof && self.channel.is_closed() {
            return Ok(Flow::Closed);
        }

        Ok(if moved || down.moved {
            Flow::Moved
        } else {
            Flow::Idle
        })
    }
}

/// The handler loop and everything only it touches.
struct Worker {
    id: TunnelId,
    local_port: u16,
    config: ConnectionConfig,
    session: SharedSession,
    shared: Arc<Shared>,
    events: EventSink,
    reconnect: ReconnectConfig,
    poll: Poll,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    failed: bool,
}

impl Worker {
    fn run(mut self, ready: async_channel::Sender<io::Result<()>>) {
        if let Err(err) = self.session.lock().register(self.poll.registry(), SESSION) {
            tracing::error!(
                "SSH tunnel {} could not watch the session: {}",
                self.local_port,
                err
            );
            self.set_state(TunnelState::Failed {
                error: err.to_string(),
            });
            let _ = ready.send_blocking(Err(err));
            return;
        }

        self.shared.running.store(true, Ordering::SeqCst);
        self.set_state(TunnelState::Listening {
            local_port: self.local_port,
        });
        let _ = ready.send_blocking(Ok(()));

        tracing::info!(
            "SSH tunnel {} established: {}:{} -> {} via {}",
            self.id,
            self.config.local_host,
            self.local_port,
            self.config.remote_endpoint(),
            self.config.ssh_endpoint()
        );

        let mut events = Events::with_capacity(128);
        let mut backlog = false;
        while !self.stopping() {
            self.open_pending();

            // Data left over from the last round fires no new edge.
            let timeout = if backlog { Duration::ZERO } else { POLL_INTERVAL };
            if let Err(err) = self.poll_session(&mut events, timeout) {
                tracing::warn!("SSH tunnel {} lost its session: {}", self.local_port, err);
                if !self.recover(err) {
                    break;
                }
                backlog = false;
                continue;
            }

            backlog = self.pump_all();
        }

        self.shutdown();
    }

    fn stopping(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: TunnelState) {
        *self.shared.state.lock() = state.clone();
        self.events.state_changed(self.id, self.local_port, state);
    }

    fn emit(&self, kind: TunnelEventKind) {
        self.events.emit(self.id, self.local_port, kind);
    }

    fn open_pending(&mut self) {
        for PendingClient { stream, peer } in self.shared.pending.drain() {
            if self.stopping() {
                continue;
            }
            match self.open_channel(peer) {
                Ok(channel) => self.add_connection(stream, channel, peer),
                Err(err) => {
                    tracing::warn!(
                        "SSH tunnel {}: no channel for client {}: {}",
                        self.local_port,
                        peer,
                        err
                    );
                    self.emit(TunnelEventKind::ChannelOpenFailed {
                        peer,
                        error: err.to_string(),
                    });
                }
            }
        }
    }

    /// Open a forwarding channel, retrying in fixed steps while the session
    /// asks for it, for at most the connect timeout.
    fn open_channel(&self, peer: SocketAddr) -> Result<Box<dyn ForwardChannel>, ChannelOpenError> {
        let mut retry = RetryBudget::new(self.config.connect_timeout(), CHANNEL_OPEN_STEP);
        let bind_host = peer.ip().to_string();

        loop {
            let attempt = self.session.lock().open_forward_channel(
                &self.config.remote_host,
                self.config.remote_port,
                &bind_host,
                peer.port(),
            );
            match attempt {
                Ok(channel) => return Ok(channel),
                Err(err) if err.is_retryable() => {
                    if self.stopping() || !retry.wait_next() {
                        tracing::debug!(
                            "SSH tunnel {}: channel for {} still pending after {} retries",
                            self.local_port,
                            peer,
                            retry.retries()
                        );
                        return Err(ChannelOpenError::TimedOut {
                            target: self.config.remote_endpoint(),
                            budget: retry.budget(),
                        });
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn add_connection(
        &mut self,
        mut client: TcpStream,
        mut channel: Box<dyn ForwardChannel>,
        peer: SocketAddr,
    ) {
        let client_token = Token(self.next_token);
        let channel_token = Token(self.next_token + 1);
        self.next_token += 2;

        let registry = self.poll.registry();
        let registered = registry
            .register(
                &mut client,
                client_token,
                Interest::READABLE | Interest::WRITABLE,
            )
            .and_then(|_| channel.register(registry, channel_token));
        if let Err(err) = registered {
            tracing::warn!(
                "SSH tunnel {}: could not watch client {}: {}",
                self.local_port,
                peer,
                err
            );
            let _ = registry.deregister(&mut client);
            channel.close();
            self.emit(TunnelEventKind::ClientClosed { peer });
            return;
        }

        let size = self.config.buffer_size;
        let connection = Connection {
            client,
            channel,
            peer,
            upstream: Transfer::new(size),
            downstream: Transfer::new(size),
            client_eof: false,
            eof_sent: false,
        };
        self.connections.insert(client_token, connection);
        self.shared
            .connections
            .store(self.connections.len(), Ordering::SeqCst);

        tracing::debug!(
            "SSH tunnel {}: forwarding client {} to {}",
            self.local_port,
            peer,
            self.config.remote_endpoint()
        );
        self.emit(TunnelEventKind::ChannelOpened { peer });
    }

    fn remove_connection(&mut self, token: Token, reason: Option<TransferError>) {
        let Some(mut connection) = self.connections.remove(&token) else {
            return;
        };

        let registry = self.poll.registry();
        let _ = registry.deregister(&mut connection.client);
        let _ = connection.channel.deregister(registry);
        connection.channel.close();
        let _ = connection.client.shutdown(std::net::Shutdown::Both);

        let peer = connection.peer;
        match reason {
            Some(err) => tracing::warn!(
                "SSH tunnel {}: dropping client {}: {}",
                self.local_port,
                peer,
                err
            ),
            None => tracing::debug!("SSH tunnel {}: client {} closed", self.local_port, peer),
        }
        self.emit(TunnelEventKind::ClientClosed { peer });
        self.shared
            .connections
            .store(self.connections.len(), Ordering::SeqCst);
    }

    fn close_all(&mut self) {
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.remove_connection(token, None);
        }
    }

    /// Wait for activity and let the session do its housekeeping. Errors
    /// here are fatal to the session, not to a single client.
    fn poll_session(&mut self, events: &mut Events, timeout: Duration) -> Result<(), SessionError> {
        match self.poll.poll(events, Some(timeout)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(SessionError::Poll(err)),
        }

        let hung_up = events.iter().any(|event| {
            event.token() == SESSION
                && (event.is_error() || (event.is_read_closed() && event.is_write_closed()))
        });
        if hung_up {
            return Err(SessionError::Hangup);
        }

        self.session.lock().process_events()
    }

    /// Pump every pair until nothing moves. Returns true when the pass
    /// limit was hit while data was still moving.
    fn pump_all(&mut self) -> bool {
        let timeout = self.config.read_write_timeout();

        for _ in 0..MAX_PUMP_PASSES {
            let mut moved = false;
            let mut finished = Vec::new();

            for (token, connection) in self.connections.iter_mut() {
                match connection.pump(timeout) {
                    Ok(Flow::Idle) => {}
                    Ok(Flow::Moved) => moved = true,
                    Ok(Flow::Closed) => finished.push((*token, None)),
                    Err(err) => finished.push((*token, Some(err))),
                }
            }

            for (token, reason) in finished {
                self.remove_connection(token, reason);
            }
            if !moved {
                return false;
            }
        }
        true
    }

    /// Drop every client, then try to bring the session back. Returns false
    /// when the loop should exit.
    fn recover(&mut self, err: SessionError) -> bool {
        self.close_all();
        let _ = self.session.lock().deregister(self.poll.registry());

        let mut backoff = ExponentialBackoff::new(self.reconnect.clone());
        let mut last = err;

        while last.is_retriable() {
            let Some(delay) = backoff.next_delay() else {
                break;
            };
            self.set_state(TunnelState::Reconnecting {
                attempt: backoff.attempt(),
                max_attempts: backoff.max_attempts(),
            });
            tracing::info!(
                "SSH tunnel {} reconnecting (attempt {}/{}) in {:?}",
                self.local_port,
                backoff.attempt(),
                backoff.max_attempts(),
                delay
            );
            if !self.sleep_unless_stopped(delay) {
                return false;
            }

            let reconnected = self.session.lock().reconnect();
            match reconnected {
                Ok(()) => match self.session.lock().register(self.poll.registry(), SESSION) {
                    Ok(()) => {
                        tracing::info!("SSH tunnel {} session restored", self.local_port);
                        self.set_state(TunnelState::Listening {
                            local_port: self.local_port,
                        });
                        return true;
                    }
                    Err(err) => last = SessionError::Io(err),
                },
                Err(err) => {
                    tracing::warn!(
                        "SSH tunnel {} reconnect attempt {} failed: {}",
                        self.local_port,
                        backoff.attempt(),
                        err
                    );
                    last = err;
                }
            }
        }

        tracing::error!(
            "SSH tunnel {} giving up on session: {}",
            self.local_port,
            last
        );
        self.failed = true;
        self.set_state(TunnelState::Failed {
            error: last.to_string(),
        });
        false
    }

    /// Sleep for `delay`, cut short by the waker. Returns false if a stop was
    /// requested.
    fn sleep_unless_stopped(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        let mut events = Events::with_capacity(4);
        loop {
            if self.stopping() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            if let Err(err) = self.poll.poll(&mut events, Some(deadline - now)) {
                if err.kind() != io::ErrorKind::Interrupted {
                    thread::sleep(POLL_INTERVAL.min(deadline - now));
                }
            }
        }
    }

    fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.close_all();
        // Clients queued after the last drain are closed on drop.
        drop(self.shared.pending.drain());
        if !self.failed {
            let _ = self.session.lock().deregister(self.poll.registry());
            self.set_state(TunnelState::Closed);
        }
        tracing::info!("SSH tunnel {} closed", self.local_port);
    }
}

#[cfg(test)]
mod tests {
    use super::super::session::share;
    use super::super::socket::create_listening_socket;
    use super::super::testing::{EchoServer, LoopbackSession, connect_client, wait_until};
    use super::*;
    use std::net::TcpStream as StdTcpStream;

    fn fast_reconnect(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
            max_attempts,
        }
    }

    fn start_handler(
        session: &LoopbackSession,
        reconnect: ReconnectConfig,
    ) -> (TunnelHandler, async_channel::Receiver<super::super::state::TunnelEvent>) {
        let events = EventSink::new();
        let rx = events.subscribe();
        let sock = create_listening_socket("127.0.0.1").unwrap();
        let handler = TunnelHandler::new(
            TunnelId(1),
            session.config().clone(),
            share(session.clone()),
            sock,
            events,
        )
        .with_reconnect(reconnect);
        handler.start().unwrap();
        (handler, rx)
    }

    /// Connect a client and drive the manager side by hand until the handler
    /// has taken it.
    fn attach_client(handler: &TunnelHandler, expected: usize) -> StdTcpStream {
        let client = connect_client(handler.local_port());
        assert!(wait_until(Duration::from_secs(5), || {
            handler.handle_new_connection();
            handler.connection_count() == expected
        }));
        client
    }

    fn echo(client: &mut StdTcpStream, payload: &[u8]) -> Vec<u8> {
        client.write_all(payload).unwrap();
        let mut back = vec![0; payload.len()];
        client.read_exact(&mut back).unwrap();
        back
    }

    fn drain_kinds(
        rx: &async_channel::Receiver<super::super::state::TunnelEvent>,
    ) -> Vec<TunnelEventKind> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|event| event.kind)
            .collect()
    }

    #[test]
    fn test_start_reports_listening_and_stop_closes() {
        let echo_server = EchoServer::start();
        let session = LoopbackSession::connected(echo_server.config());
        let (handler, rx) = start_handler(&session, fast_reconnect(1));

        assert!(handler.is_running());
        assert_eq!(
            handler.state(),
            TunnelState::Listening {
                local_port: handler.local_port()
            }
        );

        handler.stop();
        handler.stop();
        assert!(!handler.is_running());
        assert_eq!(handler.state(), TunnelState::Closed);

        let kinds = drain_kinds(&rx);
        assert_eq!(
            kinds.first(),
            Some(&TunnelEventKind::StateChanged(TunnelState::Listening {
                local_port: handler.local_port()
            }))
        );
        assert_eq!(
            kinds.last(),
            Some(&TunnelEventKind::StateChanged(TunnelState::Closed))
        );
    }

    #[test]
    fn test_forwards_through_channel() {
        let echo_server = EchoServer::start();
        let session = LoopbackSession::connected(echo_server.config());
        let (handler, rx) = start_handler(&session, fast_reconnect(1));

        let mut client = attach_client(&handler, 1);
        assert_eq!(echo(&mut client, b"select 1;"), b"select 1;");

        drop(client);
        assert!(wait_until(Duration::from_secs(5), || handler
            .connection_count()
            == 0));
        handler.stop();

        let kinds = drain_kinds(&rx);
        assert!(
            kinds
                .iter()
                .any(|k| matches!(k, TunnelEventKind::ChannelOpened { .. }))
        );
        assert!(
            kinds
                .iter()
                .any(|k| matches!(k, TunnelEventKind::ClientClosed { .. }))
        );
    }

    #[test]
    fn test_channel_open_retries_until_ready() {
        let echo_server = EchoServer::start();
        let session = LoopbackSession::connected(echo_server.config());
        session.control().fail_opens.store(3, Ordering::SeqCst);
        let (handler, _rx) = start_handler(&session, fast_reconnect(1));

        let mut client = attach_client(&handler, 1);
        assert_eq!(session.control().opens.load(Ordering::SeqCst), 4);
        assert_eq!(echo(&mut client, b"ping"), b"ping");
        handler.stop();
    }

    #[test]
    fn test_rejected_channel_only_drops_that_client() {
        let echo_server = EchoServer::start();
        let session = LoopbackSession::connected(echo_server.config());
        let (handler, rx) = start_handler(&session, fast_reconnect(1));

        session.control().reject.store(true, Ordering::SeqCst);
        let mut rejected = connect_client(handler.local_port());
        assert!(wait_until(Duration::from_secs(5), || {
            handler.handle_new_connection();
            drain_kinds(&rx)
                .iter()
                .any(|k| matches!(k, TunnelEventKind::ChannelOpenFailed { .. }))
        }));
        let mut buf = [0u8; 1];
        assert_eq!(rejected.read(&mut buf).unwrap_or(0), 0);

        session.control().reject.store(false, Ordering::SeqCst);
        assert!(handler.is_running());
        let mut client = attach_client(&handler, 1);
        assert_eq!(echo(&mut client, b"still here"), b"still here");
        handler.stop();
    }

    #[test]
    fn test_channel_open_gives_up_after_connect_timeout() {
        let echo_server = EchoServer::start();
        let session = LoopbackSession::connected(echo_server.config().with_connect_timeout(1));
        session.control().fail_opens.store(u32::MAX, Ordering::SeqCst);
        let (handler, rx) = start_handler(&session, fast_reconnect(1));

        let started = Instant::now();
        let _client = connect_client(handler.local_port());
        let mut failure = None;
        assert!(wait_until(Duration::from_secs(5), || {
            handler.handle_new_connection();
            failure = drain_kinds(&rx).into_iter().find_map(|k| match k {
                TunnelEventKind::ChannelOpenFailed { error, .. } => Some(error),
                _ => None,
            });
            failure.is_some()
        }));
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(failure.unwrap().starts_with("no channel to"));
        assert!(handler.is_running());
        handler.stop();
    }

    #[test]
    fn test_reconnect_restores_forwarding() {
        let echo_server = EchoServer::start();
        let session = LoopbackSession::connected(echo_server.config());
        let (handler, _rx) = start_handler(&session, fast_reconnect(3));

        let mut client = attach_client(&handler, 1);
        assert_eq!(echo(&mut client, b"before"), b"before");

        session.control().fail_events.store(true, Ordering::SeqCst);
        assert!(wait_until(Duration::from_secs(5), || {
            session.control().reconnects.load(Ordering::SeqCst) == 1
                && handler.state().is_listening()
        }));

        // the pair that lived through the failure is gone
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
        assert_eq!(handler.connection_count(), 0);

        let mut client = attach_client(&handler, 1);
        assert_eq!(echo(&mut client, b"after"), b"after");
        handler.stop();
    }

    #[test]
    fn test_reconnect_failure_stops_handler() {
        let echo_server = EchoServer::start();
        let session = LoopbackSession::connected(echo_server.config());
        session.control().reconnect_ok.store(false, Ordering::SeqCst);
        let (handler, rx) = start_handler(&session, fast_reconnect(2));

        session.control().fail_events.store(true, Ordering::SeqCst);
        assert!(wait_until(Duration::from_secs(5), || !handler.is_running()));
        assert_eq!(session.control().reconnects.load(Ordering::SeqCst), 2);
        assert!(matches!(handler.state(), TunnelState::Failed { .. }));

        let kinds = drain_kinds(&rx);
        assert!(kinds.contains(&TunnelEventKind::StateChanged(TunnelState::Reconnecting {
            attempt: 2,
            max_attempts: 2
        })));

        // clients arriving after the failure are closed straight away
        let mut late = connect_client(handler.local_port());
        late.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        let mut buf = [0u8; 1];
        assert!(wait_until(Duration::from_secs(5), || {
            handler.handle_new_connection();
            matches!(late.read(&mut buf), Ok(0))
        }));
        handler.stop();
    }

    #[test]
    fn test_transfer_keeps_one_chunk_in_flight() {
        struct Stubborn;
        impl Write for Stubborn {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::WouldBlock.into())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut transfer = Transfer::new(4);
        let mut src: &[u8] = b"abcdefgh";
        let progress = transfer
            .run(
                &mut src,
                &mut Stubborn,
                Duration::from_secs(5),
                TransferError::ClientRead,
                TransferError::ChannelWrite,
            )
            .unwrap();
        assert!(progress.moved);
        assert!(!progress.eof);
        assert_eq!(&transfer.buf[transfer.pos..transfer.len], b"abcd");
        assert_eq!(src, b"efgh");

        let err = transfer
            .run(
                &mut src,
                &mut Stubborn,
                Duration::ZERO,
                TransferError::ClientRead,
                TransferError::ChannelWrite,
            )
            .unwrap_err();
        assert!(
            matches!(err, TransferError::ChannelWrite(e) if e.kind() == io::ErrorKind::TimedOut)
        );
    }

    #[test]
    fn test_half_closed_client_still_gets_reply() {
        let echo_server = EchoServer::start();
        let session = LoopbackSession::connected(echo_server.config());
        let (handler, _rx) = start_handler(&session, fast_reconnect(1));

        let mut client = attach_client(&handler, 1);
        client.write_all(b"request").unwrap();
        client.shutdown(std::net::Shutdown::Write).unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, b"request");
        assert!(wait_until(Duration::from_secs(5), || handler
            .connection_count()
            == 0));
        handler.stop();
    }

    /// Accepts everything, never has anything to read.
    struct CountingSink {
        received: Arc<AtomicUsize>,
    }

    impl Read for CountingSink {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    impl Write for CountingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.received.fetch_add(buf.len(), Ordering::SeqCst);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl ForwardChannel for CountingSink {
        fn is_closed(&self) -> bool {
            false
        }
        fn send_eof(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn close(&mut self) {}
    }

    #[test]
    fn test_pump_all_reports_backlog() {
        let echo_server = EchoServer::start();
        let session = LoopbackSession::connected(echo_server.config());
        let config = echo_server.config().with_buffer_size(16);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut writer = StdTcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, peer) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();

        let received = Arc::new(AtomicUsize::new(0));
        let mut worker = Worker {
            id: TunnelId(1),
            local_port: 0,
            config: config.clone(),
            session: share(session),
            shared: Arc::new(Shared {
                pending: PendingQueue::new(),
                stop: AtomicBool::new(false),
                running: AtomicBool::new(true),
                state: Mutex::new(TunnelState::Starting),
                connections: AtomicUsize::new(0),
            }),
            events: EventSink::new(),
            reconnect: fast_reconnect(1),
            poll: Poll::new().unwrap(),
            connections: HashMap::new(),
            next_token: FIRST_CLIENT_TOKEN,
            failed: false,
        };
        worker.add_connection(
            TcpStream::from_std(accepted),
            Box::new(CountingSink {
                received: received.clone(),
            }),
            peer,
        );

        // more than one round may move: passes * chunks * buffer
        let total = MAX_PUMP_PASSES * MAX_CHUNKS_PER_PASS * 16 * 4;
        writer.write_all(&vec![7u8; total]).unwrap();

        let mut saw_backlog = false;
        assert!(wait_until(Duration::from_secs(5), || {
            saw_backlog |= worker.pump_all();
            received.load(Ordering::SeqCst) == total
        }));
        assert!(saw_backlog);
        assert!(!worker.pump_all());
    }
}
