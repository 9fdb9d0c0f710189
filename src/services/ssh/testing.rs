//! Test doubles: a `SecureSession` whose channels are plain TCP connections
//! to a local echo server.

use super::error::{ChannelOpenError, SessionError};
use super::session::{ConnectOutcome, ForwardChannel, SecureSession, SessionState};
use super::types::{ConnectionConfig, Credentials};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Knobs a test flips to make the loopback session misbehave.
pub struct LoopbackControl {
    pub connected: AtomicBool,
    /// Opens left that answer `Retry` before one succeeds
    pub fail_opens: AtomicU32,
    pub reject: AtomicBool,
    /// Fail the next `process_events` call, dropping the session
    pub fail_events: AtomicBool,
    pub reconnect_ok: AtomicBool,
    pub reconnects: AtomicU32,
    pub opens: AtomicU32,
}

#[derive(Clone)]
pub struct LoopbackSession {
    config: ConnectionConfig,
    control: Arc<LoopbackControl>,
}

impl LoopbackSession {
    pub fn connected(config: ConnectionConfig) -> Self {
        Self {
            config,
            control: Arc::new(LoopbackControl {
                connected: AtomicBool::new(true),
                fail_opens: AtomicU32::new(0),
                reject: AtomicBool::new(false),
                fail_events: AtomicBool::new(false),
                reconnect_ok: AtomicBool::new(true),
                reconnects: AtomicU32::new(0),
                opens: AtomicU32::new(0),
            }),
        }
    }

    pub fn control(&self) -> &LoopbackControl {
        &self.control
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

impl SecureSession for LoopbackSession {
    fn connect(
        &mut self,
        config: &ConnectionConfig,
        _credentials: &Credentials,
    ) -> Result<ConnectOutcome, SessionError> {
        self.config = config.clone();
        self.control.connected.store(true, Ordering::SeqCst);
        Ok(ConnectOutcome::Connected)
    }

    fn disconnect(&mut self) {
        self.control.connected.store(false, Ordering::SeqCst);
    }

    fn reconnect(&mut self) -> Result<(), SessionError> {
        self.control.reconnects.fetch_add(1, Ordering::SeqCst);
        if self.control.reconnect_ok.load(Ordering::SeqCst) {
            self.control.connected.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(SessionError::Connect("Connection refused".into()))
        }
    }

    fn is_connected(&self) -> bool {
        self.control.connected.load(Ordering::SeqCst)
    }

    fn state(&self) -> SessionState {
        if self.is_connected() {
            SessionState::Connected
        } else {
            SessionState::Disconnected
        }
    }

    fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn open_forward_channel(
        &mut self,
        remote_host: &str,
        remote_port: u16,
        _bind_host: &str,
        _bind_port: u16,
    ) -> Result<Box<dyn ForwardChannel>, ChannelOpenError> {
        self.control.opens.fetch_add(1, Ordering::SeqCst);
        if !self.is_connected() {
            return Err(ChannelOpenError::NotConnected);
        }
        if self.control.reject.load(Ordering::SeqCst) {
            return Err(ChannelOpenError::Rejected("administratively prohibited".into()));
        }
        let retry = self
            .control
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if retry {
            return Err(ChannelOpenError::Retry(format!("{}:{}", remote_host, remote_port)));
        }

        let stream = StdTcpStream::connect((remote_host, remote_port))
            .map_err(|e| ChannelOpenError::Rejected(e.to_string()))?;
        stream
            .set_nonblocking(true)
            .map_err(|e| ChannelOpenError::Rejected(e.to_string()))?;
        Ok(Box::new(TcpChannel {
            stream: TcpStream::from_std(stream),
            closed: false,
        }))
    }

    fn register(&mut self, _registry: &Registry, _token: Token) -> io::Result<()> {
        Ok(())
    }

    fn deregister(&mut self, _registry: &Registry) -> io::Result<()> {
        Ok(())
    }

    fn process_events(&mut self) -> Result<(), SessionError> {
        if self.control.fail_events.swap(false, Ordering::SeqCst) {
            self.control.connected.store(false, Ordering::SeqCst);
            return Err(SessionError::Hangup);
        }
        Ok(())
    }
}

/// A forwarding channel backed by its own TCP connection.
pub struct TcpChannel {
    stream: TcpStream,
    closed: bool,
}

impl Read for TcpChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stream.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.closed = true;
        }
        Ok(n)
    }
}

impl Write for TcpChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl ForwardChannel for TcpChannel {
    fn is_closed(&self) -> bool {
        self.closed
    }

    fn send_eof(&mut self) -> io::Result<()> {
        self.stream.shutdown(std::net::Shutdown::Write)
    }

    fn close(&mut self) {
        self.closed = true;
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.stream, token, Interest::READABLE)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }
}

/// Echoes every byte back on each accepted connection.
pub struct EchoServer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
}

impl EchoServer {
    pub fn start() -> Self {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = accepted.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                counter.fetch_add(1, Ordering::SeqCst);
                thread::spawn(move || {
                    let Ok(mut writer) = stream.try_clone() else {
                        return;
                    };
                    let mut reader = stream;
                    let _ = io::copy(&mut reader, &mut writer);
                });
            }
        });

        Self { addr, accepted }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// A tunnel config pointing at this server with a small buffer.
    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig::new("loopback", 22, "127.0.0.1", self.port())
            .with_buffer_size(1024)
            .with_connect_timeout(2)
    }
}

/// Blocking client connected to a local tunnel port.
pub fn connect_client(port: u16) -> StdTcpStream {
    let stream = StdTcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
