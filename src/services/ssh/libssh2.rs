//! `SecureSession` backend on libssh2, through the `ssh2` crate.
//!
//! The session is blocking while it connects and authenticates, then
//! switches to non-blocking mode so channels can be pumped from the
//! handler's poll loop. All channels share the session's socket, which is
//! the event source handlers register.

use super::error::{ChannelOpenError, SessionError};
use super::session::{
    ConnectOutcome, ForwardChannel, SecureSession, SessionState, format_fingerprint,
};
use super::socket::describe_error;
use super::types::{ConnectionConfig, Credentials, DEFAULT_SSH_PORT, SshAuthMethod};
use mio::{Registry, Token};
use ssh2::{CheckResult, ErrorCode, HashType, KnownHostFileKind, KnownHostKeyFormat, Session};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const LIBSSH2_ERROR_EAGAIN: i32 = -37;

fn would_block(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::Session(code) if code == LIBSSH2_ERROR_EAGAIN)
}

pub struct Ssh2Session {
    config: ConnectionConfig,
    credentials: Option<Credentials>,
    session: Option<Session>,
    socket: Option<TcpStream>,
    state: SessionState,
    last_keepalive: Instant,
}

impl Ssh2Session {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            credentials: None,
            session: None,
            socket: None,
            state: SessionState::Disconnected,
            last_keepalive: Instant::now(),
        }
    }

    /// TCP connect, handshake, host key check and authentication. Any
    /// outcome other than success comes back as the `Err` value.
    fn establish(
        config: &ConnectionConfig,
        credentials: &Credentials,
    ) -> Result<(Session, TcpStream), ConnectOutcome> {
        let addr = config
            .ssh_endpoint()
            .to_socket_addrs()
            .map_err(|e| ConnectOutcome::ConnectionFailure(describe_error("resolve", &e)))?
            .next()
            .ok_or_else(|| {
                ConnectOutcome::ConnectionFailure(format!("no address for {}", config.ssh_host))
            })?;

        let tcp = TcpStream::connect_timeout(&addr, config.connect_timeout())
            .map_err(|e| ConnectOutcome::ConnectionFailure(describe_error("connect", &e)))?;
        let socket = tcp
            .try_clone()
            .map_err(|e| ConnectOutcome::ConnectionFailure(describe_error("dup", &e)))?;

        let mut session =
            Session::new().map_err(|e| ConnectOutcome::ConnectionFailure(e.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(millis(config.connect_timeout()));
        session.set_compress(config.compression_level > 0);
        session.handshake().map_err(|e| {
            ConnectOutcome::ConnectionFailure(format!("SSH handshake failed: {}", e))
        })?;

        check_host_key(&session, config)?;
        authenticate(&session, credentials)?;

        if config.keepalive > 0 {
            session.set_keepalive(false, config.keepalive as u32);
        }
        session.set_timeout(millis(config.read_write_timeout()));
        session.set_blocking(false);

        Ok((session, socket))
    }

    fn install(&mut self, session: Session, socket: TcpStream) {
        self.session = Some(session);
        self.socket = Some(socket);
        self.state = SessionState::Connected;
        self.last_keepalive = Instant::now();
        tracing::info!("SSH session to {} established", self.config.ssh_endpoint());
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<std::os::unix::io::RawFd> {
        use std::os::unix::io::AsRawFd;
        self.socket.as_ref().map(|s| s.as_raw_fd())
    }
}

impl SecureSession for Ssh2Session {
    fn connect(
        &mut self,
        config: &ConnectionConfig,
        credentials: &Credentials,
    ) -> Result<ConnectOutcome, SessionError> {
        self.disconnect();
        self.config = config.clone();
        self.credentials = Some(credentials.clone());

        match Self::establish(config, credentials) {
            Ok((session, socket)) => {
                self.install(session, socket);
                Ok(ConnectOutcome::Connected)
            }
            Err(outcome) => {
                tracing::warn!(
                    "SSH session to {} not established: {}",
                    config.ssh_endpoint(),
                    outcome
                );
                self.state = SessionState::Failed;
                Ok(outcome)
            }
        }
    }

    fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.disconnect(None, "closing tunnel session", None);
            tracing::debug!("SSH session to {} closed", self.config.ssh_endpoint());
        }
        self.socket = None;
        self.state = SessionState::Disconnected;
    }

    fn reconnect(&mut self) -> Result<(), SessionError> {
        let credentials = self.credentials.clone().ok_or(SessionError::NotConnected)?;
        self.disconnect();

        match Self::establish(&self.config, &credentials) {
            Ok((session, socket)) => {
                self.install(session, socket);
                Ok(())
            }
            Err(outcome) => {
                self.state = SessionState::Failed;
                Err(match outcome {
                    ConnectOutcome::InvalidAuthData(msg) => SessionError::Auth(msg),
                    ConnectOutcome::ConnectionFailure(msg) => SessionError::Connect(msg),
                    other => SessionError::HostKey(other.to_string()),
                })
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.state == SessionState::Connected && self.session.is_some()
    }

    fn state(&self) -> SessionState {
        self.state
    }

    fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn open_forward_channel(
        &mut self,
        remote_host: &str,
        remote_port: u16,
        bind_host: &str,
        bind_port: u16,
    ) -> Result<Box<dyn ForwardChannel>, ChannelOpenError> {
        let session = self.session.as_ref().ok_or(ChannelOpenError::NotConnected)?;
        match session.channel_direct_tcpip(remote_host, remote_port, Some((bind_host, bind_port))) {
            Ok(channel) => Ok(Box::new(Ssh2Channel { channel })),
            Err(err) if would_block(&err) => Err(ChannelOpenError::Retry(format!(
                "{}:{}",
                remote_host, remote_port
            ))),
            Err(err) => Err(ChannelOpenError::Rejected(err.message().to_string())),
        }
    }

    #[cfg(unix)]
    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let fd = self.raw_fd().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "session is not connected")
        })?;
        registry.register(&mut mio::unix::SourceFd(&fd), token, mio::Interest::READABLE)
    }

    #[cfg(not(unix))]
    fn register(&mut self, _registry: &Registry, _token: Token) -> io::Result<()> {
        // No raw socket source here; the handler's poll interval drives it.
        Ok(())
    }

    #[cfg(unix)]
    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self.raw_fd() {
            Some(fd) => registry.deregister(&mut mio::unix::SourceFd(&fd)),
            None => Ok(()),
        }
    }

    #[cfg(not(unix))]
    fn deregister(&mut self, _registry: &Registry) -> io::Result<()> {
        Ok(())
    }

    fn process_events(&mut self) -> Result<(), SessionError> {
        let session = self.session.as_ref().ok_or(SessionError::NotConnected)?;
        if self.config.keepalive == 0
            || self.last_keepalive.elapsed() < Duration::from_secs(self.config.keepalive)
        {
            return Ok(());
        }

        match session.keepalive_send() {
            Ok(_) => {}
            Err(err) if would_block(&err) => {}
            Err(err) => {
                self.state = SessionState::Failed;
                return Err(SessionError::Protocol(format!(
                    "keepalive failed: {}",
                    err.message()
                )));
            }
        }
        self.last_keepalive = Instant::now();
        Ok(())
    }
}

impl Drop for Ssh2Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// A `direct-tcpip` channel on a non-blocking session.
pub struct Ssh2Channel {
    channel: ssh2::Channel,
}

impl Read for Ssh2Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.channel.read(buf)
    }
}

impl Write for Ssh2Channel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.channel.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.channel.flush()
    }
}

impl ForwardChannel for Ssh2Channel {
    fn is_closed(&self) -> bool {
        self.channel.eof()
    }

    fn send_eof(&mut self) -> io::Result<()> {
        self.channel.send_eof().map_err(|err| {
            if would_block(&err) {
                io::ErrorKind::WouldBlock.into()
            } else {
                io::Error::other(err.to_string())
            }
        })
    }

    fn close(&mut self) {
        let _ = self.channel.close();
    }
}

fn millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

fn check_host_key(session: &Session, config: &ConnectionConfig) -> Result<(), ConnectOutcome> {
    let (key, key_type) = session
        .host_key()
        .ok_or_else(|| ConnectOutcome::ConnectionFailure("server sent no host key".into()))?;
    let fingerprint = session
        .host_key_hash(HashType::Sha256)
        .or_else(|| session.host_key_hash(HashType::Sha1))
        .map(format_fingerprint)
        .unwrap_or_default();

    let path = config.known_hosts_path();

    // Accepted by the user on an earlier FingerprintUnknown.
    if config.fingerprint.as_deref() == Some(fingerprint.as_str()) {
        if let Some(path) = &path {
            if let Err(err) = remember_host_key(session, config, key, key_type.into(), path) {
                tracing::warn!("Could not update {}: {}", path.display(), err);
            }
        }
        return Ok(());
    }
    if !config.strict_host_key_check {
        return Ok(());
    }

    let mut known = session
        .known_hosts()
        .map_err(|e| ConnectOutcome::ConnectionFailure(e.to_string()))?;
    let known_hosts_missing = !path.as_deref().is_some_and(Path::exists);
    if let Some(path) = path.as_deref().filter(|p| p.exists()) {
        known
            .read_file(path, KnownHostFileKind::OpenSSH)
            .map_err(|e| ConnectOutcome::ConnectionFailure(e.to_string()))?;
    }

    match known.check_port(&config.ssh_host, config.ssh_port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::NotFound => Err(ConnectOutcome::FingerprintUnknown {
            fingerprint,
            known_hosts_missing,
        }),
        CheckResult::Mismatch => Err(ConnectOutcome::FingerprintChanged { fingerprint }),
        CheckResult::Failure => Err(ConnectOutcome::FingerprintMismatch { fingerprint }),
    }
}

fn remember_host_key(
    session: &Session,
    config: &ConnectionConfig,
    key: &[u8],
    format: KnownHostKeyFormat,
    path: &Path,
) -> Result<(), ssh2::Error> {
    let mut known = session.known_hosts()?;
    if path.exists() {
        known.read_file(path, KnownHostFileKind::OpenSSH)?;
    } else if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let host = known_hosts_entry(&config.ssh_host, config.ssh_port);
    known.add(&host, key, "added by sshtunnel", format)?;
    known.write_file(path, KnownHostFileKind::OpenSSH)?;
    tracing::info!("Added host key for {} to {}", host, path.display());
    Ok(())
}

/// Host pattern as OpenSSH writes it: bare for port 22, `[host]:port`
/// otherwise.
fn known_hosts_entry(host: &str, port: u16) -> String {
    if port == DEFAULT_SSH_PORT {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

fn authenticate(session: &Session, credentials: &Credentials) -> Result<(), ConnectOutcome> {
    let user = credentials.username.as_str();
    let result = match &credentials.auth_method {
        SshAuthMethod::Agent => session.userauth_agent(user),
        SshAuthMethod::Password(password) => session.userauth_password(user, password),
        SshAuthMethod::PublicKey {
            private_key_path,
            passphrase,
        } => session.userauth_pubkey_file(
            user,
            None,
            &expand_home(private_key_path),
            passphrase.as_deref(),
        ),
    };
    result.map_err(|e| ConnectOutcome::InvalidAuthData(e.message().to_string()))?;

    if !session.authenticated() {
        return Err(ConnectOutcome::InvalidAuthData(format!(
            "server did not accept credentials for {}",
            user
        )));
    }
    Ok(())
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}
