//! SSH tunnel configuration types.

use super::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_LOCAL_HOST: &str = "127.0.0.1";
pub const DEFAULT_BUFFER_SIZE: usize = 10240;

/// Authentication method for SSH connections
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SshAuthMethod {
    /// Use ssh-agent
    Agent,
    /// Password authentication
    Password(String),
    /// Public key file with optional passphrase
    PublicKey {
        private_key_path: String,
        passphrase: Option<String>,
    },
}

impl Default for SshAuthMethod {
    fn default() -> Self {
        SshAuthMethod::Agent
    }
}

/// Who to authenticate as, and how. Only session backends look at this.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub auth_method: SshAuthMethod,
}

impl Credentials {
    pub fn agent(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            auth_method: SshAuthMethod::Agent,
        }
    }

    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            auth_method: SshAuthMethod::Password(password.into()),
        }
    }

    pub fn public_key(
        username: impl Into<String>,
        private_key_path: impl Into<String>,
        passphrase: Option<String>,
    ) -> Self {
        Self {
            username: username.into(),
            auth_method: SshAuthMethod::PublicKey {
                private_key_path: private_key_path.into(),
                passphrase,
            },
        }
    }
}

/// The routing part of a [`ConnectionConfig`].
///
/// Two configs with the same key describe the same tunnel, whatever their
/// tuning fields say.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelKey {
    pub local_host: String,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

/// Configuration for one tunnel and the SSH hop it goes through.
///
/// Timeouts are whole seconds, matching how they are configured in the
/// settings file. Equality compares the routing fields only (see
/// [`TunnelKey`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Local bind address for the listening socket
    pub local_host: String,
    /// Host to forward to (as seen from the SSH server)
    pub remote_host: String,
    pub remote_port: u16,
    /// SSH server hostname
    pub ssh_host: String,
    pub ssh_port: u16,
    /// Chunk size used when pumping bytes
    pub buffer_size: usize,
    pub connect_timeout: u64,
    pub read_write_timeout: u64,
    pub command_timeout: u64,
    pub command_retry_count: u32,
    /// 0 disables compression
    pub compression_level: u32,
    /// Keepalive interval in seconds, 0 disables it
    pub keepalive: u64,
    pub strict_host_key_check: bool,
    pub known_hosts_file: Option<String>,
    /// Fingerprint the user already accepted for an unknown host
    pub fingerprint: Option<String>,
    pub config_file: Option<String>,
    pub options_dir: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            local_host: DEFAULT_LOCAL_HOST.to_string(),
            remote_host: String::new(),
            remote_port: 0,
            ssh_host: String::new(),
            ssh_port: DEFAULT_SSH_PORT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout: 10,
            read_write_timeout: 5,
            command_timeout: 1,
            command_retry_count: 3,
            compression_level: 0,
            keepalive: 60,
            strict_host_key_check: true,
            known_hosts_file: None,
            fingerprint: None,
            config_file: None,
            options_dir: None,
        }
    }
}

impl ConnectionConfig {
    /// Create a tunnel configuration with default tuning.
    pub fn new(
        ssh_host: impl Into<String>,
        ssh_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            ssh_host: ssh_host.into(),
            ssh_port,
            remote_host: remote_host.into(),
            remote_port,
            ..Self::default()
        }
    }

    /// Build a configuration from `host[:port]` strings, as entered in a
    /// connection form.
    pub fn from_endpoints(
        ssh: &str,
        remote: &str,
        default_remote_port: u16,
    ) -> Result<Self, ConfigError> {
        let (ssh_host, ssh_port) = parse_endpoint(ssh, DEFAULT_SSH_PORT)?;
        let (remote_host, remote_port) = parse_endpoint(remote, default_remote_port)?;
        Ok(Self::new(ssh_host, ssh_port, remote_host, remote_port))
    }

    pub fn with_local_host(mut self, host: impl Into<String>) -> Self {
        self.local_host = host.into();
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout = secs;
        self
    }

    pub fn with_read_write_timeout(mut self, secs: u64) -> Self {
        self.read_write_timeout = secs;
        self
    }

    pub fn with_keepalive(mut self, secs: u64) -> Self {
        self.keepalive = secs;
        self
    }

    pub fn with_compression(mut self, level: u32) -> Self {
        self.compression_level = level;
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn with_known_hosts_file(mut self, path: impl Into<String>) -> Self {
        self.known_hosts_file = Some(path.into());
        self
    }

    pub fn with_strict_host_key_check(mut self, strict: bool) -> Self {
        self.strict_host_key_check = strict;
        self
    }

    pub fn key(&self) -> TunnelKey {
        TunnelKey {
            local_host: self.local_host.clone(),
            ssh_host: self.ssh_host.clone(),
            ssh_port: self.ssh_port,
            remote_host: self.remote_host.clone(),
            remote_port: self.remote_port,
        }
    }

    /// True when both configs route through the same hop to the same target.
    pub fn same_tunnel(&self, other: &ConnectionConfig) -> bool {
        self.local_host == other.local_host
            && self.ssh_host == other.ssh_host
            && self.ssh_port == other.ssh_port
            && self.remote_host == other.remote_host
            && self.remote_port == other.remote_port
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn read_write_timeout(&self) -> Duration {
        Duration::from_secs(self.read_write_timeout)
    }

    /// `host:port` of the SSH server
    pub fn ssh_endpoint(&self) -> String {
        format_endpoint(&self.ssh_host, self.ssh_port)
    }

    /// `host:port` of the forwarding target
    pub fn remote_endpoint(&self) -> String {
        format_endpoint(&self.remote_host, self.remote_port)
    }

    /// The known_hosts file to check host keys against.
    pub fn known_hosts_path(&self) -> Option<PathBuf> {
        if let Some(file) = self.known_hosts_file.as_deref().filter(|f| !f.is_empty()) {
            return Some(PathBuf::from(file));
        }
        if let Some(dir) = self.options_dir.as_deref().filter(|d| !d.is_empty()) {
            return Some(PathBuf::from(dir).join("known_hosts"));
        }
        dirs::home_dir().map(|home| home.join(".ssh").join("known_hosts"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local_host.trim().is_empty() {
            return Err(ConfigError::EmptyField("local_host"));
        }
        if self.ssh_host.trim().is_empty() {
            return Err(ConfigError::EmptyField("ssh_host"));
        }
        if self.remote_host.trim().is_empty() {
            return Err(ConfigError::EmptyField("remote_host"));
        }
        if self.ssh_port == 0 {
            return Err(ConfigError::ZeroValue("ssh_port"));
        }
        if self.remote_port == 0 {
            return Err(ConfigError::ZeroValue("remote_port"));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::ZeroValue("buffer_size"));
        }
        if self.connect_timeout == 0 {
            return Err(ConfigError::ZeroValue("connect_timeout"));
        }
        Ok(())
    }
}

impl PartialEq for ConnectionConfig {
    fn eq(&self, other: &Self) -> bool {
        self.same_tunnel(other)
    }
}

impl Eq for ConnectionConfig {}

impl Hash for ConnectionConfig {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.local_host.hash(state);
        self.ssh_host.hash(state);
        self.ssh_port.hash(state);
        self.remote_host.hash(state);
        self.remote_port.hash(state);
    }
}

/// Split `host[:port]` into its parts.
///
/// Bracketed IPv6 literals (`[::1]:22`) are supported; a bare IPv6 literal
/// is taken as a host without a port. A port that does not parse falls back
/// to `default_port`.
pub fn parse_endpoint(raw: &str, default_port: u16) -> Result<(String, u16), ConfigError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ConfigError::InvalidEndpoint(raw.to_string()));
    }

    let (host, port) = if let Some(rest) = raw.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ConfigError::InvalidEndpoint(raw.to_string()))?;
        (host, tail.strip_prefix(':'))
    } else if raw.matches(':').count() == 1 {
        let (host, port) = raw.split_once(':').unwrap_or((raw, ""));
        (host, Some(port))
    } else {
        (raw, None)
    };

    if host.is_empty() {
        return Err(ConfigError::InvalidEndpoint(raw.to_string()));
    }

    let port = port
        .and_then(|p| p.parse::<u16>().ok())
        .filter(|p| *p != 0)
        .unwrap_or(default_port);
    Ok((host.to_string(), port))
}

fn format_endpoint(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_logical_equality_ignores_tuning() {
        let a = ConnectionConfig::new("bastion", 22, "db.internal", 3306);
        let b = ConnectionConfig::new("bastion", 22, "db.internal", 3306)
            .with_buffer_size(1024)
            .with_connect_timeout(30)
            .with_compression(6)
            .with_fingerprint("aa:bb");
        assert_eq!(a, b);
        assert!(a.same_tunnel(&b));
        assert_eq!(a.key(), b.key());

        let set: HashSet<_> = [a.clone(), b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_logical_equality_routing_fields() {
        let base = ConnectionConfig::new("bastion", 22, "db.internal", 3306);
        assert_ne!(base, base.clone().with_local_host("0.0.0.0"));
        assert_ne!(base, ConnectionConfig::new("bastion", 2222, "db.internal", 3306));
        assert_ne!(base, ConnectionConfig::new("other", 22, "db.internal", 3306));
        assert_ne!(base, ConnectionConfig::new("bastion", 22, "db2.internal", 3306));
        assert_ne!(base, ConnectionConfig::new("bastion", 22, "db.internal", 3307));
    }

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::new("bastion", 22, "db", 5432);
        assert_eq!(config.local_host, "127.0.0.1");
        assert_eq!(config.buffer_size, 10240);
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.read_write_timeout(), Duration::from_secs(5));
        assert_eq!(config.command_retry_count, 3);
        assert_eq!(config.keepalive, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        let config = ConnectionConfig::new("", 22, "db", 5432);
        assert_eq!(config.validate(), Err(ConfigError::EmptyField("ssh_host")));

        let config = ConnectionConfig::new("bastion", 22, "db", 0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroValue("remote_port")));

        let config = ConnectionConfig::new("bastion", 22, "db", 5432).with_buffer_size(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroValue("buffer_size")));

        let config = ConnectionConfig::new("bastion", 22, "db", 5432).with_connect_timeout(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroValue("connect_timeout")));
    }

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(parse_endpoint("bastion", 22).unwrap(), ("bastion".into(), 22));
        assert_eq!(parse_endpoint("bastion:2222", 22).unwrap(), ("bastion".into(), 2222));
        assert_eq!(parse_endpoint(" db:3306 ", 3306).unwrap(), ("db".into(), 3306));
        assert_eq!(parse_endpoint("db:notaport", 3306).unwrap(), ("db".into(), 3306));
        assert_eq!(parse_endpoint("[::1]:2200", 22).unwrap(), ("::1".into(), 2200));
        assert_eq!(parse_endpoint("[fe80::1]", 22).unwrap(), ("fe80::1".into(), 22));
        assert_eq!(parse_endpoint("fe80::1", 22).unwrap(), ("fe80::1".into(), 22));
        assert!(parse_endpoint("", 22).is_err());
        assert!(parse_endpoint(":22", 22).is_err());
        assert!(parse_endpoint("[::1", 22).is_err());
    }

    #[test]
    fn test_from_endpoints() {
        let config = ConnectionConfig::from_endpoints("bastion:2222", "db", 3306).unwrap();
        assert_eq!(config.ssh_host, "bastion");
        assert_eq!(config.ssh_port, 2222);
        assert_eq!(config.remote_host, "db");
        assert_eq!(config.remote_port, 3306);
        assert_eq!(config.ssh_endpoint(), "bastion:2222");
        assert_eq!(config.remote_endpoint(), "db:3306");
    }

    #[test]
    fn test_known_hosts_path() {
        let config = ConnectionConfig::new("bastion", 22, "db", 5432)
            .with_known_hosts_file("/tmp/known_hosts_test");
        assert_eq!(
            config.known_hosts_path(),
            Some(PathBuf::from("/tmp/known_hosts_test"))
        );

        let mut config = ConnectionConfig::new("bastion", 22, "db", 5432);
        config.options_dir = Some("/etc/sshtunnel".into());
        assert_eq!(
            config.known_hosts_path(),
            Some(PathBuf::from("/etc/sshtunnel/known_hosts"))
        );
    }

    #[test]
    fn test_config_deserialize_fills_defaults() {
        let config: ConnectionConfig = serde_json::from_str(
            r#"{"ssh_host": "bastion", "remote_host": "db", "remote_port": 5432}"#,
        )
        .unwrap();
        assert_eq!(config.ssh_port, 22);
        assert_eq!(config.local_host, "127.0.0.1");
        assert_eq!(config.buffer_size, 10240);
    }

    #[test]
    fn test_credentials_constructors() {
        assert_eq!(Credentials::agent("me").auth_method, SshAuthMethod::Agent);
        assert_eq!(
            Credentials::password("me", "pw").auth_method,
            SshAuthMethod::Password("pw".into())
        );
        let key = Credentials::public_key("me", "/home/me/.ssh/id_ed25519", None);
        assert!(matches!(key.auth_method, SshAuthMethod::PublicKey { .. }));
    }
}
