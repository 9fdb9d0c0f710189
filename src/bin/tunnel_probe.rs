//! SSH Tunnel Probe
//!
//! Opens a tunnel through a real SSH server and exercises it end to end:
//! creation, reuse, a TCP round trip through the forwarded port, and
//! disconnect.
//!
//! Run with:
//!   SSHTUNNEL_PASSWORD=secret cargo run --features libssh2 --bin tunnel_probe -- \
//!       user@bastion:2222 db.internal:5432
//!
//! Without `SSHTUNNEL_PASSWORD` the ssh-agent is used. Pass
//! `--accept-host-key` to trust an unknown host key.

use anyhow::{Context, Result, bail};
use sshtunnel::settings::SshSettings;
use sshtunnel::ssh::{
    ConnectOutcome, ConnectionConfig, Credentials, SecureSession, Ssh2Session, TunnelManager,
    TunnelStatus, share,
};
use std::io::{BufRead, Write};
use std::net::TcpStream;
use std::time::Duration;

const USAGE: &str =
    "usage: tunnel_probe [--accept-host-key] user@ssh_host[:port] remote_host[:port]";
const DEFAULT_REMOTE_PORT: u16 = 22;

fn main() -> Result<()> {
    sshtunnel::logging::init_with_default("tunnel_probe=debug,sshtunnel=debug,warn");

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let accept_host_key = take_flag(&mut args, "--accept-host-key");
    let [ssh, remote] = args.as_slice() else {
        bail!(USAGE);
    };
    let (user, ssh) = ssh
        .split_once('@')
        .with_context(|| format!("missing user in '{}'\n{}", ssh, USAGE))?;

    let settings = SshSettings::load_default()?;
    let mut config = ConnectionConfig::from_endpoints(ssh, remote, DEFAULT_REMOTE_PORT)?;
    settings.apply_to(&mut config);

    let credentials = match std::env::var("SSHTUNNEL_PASSWORD") {
        Ok(password) => Credentials::password(user, password),
        Err(_) => Credentials::agent(user),
    };

    println!("━━━ Step 1: SSH session ━━━");
    let mut session = Ssh2Session::new(config.clone());
    match session.connect(&config, &credentials)? {
        ConnectOutcome::Connected => {}
        ConnectOutcome::FingerprintUnknown { fingerprint, .. } if accept_host_key => {
            println!("  → Trusting host key {}", fingerprint);
            config = config.with_fingerprint(fingerprint);
            let retry = session.connect(&config, &credentials)?;
            if !retry.is_connected() {
                bail!("SSH session failed: {}", retry);
            }
        }
        outcome => bail!("SSH session failed: {}", outcome),
    }
    println!("  ✓ Connected to {} as '{}'", config.ssh_endpoint(), user);

    println!("\n━━━ Step 2: Tunnel lifecycle ━━━");
    let manager = TunnelManager::init_with(settings.reconnect_config())?;
    let events = manager.subscribe();
    let session = share(session);

    let status = manager.create_tunnel(&config, session.clone())?;
    let local_port = status.local_port();
    println!(
        "  ✓ Tunnel listening on 127.0.0.1:{} -> {}",
        local_port,
        config.remote_endpoint()
    );

    let again = manager.create_tunnel(&config, session.clone())?;
    if again != (TunnelStatus::Reused { local_port }) {
        bail!("expected the tunnel to be reused, got {:?}", again);
    }
    println!("  ✓ Second request reused port {}", local_port);

    println!("\n━━━ Step 3: Round trip ━━━");
    let mut stream = TcpStream::connect(("127.0.0.1", local_port))
        .context("Failed to connect to the tunnel")?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(b"\r\n")?;
    let mut banner = String::new();
    match std::io::BufReader::new(&stream).read_line(&mut banner) {
        Ok(0) => println!("  → Remote closed without data"),
        Ok(_) => println!("  ✓ Remote said: {}", banner.trim_end()),
        Err(e) => println!("  → No data from remote: {}", e),
    }
    drop(stream);

    println!("\n━━━ Step 4: Disconnect ━━━");
    if !manager.disconnect(&config) {
        bail!("tunnel was not registered");
    }
    if manager.lookup_tunnel(&config) != 0 {
        bail!("tunnel still registered after disconnect");
    }
    println!("  ✓ Tunnel closed");

    println!("\n  Events:");
    while let Ok(event) = events.try_recv() {
        println!("    {} {:?}", event.tunnel, event.kind);
    }

    manager.shutdown();
    Ok(())
}

fn take_flag(args: &mut Vec<String>, flag: &str) -> bool {
    let before = args.len();
    args.retain(|arg| arg != flag);
    args.len() != before
}
