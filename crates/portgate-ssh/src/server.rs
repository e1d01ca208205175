//! Accept loop and server configuration for the tunnel-control port

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use portgate_control::TunnelRegistry;
use portgate_endpoint::IdentityVerifier;
use russh::keys::PrivateKey;
use russh::server::{Config, Handle};
use russh::{ChannelId, MethodKind, MethodSet, SshId};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::handler::ConnectionHandler;

/// The registry instantiated with this server's transport types.
pub type Registry = TunnelRegistry<Handle, ChannelId>;

/// Host key file names expected in the host-keys directory.
const HOST_KEY_FILES: [&str; 3] = [
    "ssh_host_ecdsa_key",
    "ssh_host_ed25519_key",
    "ssh_host_rsa_key",
];

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SshServerError {
    #[error("failed to load host key {path}: {source}")]
    HostKey {
        path: PathBuf,
        source: russh::keys::Error,
    },

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct SshServerConfig {
    pub bind_addr: SocketAddr,
    /// Public base domain; used for the server banner, endpoint derivation
    /// and the usage hint.
    pub domain: String,
    /// Directory containing the three host key files.
    pub host_keys_path: PathBuf,
    /// Offer `<user>.gh` vanity subdomains for GitHub-verified keys.
    pub github_subdomains: bool,
    /// Offer `<user>-<port>.gl` vanity subdomains for GitLab-verified keys.
    pub gitlab_subdomains: bool,
}

/// Run the tunnel-control server. Resolves only on a fatal startup error;
/// per-connection failures are logged and contained.
pub async fn run(
    config: SshServerConfig,
    registry: Arc<Registry>,
    verifier: Arc<IdentityVerifier>,
) -> Result<(), SshServerError> {
    let keys = load_host_keys(&config.host_keys_path)?;

    let ssh_config = Arc::new(Config {
        server_id: SshId::Standard(format!("SSH-2.0-{}-1.0", config.domain)),
        keys,
        methods: MethodSet::from(&[MethodKind::PublicKey][..]),
        keepalive_interval: Some(KEEPALIVE_INTERVAL),
        keepalive_max: 2,
        inactivity_timeout: Some(INACTIVITY_TIMEOUT),
        ..Default::default()
    });

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .map_err(|e| SshServerError::BindError {
            address: config.bind_addr.ip().to_string(),
            port: config.bind_addr.port(),
            reason: e.to_string(),
        })?;
    info!("SSH tunnel-control server listening on {}", config.bind_addr);

    let config = Arc::new(config);
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let ssh_config = ssh_config.clone();
                let config = config.clone();
                let registry = registry.clone();
                let verifier = verifier.clone();

                tokio::spawn(async move {
                    serve_connection(ssh_config, config, registry, verifier, stream, peer).await;
                });
            }
            Err(error) => {
                error!("SSH listener accept error: {}", error);
            }
        }
    }
}

async fn serve_connection(
    ssh_config: Arc<Config>,
    config: Arc<SshServerConfig>,
    registry: Arc<Registry>,
    verifier: Arc<IdentityVerifier>,
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
) {
    let handler = ConnectionHandler::new(config, registry.clone(), verifier, peer);
    let conn_id = handler.conn_id();

    match russh::server::run_stream(ssh_config, stream, handler).await {
        Ok(session) => {
            if let Err(error) = session.await {
                debug!(%peer, %error, "SSH session ended with error");
            }
        }
        Err(error) => {
            debug!(%peer, %error, "SSH handshake failed");
        }
    }

    if let Some(closed) = registry.close_connection(conn_id) {
        info!(%peer, key_id = %closed.key_id, tunnels = closed.tunnels, "disconnected");
    }
}

fn load_host_keys(dir: &Path) -> Result<Vec<PrivateKey>, SshServerError> {
    HOST_KEY_FILES
        .iter()
        .map(|name| {
            let path = dir.join(name);
            russh::keys::load_secret_key(&path, None)
                .map_err(|source| SshServerError::HostKey { path, source })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_host_key_is_reported_with_its_path() {
        let error = load_host_keys(Path::new("/nonexistent-host-keys")).unwrap_err();
        match error {
            SshServerError::HostKey { path, .. } => {
                assert!(path.ends_with("ssh_host_ecdsa_key"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
