//! TLS listener and tunnel splicing

use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use portgate_control::Target;
use portgate_ssh::Registry;
use russh::server::Handle;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use crate::http;

#[derive(Debug, Error)]
pub enum HttpsServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct HttpsServerConfig {
    pub bind_addr: SocketAddr,
    /// Certificate chain, PEM.
    pub chain_path: PathBuf,
    /// Private key, PEM.
    pub key_path: PathBuf,
    /// Public base domain; requests for it are redirected to the docs site.
    pub domain: String,
}

pub struct HttpsServer {
    config: HttpsServerConfig,
    registry: Arc<Registry>,
}

impl HttpsServer {
    pub fn new(config: HttpsServerConfig, registry: Arc<Registry>) -> Self {
        Self { config, registry }
    }

    /// Load TLS certificates from a PEM file
    fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, HttpsServerError> {
        let file = File::open(path)
            .map_err(|e| HttpsServerError::TlsError(format!("Failed to open cert file: {}", e)))?;
        let mut reader = BufReader::new(file);

        rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| HttpsServerError::TlsError(format!("Failed to parse certs: {}", e)))
    }

    /// Load the private key from a PEM file
    fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, HttpsServerError> {
        let file = File::open(path)
            .map_err(|e| HttpsServerError::TlsError(format!("Failed to open key file: {}", e)))?;
        let mut reader = BufReader::new(file);

        rustls_pemfile::private_key(&mut reader)
            .map_err(|e| HttpsServerError::TlsError(format!("Failed to parse key: {}", e)))?
            .ok_or_else(|| HttpsServerError::TlsError("No private key found".to_string()))
    }

    /// Start the HTTPS frontend. Resolves only on a fatal startup error.
    pub async fn start(self) -> Result<(), HttpsServerError> {
        let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();

        info!("Loading TLS certificate chain from: {}", self.config.chain_path.display());
        let certs = Self::load_certs(&self.config.chain_path)?;
        info!("Loading TLS private key from: {}", self.config.key_path.display());
        let key = Self::load_private_key(&self.config.key_path)?;

        let mut tls_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| HttpsServerError::TlsError(format!("Invalid certificate/key: {}", e)))?;
        tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let listener = TcpListener::bind(self.config.bind_addr).await.map_err(|e| {
            HttpsServerError::BindError {
                address: self.config.bind_addr.ip().to_string(),
                port: self.config.bind_addr.port(),
                reason: e.to_string(),
            }
        })?;
        info!("HTTPS server listening on {}", self.config.bind_addr);

        let domain: Arc<str> = self.config.domain.clone().into();
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    let acceptor = acceptor.clone();
                    let registry = self.registry.clone();
                    let domain = domain.clone();

                    tokio::spawn(async move {
                        serve_connection(acceptor, registry, domain, socket, peer).await;
                    });
                }
                Err(error) => {
                    error!("HTTPS listener accept error: {}", error);
                }
            }
        }
    }
}

async fn serve_connection(
    acceptor: TlsAcceptor,
    registry: Arc<Registry>,
    domain: Arc<str>,
    socket: TcpStream,
    peer: SocketAddr,
) {
    let mut tls = match acceptor.accept(socket).await {
        Ok(tls) => tls,
        Err(error) => {
            debug!(%peer, %error, "TLS handshake failed");
            return;
        }
    };
    let sni = tls
        .get_ref()
        .1
        .server_name()
        .map(str::to_owned)
        .unwrap_or_default();

    if sni == *domain {
        let _ = http::redirect(&mut tls, &format!("https://docs.{domain}")).await;
        let _ = tls.shutdown().await;
        return;
    }

    let Some(target) = registry.pick_target(&sni) else {
        let _ = http::error_out(&mut tls, "503 Service Unavailable", "No tunnel available.").await;
        let _ = tls.shutdown().await;
        return;
    };

    let channel = match open_tunnel_channel(&target, &domain).await {
        Ok(channel) => channel,
        Err(error) => {
            debug!(%peer, hostname = %sni, %error, "tunnel channel open failed");
            let _ = http::error_out(&mut tls, "502 Bad Gateway", &error.to_string()).await;
            let _ = tls.shutdown().await;
            return;
        }
    };

    splice(tls, channel.into_stream(), &sni, peer).await;
}

/// Open the `forwarded-tcpip` channel carrying this connection's bytes. The
/// origin port is a synthetic per-connection label, not a real socket port.
async fn open_tunnel_channel(
    target: &Target<Handle>,
    domain: &str,
) -> Result<russh::Channel<russh::server::Msg>, russh::Error> {
    target
        .handle
        .channel_open_forwarded_tcpip(
            target.bind_addr.clone(),
            target.bind_port,
            domain.to_string(),
            u32::from(target.next_origin_port()),
        )
        .await
}

/// Copy in both directions until both sides are done, propagating half-close
/// and keeping per-direction byte counts for the log.
async fn splice<A, B>(client: A, tunnel: B, hostname: &str, peer: SocketAddr)
where
    A: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send,
    B: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut tunnel_read, mut tunnel_write) = tokio::io::split(tunnel);

    let to_client = async {
        let (bytes, error) = copy_all(&mut tunnel_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        (bytes, error)
    };
    let to_tunnel = async {
        let (bytes, error) = copy_all(&mut client_read, &mut tunnel_write).await;
        let _ = tunnel_write.shutdown().await;
        (bytes, error)
    };
    let ((received, recv_error), (sent, send_error)) = tokio::join!(to_client, to_tunnel);

    for (direction, error) in [("tunnel→client", recv_error), ("client→tunnel", send_error)] {
        if let Some(error) = error {
            if error.kind() != io::ErrorKind::UnexpectedEof {
                debug!(%peer, hostname, direction, %error, "copy failed");
            }
        }
    }
    debug!(%peer, hostname, received, sent, "connection closed");
}

/// Copy until EOF or error, returning the byte count either way.
async fn copy_all<R, W>(read: &mut R, write: &mut W) -> (u64, Option<io::Error>)
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0u64;
    loop {
        match read.read(&mut buf).await {
            Ok(0) => return (total, None),
            Ok(n) => {
                if let Err(error) = write.write_all(&buf[..n]).await {
                    return (total, Some(error));
                }
                total += n as u64;
            }
            Err(error) => return (total, Some(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn splice_moves_bytes_both_ways_and_half_closes() {
        let (client_near, client_far) = tokio::io::duplex(4096);
        let (tunnel_near, tunnel_far) = tokio::io::duplex(4096);

        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let splice_task = tokio::spawn(async move {
            splice(client_far, tunnel_far, "h.example.test", peer).await;
        });

        let (mut client_read, mut client_write) = tokio::io::split(client_near);
        let (mut tunnel_read, mut tunnel_write) = tokio::io::split(tunnel_near);

        client_write.write_all(b"request bytes").await.unwrap();
        client_write.shutdown().await.unwrap();

        let mut seen_by_tunnel = Vec::new();
        tunnel_read.read_to_end(&mut seen_by_tunnel).await.unwrap();
        assert_eq!(seen_by_tunnel, b"request bytes");

        tunnel_write.write_all(b"response bytes").await.unwrap();
        tunnel_write.shutdown().await.unwrap();

        let mut seen_by_client = Vec::new();
        client_read.read_to_end(&mut seen_by_client).await.unwrap();
        assert_eq!(seen_by_client, b"response bytes");

        splice_task.await.unwrap();
    }

    #[tokio::test]
    async fn copy_all_counts_bytes() {
        let (mut near, far) = tokio::io::duplex(4096);
        let (mut far_read, _far_write) = tokio::io::split(far);

        near.write_all(&[7u8; 1000]).await.unwrap();
        near.shutdown().await.unwrap();
        drop(near);

        let mut sink = Vec::new();
        let (bytes, error) = copy_all(&mut far_read, &mut sink).await;
        assert_eq!(bytes, 1000);
        assert!(error.is_none());
        assert_eq!(sink.len(), 1000);
    }
}
