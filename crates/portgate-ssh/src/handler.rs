//! Per-connection handler for the tunnel-control protocol
//!
//! One handler per SSH connection, driven by the russh session event loop.
//! Three cooperating pieces of state: the shared registry (endpoint and
//! session bookkeeping), an unbounded per-connection message channel whose
//! drain task fans announcements out to every open session, and a request
//! counter that gates the usage hint.
//!
//! Handle-directed I/O (session writes, exit status, close, disconnect) is
//! always performed from spawned tasks, never inline in a callback: the
//! callback runs on the same event loop that would have to consume those
//! messages.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use portgate_control::ConnId;
use portgate_endpoint::{endpoint_hostnames, key_id, IdentityVerifier, NO_MATCH_USER};
use russh::keys::PublicKey;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Disconnect, MethodKind, MethodSet};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::server::{Registry, SshServerConfig};

/// The port clients reach their tunnels on, reported in forward replies.
const PUBLIC_TUNNEL_PORT: u32 = 443;

/// How long a fresh session may sit without any forward request before it
/// is told how to use the service and dismissed.
const USAGE_DEADLINE: Duration = Duration::from_secs(1);

pub struct ConnectionHandler {
    config: Arc<SshServerConfig>,
    registry: Arc<Registry>,
    verifier: Arc<IdentityVerifier>,
    conn_id: ConnId,
    peer: SocketAddr,
    user: Option<String>,
    key_blob: Option<Vec<u8>>,
    github_verified: bool,
    gitlab_verified: bool,
    /// Counts tcpip-forward and cancel-tcpip-forward requests; read by the
    /// usage-deadline tasks.
    requested: Arc<AtomicU32>,
    msg_tx: mpsc::UnboundedSender<String>,
    msg_rx: Option<mpsc::UnboundedReceiver<String>>,
    output_ready: watch::Sender<bool>,
}

impl ConnectionHandler {
    pub fn new(
        config: Arc<SshServerConfig>,
        registry: Arc<Registry>,
        verifier: Arc<IdentityVerifier>,
        peer: SocketAddr,
    ) -> Self {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (output_ready, _) = watch::channel(false);
        Self {
            config,
            registry,
            verifier,
            conn_id: ConnId::next(),
            peer,
            user: None,
            key_blob: None,
            github_verified: false,
            gitlab_verified: false,
            requested: Arc::new(AtomicU32::new(0)),
            msg_tx,
            msg_rx: Some(msg_rx),
            output_ready,
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    fn endpoints_for(&self, bind_port: u32) -> Option<Vec<String>> {
        let key_blob = self.key_blob.as_deref()?;
        let user = self.user.as_deref().unwrap_or_default();
        Some(endpoint_hostnames(
            &self.config.domain,
            user,
            key_blob,
            bind_port,
            self.github_verified,
            self.gitlab_verified,
        ))
    }

    /// Spawn the task that delivers queued messages to every open session.
    /// It stays silent until the first session opens, then drains until the
    /// handler (and with it the sender) is dropped.
    fn spawn_message_fanout(&mut self, handle: Handle) {
        let Some(mut msg_rx) = self.msg_rx.take() else {
            return;
        };
        let mut ready = self.output_ready.subscribe();
        let registry = self.registry.clone();
        let conn_id = self.conn_id;

        tokio::spawn(async move {
            if ready.wait_for(|ready| *ready).await.is_err() {
                return;
            }
            while let Some(msg) = msg_rx.recv().await {
                let line = format!("{msg}\r\n");
                for channel in registry.session_channels(conn_id) {
                    if handle
                        .data(channel, CryptoVec::from_slice(line.as_bytes()))
                        .await
                        .is_err()
                    {
                        debug!(%conn_id, "could not deliver message to session");
                    }
                }
            }
        });
    }
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(&[MethodKind::PublicKey][..])),
            partial_success: false,
        })
    }

    /// Any key is accepted; possession is the only requirement. The key is
    /// recorded because everything else (endpoint names, vanity checks,
    /// logging) derives from it.
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.user = Some(user.to_string());
        self.key_blob = Some(public_key.to_bytes()?);
        Ok(Auth::Accept)
    }

    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        let key_blob = self
            .key_blob
            .clone()
            .ok_or_else(|| anyhow::anyhow!("authenticated without a public key"))?;
        let key_id = key_id(&key_blob);
        let user = self.user.clone().unwrap_or_default();

        let check = |site: &'static str, enabled: bool| {
            let verifier = self.verifier.clone();
            let user = user.clone();
            let key_id = key_id.clone();
            async move {
                enabled
                    && user != NO_MATCH_USER
                    && verifier.key_matches_account(site, &user, &key_id).await
            }
        };
        let (github_verified, gitlab_verified) = tokio::join!(
            check("github.com", self.config.github_subdomains),
            check("gitlab.com", self.config.gitlab_subdomains),
        );
        self.github_verified = github_verified;
        self.gitlab_verified = gitlab_verified;

        info!(
            peer = %self.peer,
            key_id = %key_id,
            user = %user,
            github = github_verified,
            gitlab = gitlab_verified,
            "connected"
        );

        self.registry
            .register_connection(self.conn_id, key_id, session.handle());
        self.spawn_message_fanout(session.handle());
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let channel_id = channel.id();
        if self.registry.start_session(self.conn_id, channel_id) {
            let _ = self.output_ready.send(true);
        }

        // A session that never asks for a forward gets the usage hint and
        // exit status 1 after a short grace period.
        let requested = self.requested.clone();
        let registry = self.registry.clone();
        let handle = session.handle();
        let conn_id = self.conn_id;
        let domain = self.config.domain.clone();
        tokio::spawn(async move {
            tokio::time::sleep(USAGE_DEADLINE).await;
            if requested.load(Ordering::Relaxed) == 0 {
                let usage = usage_line(&domain);
                let _ = handle
                    .data(channel_id, CryptoVec::from_slice(usage.as_bytes()))
                    .await;
                finish_session(&registry, &handle, conn_id, channel_id, 1).await;
            }
        });

        Ok(true)
    }

    /// Interactive sessions only carry keystrokes we do not want, except
    /// Ctrl-C and Ctrl-D which end the session.
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if contains_interrupt(data) {
            let registry = self.registry.clone();
            let handle = session.handle();
            let conn_id = self.conn_id;
            tokio::spawn(async move {
                finish_session(&registry, &handle, conn_id, channel, 0).await;
            });
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let registry = self.registry.clone();
        let handle = session.handle();
        let conn_id = self.conn_id;
        tokio::spawn(async move {
            finish_session(&registry, &handle, conn_id, channel, 0).await;
        });
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let registry = self.registry.clone();
        let handle = session.handle();
        let conn_id = self.conn_id;
        tokio::spawn(async move {
            finish_session(&registry, &handle, conn_id, channel, 0).await;
        });
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let bind_port = *port;
        let Some(hostnames) = self.endpoints_for(bind_port) else {
            warn!(peer = %self.peer, "tcpip-forward before key exchange completed");
            return Ok(false);
        };
        self.requested.fetch_add(1, Ordering::Relaxed);

        let urls: Vec<String> = hostnames.iter().map(|h| format!("https://{h}/")).collect();
        let _ = self.msg_tx.send(format!("{}: {}", bind_port, urls.join(", ")));

        self.registry
            .register_tunnel(self.conn_id, &hostnames, address, bind_port);

        // Clients reach every tunnel through the HTTPS listener.
        *port = PUBLIC_TUNNEL_PORT;
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(hostnames) = self.endpoints_for(port) else {
            return Ok(false);
        };
        self.requested.fetch_add(1, Ordering::Relaxed);

        self.registry
            .unregister_tunnel(self.conn_id, &hostnames, address, port);
        Ok(true)
    }
}

/// End one session: registry bookkeeping, exit status, channel close, and,
/// when it was the connection's last session, an asynchronous disconnect of
/// the whole connection.
async fn finish_session(
    registry: &Registry,
    handle: &Handle,
    conn_id: ConnId,
    channel: ChannelId,
    status: u32,
) {
    let Some(end) = registry.end_session(conn_id, channel) else {
        return;
    };
    let _ = handle.exit_status_request(channel, status).await;
    let _ = handle.close(channel).await;
    if end.last {
        let _ = handle
            .disconnect(Disconnect::ByApplication, "".into(), "".into())
            .await;
    }
}

fn usage_line(domain: &str) -> String {
    format!("Usage: ssh {domain} -R 1:localhost:3000 -R 2:192.168.0.1:80 …\r\n")
}

/// Ctrl-C or Ctrl-D anywhere in a keystroke buffer.
fn contains_interrupt(data: &[u8]) -> bool {
    data.iter().any(|&b| b == 0x03 || b == 0x04)
}
