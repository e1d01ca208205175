//! Portgate relay - public reverse-tunneling gateway
//!
//! Runs the SSH tunnel-control server and the HTTPS frontend as peers over
//! one shared tunnel registry, plus a once-per-minute stats logger.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use portgate_control::TunnelRegistry;
use portgate_endpoint::IdentityVerifier;
use portgate_server_https::{HttpsServer, HttpsServerConfig};
use portgate_ssh::{Registry, SshServerConfig};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Portgate - expose local ports as public HTTPS endpoints over SSH
#[derive(Parser, Debug)]
#[command(name = "portgate-relay")]
#[command(about = "Public reverse-tunneling gateway: ssh -R in, HTTPS out")]
#[command(version)]
struct Cli {
    /// Public base domain this gateway serves endpoints under
    #[arg(long, env = "PORTGATE_DOMAIN")]
    domain: String,

    /// SSH tunnel-control listener port
    #[arg(long, default_value_t = 22)]
    ssh_port: u16,

    /// HTTPS listener port
    #[arg(long, default_value_t = 443)]
    https_port: u16,

    /// Path to the TLS certificate chain (PEM)
    #[arg(long)]
    https_chain_path: PathBuf,

    /// Path to the TLS private key (PEM)
    #[arg(long)]
    https_key_path: PathBuf,

    /// Directory containing ssh_host_ecdsa_key, ssh_host_ed25519_key and
    /// ssh_host_rsa_key
    #[arg(long, default_value = "/etc/ssh")]
    ssh_host_keys_path: PathBuf,

    /// Whether to expose $username.gh subdomains for GitHub-verified keys
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    github_subdomains: bool,

    /// Whether to expose $username-$port.gl subdomains for GitLab-verified keys
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    gitlab_subdomains: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Log registry totals once per minute.
async fn log_stats(registry: Arc<Registry>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        info!(
            "Stats: {} conns, {} endpoints",
            registry.connection_count(),
            registry.endpoint_count()
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);
    info!("Portgate relay starting for domain {}", cli.domain);

    let registry: Arc<Registry> = Arc::new(TunnelRegistry::new());
    let verifier =
        Arc::new(IdentityVerifier::new().context("Failed to build identity verifier")?);

    let https_config = HttpsServerConfig {
        bind_addr: SocketAddr::from(([0, 0, 0, 0], cli.https_port)),
        chain_path: cli.https_chain_path,
        key_path: cli.https_key_path,
        domain: cli.domain.clone(),
    };
    let ssh_config = SshServerConfig {
        bind_addr: SocketAddr::from(([0, 0, 0, 0], cli.ssh_port)),
        domain: cli.domain,
        host_keys_path: cli.ssh_host_keys_path,
        github_subdomains: cli.github_subdomains,
        gitlab_subdomains: cli.gitlab_subdomains,
    };

    let https = HttpsServer::new(https_config, registry.clone());
    let mut https_task = tokio::spawn(https.start());
    let mut ssh_task = tokio::spawn(portgate_ssh::run(ssh_config, registry.clone(), verifier));
    tokio::spawn(log_stats(registry));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
        result = &mut https_task => {
            let result = result.context("HTTPS server task panicked")?;
            error!("HTTPS server exited");
            result.context("HTTPS server failed")
        }
        result = &mut ssh_task => {
            let result = result.context("SSH server task panicked")?;
            error!("SSH server exited");
            result.context("SSH server failed")
        }
    }
}
