//! SSH tunnel-control server
//!
//! Accepts the long-lived client connections that register tunnels. Each
//! connection is authenticated by public key (any key is accepted; the
//! fingerprint-derived hostname is what makes endpoints unforgeable),
//! translates `tcpip-forward` / `cancel-tcpip-forward` global requests into
//! registry edits, and announces endpoint URLs on interactive sessions.

pub mod handler;
pub mod server;

pub use server::{run, Registry, SshServerConfig, SshServerError};
