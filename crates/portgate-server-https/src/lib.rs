//! Public HTTPS frontend
//!
//! Terminates TLS on the public listener, picks a tunnel target by SNI, and
//! splices the decrypted bytestream onto a `forwarded-tcpip` channel opened
//! on the target's tunnel-control connection.

mod http;
pub mod server;

pub use server::{HttpsServer, HttpsServerConfig, HttpsServerError};
