//! Advisory account key verification
//!
//! Code-hosting sites publish a user's SSH public keys at
//! `https://<site>/<user>.keys`. A match entitles the connection to vanity
//! hostnames; any failure (network, status, parse, non-match) only means the
//! vanity hostnames are withheld.

use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// Sentinel user name that opts out of account verification entirely.
pub const NO_MATCH_USER: &str = "nomatch";

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Looks up advertised public keys on code-hosting sites.
pub struct IdentityVerifier {
    client: reqwest::Client,
}

impl IdentityVerifier {
    pub fn new() -> Result<Self, IdentityError> {
        let client = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    /// Whether `user` on `site` advertises a key whose KeyID equals `key_id`.
    ///
    /// Strictly advisory: every failure mode returns `false`.
    pub async fn key_matches_account(&self, site: &str, user: &str, key_id: &str) -> bool {
        let url = format!("https://{site}/{user}.keys");
        let body = match self.fetch(&url).await {
            Ok(body) => body,
            Err(error) => {
                debug!(%site, %user, %error, "account key lookup failed");
                return false;
            }
        };
        keys_file_contains(&body, key_id)
    }

    async fn fetch(&self, url: &str) -> Result<String, reqwest::Error> {
        self.client.get(url).send().await?.text().await
    }
}

/// Whether any record in a `.keys` listing carries `key_id` as its second
/// space-separated field (the base64 key material in OpenSSH public key
/// lines).
pub fn keys_file_contains(body: &str, key_id: &str) -> bool {
    body.lines().any(|line| {
        let mut fields = line.splitn(3, ' ');
        fields.next();
        fields.next() == Some(key_id)
    })
}
