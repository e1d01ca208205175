//! Public endpoint hostname derivation
//!
//! Every forwarded port gets one unforgeable fingerprint hostname derived
//! from the client's public key, plus optional vanity hostnames when the
//! claimed account was verified against a code-hosting site.

use std::sync::LazyLock;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use data_encoding::{Encoding, Specification};
use sha2::{Digest, Sha256};

/// Lowercase base32 without padding, as used in the fingerprint label.
pub static BASE32_LOWER: LazyLock<Encoding> = LazyLock::new(|| {
    let mut spec = Specification::new();
    spec.symbols.push_str("abcdefghijklmnopqrstuvwxyz234567");
    spec.encoding().expect("valid base32 alphabet")
});

/// Number of SHA-256 prefix bytes encoded into the fingerprint label.
const FINGERPRINT_BYTES: usize = 16;

/// Identity label for a public key: the base64 (unpadded) encoding of its
/// SSH wire serialization. Used in logs and vanity-key comparison.
pub fn key_id(key_blob: &[u8]) -> String {
    STANDARD_NO_PAD.encode(key_blob)
}

/// The unforgeable hostname label for `(key, port)`: the first 16 bytes of
/// `SHA-256(key_blob || 0x00 || decimal(port))`, lowercase base32, unpadded.
pub fn fingerprint_label(key_blob: &[u8], port: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key_blob);
    hasher.update([0u8]);
    hasher.update(port.to_string().as_bytes());
    BASE32_LOWER.encode(&hasher.finalize()[..FINGERPRINT_BYTES])
}

/// Ordered list of public hostnames for a forwarded port: the fingerprint
/// hostname first, then the GitHub and GitLab vanity hostnames when enabled.
///
/// Port 1 is the "default" port and gets the bare `<user>.gh` form; other
/// ports are disambiguated with a `--<port>` suffix. GitLab labels always
/// carry `-<port>`.
pub fn endpoint_hostnames(
    domain: &str,
    user: &str,
    key_blob: &[u8],
    port: u32,
    github: bool,
    gitlab: bool,
) -> Vec<String> {
    let mut hostnames = vec![format!("{}.{}", fingerprint_label(key_blob, port), domain)];
    if github {
        if port == 1 {
            hostnames.push(format!("{user}.gh.{domain}"));
        } else {
            hostnames.push(format!("{user}--{port}.gh.{domain}"));
        }
    }
    if gitlab {
        hostnames.push(format!("{user}-{port}.gl.{domain}"));
    }
    hostnames
}
