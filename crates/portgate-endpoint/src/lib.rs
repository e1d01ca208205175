//! Endpoint naming and identity verification
//!
//! Derives the public hostnames a tunneled port is reachable under, and
//! checks (advisorily) whether a connecting key is advertised by a claimed
//! account on a code-hosting site.

pub mod identity;
pub mod namer;

pub use identity::{keys_file_contains, IdentityError, IdentityVerifier, NO_MATCH_USER};
pub use namer::{endpoint_hostnames, fingerprint_label, key_id};
