//! Identity primitives for Meridian entities

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Registry-assigned surrogate id of a persisted instance.
pub type Sid = i64;

/// Number of trailing hex characters that make up a short id.
pub const SHORT_ID_LEN: usize = 6;

/// Compute the lowercase hex SHA-256 digest of content.
///
/// Used both for package integrity checks and for instance fingerprints.
pub fn compute_content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Long fingerprint of an agent build: hash of `"{class}:{hash}:{version}"`.
pub fn long_fingerprint(class_name: &str, package_hash: &str, version: &str) -> String {
    compute_content_hash(format!("{}:{}:{}", class_name, package_hash, version).as_bytes())
}

/// Last [`SHORT_ID_LEN`] characters of a long fingerprint.
pub fn short_fingerprint(long_id: &str) -> String {
    let start = long_id.len().saturating_sub(SHORT_ID_LEN);
    long_id[start..].to_string()
}
