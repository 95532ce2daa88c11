// kiln-net/src/validation.rs
use std::fs::File;
use std::io;
use std::path::Path;

use kiln_common::error::{KilnError, Result};
use sha2::{Digest, Sha256};
use url::Url;

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn compare(actual: String, expected: &str, target: &str, what: &str) -> Result<()> {
    let expected = expected.trim();
    if expected.is_empty() {
        return Err(KilnError::ValidationError(format!(
            "{what} of '{target}' has no declared sha256; refusing to use it unverified"
        )));
    }
    // Full-length comparison; a matching prefix is not a match.
    if actual.len() == expected.len() && actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(KilnError::ChecksumMismatch {
            target: target.to_string(),
            what: what.to_string(),
            expected: expected.to_ascii_lowercase(),
            actual,
        })
    }
}

/// Verifies a fully fetched payload against its declared sha256.
pub fn verify_bytes(bytes: &[u8], expected: &str, target: &str, what: &str) -> Result<()> {
    let actual = sha256_hex(bytes);
    tracing::debug!(
        "[{}] sha256 of {} ({} bytes): {} (expected {})",
        target,
        what,
        bytes.len(),
        actual,
        expected
    );
    compare(actual, expected, target, what)
}

/// Streams a file through sha256 and compares it with `expected`.
pub fn verify_checksum(path: &Path, expected: &str, target: &str, what: &str) -> Result<()> {
    tracing::debug!("Verifying checksum for: {}", path.display());
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let bytes_copied = io::copy(&mut file, &mut hasher)?;
    let actual = hex::encode(hasher.finalize());
    tracing::debug!(
        "Calculated SHA256: {} ({} bytes read)",
        actual,
        bytes_copied
    );
    compare(actual, expected, target, what)
}

/// Accepts `https` URLs and local `file` URLs.
pub fn validate_url(url_str: &str) -> Result<Url> {
    let url = Url::parse(url_str)
        .map_err(|e| KilnError::ValidationError(format!("Failed to parse URL '{url_str}': {e}")))?;
    match url.scheme() {
        "https" | "file" => Ok(url),
        other => Err(KilnError::ValidationError(format!(
            "Invalid URL scheme for '{url_str}': must be https or file, but got '{other}'"
        ))),
    }
}
