//! SHA-256 helpers for content identity.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};
use strata_core::error::{BuildError, Result};

/// Compute SHA256 digest of a file, streaming its contents.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        BuildError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to open {} for hashing: {}", path.display(), e),
        ))
    })?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compute SHA256 digest of raw bytes.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Hash a sequence of fields, NUL-separated so that field boundaries
/// are part of the digest.
pub fn sha256_fields<'a, I>(fields: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update(field.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}
