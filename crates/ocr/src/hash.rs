use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Compute SHA-256 of an in-memory byte slice.
pub fn sha256_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash the canonical JSON rendering of a serializable value.
pub fn sha256_json<T: Serialize>(value: &T) -> Result<[u8; 32], serde_json::Error> {
    let json = serde_json::to_vec(value)?;
    Ok(sha256_bytes(&json))
}

/// Encode a raw 32-byte hash as a lowercase hex string (64 chars).
pub fn to_hex(hash: &[u8; 32]) -> String {
    hash.iter().map(|b| format!("{b:02x}")).collect()
}

/// Content-addressed identity of a cached extraction: what was read, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub content: [u8; 32],
    pub config: [u8; 32],
}

impl CacheKey {
    pub fn new(content: [u8; 32], config: [u8; 32]) -> Self {
        Self { content, config }
    }

    /// Key for raw image bytes read under a serializable recognition scope.
    pub fn derive<T: Serialize>(data: &[u8], scope: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(sha256_bytes(data), sha256_json(scope)?))
    }

    pub fn content_hex(&self) -> String {
        to_hex(&self.content)
    }

    pub fn config_hex(&self) -> String {
        to_hex(&self.config)
    }

    /// Derive the storage path for this key.
    /// Layout: `<base>/<first_2_content_hex>/<content_hex>-<config_hex>.json`
    pub fn entry_path(&self, cache_dir: &Path) -> PathBuf {
        let content = self.content_hex();
        cache_dir
            .join(&content[..2])
            .join(format!("{content}-{}.json", self.config_hex()))
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", &self.content_hex()[..12], &self.config_hex()[..12])
    }
}
