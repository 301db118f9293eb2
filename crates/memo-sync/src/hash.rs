//! Content fingerprints for change detection.
//!
//! The coordinator records the fingerprint of the last acknowledged save and
//! skips any write whose fingerprint matches it. Equal fingerprints are
//! treated as equal content.

use sha2::{Digest, Sha256};
use std::fmt::{self, Display, Formatter};

/// SHA-256 fingerprint of memo content, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    /// Compute hash from a single text.
    pub fn from_content(content: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Compute hash of a `(title, content)` pair.
    ///
    /// The title is length-prefixed so that moving characters across the
    /// title/content boundary changes the fingerprint.
    pub fn of_memo(title: &str, content: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update((title.len() as u64).to_le_bytes());
        hasher.update(title.as_bytes());
        hasher.update(content.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // Short form is enough for log lines
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}
