//! Content digests using BLAKE3
//!
//! The same 32-byte digest is used for file contents in SYNC_META and for the
//! password field in LOGIN.

use std::fmt;
use std::io::Read;
use std::path::Path;

/// Width of every digest on the wire
pub const HASH_LEN: usize = 32;

/// A BLAKE3 digest (256-bit)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    /// The all-zero digest sent for directories and unreadable files
    pub const ZERO: Self = Self([0; HASH_LEN]);

    /// Hash arbitrary bytes
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Hash everything a reader yields
    ///
    /// # Errors
    /// Returns an error if reading fails
    pub fn from_reader<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let mut hasher = blake3::Hasher::new();
        let mut buffer = [0u8; 64 * 1024];

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(Self(*hasher.finalize().as_bytes()))
    }

    /// Hash a file by path, following symlinks
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or read
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        Self::from_reader(std::fs::File::open(path)?)
    }

    /// Wrap a digest received off the wire
    #[must_use]
    pub fn from_raw(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; HASH_LEN]
    }

    /// Convert to hex string
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "ContentHash({})", hex.get(..16).unwrap_or(&hex))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "{}", hex.get(..16).unwrap_or(&hex))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_content_hash_deterministic() {
        let h1 = ContentHash::from_bytes(b"hello world");
        let h2 = ContentHash::from_bytes(b"hello world");
        assert_eq!(h1, h2);
        assert_ne!(h1, ContentHash::from_bytes(b"hello"));
    }

    #[test]
    fn test_file_hash_matches_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        let data = vec![7u8; 200_000];
        std::fs::write(&path, &data).unwrap();

        assert_eq!(
            ContentHash::from_file(&path).unwrap(),
            ContentHash::from_bytes(&data)
        );
    }

    #[test]
    fn test_zero_hash() {
        assert!(ContentHash::ZERO.is_zero());
        assert!(!ContentHash::from_bytes(b"").is_zero());
        assert_eq!(ContentHash::default(), ContentHash::ZERO);
    }
}
