use std::fmt;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use xxhash_rust::xxh3::Xxh3;

use crate::error::{CacheError, Result};

/// Digest function used for every hash under one cache root.
///
/// Switching functions makes every existing entry unreachable; nothing
/// detects a mix, so the choice must stay fixed per cache directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    /// XXH3-128.
    #[default]
    Xxh3,
    Sha256,
}

impl HashAlgorithm {
    pub fn hash(self, bytes: impl AsRef<[u8]>) -> Hash {
        let mut hasher = self.hasher();
        hasher.update(bytes.as_ref());
        hasher.finish()
    }

    /// Streams `reader` through the hasher in 64 KiB chunks.
    pub fn hash_reader(self, mut reader: impl Read) -> std::io::Result<Hash> {
        let mut hasher = self.hasher();
        let mut buf = vec![0_u8; 64 * 1024];
        loop {
            let read = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            hasher.update(&buf[..read]);
        }
        Ok(hasher.finish())
    }

    pub fn hash_file(self, path: &Path) -> Result<Hash> {
        let file = std::fs::File::open(path).map_err(|err| CacheError::io(path, err))?;
        self.hash_reader(file).map_err(|err| CacheError::io(path, err))
    }

    pub fn hasher(self) -> ContentHasher {
        let state = match self {
            HashAlgorithm::Xxh3 => HasherState::Xxh3(Box::new(Xxh3::new())),
            HashAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
        };
        ContentHasher { state }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HashAlgorithm::Xxh3 => "xxh3",
            HashAlgorithm::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incremental hasher produced by [`HashAlgorithm::hasher`].
pub struct ContentHasher {
    state: HasherState,
}

enum HasherState {
    Xxh3(Box<Xxh3>),
    Sha256(Sha256),
}

impl ContentHasher {
    pub fn update(&mut self, bytes: &[u8]) {
        match &mut self.state {
            HasherState::Xxh3(hasher) => hasher.update(bytes),
            HasherState::Sha256(hasher) => hasher.update(bytes),
        }
    }

    /// Feeds a length-prefixed field so that adjacent fields cannot run into
    /// each other.
    pub fn update_field(&mut self, bytes: &[u8]) {
        self.update(&(bytes.len() as u64).to_le_bytes());
        self.update(bytes);
    }

    pub fn finish(self) -> Hash {
        match self.state {
            HasherState::Xxh3(hasher) => Hash(hex::encode(hasher.digest128().to_be_bytes())),
            HasherState::Sha256(hasher) => Hash(hex::encode(hasher.finalize())),
        }
    }
}

impl fmt::Debug for ContentHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let algorithm = match self.state {
            HasherState::Xxh3(_) => HashAlgorithm::Xxh3,
            HasherState::Sha256(_) => HashAlgorithm::Sha256,
        };
        f.debug_struct("ContentHasher")
            .field("algorithm", &algorithm)
            .finish_non_exhaustive()
    }
}

/// A digest stored as a lowercase hex string.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hash(String);

impl Hash {
    /// Accepts a non-empty lowercase hex string, as written by [`Hash`]'s
    /// `Display`.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let valid = !text.is_empty()
            && text
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(text.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Hash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_matches_known_digest() {
        assert_eq!(
            HashAlgorithm::Sha256.hash(b"abc").as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn xxh3_is_128_bits_of_hex() {
        let hash = HashAlgorithm::Xxh3.hash(b"abc");
        assert_eq!(hash.as_str().len(), 32);
        assert_eq!(hash, HashAlgorithm::Xxh3.hash(b"abc"));
        assert_ne!(hash, HashAlgorithm::Xxh3.hash(b"abd"));
    }

    #[test]
    fn streaming_matches_one_shot() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        for algorithm in [HashAlgorithm::Xxh3, HashAlgorithm::Sha256] {
            let streamed = algorithm.hash_reader(std::io::Cursor::new(&data)).unwrap();
            assert_eq!(streamed, algorithm.hash(&data), "{algorithm}");
        }
    }

    #[test]
    fn length_prefixed_fields_do_not_collide() {
        let mut a = HashAlgorithm::Xxh3.hasher();
        a.update_field(b"ab");
        a.update_field(b"c");
        let mut b = HashAlgorithm::Xxh3.hasher();
        b.update_field(b"a");
        b.update_field(b"bc");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn parse_accepts_only_lowercase_hex() {
        assert!(Hash::parse("00ff").is_some());
        assert_eq!(Hash::parse(" 0a\n").unwrap().as_str(), "0a");
        assert!(Hash::parse("").is_none());
        assert!(Hash::parse("0A").is_none());
        assert!(Hash::parse("xyz").is_none());
    }

    #[test]
    fn algorithm_names_round_trip_through_serde() {
        let json = serde_json::to_string(&HashAlgorithm::Sha256).unwrap();
        assert_eq!(json, "\"sha256\"");
        let parsed: HashAlgorithm = serde_json::from_str("\"xxh3\"").unwrap();
        assert_eq!(parsed, HashAlgorithm::Xxh3);
    }
}
