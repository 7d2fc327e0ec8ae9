use std::fs;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
use crate::hash::{Hash, HashAlgorithm};
use crate::retry::RetryPolicy;
use crate::tier::{CacheTier, DiskCodec, DiskTier, MemoryTier, Tiered};

/// Cheap stand-in for a file's contents: equal identities are trusted to
/// mean equal bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    pub path: PathBuf,
    pub length: u64,
    /// Last write time, nanoseconds since the Unix epoch (UTC).
    pub modified_nanos: i128,
}

impl FileIdentity {
    pub fn of(path: &Path) -> Result<Self> {
        let path = std::path::absolute(path).map_err(|err| CacheError::io(path, err))?;
        let metadata = fs::metadata(&path).map_err(|err| CacheError::io(&path, err))?;
        let modified = FileTime::from_last_modification_time(&metadata);
        Ok(Self {
            length: metadata.len(),
            modified_nanos: i128::from(modified.unix_seconds()) * 1_000_000_000
                + i128::from(modified.nanoseconds()),
            path,
        })
    }

    fn digest(&self, algorithm: HashAlgorithm) -> Hash {
        let mut hasher = algorithm.hasher();
        hasher.update_field(self.path.as_os_str().as_encoded_bytes());
        hasher.update_field(&self.length.to_le_bytes());
        hasher.update_field(&self.modified_nanos.to_le_bytes());
        hasher.finish()
    }
}

/// What a file contributes to a fingerprint. Location and timestamps are
/// deliberately absent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileExtract {
    pub name: String,
    pub hash: Hash,
    pub length: u64,
}

/// A [`FileExtract`] together with where it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileExtract {
    pub path: PathBuf,
    pub identity: FileIdentity,
    pub extract: FileExtract,
}

struct FileHashCodec {
    algorithm: HashAlgorithm,
}

impl DiskCodec for FileHashCodec {
    type Key = FileIdentity;
    type Value = Hash;

    fn file_name(&self, key: &FileIdentity) -> String {
        key.digest(self.algorithm).to_string()
    }

    fn encode(&self, value: &Hash) -> Result<Vec<u8>> {
        Ok(value.as_str().as_bytes().to_vec())
    }

    fn decode(&self, path: &Path, bytes: &[u8]) -> Result<Hash> {
        std::str::from_utf8(bytes)
            .ok()
            .and_then(Hash::parse)
            .ok_or_else(|| {
                CacheError::corruption(path.display(), "file hash entry is not a hex digest")
            })
    }
}

/// `FileIdentity -> content hash`, memory over disk.
pub struct FileHashCache {
    tiers: Tiered<MemoryTier<FileIdentity, Hash>, DiskTier<FileHashCodec>>,
}

impl FileHashCache {
    pub fn new(root: impl Into<PathBuf>, algorithm: HashAlgorithm, retry: RetryPolicy) -> Self {
        let disk = DiskTier::new(root, FileHashCodec { algorithm }, retry);
        Self {
            tiers: Tiered::new(MemoryTier::new(), disk),
        }
    }

    pub fn exists(&self, identity: &FileIdentity) -> Result<bool> {
        self.tiers.exists(identity)
    }

    pub fn get(&self, identity: &FileIdentity) -> Result<Option<Hash>> {
        self.tiers.get(identity)
    }

    /// Returns `false` if an entry was already present.
    pub fn set(&self, identity: &FileIdentity, hash: &Hash) -> Result<bool> {
        self.tiers.set(identity, hash)
    }

    pub fn root(&self) -> &Path {
        self.tiers.slow().root()
    }
}

impl std::fmt::Debug for FileHashCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHashCache")
            .field("root", &self.root())
            .finish_non_exhaustive()
    }
}

/// Hashes files, consulting the [`FileHashCache`] first.
#[derive(Debug)]
pub struct FileHasher {
    cache: FileHashCache,
    algorithm: HashAlgorithm,
}

impl FileHasher {
    pub fn new(cache: FileHashCache, algorithm: HashAlgorithm) -> Self {
        Self { cache, algorithm }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn cache(&self) -> &FileHashCache {
        &self.cache
    }

    /// The extract of `path`, named by its bare file name.
    pub fn extract(&self, path: &Path) -> Result<LocalFileExtract> {
        let identity = FileIdentity::of(path)?;
        let hash = match self.cache.get(&identity)? {
            Some(hash) => hash,
            None => {
                let hash = self.algorithm.hash_file(&identity.path)?;
                self.cache.set(&identity, &hash)?;
                // A concurrent writer may have won; every reader must agree on its value.
                self.cache.get(&identity)?.unwrap_or(hash)
            }
        };
        let name = identity
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(LocalFileExtract {
            path: identity.path.clone(),
            extract: FileExtract {
                name,
                hash,
                length: identity.length,
            },
            identity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hasher(root: &Path) -> FileHasher {
        FileHasher::new(
            FileHashCache::new(root, HashAlgorithm::Xxh3, RetryPolicy::default()),
            HashAlgorithm::Xxh3,
        )
    }

    #[test]
    fn extract_hashes_contents_and_persists_entry() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.cs");
        fs::write(&file, b"class A {}").unwrap();

        let hasher = hasher(&dir.path().join("cache"));
        let extract = hasher.extract(&file).unwrap();
        assert_eq!(extract.extract.name, "a.cs");
        assert_eq!(extract.extract.length, 10);
        assert_eq!(extract.extract.hash, HashAlgorithm::Xxh3.hash(b"class A {}"));

        let entries: Vec<_> = fs::read_dir(dir.path().join("cache")).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn identity_fields_cannot_run_into_each_other() {
        let identity = |path: &str, length: u64| FileIdentity {
            path: PathBuf::from(path),
            length,
            modified_nanos: 7,
        };
        let a = identity("/src/a1", 23);
        let b = identity("/src/a", 123);
        assert_ne!(
            a.digest(HashAlgorithm::Xxh3),
            b.digest(HashAlgorithm::Xxh3)
        );
        assert_eq!(
            a.digest(HashAlgorithm::Xxh3),
            a.clone().digest(HashAlgorithm::Xxh3)
        );
    }

    #[test]
    fn identity_is_trusted_over_content() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.cs");
        fs::write(&file, b"one").unwrap();
        let original = FileTime::from_last_modification_time(&fs::metadata(&file).unwrap());

        let cache_root = dir.path().join("cache");
        let first = hasher(&cache_root).extract(&file).unwrap();

        // Same length and timestamp: a fresh process still gets the recorded hash.
        fs::write(&file, b"two").unwrap();
        filetime::set_file_mtime(&file, original).unwrap();
        let second = hasher(&cache_root).extract(&file).unwrap();
        assert_eq!(first.extract.hash, second.extract.hash);

        let later = FileTime::from_unix_time(original.unix_seconds() + 5, 0);
        filetime::set_file_mtime(&file, later).unwrap();
        let third = hasher(&cache_root).extract(&file).unwrap();
        assert_eq!(third.extract.hash, HashAlgorithm::Xxh3.hash(b"two"));
    }

    #[test]
    fn set_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.cs");
        fs::write(&file, b"x").unwrap();
        let identity = FileIdentity::of(&file).unwrap();

        let cache = FileHashCache::new(
            dir.path().join("cache"),
            HashAlgorithm::Sha256,
            RetryPolicy::default(),
        );
        let a = HashAlgorithm::Sha256.hash(b"a");
        let b = HashAlgorithm::Sha256.hash(b"b");
        assert!(!cache.exists(&identity).unwrap());
        assert!(cache.set(&identity, &a).unwrap());
        assert!(!cache.set(&identity, &b).unwrap());
        assert_eq!(cache.get(&identity).unwrap(), Some(a));
    }

    #[test]
    fn garbage_entries_are_reported_as_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.cs");
        fs::write(&file, b"x").unwrap();
        let identity = FileIdentity::of(&file).unwrap();

        let root = dir.path().join("cache");
        let codec = FileHashCodec { algorithm: HashAlgorithm::Xxh3 };
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join(codec.file_name(&identity)), b"not a hash").unwrap();

        let cache = FileHashCache::new(&root, HashAlgorithm::Xxh3, RetryPolicy::default());
        assert!(matches!(cache.get(&identity), Err(CacheError::Corruption { .. })));
    }

    #[test]
    fn missing_files_fail_with_their_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone.cs");
        let err = hasher(&dir.path().join("cache")).extract(&missing).unwrap_err();
        match err {
            CacheError::Io { path, .. } => assert_eq!(path, missing),
            other => panic!("unexpected error: {other}"),
        }
    }
}
