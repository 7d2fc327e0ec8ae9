//! Semantic hashes of referenced assemblies and their cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
use crate::file_hash_cache::{FileExtract, FileHasher, LocalFileExtract};
use crate::hash::{Hash, HashAlgorithm};
use crate::retry::RetryPolicy;
use crate::tier::{CacheTier, DiskCodec, DiskTier, MemoryTier, Tiered};

pub type ParseError = Box<dyn std::error::Error + Send + Sync>;

/// What a dependent compilation can observe of an assembly, in a canonical
/// byte form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblySurface {
    pub assembly_name: Option<String>,
    pub public: Vec<u8>,
    /// Public plus internal members; `None` when no friend assembly exists.
    pub internal: Option<Vec<u8>>,
    pub internals_visible_to: Vec<String>,
}

/// Reads the observable surface out of an assembly image.
pub trait SurfaceParser: Send + Sync {
    fn parse(&self, bytes: &[u8]) -> std::result::Result<AssemblySurface, ParseError>;
}

/// [`SurfaceParser`] for ECMA-335 images.
#[derive(Debug, Clone, Copy, Default)]
pub struct EcmaSurfaceParser;

impl SurfaceParser for EcmaSurfaceParser {
    fn parse(&self, bytes: &[u8]) -> std::result::Result<AssemblySurface, ParseError> {
        let surfaces = kiln_metadata::read_surfaces(bytes)?;
        Ok(AssemblySurface {
            assembly_name: surfaces.assembly_name,
            public: surfaces.public.to_bytes(),
            internal: surfaces.internal.map(|surface| surface.to_bytes()),
            internals_visible_to: surfaces.internals_visible_to,
        })
    }
}

/// Hashes of a reference's two surfaces, plus who may see its internals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceData {
    pub public_hash: Hash,
    pub internal_hash: Hash,
    /// Sorted, deduplicated friend assembly names.
    pub internals_visible_to: Vec<String>,
}

impl ReferenceData {
    /// The hash a compilation of `consumer` depends on: the internal one iff
    /// `consumer` is a declared friend.
    pub fn hash_for(&self, consumer: Option<&str>) -> &Hash {
        if self.grants_internals_to(consumer) {
            &self.internal_hash
        } else {
            &self.public_hash
        }
    }

    pub fn grants_internals_to(&self, consumer: Option<&str>) -> bool {
        consumer.is_some_and(|consumer| {
            self.internals_visible_to
                .iter()
                .any(|friend| friend.eq_ignore_ascii_case(consumer))
        })
    }
}

/// Turns assembly bytes into [`ReferenceData`].
pub struct ReferenceTrimmer {
    parser: Box<dyn SurfaceParser>,
    algorithm: HashAlgorithm,
}

impl ReferenceTrimmer {
    pub fn new(parser: Box<dyn SurfaceParser>, algorithm: HashAlgorithm) -> Self {
        Self { parser, algorithm }
    }

    pub fn ecma(algorithm: HashAlgorithm) -> Self {
        Self::new(Box::new(EcmaSurfaceParser), algorithm)
    }

    /// `path` is only used to describe failures.
    pub fn trim(&self, path: &Path, bytes: &[u8]) -> Result<ReferenceData> {
        let surface = self
            .parser
            .parse(bytes)
            .map_err(|source| CacheError::MalformedAssembly {
                path: path.to_path_buf(),
                source,
            })?;

        let algorithm = self.algorithm;
        let (public_hash, internal_hash) = rayon::join(
            || algorithm.hash(&surface.public),
            || surface.internal.as_ref().map(|internal| algorithm.hash(internal)),
        );

        let mut internals_visible_to = surface.internals_visible_to;
        internals_visible_to.sort();
        internals_visible_to.dedup();

        Ok(ReferenceData {
            internal_hash: internal_hash.unwrap_or_else(|| public_hash.clone()),
            public_hash,
            internals_visible_to,
        })
    }
}

impl std::fmt::Debug for ReferenceTrimmer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceTrimmer")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// `{assembly file stem}_{content hash}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReferenceKey {
    pub stem: String,
    pub content_hash: Hash,
}

impl ReferenceKey {
    pub fn for_file(path: &Path, content_hash: Hash) -> Self {
        let stem = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { stem, content_hash }
    }
}

impl std::fmt::Display for ReferenceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.stem, self.content_hash)
    }
}

/// A reference cache entry as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceEntry {
    pub reference: ReferenceData,
    pub source: FileExtract,
}

struct ReferenceCodec;

impl DiskCodec for ReferenceCodec {
    type Key = ReferenceKey;
    type Value = ReferenceEntry;

    fn file_name(&self, key: &ReferenceKey) -> String {
        format!("{key}.json")
    }

    fn encode(&self, value: &ReferenceEntry) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(value).map_err(|err| CacheError::json("reference entry", err))
    }

    fn decode(&self, path: &Path, bytes: &[u8]) -> Result<ReferenceEntry> {
        serde_json::from_slice(bytes)
            .map_err(|err| CacheError::json(path.display().to_string(), err))
    }
}

/// Reference cache, shared by every project using the same cache installation.
pub struct ReferenceCache {
    tiers: Tiered<MemoryTier<ReferenceKey, ReferenceEntry>, DiskTier<ReferenceCodec>>,
}

impl ReferenceCache {
    pub fn new(root: impl Into<PathBuf>, retry: RetryPolicy) -> Self {
        Self {
            tiers: Tiered::new(MemoryTier::new(), DiskTier::new(root, ReferenceCodec, retry)),
        }
    }

    pub fn exists(&self, key: &ReferenceKey) -> Result<bool> {
        self.tiers.exists(key)
    }

    pub fn get(&self, key: &ReferenceKey) -> Result<Option<ReferenceEntry>> {
        self.tiers.get(key)
    }

    pub fn set(&self, key: &ReferenceKey, entry: &ReferenceEntry) -> Result<bool> {
        self.tiers.set(key, entry)
    }

    pub fn path_for(&self, key: &ReferenceKey) -> PathBuf {
        self.tiers.slow().path_for(key)
    }
}

impl std::fmt::Debug for ReferenceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceCache")
            .field("root", &self.tiers.slow().root())
            .finish_non_exhaustive()
    }
}

/// A reference file with its trimmed data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedReference {
    pub file: LocalFileExtract,
    pub data: ReferenceData,
}

/// Content hash, cache lookup and trimming for referenced assemblies.
#[derive(Debug)]
pub struct ReferenceResolver {
    files: Arc<FileHasher>,
    cache: ReferenceCache,
    trimmer: ReferenceTrimmer,
}

impl ReferenceResolver {
    pub fn new(files: Arc<FileHasher>, cache: ReferenceCache, trimmer: ReferenceTrimmer) -> Self {
        Self {
            files,
            cache,
            trimmer,
        }
    }

    pub fn cache(&self) -> &ReferenceCache {
        &self.cache
    }

    pub fn resolve(&self, path: &Path) -> Result<ResolvedReference> {
        self.resolve_inner(path).map(|(resolved, _)| resolved)
    }

    /// Trims `path` ahead of any consumer asking for it. Returns whether a
    /// new entry was written.
    pub fn record(&self, path: &Path) -> Result<bool> {
        let (resolved, stored) = self.resolve_inner(path)?;
        tracing::debug!(
            target = "kiln.cache.refs",
            path = %resolved.file.path.display(),
            stored,
            "recorded reference data for produced assembly"
        );
        Ok(stored)
    }

    fn resolve_inner(&self, path: &Path) -> Result<(ResolvedReference, bool)> {
        let file = self.files.extract(path)?;
        let key = ReferenceKey::for_file(&file.path, file.extract.hash.clone());
        if let Some(entry) = self.cache.get(&key)? {
            return Ok((
                ResolvedReference {
                    file,
                    data: entry.reference,
                },
                false,
            ));
        }

        let bytes = std::fs::read(&file.path).map_err(|err| CacheError::io(&file.path, err))?;
        let found = self.files.algorithm().hash(&bytes);
        if found != file.extract.hash {
            return Err(CacheError::FileChanged {
                path: file.path.clone(),
                expected: file.extract.hash.to_string(),
                found: found.to_string(),
            });
        }
        let data = self.trimmer.trim(&file.path, &bytes)?;
        tracing::debug!(
            target = "kiln.cache.refs",
            path = %file.path.display(),
            key = %key,
            friends = data.internals_visible_to.len(),
            "trimmed reference assembly"
        );

        let entry = ReferenceEntry {
            reference: data,
            source: file.extract.clone(),
        };
        let stored = self.cache.set(&key, &entry)?;
        let data = if stored {
            entry.reference
        } else {
            self.cache
                .get(&key)?
                .map(|existing| existing.reference)
                .unwrap_or(entry.reference)
        };
        Ok((ResolvedReference { file, data }, stored))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::file_hash_cache::FileHashCache;

    struct FakeParser {
        calls: Arc<AtomicUsize>,
    }

    impl SurfaceParser for FakeParser {
        fn parse(&self, bytes: &[u8]) -> std::result::Result<AssemblySurface, ParseError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let text = std::str::from_utf8(bytes)?;
            let (public, rest) = text.split_once('|').ok_or("missing separator")?;
            let (internal, friends) = rest.split_once('|').ok_or("missing separator")?;
            Ok(AssemblySurface {
                assembly_name: None,
                public: public.as_bytes().to_vec(),
                internal: (!internal.is_empty()).then(|| internal.as_bytes().to_vec()),
                internals_visible_to: friends
                    .split(',')
                    .filter(|friend| !friend.is_empty())
                    .map(str::to_string)
                    .collect(),
            })
        }
    }

    fn resolver(root: &Path, calls: Arc<AtomicUsize>) -> ReferenceResolver {
        let files = Arc::new(FileHasher::new(
            FileHashCache::new(root.join("files"), HashAlgorithm::Xxh3, RetryPolicy::default()),
            HashAlgorithm::Xxh3,
        ));
        ReferenceResolver::new(
            files,
            ReferenceCache::new(root.join("refs"), RetryPolicy::default()),
            ReferenceTrimmer::new(Box::new(FakeParser { calls }), HashAlgorithm::Xxh3),
        )
    }

    fn data(friends: &[&str]) -> ReferenceData {
        ReferenceData {
            public_hash: HashAlgorithm::Xxh3.hash(b"public"),
            internal_hash: HashAlgorithm::Xxh3.hash(b"internal"),
            internals_visible_to: friends.iter().map(|f| f.to_string()).collect(),
        }
    }

    #[test]
    fn internal_hash_only_for_declared_friends() {
        let data = data(&["Lib.Tests"]);
        assert_eq!(data.hash_for(Some("Lib.Tests")), &data.internal_hash);
        assert_eq!(data.hash_for(Some("lib.tests")), &data.internal_hash);
        assert_eq!(data.hash_for(Some("App")), &data.public_hash);
        assert_eq!(data.hash_for(None), &data.public_hash);
    }

    #[test]
    fn without_friends_both_hashes_are_public() {
        let trimmer = ReferenceTrimmer::new(
            Box::new(FakeParser { calls: Arc::default() }),
            HashAlgorithm::Sha256,
        );
        let data = trimmer.trim(Path::new("a.dll"), b"pub||").unwrap();
        assert_eq!(data.public_hash, data.internal_hash);
        assert!(data.internals_visible_to.is_empty());

        let data = trimmer.trim(Path::new("a.dll"), b"pub|int|Z,A,Z").unwrap();
        assert_ne!(data.public_hash, data.internal_hash);
        assert_eq!(data.internals_visible_to, vec!["A", "Z"]);
    }

    #[test]
    fn parse_failures_name_the_file() {
        let trimmer = ReferenceTrimmer::new(
            Box::new(FakeParser { calls: Arc::default() }),
            HashAlgorithm::Xxh3,
        );
        match trimmer.trim(Path::new("bad.dll"), b"no separators") {
            Err(CacheError::MalformedAssembly { path, .. }) => {
                assert_eq!(path, Path::new("bad.dll"))
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn unchanged_references_are_trimmed_once_per_installation() {
        let dir = tempfile::tempdir().unwrap();
        let dll = dir.path().join("Dep.dll");
        std::fs::write(&dll, b"pub|int|App").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let first = resolver(dir.path(), calls.clone()).resolve(&dll).unwrap();
        // A new resolver models a new process sharing the cache directories.
        let second = resolver(dir.path(), calls.clone()).resolve(&dll).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.data, second.data);

        let key = ReferenceKey::for_file(&dll, first.file.extract.hash.clone());
        let on_disk = dir.path().join("refs").join(format!("Dep_{}.json", first.file.extract.hash));
        assert_eq!(resolver(dir.path(), calls).cache().path_for(&key), on_disk);
        assert!(on_disk.is_file());
    }

    #[test]
    fn bytes_that_no_longer_match_the_key_are_not_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let dll = dir.path().join("Dep.dll");
        std::fs::write(&dll, b"pub|int|App").unwrap();
        let stamp = filetime::FileTime::from_unix_time(1_700_000_000, 0);
        filetime::set_file_mtime(&dll, stamp).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = resolver(dir.path(), calls.clone());
        let recorded = resolver.files.extract(&dll).unwrap();

        // Same length and timestamp, so the identity still matches.
        std::fs::write(&dll, b"PUB|int|App").unwrap();
        filetime::set_file_mtime(&dll, stamp).unwrap();

        match resolver.resolve(&dll) {
            Err(CacheError::FileChanged { path, expected, .. }) => {
                assert_eq!(path, recorded.path);
                assert_eq!(expected, recorded.extract.hash.to_string());
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let key = ReferenceKey::for_file(&dll, recorded.extract.hash.clone());
        assert!(!resolver.cache().exists(&key).unwrap());
    }

    #[test]
    fn record_reports_new_entries_only() {
        let dir = tempfile::tempdir().unwrap();
        let dll = dir.path().join("Out.dll");
        std::fs::write(&dll, b"pub||").unwrap();

        let resolver = resolver(dir.path(), Arc::default());
        assert!(resolver.record(&dll).unwrap());
        assert!(!resolver.record(&dll).unwrap());
    }
}
