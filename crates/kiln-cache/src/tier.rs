//! Write-once key/value tiers and their "memory over disk" composition.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash as StdHash;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::util::{install_once, read_if_exists, InstallOutcome};

/// A write-once store. `set` never replaces an existing value.
pub trait CacheTier {
    type Key;
    type Value;

    fn exists(&self, key: &Self::Key) -> Result<bool>;
    fn get(&self, key: &Self::Key) -> Result<Option<Self::Value>>;
    /// Returns `false` when `key` was already present.
    fn set(&self, key: &Self::Key, value: &Self::Value) -> Result<bool>;
}

/// In-process tier, shared by worker threads.
pub struct MemoryTier<K, V> {
    entries: RwLock<HashMap<K, V>>,
}

impl<K, V> MemoryTier<K, V> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<K, V> Default for MemoryTier<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for MemoryTier<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTier")
            .field("len", &self.len())
            .finish()
    }
}

impl<K, V> CacheTier for MemoryTier<K, V>
where
    K: Eq + StdHash + Clone,
    V: Clone,
{
    type Key = K;
    type Value = V;

    fn exists(&self, key: &K) -> Result<bool> {
        Ok(self.entries.read().contains_key(key))
    }

    fn get(&self, key: &K) -> Result<Option<V>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &K, value: &V) -> Result<bool> {
        let mut entries = self.entries.write();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.clone(), value.clone());
        Ok(true)
    }
}

/// Maps keys to file names and values to file contents for a [`DiskTier`].
pub trait DiskCodec {
    type Key;
    type Value;

    fn file_name(&self, key: &Self::Key) -> String;
    fn encode(&self, value: &Self::Value) -> Result<Vec<u8>>;
    /// `path` is only used for diagnostics.
    fn decode(&self, path: &Path, bytes: &[u8]) -> Result<Self::Value>;
}

/// One file per key under `root`, installed atomically.
#[derive(Debug)]
pub struct DiskTier<C> {
    root: PathBuf,
    codec: C,
    retry: RetryPolicy,
}

impl<C: DiskCodec> DiskTier<C> {
    pub fn new(root: impl Into<PathBuf>, codec: C, retry: RetryPolicy) -> Self {
        Self {
            root: root.into(),
            codec,
            retry,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &C::Key) -> PathBuf {
        self.root.join(self.codec.file_name(key))
    }
}

impl<C: DiskCodec> CacheTier for DiskTier<C> {
    type Key = C::Key;
    type Value = C::Value;

    fn exists(&self, key: &C::Key) -> Result<bool> {
        Ok(self.path_for(key).is_file())
    }

    fn get(&self, key: &C::Key) -> Result<Option<C::Value>> {
        let path = self.path_for(key);
        match read_if_exists(&self.retry, &path)? {
            Some(bytes) => self.codec.decode(&path, &bytes).map(Some),
            None => Ok(None),
        }
    }

    fn set(&self, key: &C::Key, value: &C::Value) -> Result<bool> {
        let path = self.path_for(key);
        let bytes = self.codec.encode(value)?;
        let outcome = install_once(&self.retry, &path, |file| file.write_all(&bytes))?;
        Ok(outcome == InstallOutcome::Installed)
    }
}

/// A fast tier in front of a slow one.
///
/// Slow-tier hits are promoted. Writes go to the slow tier first, and the
/// fast tier then receives whatever value survived there, so a process that
/// loses a write race still converges on the winner's value.
#[derive(Debug)]
pub struct Tiered<F, S> {
    fast: F,
    slow: S,
}

impl<F, S> Tiered<F, S> {
    pub fn new(fast: F, slow: S) -> Self {
        Self { fast, slow }
    }

    pub fn fast(&self) -> &F {
        &self.fast
    }

    pub fn slow(&self) -> &S {
        &self.slow
    }
}

impl<F, S> CacheTier for Tiered<F, S>
where
    F: CacheTier,
    S: CacheTier<Key = F::Key, Value = F::Value>,
{
    type Key = F::Key;
    type Value = F::Value;

    fn exists(&self, key: &Self::Key) -> Result<bool> {
        Ok(self.fast.exists(key)? || self.slow.exists(key)?)
    }

    fn get(&self, key: &Self::Key) -> Result<Option<Self::Value>> {
        if let Some(value) = self.fast.get(key)? {
            return Ok(Some(value));
        }
        let Some(value) = self.slow.get(key)? else {
            return Ok(None);
        };
        self.fast.set(key, &value)?;
        Ok(Some(value))
    }

    fn set(&self, key: &Self::Key, value: &Self::Value) -> Result<bool> {
        if self.slow.set(key, value)? {
            self.fast.set(key, value)?;
            return Ok(true);
        }
        if let Some(existing) = self.slow.get(key)? {
            self.fast.set(key, &existing)?;
        }
        Ok(false)
    }
}
