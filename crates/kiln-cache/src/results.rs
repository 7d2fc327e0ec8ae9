//! The results cache: one directory per [`CacheKey`] holding `extract.json`
//! and a single output bundle.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{CacheError, Result};
use crate::fingerprint::FullExtract;
use crate::hash::Hash;
use crate::retry::{retry_io, RetryPolicy};
use crate::util::{install_copy_once, install_once, read_if_exists, InstallOutcome};

pub const EXTRACT_FILE: &str = "extract.json";
pub const BUNDLE_EXTENSION: &str = "zip";

/// `{project}_{fingerprint}`; also the entry's directory name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    project: String,
    fingerprint: Hash,
}

impl CacheKey {
    /// Characters outside `[A-Za-z0-9._-]` in `project` become `_`.
    pub fn new(project: &str, fingerprint: Hash) -> Self {
        let project = project
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        Self {
            project,
            fingerprint,
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        let (project, fingerprint) = text.rsplit_once('_')?;
        let fingerprint = Hash::parse(fingerprint)?;
        if project.is_empty() || project.starts_with('.') {
            return None;
        }
        Some(Self::new(project, fingerprint))
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn fingerprint(&self) -> &Hash {
        &self.fingerprint
    }

    pub fn bundle_file_name(&self) -> String {
        format!("{}.{BUNDLE_EXTENSION}", self.fingerprint)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.project, self.fingerprint)
    }
}

/// A committed entry, read in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
    pub key: CacheKey,
    pub extract_path: PathBuf,
    pub bundle_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ResultsCache {
    root: PathBuf,
    retry: RetryPolicy,
}

impl ResultsCache {
    pub fn new(root: impl Into<PathBuf>, retry: RetryPolicy) -> Self {
        Self {
            root: root.into(),
            retry,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.to_string())
    }

    /// An entry exists once its `extract.json` is in place; it is written
    /// last.
    pub fn exists(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.entry_dir(key).join(EXTRACT_FILE).is_file())
    }

    pub fn get(&self, key: &CacheKey) -> Result<Option<CachedEntry>> {
        let dir = self.entry_dir(key);
        let extract_path = dir.join(EXTRACT_FILE);
        if !extract_path.is_file() {
            return Ok(None);
        }

        let bundles = self.bundles_in(&dir)?;
        match bundles.as_slice() {
            [bundle] => Ok(Some(CachedEntry {
                key: key.clone(),
                extract_path,
                bundle_path: bundle.clone(),
            })),
            [] => Err(CacheError::corruption(key, "entry has an extract but no bundle")),
            many => Err(CacheError::corruption(
                key,
                format!("entry holds {} bundles; exactly one expected", many.len()),
            )),
        }
    }

    /// Commits `bundle` and then `extract` under `key`. Neither file is ever
    /// replaced; a second commit of the same key is a no-op.
    pub fn set(
        &self,
        key: &CacheKey,
        extract: &FullExtract,
        bundle: &Path,
    ) -> Result<InstallOutcome> {
        let dir = self.entry_dir(key);
        retry_io(&self.retry, "create_dir", &dir, || fs::create_dir_all(&dir))?;

        let bundle_dest = dir.join(key.bundle_file_name());
        let bundle_outcome = install_copy_once(&self.retry, bundle, &bundle_dest)?;
        let json = extract.to_pretty_json()?;
        let extract_outcome = install_once(&self.retry, &dir.join(EXTRACT_FILE), |file| {
            file.write_all(&json)
        })?;

        tracing::debug!(
            target = "kiln.cache.results",
            key = %key,
            bundle = ?bundle_outcome,
            extract = ?extract_outcome,
            "committed cache entry"
        );
        Ok(extract_outcome)
    }

    /// Keys of every committed entry, sorted.
    pub fn entries(&self) -> Result<Vec<CacheKey>> {
        let read_dir = match fs::read_dir(&self.root) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(CacheError::io(&self.root, err)),
        };
        let mut keys = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|err| CacheError::io(&self.root, err))?;
            let Some(key) = entry.file_name().to_str().and_then(CacheKey::parse) else {
                continue;
            };
            if entry.path().join(EXTRACT_FILE).is_file() {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    pub fn read_extract(&self, key: &CacheKey) -> Result<Option<FullExtract>> {
        let path = self.entry_dir(key).join(EXTRACT_FILE);
        match read_if_exists(&self.retry, &path)? {
            Some(bytes) => {
                FullExtract::from_json_slice(&path.display().to_string(), &bytes).map(Some)
            }
            None => Ok(None),
        }
    }

    fn bundles_in(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let entries = retry_io(&self.retry, "read_dir", dir, || {
            fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()
        })?;
        let mut bundles: Vec<PathBuf> = entries
            .into_iter()
            .map(|entry| entry.path())
            .filter(|path| {
                let hidden = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with('.'));
                !hidden
                    && path.is_file()
                    && path.extension().and_then(|ext| ext.to_str()) == Some(BUNDLE_EXTENSION)
            })
            .collect();
        bundles.sort();
        Ok(bundles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashAlgorithm;

    #[test]
    fn keys_are_filesystem_safe_and_parse_back() {
        let fingerprint = HashAlgorithm::Xxh3.hash(b"inputs");
        let key = CacheKey::new("My App/v2.csproj", fingerprint.clone());
        assert_eq!(key.to_string(), format!("My_App_v2.csproj_{fingerprint}"));
        assert_eq!(CacheKey::parse(&key.to_string()), Some(key));
        assert_eq!(CacheKey::parse(".refcache"), None);
        assert_eq!(CacheKey::parse("App_NOTHEX"), None);
    }

    #[test]
    fn missing_entries_are_misses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultsCache::new(dir.path(), RetryPolicy::default());
        let key = CacheKey::new("App.csproj", HashAlgorithm::Xxh3.hash(b"x"));
        assert!(!cache.exists(&key).unwrap());
        assert_eq!(cache.get(&key).unwrap(), None);
        assert!(cache.entries().unwrap().is_empty());
    }
}
