//! Canonical extracts of a compilation's inputs and their fingerprint.

use std::path::{Component, Path};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::decompose::DecomposedInputs;
use crate::error::{CacheError, Result};
use crate::file_hash_cache::{FileHasher, LocalFileExtract};
use crate::hash::{Hash, HashAlgorithm};
use crate::pool::WorkerPool;
use crate::reference::{ReferenceResolver, ResolvedReference};

/// Bumped whenever the shape or meaning of [`FullExtract`] changes; it is
/// part of the hashed bytes.
pub const FULL_EXTRACT_FORMAT_VERSION: u32 = 1;

/// The location-independent description of a compilation that its
/// fingerprint is computed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullExtract {
    pub format_version: u32,
    pub project: String,
    pub assembly_name: Option<String>,
    pub files: Vec<FileInputExtract>,
    pub references: Vec<ReferenceExtract>,
    pub properties: Vec<PropertyExtract>,
    pub outputs: Vec<OutputExtract>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileInputExtract {
    pub name: String,
    pub property: String,
    pub hash: Hash,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReferenceExtract {
    pub name: String,
    pub property: String,
    /// Surface hash selected for this consumer.
    pub hash: Hash,
    pub internals: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PropertyExtract {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputExtract {
    pub name: String,
    pub cache_file_name: String,
}

impl FullExtract {
    /// Sorts every list so enumeration order never reaches the hash.
    pub fn canonicalize(&mut self) {
        self.files.sort();
        self.references.sort();
        self.properties.sort();
        self.outputs.sort();
    }

    /// Compact JSON of the canonicalized extract; the bytes that get hashed.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let mut canonical = self.clone();
        canonical.canonicalize();
        serde_json::to_vec(&canonical).map_err(|err| CacheError::json("full extract", err))
    }

    /// Indented JSON, as stored in `extract.json`.
    pub fn to_pretty_json(&self) -> Result<Vec<u8>> {
        let mut canonical = self.clone();
        canonical.canonicalize();
        serde_json::to_vec_pretty(&canonical).map_err(|err| CacheError::json("full extract", err))
    }

    pub fn from_json_slice(context: &str, bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|err| CacheError::json(context, err))
    }

    pub fn fingerprint(&self, algorithm: HashAlgorithm) -> Result<Hash> {
        Ok(algorithm.hash(self.canonical_bytes()?))
    }
}

/// Fingerprinted inputs plus the local files they were computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInputs {
    pub extract: FullExtract,
    pub fingerprint: Hash,
    pub files: Vec<LocalFileExtract>,
    pub references: Vec<ResolvedReference>,
}

/// Computes [`LocalInputs`] on a bounded worker pool.
#[derive(Debug)]
pub struct Fingerprinter {
    files: Arc<FileHasher>,
    references: Arc<ReferenceResolver>,
    pool: WorkerPool,
    algorithm: HashAlgorithm,
}

impl Fingerprinter {
    pub fn new(
        files: Arc<FileHasher>,
        references: Arc<ReferenceResolver>,
        pool: WorkerPool,
        algorithm: HashAlgorithm,
    ) -> Self {
        Self {
            files,
            references,
            pool,
            algorithm,
        }
    }

    pub fn compute(&self, inputs: &DecomposedInputs) -> Result<LocalInputs> {
        let files = self
            .pool
            .map_ordered(&inputs.input_files, |input| self.files.extract(&input.path))?;
        let references = self
            .pool
            .map_ordered(&inputs.references, |input| self.references.resolve(&input.path))?;

        let consumer = inputs.assembly_name.as_deref();
        let mut extract = FullExtract {
            format_version: FULL_EXTRACT_FORMAT_VERSION,
            project: inputs.project_name.clone(),
            assembly_name: inputs.assembly_name.clone(),
            files: inputs
                .input_files
                .iter()
                .zip(&files)
                .map(|(input, local)| FileInputExtract {
                    name: display_name(&inputs.project_dir, &local.path),
                    property: input.property.clone(),
                    hash: local.extract.hash.clone(),
                    length: local.extract.length,
                })
                .collect(),
            references: inputs
                .references
                .iter()
                .zip(&references)
                .map(|(input, resolved)| ReferenceExtract {
                    name: display_name(&inputs.project_dir, &resolved.file.path),
                    property: input.property.clone(),
                    hash: resolved.data.hash_for(consumer).clone(),
                    internals: resolved.data.grants_internals_to(consumer),
                })
                .collect(),
            properties: inputs
                .properties
                .iter()
                .map(|(name, value)| PropertyExtract {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
            outputs: inputs
                .outputs
                .iter()
                .map(|output| OutputExtract {
                    name: output.name.clone(),
                    cache_file_name: output.cache_file_name.clone(),
                })
                .collect(),
        };
        extract.canonicalize();
        let fingerprint = extract.fingerprint(self.algorithm)?;

        Ok(LocalInputs {
            extract,
            fingerprint,
            files,
            references,
        })
    }
}

/// `/`-separated path relative to `project_dir` when `path` lies beneath it,
/// otherwise the bare file name.
pub(crate) fn display_name(project_dir: &Path, path: &Path) -> String {
    if let Ok(relative) = path.strip_prefix(project_dir) {
        let parts: Option<Vec<_>> = relative
            .components()
            .map(|component| match component {
                Component::Normal(part) => Some(part.to_string_lossy()),
                _ => None,
            })
            .collect();
        if let Some(parts) = parts.filter(|parts| !parts.is_empty()) {
            return parts.join("/");
        }
    }
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
