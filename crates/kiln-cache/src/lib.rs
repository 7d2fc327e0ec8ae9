//! Kiln: a cache for compiler outputs.
//!
//! A build integration calls [`CompilationCache::locate`] before compiling.
//! The inputs of the invocation are classified by [`DecomposeRules`],
//! fingerprinted (source files by content, referenced assemblies by their
//! API surface), and looked up in the [`ResultsCache`]. On a hit the cached
//! outputs are restored and compilation is skipped. Afterwards
//! [`CompilationCache::populate`] re-checks the fingerprint and commits fresh
//! outputs.
//!
//! On-disk layout under the cache root:
//!
//! ```text
//! <cache_dir>/<project>_<fingerprint>/extract.json
//! <cache_dir>/<project>_<fingerprint>/<fingerprint>.zip
//! <cache_dir>/.filehashcache/<identity hash>
//! <cache_dir>/.refcache/<assembly>_<content hash>.json
//! ```

mod bundle;
mod config;
mod decompose;
mod error;
mod file_hash_cache;
mod fingerprint;
mod hash;
mod logging;
mod orchestrator;
mod pool;
mod reference;
mod results;
mod retry;
mod tier;
mod util;

pub use crate::bundle::{
    write_bundle, Bundle, OutputRecord, OutputsManifest, StagedBundle, INPUTS_ENTRY, OUTPUTS_ENTRY,
    RESERVED_PREFIX,
};
pub use crate::config::{CacheConfig, LoggingConfig, RetryConfig};
pub use crate::decompose::{
    CompilationInputs, Condition, DeclaredOutput, DecomposeRules, DecomposedInputs, Decomposition,
    InputFile, OutputItem, ProjectIdentity, PropertyKind, ReferenceInput, RULES_FORMAT_VERSION,
};
pub use crate::error::{CacheError, Result};
pub use crate::file_hash_cache::{
    FileExtract, FileHashCache, FileHasher, FileIdentity, LocalFileExtract,
};
pub use crate::fingerprint::{
    FileInputExtract, Fingerprinter, FullExtract, LocalInputs, OutputExtract, PropertyExtract,
    ReferenceExtract, FULL_EXTRACT_FORMAT_VERSION,
};
pub use crate::hash::{ContentHasher, Hash, HashAlgorithm};
pub use crate::logging::init_tracing;
pub use crate::orchestrator::{
    CompilationCache, LocateOutcome, LocateResult, LocateSession, PopulateOutcome,
};
pub use crate::pool::WorkerPool;
pub use crate::reference::{
    AssemblySurface, EcmaSurfaceParser, ParseError, ReferenceCache, ReferenceData, ReferenceEntry,
    ReferenceKey, ReferenceResolver, ReferenceTrimmer, ResolvedReference, SurfaceParser,
};
pub use crate::results::{CacheKey, CachedEntry, ResultsCache, BUNDLE_EXTENSION, EXTRACT_FILE};
pub use crate::retry::{is_transient, retry_io, RetryPolicy};
pub use crate::tier::{CacheTier, DiskCodec, DiskTier, MemoryTier, Tiered};
pub use crate::util::{install_copy_once, install_once, InstallOutcome};
