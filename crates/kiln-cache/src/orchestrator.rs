//! The two-phase locate/populate protocol.

use std::fmt;
use std::fs;
use std::sync::Arc;
use std::time::SystemTime;

use crate::bundle::{write_bundle, Bundle};
use crate::config::CacheConfig;
use crate::decompose::{CompilationInputs, DecomposeRules, DecomposedInputs, Decomposition};
use crate::error::{CacheError, Result};
use crate::file_hash_cache::{FileHashCache, FileHasher};
use crate::fingerprint::{Fingerprinter, LocalInputs};
use crate::hash::{Hash, HashAlgorithm};
use crate::pool::WorkerPool;
use crate::reference::{ReferenceCache, ReferenceResolver, ReferenceTrimmer};
use crate::results::{CacheKey, ResultsCache};
use crate::retry::RetryPolicy;
use crate::util::InstallOutcome;

/// Outputs fed back into the reference cache after populate.
const ASSEMBLY_OUTPUTS: [&str; 2] = ["OutputAssembly", "OutputRefAssembly"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocateOutcome {
    /// The invocation uses settings the cache cannot reason about.
    CacheNotSupported,
    CacheMiss,
    /// Outputs were restored from the cache; compilation can be skipped.
    CacheUsed,
    /// Verify-only mode: always compile, then populate.
    OnlyPopulateCache,
}

impl fmt::Display for LocateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LocateOutcome::CacheNotSupported => "not-supported",
            LocateOutcome::CacheMiss => "miss",
            LocateOutcome::CacheUsed => "hit",
            LocateOutcome::OnlyPopulateCache => "only-populate",
        })
    }
}

/// Everything populate needs from locate. Returned by
/// [`CompilationCache::locate`] and moved into [`CompilationCache::populate`].
#[derive(Debug, Clone)]
pub struct LocateSession {
    outcome: LocateOutcome,
    started_at: SystemTime,
    state: Option<Arc<SessionState>>,
}

#[derive(Debug)]
struct SessionState {
    key: CacheKey,
    inputs: DecomposedInputs,
    local: LocalInputs,
}

impl LocateSession {
    pub fn outcome(&self) -> LocateOutcome {
        self.outcome
    }

    /// When locate started; restored outputs carry this modification time.
    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub fn cache_key(&self) -> Option<&CacheKey> {
        self.state.as_ref().map(|state| &state.key)
    }

    pub fn local_inputs(&self) -> Option<&LocalInputs> {
        self.state.as_ref().map(|state| &state.local)
    }

    pub fn inputs(&self) -> Option<&DecomposedInputs> {
        self.state.as_ref().map(|state| &state.inputs)
    }
}

#[derive(Debug, Clone)]
pub struct LocateResult {
    pub outcome: LocateOutcome,
    pub cache_key: Option<CacheKey>,
    pub unsupported_reasons: Vec<String>,
    pub session: LocateSession,
}

impl LocateResult {
    pub fn run_compilation(&self) -> bool {
        self.outcome != LocateOutcome::CacheUsed
    }

    pub fn populate_needed(&self) -> bool {
        self.outcome != LocateOutcome::CacheNotSupported
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopulateOutcome {
    /// A new entry was committed.
    Stored,
    /// Another build committed the same key first.
    AlreadyCached,
    /// Inputs changed while compiling; the outputs were not cached.
    SkippedInputsChanged,
    /// A cache hit was confirmed against the current inputs.
    Verified,
    /// Caching was not supported for this invocation.
    NotApplicable,
}

/// Compilation output cache rooted at [`CacheConfig::cache_dir`].
pub struct CompilationCache {
    config: CacheConfig,
    rules: DecomposeRules,
    algorithm: HashAlgorithm,
    retry: RetryPolicy,
    references: Arc<ReferenceResolver>,
    fingerprinter: Fingerprinter,
    results: ResultsCache,
}

impl CompilationCache {
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::with_rules(config, DecomposeRules::csc()?)
    }

    pub fn with_rules(config: CacheConfig, rules: DecomposeRules) -> Result<Self> {
        config.validate()?;
        let algorithm = config.hash_algorithm;
        let retry = config.retry_policy();

        let files = Arc::new(FileHasher::new(
            FileHashCache::new(config.file_hash_cache_dir(), algorithm, retry),
            algorithm,
        ));
        let references = Arc::new(ReferenceResolver::new(
            files.clone(),
            ReferenceCache::new(config.ref_cache_dir(), retry),
            ReferenceTrimmer::ecma(algorithm),
        ));
        let fingerprinter = Fingerprinter::new(
            files,
            references.clone(),
            WorkerPool::new(config.parallelism()),
            algorithm,
        );
        let results = ResultsCache::new(&config.cache_dir, retry);

        Ok(Self {
            config,
            rules,
            algorithm,
            retry,
            references,
            fingerprinter,
            results,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn results(&self) -> &ResultsCache {
        &self.results
    }

    pub fn references(&self) -> &ReferenceResolver {
        &self.references
    }

    /// Decides whether compilation can be skipped, restoring cached outputs
    /// when it can.
    pub fn locate(&self, inputs: &CompilationInputs) -> Result<LocateResult> {
        let started_at = SystemTime::now();
        let project = inputs.project.project_file.display().to_string();

        let decomposed = match self.rules.decompose(inputs)? {
            Decomposition::Supported(decomposed) => decomposed,
            Decomposition::Unsupported(reasons) => {
                tracing::info!(
                    target = "kiln.cache",
                    project = %project,
                    reasons = ?reasons,
                    "compilation cannot be cached"
                );
                return Ok(LocateResult {
                    outcome: LocateOutcome::CacheNotSupported,
                    cache_key: None,
                    unsupported_reasons: reasons,
                    session: LocateSession {
                        outcome: LocateOutcome::CacheNotSupported,
                        started_at,
                        state: None,
                    },
                });
            }
        };

        let local = self.fingerprinter.compute(&decomposed)?;
        let key = CacheKey::new(&decomposed.project_name, local.fingerprint.clone());

        let outcome = if self.config.verify_only {
            LocateOutcome::OnlyPopulateCache
        } else {
            match self.results.get(&key)? {
                Some(entry) => {
                    let mut bundle = Bundle::open(&entry.bundle_path, key.to_string())?;
                    bundle.restore(&decomposed.outputs, self.algorithm, started_at, &self.retry)?;
                    LocateOutcome::CacheUsed
                }
                None => LocateOutcome::CacheMiss,
            }
        };

        tracing::info!(
            target = "kiln.cache",
            project = %project,
            key = %key,
            outcome = %outcome,
            files = local.files.len(),
            references = local.references.len(),
            "located compilation"
        );

        Ok(LocateResult {
            outcome,
            cache_key: Some(key.clone()),
            unsupported_reasons: Vec::new(),
            session: LocateSession {
                outcome,
                started_at,
                state: Some(Arc::new(SessionState {
                    key,
                    inputs: decomposed,
                    local,
                })),
            },
        })
    }

    /// Verifies the inputs did not drift since `locate` and commits freshly
    /// compiled outputs.
    pub fn populate(&self, session: LocateSession) -> Result<PopulateOutcome> {
        let Some(state) = session.state else {
            return Ok(PopulateOutcome::NotApplicable);
        };

        let current = self.fingerprinter.compute(&state.inputs)?;
        let drifted = current.extract != state.local.extract;

        let outcome = match session.outcome {
            LocateOutcome::CacheNotSupported => PopulateOutcome::NotApplicable,
            LocateOutcome::CacheUsed if drifted => {
                return Err(CacheError::InputsChangedAfterHit {
                    key: state.key.to_string(),
                    expected: state.local.fingerprint.to_string(),
                    found: current.fingerprint.to_string(),
                });
            }
            LocateOutcome::CacheUsed => PopulateOutcome::Verified,
            LocateOutcome::CacheMiss | LocateOutcome::OnlyPopulateCache if drifted => {
                tracing::warn!(
                    target = "kiln.cache",
                    key = %state.key,
                    current = %current.fingerprint,
                    "inputs changed during compilation; not caching outputs"
                );
                self.record_assembly_outputs(&state.inputs);
                return Ok(PopulateOutcome::SkippedInputsChanged);
            }
            LocateOutcome::CacheMiss | LocateOutcome::OnlyPopulateCache => {
                self.store(&state, session.outcome)?
            }
        };

        self.record_assembly_outputs(&state.inputs);
        tracing::info!(
            target = "kiln.cache",
            key = %state.key,
            outcome = ?outcome,
            "populated cache"
        );
        Ok(outcome)
    }

    fn store(&self, state: &SessionState, located: LocateOutcome) -> Result<PopulateOutcome> {
        let root = self.results.root();
        fs::create_dir_all(root).map_err(|err| CacheError::io(root, err))?;
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(root)
            .map_err(|err| CacheError::io(root, err))?;

        let staged = write_bundle(
            staging.path(),
            &state.key.bundle_file_name(),
            self.algorithm,
            &state.local.extract,
            &state.inputs.outputs,
        )?;

        if located == LocateOutcome::OnlyPopulateCache {
            self.compare_with_existing(&state.key, &staged.manifest.outputs_hash)?;
        }

        let outcome = self.results.set(&state.key, &state.local.extract, &staged.path)?;
        Ok(match outcome {
            InstallOutcome::Installed => PopulateOutcome::Stored,
            InstallOutcome::AlreadyPresent => PopulateOutcome::AlreadyCached,
        })
    }

    /// Verify-only mode: reports whether recompiling reproduced the outputs
    /// already in the cache.
    fn compare_with_existing(&self, key: &CacheKey, outputs_hash: &Hash) -> Result<()> {
        let Some(entry) = self.results.get(key)? else {
            return Ok(());
        };
        let cached = Bundle::open(&entry.bundle_path, key.to_string())?.manifest()?;
        if &cached.outputs_hash == outputs_hash {
            tracing::info!(target = "kiln.cache", key = %key, "recompiled outputs match the cache");
        } else {
            tracing::warn!(
                target = "kiln.cache",
                key = %key,
                cached = %cached.outputs_hash,
                compiled = %outputs_hash,
                "recompiled outputs differ from the cached ones"
            );
        }
        Ok(())
    }

    fn record_assembly_outputs(&self, inputs: &DecomposedInputs) {
        for output in &inputs.outputs {
            if !ASSEMBLY_OUTPUTS.contains(&output.name.as_str()) || !output.path.is_file() {
                continue;
            }
            if let Err(err) = self.references.record(&output.path) {
                tracing::warn!(
                    target = "kiln.cache.refs",
                    path = %output.path.display(),
                    error = %err,
                    "failed to record reference data for produced assembly"
                );
            }
        }
    }
}

impl fmt::Debug for CompilationCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilationCache")
            .field("cache_dir", &self.config.cache_dir)
            .field("algorithm", &self.algorithm)
            .field("verify_only", &self.config.verify_only)
            .finish_non_exhaustive()
    }
}
