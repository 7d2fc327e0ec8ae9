//! Zip bundles holding a compilation's outputs.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use filetime::FileTime;
use serde::{Deserialize, Serialize};

use crate::decompose::DeclaredOutput;
use crate::error::{CacheError, Result};
use crate::fingerprint::FullExtract;
use crate::hash::{Hash, HashAlgorithm};
use crate::retry::RetryPolicy;
use crate::util::replace_file;

pub const INPUTS_ENTRY: &str = "__inputs.json";
pub const OUTPUTS_ENTRY: &str = "__outputs.json";

/// Entry names with this prefix are bundle metadata, never outputs.
pub const RESERVED_PREFIX: &str = "__";

/// Contents of `__outputs.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputsManifest {
    pub outputs: Vec<OutputRecord>,
    /// Hash over every record, identifying the output set as a whole.
    pub outputs_hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputRecord {
    pub name: String,
    pub cache_file_name: String,
    pub hash: Hash,
    pub length: u64,
}

impl OutputsManifest {
    pub fn new(mut outputs: Vec<OutputRecord>, algorithm: HashAlgorithm) -> Result<Self> {
        outputs.sort();
        let bytes =
            serde_json::to_vec(&outputs).map_err(|err| CacheError::json("outputs manifest", err))?;
        Ok(Self {
            outputs_hash: algorithm.hash(bytes),
            outputs,
        })
    }
}

/// A bundle written to a staging directory, ready to be committed.
#[derive(Debug)]
pub struct StagedBundle {
    pub path: PathBuf,
    pub manifest: OutputsManifest,
}

/// Copies `outputs` into `staging`, hashes the copies and packs them with
/// the extract and manifest into `<staging>/<file_name>`.
pub fn write_bundle(
    staging: &Path,
    file_name: &str,
    algorithm: HashAlgorithm,
    extract: &FullExtract,
    outputs: &[DeclaredOutput],
) -> Result<StagedBundle> {
    let files_dir = staging.join("files");
    fs::create_dir_all(&files_dir).map_err(|err| CacheError::io(&files_dir, err))?;

    let mut records = Vec::with_capacity(outputs.len());
    for output in outputs {
        let staged = files_dir.join(&output.cache_file_name);
        fs::copy(&output.path, &staged).map_err(|err| CacheError::io(&output.path, err))?;
        let length = fs::metadata(&staged)
            .map_err(|err| CacheError::io(&staged, err))?
            .len();
        records.push(OutputRecord {
            name: output.name.clone(),
            cache_file_name: output.cache_file_name.clone(),
            hash: algorithm.hash_file(&staged)?,
            length,
        });
    }
    let manifest = OutputsManifest::new(records, algorithm)?;

    let path = staging.join(file_name);
    let file = File::create(&path).map_err(|err| CacheError::io(&path, err))?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::<()>::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644);
    let zip_err = |err: zip::result::ZipError| CacheError::Zip {
        path: path.clone(),
        message: err.to_string(),
    };
    let io_err = |err: io::Error| CacheError::io(&path, err);

    zip.start_file(INPUTS_ENTRY, options).map_err(zip_err)?;
    zip.write_all(&extract.to_pretty_json()?).map_err(io_err)?;

    let manifest_json = serde_json::to_vec_pretty(&manifest)
        .map_err(|err| CacheError::json("outputs manifest", err))?;
    zip.start_file(OUTPUTS_ENTRY, options).map_err(zip_err)?;
    zip.write_all(&manifest_json).map_err(io_err)?;

    for record in &manifest.outputs {
        let staged = files_dir.join(&record.cache_file_name);
        let mut source = File::open(&staged).map_err(|err| CacheError::io(&staged, err))?;
        zip.start_file(record.cache_file_name.as_str(), options)
            .map_err(zip_err)?;
        io::copy(&mut source, &mut zip).map_err(io_err)?;
    }

    let file = zip.finish().map_err(zip_err)?;
    file.sync_all().map_err(io_err)?;

    Ok(StagedBundle { path, manifest })
}

/// An opened bundle.
pub struct Bundle {
    path: PathBuf,
    key: String,
    archive: zip::ZipArchive<File>,
}

impl Bundle {
    /// `key` names the cache entry in corruption reports.
    pub fn open(path: &Path, key: impl Into<String>) -> Result<Self> {
        let file = File::open(path).map_err(|err| CacheError::io(path, err))?;
        let key = key.into();
        let archive = zip::ZipArchive::new(file)
            .map_err(|err| CacheError::corruption(&key, format!("unreadable bundle: {err}")))?;
        Ok(Self {
            path: path.to_path_buf(),
            key,
            archive,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn extract(&mut self) -> Result<FullExtract> {
        let bytes = self.read_entry(INPUTS_ENTRY, None)?;
        FullExtract::from_json_slice(INPUTS_ENTRY, &bytes)
    }

    pub fn manifest(&mut self) -> Result<OutputsManifest> {
        let bytes = self.read_entry(OUTPUTS_ENTRY, None)?;
        serde_json::from_slice(&bytes).map_err(|err| CacheError::json(OUTPUTS_ENTRY, err))
    }

    /// Output entry names, without the metadata entries.
    pub fn output_names(&self) -> Vec<String> {
        self.archive
            .file_names()
            .filter(|name| !name.starts_with(RESERVED_PREFIX))
            .map(str::to_string)
            .collect()
    }

    /// Writes every declared output to its local path, verifying it against
    /// the manifest, and stamps it with `modified`.
    pub fn restore(
        &mut self,
        outputs: &[DeclaredOutput],
        algorithm: HashAlgorithm,
        modified: SystemTime,
        retry: &RetryPolicy,
    ) -> Result<Vec<PathBuf>> {
        let manifest = self.manifest()?;
        let records: BTreeMap<&str, &OutputRecord> = manifest
            .outputs
            .iter()
            .map(|record| (record.name.as_str(), record))
            .collect();
        if records.len() != outputs.len() {
            return Err(CacheError::corruption(
                &self.key,
                format!(
                    "bundle holds {} outputs but {} are declared",
                    records.len(),
                    outputs.len()
                ),
            ));
        }

        // Nothing is written until every entry has been checked.
        let mut verified = Vec::with_capacity(outputs.len());
        for output in outputs {
            let Some(record) = records.get(output.name.as_str()) else {
                return Err(CacheError::corruption(
                    &self.key,
                    format!("output `{}` is missing from the manifest", output.name),
                ));
            };
            let bytes = self.read_entry(&record.cache_file_name, Some(record.length))?;
            if bytes.len() as u64 != record.length || algorithm.hash(&bytes) != record.hash {
                return Err(CacheError::corruption(
                    &self.key,
                    format!(
                        "entry `{}` does not match its manifest hash",
                        record.cache_file_name
                    ),
                ));
            }
            verified.push((&output.path, bytes));
        }

        let stamp = FileTime::from_system_time(modified);
        let mut restored = Vec::with_capacity(verified.len());
        for (path, bytes) in verified {
            replace_file(retry, path, |file| file.write_all(&bytes))?;
            filetime::set_file_mtime(path, stamp).map_err(|err| CacheError::io(path, err))?;
            restored.push(path.clone());
        }
        Ok(restored)
    }

    /// Reads the entry `name`. With `expected_len`, at most one byte past it
    /// is read, whatever size the archive claims.
    fn read_entry(&mut self, name: &str, expected_len: Option<u64>) -> Result<Vec<u8>> {
        let mut entry = match self.archive.by_name(name) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => {
                return Err(CacheError::corruption(
                    &self.key,
                    format!("bundle has no `{name}` entry"),
                ))
            }
            Err(err) => {
                return Err(CacheError::Zip {
                    path: self.path.clone(),
                    message: err.to_string(),
                })
            }
        };
        let mut bytes = Vec::new();
        let read = match expected_len {
            Some(len) => {
                bytes.reserve(usize::try_from(entry.size().min(len)).unwrap_or(0));
                entry.by_ref().take(len.saturating_add(1)).read_to_end(&mut bytes)
            }
            None => entry.read_to_end(&mut bytes),
        };
        read.map_err(|err| CacheError::io(&self.path, err))?;
        Ok(bytes)
    }
}

impl std::fmt::Debug for Bundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bundle")
            .field("path", &self.path)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::FULL_EXTRACT_FORMAT_VERSION;
    use std::time::Duration;

    fn extract() -> FullExtract {
        FullExtract {
            format_version: FULL_EXTRACT_FORMAT_VERSION,
            project: "App.csproj".into(),
            assembly_name: Some("App".into()),
            files: Vec::new(),
            references: Vec::new(),
            properties: Vec::new(),
            outputs: Vec::new(),
        }
    }

    fn output(dir: &Path, name: &str, file: &str, contents: &[u8]) -> DeclaredOutput {
        let path = dir.join(file);
        fs::write(&path, contents).unwrap();
        DeclaredOutput {
            name: name.into(),
            cache_file_name: format!("{name}.{}", file.rsplit('.').next().unwrap()),
            path,
        }
    }

    fn stage(
        dir: &Path,
        into: &str,
        algorithm: HashAlgorithm,
        outputs: &[DeclaredOutput],
    ) -> StagedBundle {
        write_bundle(&dir.join(into), "b.zip", algorithm, &extract(), outputs).unwrap()
    }

    /// Hand-assembled bundle whose manifest and entries need not agree.
    fn forged(dir: &Path, manifest: &OutputsManifest, entries: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join("forged.zip");
        let mut zip = zip::ZipWriter::new(File::create(&path).unwrap());
        let options = zip::write::FileOptions::<()>::default();
        zip.start_file(INPUTS_ENTRY, options).unwrap();
        zip.write_all(&extract().to_pretty_json().unwrap()).unwrap();
        zip.start_file(OUTPUTS_ENTRY, options).unwrap();
        zip.write_all(&serde_json::to_vec(manifest).unwrap()).unwrap();
        for (name, bytes) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(bytes).unwrap();
        }
        zip.finish().unwrap();
        path
    }

    #[test]
    fn bundles_are_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let outputs = vec![
            output(dir.path(), "OutputAssembly", "App.dll", b"assembly bytes"),
            output(dir.path(), "PdbFile", "App.pdb", b"symbols"),
        ];
        let a = stage(dir.path(), "a", HashAlgorithm::Xxh3, &outputs);
        let b = stage(dir.path(), "b", HashAlgorithm::Xxh3, &outputs);
        assert_eq!(fs::read(&a.path).unwrap(), fs::read(&b.path).unwrap());
        assert_eq!(a.manifest, b.manifest);
    }

    #[test]
    fn restore_verifies_and_stamps_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let outputs = vec![output(dir.path(), "OutputAssembly", "App.dll", b"assembly bytes")];
        let staged = stage(dir.path(), "stage", HashAlgorithm::Sha256, &outputs);
        fs::remove_file(&outputs[0].path).unwrap();

        let mut bundle = Bundle::open(&staged.path, "App.csproj_00").unwrap();
        assert_eq!(bundle.output_names(), vec!["OutputAssembly.dll"]);
        assert_eq!(bundle.extract().unwrap(), extract());

        let stamp = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let restored = bundle
            .restore(&outputs, HashAlgorithm::Sha256, stamp, &RetryPolicy::default())
            .unwrap();
        assert_eq!(restored, vec![outputs[0].path.clone()]);
        assert_eq!(fs::read(&outputs[0].path).unwrap(), b"assembly bytes");
        let modified = fs::metadata(&outputs[0].path).unwrap().modified().unwrap();
        assert_eq!(modified, stamp);
    }

    #[test]
    fn undeclared_outputs_are_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let outputs = vec![output(dir.path(), "OutputAssembly", "App.dll", b"x")];
        let staged = stage(dir.path(), "stage", HashAlgorithm::Xxh3, &outputs);

        let mut renamed = outputs.clone();
        renamed[0].name = "Other".into();
        let err = Bundle::open(&staged.path, "k")
            .unwrap()
            .restore(&renamed, HashAlgorithm::Xxh3, SystemTime::now(), &RetryPolicy::default())
            .unwrap_err();
        assert!(matches!(err, CacheError::Corruption { .. }), "{err}");
    }

    #[test]
    fn failed_verification_leaves_every_output_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let outputs = vec![
            output(dir.path(), "OutputAssembly", "App.dll", b"assembly bytes"),
            output(dir.path(), "PdbFile", "App.pdb", b"symbols"),
        ];
        let staged = stage(dir.path(), "stage", HashAlgorithm::Xxh3, &outputs);
        fs::write(&outputs[0].path, b"local build").unwrap();

        // The first output checks out; the second has no manifest record.
        let mut declared = outputs.clone();
        declared[1].name = "DocumentationFile".into();
        let err = Bundle::open(&staged.path, "k")
            .unwrap()
            .restore(&declared, HashAlgorithm::Xxh3, SystemTime::now(), &RetryPolicy::default())
            .unwrap_err();
        assert!(matches!(err, CacheError::Corruption { .. }), "{err}");
        assert_eq!(fs::read(&outputs[0].path).unwrap(), b"local build");
    }

    #[test]
    fn entries_longer_than_their_record_are_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let outputs = vec![output(dir.path(), "OutputAssembly", "App.dll", b"abc")];
        let manifest = OutputsManifest::new(
            vec![OutputRecord {
                name: "OutputAssembly".into(),
                cache_file_name: "OutputAssembly.dll".into(),
                hash: HashAlgorithm::Xxh3.hash(b"abc"),
                length: 3,
            }],
            HashAlgorithm::Xxh3,
        )
        .unwrap();
        let oversized = vec![b'a'; 64 * 1024];
        let path = forged(dir.path(), &manifest, &[("OutputAssembly.dll", &oversized)]);

        let err = Bundle::open(&path, "k")
            .unwrap()
            .restore(&outputs, HashAlgorithm::Xxh3, SystemTime::now(), &RetryPolicy::default())
            .unwrap_err();
        assert!(matches!(err, CacheError::Corruption { .. }), "{err}");
        assert_eq!(fs::read(&outputs[0].path).unwrap(), b"abc");
    }

    #[test]
    fn non_zip_files_are_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.zip");
        fs::write(&path, b"definitely not a zip archive").unwrap();
        assert!(matches!(Bundle::open(&path, "k"), Err(CacheError::Corruption { .. })));
    }
}
