//! Classification of a compiler invocation's raw properties.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

pub const RULES_FORMAT_VERSION: u32 = 1;

const BUILTIN_CSC_RULES: &str = include_str!("../data/csc.json");

/// Everything the build integration knows about one compiler invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationInputs {
    pub project: ProjectIdentity,
    /// Compiler task parameters in the order the build supplied them.
    pub properties: Vec<(String, String)>,
    /// Outputs declared outside the property bag.
    #[serde(default)]
    pub outputs: Vec<OutputItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectIdentity {
    pub project_file: PathBuf,
    /// Name of the assembly being compiled; derived from `OutputAssembly`
    /// when absent.
    #[serde(default)]
    pub assembly_name: Option<String>,
}

impl ProjectIdentity {
    pub fn new(project_file: impl Into<PathBuf>) -> Self {
        Self {
            project_file: project_file.into(),
            assembly_name: None,
        }
    }

    pub fn project_dir(&self) -> PathBuf {
        self.project_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    pub fn project_name(&self) -> String {
        self.project_file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputItem {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
    /// Fingerprinted by value.
    Plain,
    /// `;`-separated files fingerprinted by content.
    InputFiles,
    /// A produced file; fingerprinted by its logical name only.
    OutputFile,
    /// `;`-separated assemblies fingerprinted by their trimmed surface.
    References,
    /// Any non-empty value disables caching.
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum Condition {
    OneOf { property: String, values: Vec<String> },
    MustNotBeTrue { property: String },
}

/// Versioned classification table for one compiler task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecomposeRules {
    pub version: u32,
    pub task: String,
    pub properties: BTreeMap<String, PropertyKind>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl DecomposeRules {
    /// The table shipped for the C# compiler task.
    pub fn csc() -> Result<Self> {
        Self::from_json_str(BUILTIN_CSC_RULES)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let rules: Self =
            serde_json::from_str(text).map_err(|err| CacheError::json("decompose rules", err))?;
        if rules.version != RULES_FORMAT_VERSION {
            return Err(CacheError::invalid_config(format!(
                "decompose rules version {} is not supported (expected {RULES_FORMAT_VERSION})",
                rules.version
            )));
        }
        let mut seen = HashMap::new();
        for name in rules.properties.keys() {
            if let Some(previous) = seen.insert(name.to_ascii_lowercase(), name) {
                return Err(CacheError::invalid_config(format!(
                    "decompose rules list `{previous}` and `{name}`, which differ only in case"
                )));
            }
        }
        Ok(rules)
    }

    /// Classifies `inputs`, failing on properties the table does not know.
    pub fn decompose(&self, inputs: &CompilationInputs) -> Result<Decomposition> {
        let lookup: HashMap<String, (&str, PropertyKind)> = self
            .properties
            .iter()
            .map(|(name, kind)| (name.to_ascii_lowercase(), (name.as_str(), *kind)))
            .collect();
        let project_dir = inputs.project.project_dir();

        let mut values: HashMap<&str, &str> = HashMap::new();
        let mut reasons = Vec::new();
        let mut properties = Vec::new();
        let mut input_files = Vec::new();
        let mut references = Vec::new();
        let mut outputs = OutputSet::default();

        for (raw_name, value) in &inputs.properties {
            let Some(&(name, kind)) = lookup.get(&raw_name.to_ascii_lowercase()) else {
                return Err(CacheError::UnknownProperty {
                    name: raw_name.clone(),
                });
            };
            if values.insert(name, value.as_str()).is_some() {
                return Err(CacheError::DuplicateProperty {
                    name: name.to_string(),
                });
            }
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match kind {
                PropertyKind::Plain => properties.push((name.to_string(), value.to_string())),
                PropertyKind::InputFiles => {
                    input_files.extend(split_list(value).map(|item| InputFile {
                        property: name.to_string(),
                        path: resolve(&project_dir, item),
                    }))
                }
                PropertyKind::References => {
                    references.extend(split_list(value).map(|item| ReferenceInput {
                        property: name.to_string(),
                        path: resolve(&project_dir, item),
                    }))
                }
                PropertyKind::OutputFile => outputs.add(name, resolve(&project_dir, value))?,
                PropertyKind::Unsupported => {
                    reasons.push(format!("property `{name}` is set and cannot be cached"))
                }
            }
        }

        for condition in &self.conditions {
            if let Some(reason) = condition.violation(&values) {
                reasons.push(reason);
            }
        }

        for item in &inputs.outputs {
            outputs.add(&item.name, resolve(&project_dir, &item.path))?;
        }
        let outputs = outputs.finish()?;

        if !reasons.is_empty() {
            return Ok(Decomposition::Unsupported(reasons));
        }

        let assembly_name = inputs.project.assembly_name.clone().or_else(|| {
            outputs
                .iter()
                .find(|output| output.name == "OutputAssembly")
                .and_then(|output| output.path.file_stem())
                .map(|stem| stem.to_string_lossy().into_owned())
        });

        properties.sort();
        input_files.sort();
        references.sort();

        Ok(Decomposition::Supported(DecomposedInputs {
            project_file: inputs.project.project_file.clone(),
            project_dir,
            project_name: inputs.project.project_name(),
            assembly_name,
            properties,
            input_files,
            references,
            outputs,
        }))
    }
}

impl Condition {
    fn violation(&self, values: &HashMap<&str, &str>) -> Option<String> {
        let value_of = |property: &str| {
            values
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(property))
                .map(|(_, value)| value.trim())
                .filter(|value| !value.is_empty())
        };
        match self {
            Condition::OneOf { property, values: allowed } => match value_of(property.as_str()) {
                Some(value)
                    if allowed
                        .iter()
                        .any(|candidate| candidate.eq_ignore_ascii_case(value)) =>
                {
                    None
                }
                Some(value) => Some(format!(
                    "`{property}` is `{value}`; caching requires one of {}",
                    allowed.join(", ")
                )),
                None => Some(format!(
                    "`{property}` is not set; caching requires one of {}",
                    allowed.join(", ")
                )),
            },
            Condition::MustNotBeTrue { property } => match value_of(property.as_str()) {
                Some(value) if value.eq_ignore_ascii_case("true") => {
                    Some(format!("`{property}` is enabled and cannot be cached"))
                }
                _ => None,
            },
        }
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(';').map(str::trim).filter(|item| !item.is_empty())
}

fn resolve(project_dir: &Path, item: impl AsRef<Path>) -> PathBuf {
    let path = item.as_ref();
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_dir.join(path)
    }
}

#[derive(Default)]
struct OutputSet {
    by_name: BTreeMap<String, PathBuf>,
}

impl OutputSet {
    fn add(&mut self, name: &str, path: PathBuf) -> Result<()> {
        if name.is_empty() || name.starts_with("__") || name.contains(['/', '\\']) {
            return Err(CacheError::invalid_config(format!(
                "`{name}` is not a valid output name"
            )));
        }
        match self.by_name.get(name) {
            Some(existing) if *existing != path => Err(CacheError::ConflictingOutput {
                name: name.to_string(),
                first: existing.clone(),
                second: path,
            }),
            Some(_) => Ok(()),
            None => {
                self.by_name.insert(name.to_string(), path);
                Ok(())
            }
        }
    }

    fn finish(self) -> Result<Vec<DeclaredOutput>> {
        let mut file_names: HashMap<String, String> = HashMap::new();
        let mut outputs = Vec::with_capacity(self.by_name.len());
        for (name, path) in self.by_name {
            let extension = path
                .extension()
                .map(|ext| format!(".{}", ext.to_string_lossy()))
                .unwrap_or_default();
            let cache_file_name = format!("{name}{extension}");
            let folded = cache_file_name.to_ascii_lowercase();
            if let Some(other) = file_names.insert(folded, name.clone()) {
                return Err(CacheError::invalid_config(format!(
                    "outputs `{other}` and `{name}` would share the cache file `{cache_file_name}`"
                )));
            }
            outputs.push(DeclaredOutput {
                name,
                path,
                cache_file_name,
            });
        }
        Ok(outputs)
    }
}

/// Outcome of classifying an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decomposition {
    Supported(DecomposedInputs),
    /// Every reason caching was ruled out.
    Unsupported(Vec<String>),
}

/// Classified inputs, canonically ordered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecomposedInputs {
    pub project_file: PathBuf,
    pub project_dir: PathBuf,
    pub project_name: String,
    pub assembly_name: Option<String>,
    pub properties: Vec<(String, String)>,
    pub input_files: Vec<InputFile>,
    pub references: Vec<ReferenceInput>,
    pub outputs: Vec<DeclaredOutput>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct InputFile {
    pub property: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReferenceInput {
    pub property: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredOutput {
    /// Logical name, e.g. the property that declared it.
    pub name: String,
    pub path: PathBuf,
    /// Entry name inside the result bundle: `<name><extension>`.
    pub cache_file_name: String,
}
