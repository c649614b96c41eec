//! Read access to a Hardhat `artifacts/` tree.
//!
//! Hardhat writes one `<Name>.json` per contract under
//! `artifacts/<sourceName>/`, a `<Name>.dbg.json` next to it pointing at the
//! build-info file, and the build-info files themselves under
//! `artifacts/build-info/`. The index is built from paths alone; artifact
//! files are parsed on demand.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use deploykit_common::abi::{self, AbiError, Value};
use serde::Deserialize;
use tracing::debug;
use walkdir::WalkDir;

const BUILD_INFO_DIR: &str = "build-info";
const DBG_SUFFIX: &str = ".dbg.json";

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Artifacts directory {} does not exist, compile the contracts first", .0.display())]
    MissingRoot(PathBuf),
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to walk artifacts directory: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("Failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("No artifact named {0}")]
    NotFound(String),
    #[error("{name} matches several artifacts: {}", .candidates.join(", "))]
    Ambiguous {
        name: String,
        candidates: Vec<String>,
    },
    #[error("{0} references libraries that are not linked")]
    UnlinkedLibraries(String),
    #[error("{name} has no usable bytecode: {reason}")]
    InvalidBytecode { name: String, reason: String },
    #[error("Failed to encode constructor arguments: {0}")]
    Abi(#[from] AbiError),
}

/// Location of one compiled contract inside the artifacts tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactEntry {
    /// `contracts/vault/Vault.sol:Vault`
    pub fully_qualified_name: String,
    pub path: PathBuf,
}

/// A `hh-sol-artifact-1` document. Only the fields the deployer uses are kept.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub contract_name: String,
    pub source_name: String,
    #[serde(default)]
    pub abi: serde_json::Value,
    pub bytecode: String,
}

impl Artifact {
    pub fn fully_qualified_name(&self) -> String {
        format!("{}:{}", self.source_name, self.contract_name)
    }

    /// Creation bytecode without constructor arguments.
    pub fn creation_code(&self) -> Result<Bytes, ArtifactError> {
        if self.bytecode.contains("__$") {
            return Err(ArtifactError::UnlinkedLibraries(self.fully_qualified_name()));
        }
        let code = deploykit_common::utils::decode_hex(&self.bytecode).map_err(|e| {
            ArtifactError::InvalidBytecode {
                name: self.fully_qualified_name(),
                reason: e.to_string(),
            }
        })?;
        if code.is_empty() {
            return Err(ArtifactError::InvalidBytecode {
                name: self.fully_qualified_name(),
                reason: "abstract contract or interface".to_owned(),
            });
        }
        Ok(Bytes::from(code))
    }

    /// Creation bytecode followed by the ABI-encoded constructor arguments.
    pub fn init_code(&self, args: &[Value]) -> Result<Bytes, ArtifactError> {
        let mut code = self.creation_code()?.to_vec();
        code.extend(abi::encode(args)?);
        Ok(Bytes::from(code))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DebugFile {
    build_info: PathBuf,
}

/// Compiler run that produced an artifact.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    pub solc_version: String,
    pub solc_long_version: String,
    /// Solidity standard JSON input, as given to the compiler.
    pub input: serde_json::Value,
}

impl BuildInfo {
    /// Version string in the form explorers expect, e.g. `v0.8.24+commit.e11b9ed9`.
    pub fn compiler_version(&self) -> String {
        format!("v{}", self.solc_long_version)
    }

    pub fn standard_json_input(&self) -> String {
        self.input.to_string()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ArtifactIndex {
    root: PathBuf,
    by_name: BTreeMap<String, Vec<ArtifactEntry>>,
}

impl ArtifactIndex {
    pub fn load(root: impl AsRef<Path>) -> Result<Self, ArtifactError> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(ArtifactError::MissingRoot(root.to_path_buf()));
        }
        let mut by_name: BTreeMap<String, Vec<ArtifactEntry>> = BTreeMap::new();
        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() != 1 || e.file_name() != BUILD_INFO_DIR);
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(file_name) = entry.file_name().to_str() else {
                continue;
            };
            if file_name.ends_with(DBG_SUFFIX) {
                continue;
            }
            let Some(contract_name) = file_name.strip_suffix(".json") else {
                continue;
            };
            // The directory holding the artifact is named after the source file.
            let Some(source_dir) = entry.path().parent().and_then(|p| p.strip_prefix(root).ok())
            else {
                continue;
            };
            let source_name = source_dir
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if !source_name.ends_with(".sol") {
                continue;
            }
            by_name
                .entry(contract_name.to_owned())
                .or_default()
                .push(ArtifactEntry {
                    fully_qualified_name: format!("{source_name}:{contract_name}"),
                    path: entry.path().to_path_buf(),
                });
        }
        debug!(root = %root.display(), contracts = by_name.len(), "Indexed artifacts");
        Ok(Self {
            root: root.to_path_buf(),
            by_name,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of distinct contract names.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Fully qualified names of every artifact called `name`.
    pub fn candidates(&self, name: &str) -> Vec<String> {
        self.by_name
            .get(name)
            .map(|entries| {
                entries
                    .iter()
                    .map(|e| e.fully_qualified_name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Looks up a bare contract name or a fully qualified `source:Name`.
    pub fn resolve(&self, name: &str) -> Result<&ArtifactEntry, ArtifactError> {
        if let Some((_, contract)) = name.rsplit_once(':') {
            return self
                .by_name
                .get(contract)
                .and_then(|entries| entries.iter().find(|e| e.fully_qualified_name == name))
                .ok_or_else(|| ArtifactError::NotFound(name.to_owned()));
        }
        match self.by_name.get(name).map(Vec::as_slice) {
            None | Some([]) => Err(ArtifactError::NotFound(name.to_owned())),
            Some([entry]) => Ok(entry),
            Some(_) => Err(ArtifactError::Ambiguous {
                name: name.to_owned(),
                candidates: self.candidates(name),
            }),
        }
    }

    pub fn artifact(&self, name: &str) -> Result<Artifact, ArtifactError> {
        let entry = self.resolve(name)?;
        read_json(&entry.path)
    }

    pub fn build_info(&self, name: &str) -> Result<BuildInfo, ArtifactError> {
        let entry = self.resolve(name)?;
        let file_name = entry
            .path
            .file_name()
            .and_then(|f| f.to_str())
            .and_then(|f| f.strip_suffix(".json"))
            .ok_or_else(|| ArtifactError::NotFound(name.to_owned()))?;
        let dbg_path = entry.path.with_file_name(format!("{file_name}{DBG_SUFFIX}"));
        let dbg: DebugFile = read_json(&dbg_path)?;
        let dir = dbg_path.parent().unwrap_or(Path::new("."));
        read_json(&dir.join(dbg.build_info))
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ArtifactError> {
    let content = fs::read_to_string(path).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ArtifactError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
