use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use deploykit_common::{Address, H256, abi::Value, address::PredictedAddress};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LedgerError;

/// One deployed contract.
///
/// `name` is the key the record is stored under and is unique within a
/// network. `contract` is only set when the compiled artifact has a different
/// name (several records may share one artifact).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    #[serde(skip)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,
    pub address: Address,
    #[serde(default)]
    pub constructor_args: Vec<Value>,
    #[serde(default)]
    pub tx_hash: Option<H256>,
    #[serde(rename = "timestamp")]
    pub deployed_at: DateTime<Utc>,
    /// Contracts that did not exist yet when this one was deployed, and the
    /// addresses its constructor arguments assumed for them.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub predicted_dependencies: BTreeMap<String, PredictedAddress>,
}

impl DeploymentRecord {
    pub fn new(
        name: impl Into<String>,
        address: Address,
        constructor_args: Vec<Value>,
        tx_hash: Option<H256>,
    ) -> Self {
        Self {
            name: name.into(),
            contract: None,
            address,
            constructor_args,
            tx_hash,
            deployed_at: Utc::now(),
            predicted_dependencies: BTreeMap::new(),
        }
    }

    pub fn with_predicted_dependencies(
        mut self,
        predictions: BTreeMap<String, PredictedAddress>,
    ) -> Self {
        self.predicted_dependencies = predictions;
        self
    }

    pub fn with_contract(mut self, contract: impl Into<String>) -> Self {
        let contract = contract.into();
        if contract != self.name {
            self.contract = Some(contract);
        }
        self
    }

    /// Name of the compiled artifact this record was deployed from.
    pub fn artifact(&self) -> &str {
        self.contract.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Serialize, Deserialize)]
struct LedgerDocument {
    network: String,
    #[serde(rename = "timestamp")]
    last_modified: DateTime<Utc>,
    #[serde(default)]
    contracts: BTreeMap<String, DeploymentRecord>,
}

/// Advisory lock on `<network>.json.lock`, held while a writable ledger is
/// open.
///
/// The lock belongs to the open file, so the OS releases it when the holder
/// exits, including on a crash or `SIGKILL`. The file itself is left in
/// place; its presence alone means nothing.
#[derive(Debug)]
struct LockGuard {
    _file: File,
}

impl LockGuard {
    fn acquire(path: PathBuf) -> Result<Self, LedgerError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| LedgerError::io(&path, e))?;
        if !try_lock_exclusive(&file).map_err(|e| LedgerError::io(&path, e))? {
            return Err(LedgerError::Locked { path });
        }
        // Holder pid, for operators.
        file.set_len(0)
            .and_then(|()| writeln!(file, "{}", std::process::id()))
            .map_err(|e| LedgerError::io(&path, e))?;
        debug!(path = %path.display(), "Acquired ledger lock");
        Ok(Self { _file: file })
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> std::io::Result<bool> {
    use std::os::fd::AsRawFd;

    // SAFETY: the descriptor is owned by `file` and open for the whole call.
    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(file: &File) -> std::io::Result<bool> {
    match file.try_lock() {
        Ok(()) => Ok(true),
        Err(std::fs::TryLockError::WouldBlock) => Ok(false),
        Err(std::fs::TryLockError::Error(err)) => Err(err),
    }
}

/// Per-network mapping from contract name to its deployment record.
///
/// Every [`append`](Self::append) rewrites the whole file before returning,
/// so a run interrupted at any point keeps everything deployed so far.
#[derive(Debug)]
pub struct DeploymentLedger {
    network: String,
    path: PathBuf,
    records: BTreeMap<String, DeploymentRecord>,
    last_modified: DateTime<Utc>,
    lock: Option<LockGuard>,
}

impl DeploymentLedger {
    pub fn path_for(dir: &Path, network: &str) -> PathBuf {
        dir.join(format!("{network}.json"))
    }

    /// Opens the ledger of `network` for writing, creating `dir` if needed.
    ///
    /// Fails with [`LedgerError::Locked`] while another writer holds it.
    pub fn open(dir: &Path, network: &str) -> Result<Self, LedgerError> {
        std::fs::create_dir_all(dir).map_err(|e| LedgerError::io(dir, e))?;
        let path = Self::path_for(dir, network);
        let lock = LockGuard::acquire(path.with_extension("json.lock"))?;
        let mut ledger = Self::load(path, network)?;
        ledger.lock = Some(lock);
        Ok(ledger)
    }

    /// Opens the ledger without taking the writer lock. Appending fails.
    pub fn open_read_only(dir: &Path, network: &str) -> Result<Self, LedgerError> {
        Self::load(Self::path_for(dir, network), network)
    }

    /// Reads `path`, or starts an empty ledger when the file does not exist.
    fn load(path: PathBuf, network: &str) -> Result<Self, LedgerError> {
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No ledger yet, starting empty");
                return Ok(Self {
                    network: network.to_owned(),
                    path,
                    records: BTreeMap::new(),
                    last_modified: Utc::now(),
                    lock: None,
                });
            }
            Err(err) => return Err(LedgerError::io(path, err)),
        };

        let document: LedgerDocument =
            serde_json::from_str(&raw).map_err(|e| LedgerError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        if document.network != network {
            return Err(LedgerError::NetworkMismatch {
                path,
                expected: network.to_owned(),
                found: document.network,
            });
        }

        let records = document
            .contracts
            .into_iter()
            .map(|(name, mut record)| {
                record.name.clone_from(&name);
                (name, record)
            })
            .collect();

        Ok(Self {
            network: document.network,
            path,
            records,
            last_modified: document.last_modified,
            lock: None,
        })
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    pub fn is_writable(&self) -> bool {
        self.lock.is_some()
    }

    pub fn has(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&DeploymentRecord> {
        self.records.get(name)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in deployment order (oldest first, ties broken by name).
    pub fn all(&self) -> Vec<&DeploymentRecord> {
        let mut records: Vec<_> = self.records.values().collect();
        records.sort_by(|a, b| {
            a.deployed_at
                .cmp(&b.deployed_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        records
    }

    /// Inserts or overwrites `record` and persists the ledger.
    ///
    /// If persisting fails the in-memory state is rolled back.
    pub fn append(&mut self, record: DeploymentRecord) -> Result<(), LedgerError> {
        if !self.is_writable() {
            return Err(LedgerError::ReadOnly);
        }
        let previous_modified = self.last_modified;
        let name = record.name.clone();
        let previous = self.records.insert(name.clone(), record);
        self.last_modified = Utc::now();

        if let Err(err) = self.save() {
            match previous {
                Some(previous) => self.records.insert(name, previous),
                None => self.records.remove(&name),
            };
            self.last_modified = previous_modified;
            return Err(err);
        }
        Ok(())
    }

    /// Writes the ledger to a temporary file next to the target and renames
    /// it into place.
    pub fn save(&self) -> Result<(), LedgerError> {
        if !self.is_writable() {
            return Err(LedgerError::ReadOnly);
        }
        let document = LedgerDocument {
            network: self.network.clone(),
            last_modified: self.last_modified,
            contracts: self.records.clone(),
        };
        let json = serde_json::to_string_pretty(&document)?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| LedgerError::io(dir, e))?;
        tmp.write_all(json.as_bytes())
            .and_then(|()| tmp.write_all(b"\n"))
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| LedgerError::io(tmp.path(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| LedgerError::io(&self.path, e.error))?;

        debug!(path = %self.path.display(), records = self.records.len(), "Persisted ledger");
        Ok(())
    }
}
