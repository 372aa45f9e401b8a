//! # Checkpoint Persistence
//!
//! Wire formats for the policy state and the stores that hold them.
//!
//! ## Formats
//!
//! ```text
//! current: {"policyName": "static", "defaultCpuSet": "2-11",
//!           "entries": {"<pod>": {"<container>": "0-1"}}, "checksum": 123}
//! legacy:  {"policyName": "static", "defaultCpuSet": "2-11",
//!           "entries": {"<pod>/<container>": "0-1"}, "checksum": 123}
//! ```
//!
//! The checksum is CRC32C over the compact JSON encoding of every other
//! field. Maps are ordered, so the encoding is canonical. The legacy format
//! is only ever read; decoding falls back to it when the current format
//! does not parse.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cpuset::CpuSet;
use crate::error::{CpuManagerError, Result};
use crate::state::{ContainerCpuAssignments, PolicyState};

/// Current on-disk layout: nested pod → container → CPU range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuManagerCheckpoint {
    pub policy_name: String,
    pub default_cpu_set: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub entries: BTreeMap<String, BTreeMap<String, String>>,
    pub checksum: u64,
}

/// Fields covered by the checksum of [`CpuManagerCheckpoint`].
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChecksumView<'a, E: Serialize> {
    policy_name: &'a str,
    default_cpu_set: &'a str,
    entries: &'a E,
}

fn checksum_of<E: Serialize>(policy_name: &str, default_cpu_set: &str, entries: &E) -> Result<u64> {
    let view = ChecksumView {
        policy_name,
        default_cpu_set,
        entries,
    };
    let bytes = serde_json::to_vec(&view)?;
    Ok(u64::from(crc32c::crc32c(&bytes)))
}

impl CpuManagerCheckpoint {
    /// Projects `state` and seals it with a checksum.
    ///
    /// # Errors
    ///
    /// Returns [`CpuManagerError::Json`] if the content cannot be encoded.
    pub fn from_state(policy_name: &str, state: &PolicyState) -> Result<Self> {
        let entries = state
            .assignments
            .iter()
            .map(|(pod, containers)| {
                let containers = containers
                    .iter()
                    .map(|(name, cpus)| (name.to_string(), cpus.to_string()))
                    .collect();
                (pod.to_string(), containers)
            })
            .collect();
        let mut checkpoint = Self {
            policy_name: policy_name.to_string(),
            default_cpu_set: state.default_cpu_set.to_string(),
            entries,
            checksum: 0,
        };
        checkpoint.checksum = checkpoint.compute_checksum()?;
        Ok(checkpoint)
    }

    fn compute_checksum(&self) -> Result<u64> {
        checksum_of(&self.policy_name, &self.default_cpu_set, &self.entries)
    }

    /// Verifies the checksum recorded under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CpuManagerError::ChecksumMismatch`] on mismatch.
    pub fn verify_checksum(&self, name: &str) -> Result<()> {
        let computed = self.compute_checksum()?;
        if computed != self.checksum {
            return Err(CpuManagerError::ChecksumMismatch {
                name: name.to_string(),
                recorded: self.checksum,
                computed,
            });
        }
        Ok(())
    }

    /// Parses the range strings back into a [`PolicyState`].
    ///
    /// # Errors
    ///
    /// Returns [`CpuManagerError::InvalidCpuSet`] for malformed ranges.
    pub fn to_state(&self) -> Result<PolicyState> {
        let mut assignments = ContainerCpuAssignments::new();
        for (pod, containers) in &self.entries {
            let pod_entry = assignments.entry(pod.as_str().into()).or_default();
            for (name, cpus) in containers {
                pod_entry.insert(name.as_str().into(), CpuSet::parse(cpus)?);
            }
        }
        Ok(PolicyState {
            default_cpu_set: CpuSet::parse(&self.default_cpu_set)?,
            assignments,
        })
    }

    /// Compact JSON for storage.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Legacy flat layout keyed by `"<pod>/<container>"`. Read-only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyCheckpoint {
    pub policy_name: String,
    pub default_cpu_set: String,
    #[serde(default)]
    pub entries: BTreeMap<String, String>,
    pub checksum: u64,
}

impl LegacyCheckpoint {
    fn verify_checksum(&self, name: &str) -> Result<()> {
        let computed = checksum_of(&self.policy_name, &self.default_cpu_set, &self.entries)?;
        if computed != self.checksum {
            return Err(CpuManagerError::ChecksumMismatch {
                name: name.to_string(),
                recorded: self.checksum,
                computed,
            });
        }
        Ok(())
    }

    /// Splits the flat keys into the nested layout.
    fn upgrade(self, name: &str) -> Result<CpuManagerCheckpoint> {
        let mut entries: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for (key, cpus) in self.entries {
            let Some((pod, container)) = key.split_once('/') else {
                return Err(CpuManagerError::CorruptCheckpoint {
                    name: name.to_string(),
                    reason: format!("legacy entry key {key:?} is not <pod>/<container>"),
                });
            };
            entries
                .entry(pod.to_string())
                .or_default()
                .insert(container.to_string(), cpus);
        }
        let mut checkpoint = CpuManagerCheckpoint {
            policy_name: self.policy_name,
            default_cpu_set: self.default_cpu_set,
            entries,
            checksum: 0,
        };
        checkpoint.checksum = checkpoint.compute_checksum()?;
        Ok(checkpoint)
    }
}

/// Which format a blob decoded as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedCheckpoint {
    Current(CpuManagerCheckpoint),
    Legacy(LegacyCheckpoint),
}

impl DecodedCheckpoint {
    /// Tries the current format, then the legacy one.
    ///
    /// # Errors
    ///
    /// Returns [`CpuManagerError::CorruptCheckpoint`] if neither parses.
    pub fn decode(name: &str, blob: &[u8]) -> Result<Self> {
        match serde_json::from_slice::<CpuManagerCheckpoint>(blob) {
            Ok(current) => Ok(Self::Current(current)),
            Err(current_err) => match serde_json::from_slice::<LegacyCheckpoint>(blob) {
                Ok(legacy) => Ok(Self::Legacy(legacy)),
                Err(_) => Err(CpuManagerError::CorruptCheckpoint {
                    name: name.to_string(),
                    reason: current_err.to_string(),
                }),
            },
        }
    }

    /// Checks integrity and returns the checkpoint in the current layout.
    ///
    /// # Errors
    ///
    /// Returns [`CpuManagerError::ChecksumMismatch`] when the recorded
    /// checksum does not match the content as it was written.
    pub fn into_current(self, name: &str) -> Result<CpuManagerCheckpoint> {
        match self {
            Self::Current(current) => {
                current.verify_checksum(name)?;
                Ok(current)
            }
            Self::Legacy(legacy) => {
                legacy.verify_checksum(name)?;
                warn!(checkpoint = name, "migrating legacy flat checkpoint to nested format");
                legacy.upgrade(name)
            }
        }
    }
}

/// Named, atomically replaced blobs.
pub trait CheckpointStore: Send {
    /// Replaces the blob stored under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CpuManagerError::Io`] if the blob could not be made durable.
    fn save(&self, name: &str, blob: &[u8]) -> Result<()>;

    /// Returns the blob stored under `name`, or `Ok(None)` on first run.
    ///
    /// # Errors
    ///
    /// Returns [`CpuManagerError::Io`] on read failure.
    fn restore(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Removes the blob stored under `name`. Missing blobs are not an error.
    ///
    /// # Errors
    ///
    /// Returns [`CpuManagerError::Io`] on failure.
    fn remove(&self, name: &str) -> Result<()>;
}

/// Fsync a file so its contents are durable.
fn sync_file(path: &Path) -> std::io::Result<()> {
    let f = std::fs::OpenOptions::new().write(true).open(path)?;
    f.sync_all()
}

/// Fsync a directory so a rename into it is durable.
#[allow(clippy::unnecessary_wraps)]
fn sync_dir(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let f = std::fs::File::open(path)?;
        f.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Stores each checkpoint as a file in one directory.
///
/// Writes go to `<name>.tmp`, are synced, then renamed over `<name>`, so a
/// reader sees either the old or the new blob.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// The directory is created lazily on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, name: &str, blob: &[u8]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(name);
        let tmp = self.dir.join(format!("{name}.tmp"));
        std::fs::write(&tmp, blob)?;
        sync_file(&tmp)?;
        std::fs::rename(&tmp, &path)?;
        sync_dir(&self.dir)?;
        Ok(())
    }

    fn restore(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path_for(name)) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, name: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for(name)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// In-memory store, for tests and for embedding without a disk.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, name: &str, blob: &[u8]) -> Result<()> {
        self.blobs.lock().insert(name.to_string(), blob.to_vec());
        Ok(())
    }

    fn restore(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().get(name).cloned())
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.blobs.lock().remove(name);
        Ok(())
    }
}

impl<T: CheckpointStore + Sync> CheckpointStore for std::sync::Arc<T> {
    fn save(&self, name: &str, blob: &[u8]) -> Result<()> {
        (**self).save(name, blob)
    }

    fn restore(&self, name: &str) -> Result<Option<Vec<u8>>> {
        (**self).restore(name)
    }

    fn remove(&self, name: &str) -> Result<()> {
        (**self).remove(name)
    }
}
