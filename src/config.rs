use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cpuset::CpuSet;
use crate::error::{CpuManagerError, Result};
use crate::policy::{take_by_topology, PolicyKind};
use crate::topology::CpuTopology;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuManagerConfig {
    pub policy: PolicyKind,
    /// Explicit CPUs kept out of the pinning pool, in range notation.
    pub reserved_cpus: Option<CpuSet>,
    /// Number of CPUs to reserve when `reserved_cpus` is not given.
    pub num_reserved_cpus: usize,
    /// Directory holding the checkpoint file.
    pub state_dir: PathBuf,
    pub checkpoint_name: String,
}

impl Default for CpuManagerConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::None,
            reserved_cpus: None,
            num_reserved_cpus: 0,
            state_dir: PathBuf::from("/var/lib/corepin"),
            checkpoint_name: "cpu_manager_state".to_string(),
        }
    }
}

impl CpuManagerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// The CPUs to keep out of the pool on `topology`.
    ///
    /// An explicit set wins; otherwise `num_reserved_cpus` CPUs are picked
    /// from the whole machine the same way container CPUs are.
    ///
    /// # Errors
    ///
    /// Returns [`CpuManagerError::InvalidConfiguration`] if the explicit set
    /// has offline CPUs, disagrees with a non-zero `num_reserved_cpus`, or
    /// the count exceeds the machine.
    pub fn resolve_reserved(&self, topology: &CpuTopology) -> Result<CpuSet> {
        let online = topology.cpus();
        match &self.reserved_cpus {
            Some(reserved) => {
                if !reserved.is_subset_of(&online) {
                    return Err(CpuManagerError::InvalidConfiguration(format!(
                        "reserved cpus {reserved} are not a subset of online cpus {online}"
                    )));
                }
                if self.num_reserved_cpus != 0 && self.num_reserved_cpus != reserved.len() {
                    return Err(CpuManagerError::InvalidConfiguration(format!(
                        "reserved cpus {reserved} hold {} cpus but num_reserved_cpus is {}",
                        reserved.len(),
                        self.num_reserved_cpus
                    )));
                }
                Ok(reserved.clone())
            }
            None if self.num_reserved_cpus > online.len() => {
                Err(CpuManagerError::InvalidConfiguration(format!(
                    "cannot reserve {} cpus on a machine with {}",
                    self.num_reserved_cpus,
                    online.len()
                )))
            }
            None => take_by_topology(topology, &online, self.num_reserved_cpus),
        }
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.state_dir.join(&self.checkpoint_name)
    }
}
