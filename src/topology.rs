//! # CPU Topology
//!
//! Static NUMA node → socket → core → thread hierarchy, built once from a
//! hardware inventory and read-only afterwards.
//!
//! Core ids in the inventory are only unique within their socket, so the
//! topology identifies a core by its lowest thread id, which is unique
//! machine-wide.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::bitmask::MAX_NUMA_NODES;
use crate::cpuset::CpuSet;
use crate::error::{CpuManagerError, Result};

/// Hardware inventory supplied by the caller, usually read from sysfs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInventory {
    pub numa_nodes: Vec<NumaNodeInventory>,
    pub sockets: Vec<SocketInventory>,
}

/// A NUMA node and the sockets it contains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumaNodeInventory {
    pub id: usize,
    pub sockets: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketInventory {
    pub id: usize,
    pub cores: Vec<CoreInventory>,
}

/// A physical core and its hyper-thread siblings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreInventory {
    pub id: usize,
    pub threads: Vec<usize>,
}

/// Where a logical CPU sits in the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuInfo {
    pub numa_node: usize,
    pub socket: usize,
    /// Lowest thread id of the owning core.
    pub core: usize,
}

/// Reverse lookup from logical CPU to its location, with set queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuDetails(BTreeMap<usize, CpuInfo>);

impl CpuDetails {
    pub fn get(&self, cpu: usize) -> Option<&CpuInfo> {
        self.0.get(&cpu)
    }

    /// Restricts the details to the CPUs in `cpus`.
    #[must_use]
    pub fn keep_only(&self, cpus: &CpuSet) -> CpuDetails {
        CpuDetails(
            self.0
                .iter()
                .filter(|(cpu, _)| cpus.contains(**cpu))
                .map(|(cpu, info)| (*cpu, *info))
                .collect(),
        )
    }

    pub fn cpus(&self) -> CpuSet {
        self.0.keys().copied().collect()
    }

    pub fn numa_nodes(&self) -> BTreeSet<usize> {
        self.0.values().map(|info| info.numa_node).collect()
    }

    pub fn sockets(&self) -> BTreeSet<usize> {
        self.0.values().map(|info| info.socket).collect()
    }

    pub fn cores(&self) -> BTreeSet<usize> {
        self.0.values().map(|info| info.core).collect()
    }

    pub fn cores_in_sockets(&self, sockets: &[usize]) -> BTreeSet<usize> {
        self.0
            .values()
            .filter(|info| sockets.contains(&info.socket))
            .map(|info| info.core)
            .collect()
    }

    pub fn cpus_in_numa_nodes(&self, nodes: &[usize]) -> CpuSet {
        self.cpus_where(|info| nodes.contains(&info.numa_node))
    }

    pub fn cpus_in_sockets(&self, sockets: &[usize]) -> CpuSet {
        self.cpus_where(|info| sockets.contains(&info.socket))
    }

    pub fn cpus_in_cores(&self, cores: &[usize]) -> CpuSet {
        self.cpus_where(|info| cores.contains(&info.core))
    }

    fn cpus_where(&self, predicate: impl Fn(&CpuInfo) -> bool) -> CpuSet {
        self.0
            .iter()
            .filter(|(_, info)| predicate(info))
            .map(|(cpu, _)| *cpu)
            .collect()
    }
}

/// The machine's CPU topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuTopology {
    num_cpus: usize,
    num_cores: usize,
    num_sockets: usize,
    num_numa_nodes: usize,
    details: CpuDetails,
}

impl CpuTopology {
    /// Validates `inventory` and builds the topology.
    ///
    /// # Errors
    ///
    /// Returns [`CpuManagerError::TopologyDiscovery`] when a CPU is listed
    /// under more than one core, a core has no threads, a socket is
    /// referenced by no node or by an undefined id, or an id is repeated.
    pub fn discover(inventory: &MachineInventory) -> Result<Self> {
        let fail = |msg: String| Err(CpuManagerError::TopologyDiscovery(msg));

        if inventory.numa_nodes.is_empty() {
            return fail("inventory lists no NUMA nodes".to_string());
        }

        let mut socket_to_node = BTreeMap::new();
        for node in &inventory.numa_nodes {
            if node.id >= MAX_NUMA_NODES {
                return fail(format!(
                    "NUMA node id {} exceeds the supported maximum of {}",
                    node.id,
                    MAX_NUMA_NODES - 1
                ));
            }
            if inventory.numa_nodes.iter().filter(|n| n.id == node.id).count() > 1 {
                return fail(format!("NUMA node {} is defined more than once", node.id));
            }
            if node.sockets.is_empty() {
                return fail(format!("NUMA node {} lists no sockets", node.id));
            }
            for &socket in &node.sockets {
                if let Some(other) = socket_to_node.insert(socket, node.id) {
                    return fail(format!(
                        "socket {socket} is referenced by NUMA nodes {other} and {}",
                        node.id
                    ));
                }
            }
        }

        let mut details = BTreeMap::new();
        let mut num_cores = 0;
        let mut defined_sockets = BTreeSet::new();
        for socket in &inventory.sockets {
            if !defined_sockets.insert(socket.id) {
                return fail(format!("socket {} is defined more than once", socket.id));
            }
            let Some(&numa_node) = socket_to_node.get(&socket.id) else {
                return fail(format!(
                    "socket {} is not referenced by any NUMA node",
                    socket.id
                ));
            };
            let mut core_ids = BTreeSet::new();
            for core in &socket.cores {
                if !core_ids.insert(core.id) {
                    return fail(format!(
                        "core {} is defined more than once in socket {}",
                        core.id, socket.id
                    ));
                }
                let Some(&core_key) = core.threads.iter().min() else {
                    return fail(format!("core {} in socket {} has no threads", core.id, socket.id));
                };
                for &cpu in &core.threads {
                    let info = CpuInfo {
                        numa_node,
                        socket: socket.id,
                        core: core_key,
                    };
                    if details.insert(cpu, info).is_some() {
                        return fail(format!("cpu {cpu} appears under more than one core"));
                    }
                }
                num_cores += 1;
            }
        }

        if let Some(socket) = socket_to_node.keys().find(|s| !defined_sockets.contains(s)) {
            return fail(format!("socket {socket} is referenced but never defined"));
        }
        if details.is_empty() {
            return fail("inventory lists no CPUs".to_string());
        }

        Ok(Self {
            num_cpus: details.len(),
            num_cores,
            num_sockets: defined_sockets.len(),
            num_numa_nodes: inventory.numa_nodes.len(),
            details: CpuDetails(details),
        })
    }

    pub fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    pub fn num_cores(&self) -> usize {
        self.num_cores
    }

    pub fn num_sockets(&self) -> usize {
        self.num_sockets
    }

    pub fn num_numa_nodes(&self) -> usize {
        self.num_numa_nodes
    }

    pub fn cpus_per_core(&self) -> usize {
        self.num_cpus / self.num_cores.max(1)
    }

    pub fn cpus_per_socket(&self) -> usize {
        self.num_cpus / self.num_sockets.max(1)
    }

    pub fn cpus_per_numa_node(&self) -> usize {
        self.num_cpus / self.num_numa_nodes.max(1)
    }

    pub fn details(&self) -> &CpuDetails {
        &self.details
    }

    /// All online CPUs.
    pub fn cpus(&self) -> CpuSet {
        self.details.cpus()
    }

    /// NUMA node ids, ascending.
    pub fn numa_node_ids(&self) -> Vec<usize> {
        self.details.numa_nodes().into_iter().collect()
    }

    /// One-line description for startup logs.
    pub fn summary(&self) -> String {
        format!(
            "{} NUMA nodes, {} sockets, {} cores, {} CPUs",
            self.num_numa_nodes, self.num_sockets, self.num_cores, self.num_cpus
        )
    }
}
