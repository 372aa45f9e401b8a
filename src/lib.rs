//! Exclusive CPU pinning for guaranteed containers on one node.
//!
//! A [`Manager`] owns the pool of pinnable CPUs. The admission side asks it
//! for NUMA [`TopologyHint`]s before a pod lands; the container lifecycle
//! side asks it to [`Manager::allocate`] and [`Manager::remove_container`].
//! Every change is checkpointed before the call returns.

pub type ConstString = Box<str>;

pub mod bitmask;
pub mod checkpoint;
pub mod config;
pub mod cpuset;
pub mod enforce;
pub mod error;
pub mod hint;
pub mod manager;
pub mod pod;
pub mod policy;
pub mod state;
pub mod topology;

pub use bitmask::{NumaMask, NumaMaskIter};
pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use config::CpuManagerConfig;
pub use cpuset::CpuSet;
pub use enforce::{CpuSetEnforcer, ThreadAffinityEnforcer};
pub use error::{CpuManagerError, Result};
pub use hint::{ResourceHints, TopologyHint, RESOURCE_CPU};
pub use manager::Manager;
pub use pod::{Container, Pod, QosClass};
pub use policy::{NonePolicy, Policy, PolicyKind, StaticPolicy};
pub use state::{CheckpointState, MemoryState, PolicyState, State};
pub use topology::{CoreInventory, CpuTopology, MachineInventory, NumaNodeInventory, SocketInventory};
