//! Allocation policies.
//!
//! A policy decides which CPUs a container gets and which NUMA placements
//! it can live with. The `none` policy never pins; the `static` policy
//! hands out exclusive CPUs chosen by topology.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cpuset::CpuSet;
use crate::error::Result;
use crate::hint::{merge_container_hints, TopologyHint};
use crate::pod::{Container, Pod};
use crate::state::State;
use crate::topology::CpuTopology;

mod cpu_assignment;
mod none;
mod static_policy;

pub use cpu_assignment::take_by_topology;
pub use none::NonePolicy;
pub use static_policy::StaticPolicy;

/// Which policy manages the pool. The name is recorded in the checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    #[default]
    None,
    Static,
}

impl PolicyKind {
    pub fn name(self) -> &'static str {
        match self {
            PolicyKind::None => "none",
            PolicyKind::Static => "static",
        }
    }

    /// Builds the policy for `topology` with `reserved` kept out of the pool.
    pub fn build(self, topology: Arc<CpuTopology>, reserved: CpuSet) -> Result<Box<dyn Policy>> {
        Ok(match self {
            PolicyKind::None => Box::new(NonePolicy::new(&topology)),
            PolicyKind::Static => Box::new(StaticPolicy::new(topology, reserved)?),
        })
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub trait Policy: Send + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Initializes a fresh state or validates a restored one.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CpuManagerError::StateInvariantViolation`] if the
    /// restored state does not fit this policy and machine.
    fn start(&mut self, state: &mut dyn State) -> Result<()>;

    /// Gives `container` of `pod` the exclusive CPUs it qualifies for.
    ///
    /// Returns the existing set if the container already has one, and
    /// `None` when nothing is pinned. The caller guarantees that a removed
    /// container is never allocated again under the same pod and name.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CpuManagerError::Allocation`] when the pool is too
    /// small, or a persistence error; the state is unchanged in both cases.
    fn allocate(
        &mut self,
        state: &mut dyn State,
        pod: &Pod,
        container: &Container,
    ) -> Result<Option<CpuSet>>;

    /// Returns the container's CPUs to the pool. A no-op if it has none.
    ///
    /// # Errors
    ///
    /// Returns a persistence error; the state is unchanged in that case.
    fn remove_container(
        &mut self,
        state: &mut dyn State,
        pod_uid: &str,
        container: &str,
    ) -> Result<Option<CpuSet>>;

    /// NUMA placements able to hold what `container` of `pod` requests.
    fn get_topology_hints(
        &self,
        state: &dyn State,
        pod: &Pod,
        container: &Container,
    ) -> Option<Vec<TopologyHint>>;

    /// Placements every exclusive container of `pod` can live with.
    fn get_pod_topology_hints(&self, state: &dyn State, pod: &Pod) -> Option<Vec<TopologyHint>> {
        merge_pod_hints(self, state, pod)
    }
}

/// Per-container hints of `pod` intersected by mask. Containers with no
/// exclusive CPUs do not constrain the result.
fn merge_pod_hints<P: Policy + ?Sized>(
    policy: &P,
    state: &dyn State,
    pod: &Pod,
) -> Option<Vec<TopologyHint>> {
    merge_container_hints(
        pod.all_containers()
            .filter(|c| pod.guaranteed_cpus(c) > 0)
            .map(|c| policy.get_topology_hints(state, pod, c)),
    )
}
