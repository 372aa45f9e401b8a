//! The `static` policy: exclusive CPUs for guaranteed containers.
//!
//! The pinnable pool is every online CPU except the reserved ones. A
//! container's CPUs leave the default pool when it is allocated and return
//! when it is removed, and every commit is checked against the partition
//! invariant before it is written.

use std::sync::Arc;

use tracing::{debug, info};

use crate::bitmask::{NumaMask, NumaMaskIter};
use crate::cpuset::CpuSet;
use crate::error::{CpuManagerError, Result};
use crate::hint::TopologyHint;
use crate::pod::{Container, Pod};
use crate::policy::{merge_pod_hints, take_by_topology, Policy};
use crate::state::{PolicyState, State};
use crate::topology::CpuTopology;

#[derive(Debug, Clone)]
pub struct StaticPolicy {
    topology: Arc<CpuTopology>,
    reserved: CpuSet,
    /// Online minus reserved.
    pinnable: CpuSet,
    /// Every NUMA node combination of the machine, narrowest first.
    masks: NumaMaskIter,
}

impl StaticPolicy {
    pub const NAME: &'static str = "static";

    /// Fails if `reserved` contains CPUs that are not online.
    pub fn new(topology: Arc<CpuTopology>, reserved: CpuSet) -> Result<Self> {
        let online = topology.cpus();
        if !reserved.is_subset_of(&online) {
            return Err(CpuManagerError::InvalidConfiguration(format!(
                "reserved cpus {} are not a subset of online cpus {}",
                reserved, online
            )));
        }
        let masks = NumaMask::iterate(&topology.numa_node_ids())?;
        info!(reserved = %reserved, "static policy reserving cpus");
        Ok(Self {
            pinnable: online.difference(&reserved),
            topology,
            reserved,
            masks,
        })
    }

    pub fn reserved(&self) -> &CpuSet {
        &self.reserved
    }

    pub fn pinnable(&self) -> &CpuSet {
        &self.pinnable
    }

    /// CPUs of `cpus` that sit on the nodes of `mask`.
    fn cpus_in_mask(&self, cpus: &CpuSet, mask: NumaMask) -> CpuSet {
        let details = self.topology.details();
        cpus.filter(|cpu| details.get(cpu).is_some_and(|info| mask.is_set(info.numa_node)))
    }

    /// Narrowest mask whose part of `pool` can hold `requested` CPUs; among
    /// equally narrow masks the one with the most free CPUs.
    fn pick_numa_affinity(&self, pool: &CpuSet, requested: usize) -> Option<NumaMask> {
        self.masks
            .clone()
            .map(|mask| (mask, self.cpus_in_mask(pool, mask).len()))
            .filter(|(_, free)| *free >= requested)
            .min_by(|(a, free_a), (b, free_b)| {
                a.count()
                    .cmp(&b.count())
                    .then_with(|| free_b.cmp(free_a))
                    .then_with(|| a.bits().cmp(&b.bits()))
            })
            .map(|(mask, _)| mask)
    }

    /// Emits a hint for every mask whose part of `available` can hold
    /// `request` CPUs.
    ///
    /// A hint is preferred when its mask has as few nodes as the narrowest
    /// mask whose total capacity, free or not, could hold the request.
    fn generate_cpu_topology_hints(&self, available: &CpuSet, request: usize) -> Vec<TopologyHint> {
        let details = self.topology.details();
        let mut min_affinity_size = self.topology.num_numa_nodes();
        let mut hints = Vec::new();

        for mask in self.masks.clone() {
            let capacity = details.cpus_in_numa_nodes(&mask.nodes()).len();
            if capacity >= request && mask.count() < min_affinity_size {
                min_affinity_size = mask.count();
            }
            if self.cpus_in_mask(available, mask).len() >= request {
                hints.push(TopologyHint::new(mask, false));
            }
        }

        for hint in &mut hints {
            hint.preferred = hint.numa_node_affinity.count() == min_affinity_size;
        }
        hints
    }

    /// CPUs held by the pod's init containers other than `container`.
    ///
    /// Init containers run one at a time and finish before the main
    /// containers start, so the next container of the pod may take them.
    fn reusable_cpus(&self, state: &dyn State, pod: &Pod, container: &Container) -> CpuSet {
        let current = state.policy_state();
        CpuSet::new().union_all(
            pod.init_containers
                .iter()
                .filter(|init| init.name != container.name)
                .filter_map(|init| current.get(&pod.uid, &init.name)),
        )
    }

    fn commit(&self, state: &mut dyn State, next: PolicyState) -> Result<()> {
        next.validate(&self.pinnable)?;
        state.commit(next)
    }
}

impl Policy for StaticPolicy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn start(&mut self, state: &mut dyn State) -> Result<()> {
        let current = state.policy_state();
        if current.is_empty() {
            info!(default_cpu_set = %self.pinnable, "initializing empty state");
            let fresh = PolicyState {
                default_cpu_set: self.pinnable.clone(),
                assignments: Default::default(),
            };
            return self.commit(state, fresh);
        }

        let assigned = current.assigned_cpus();
        if !assigned.is_subset_of(&self.pinnable) {
            return Err(CpuManagerError::StateInvariantViolation(format!(
                "restored assignments use cpus {} outside the pinnable set {}",
                assigned.difference(&self.pinnable),
                self.pinnable
            )));
        }
        let expected_default = self.pinnable.difference(&assigned);
        if current.default_cpu_set != expected_default {
            return Err(CpuManagerError::StateInvariantViolation(format!(
                "restored default cpu set {} does not match expected {}",
                current.default_cpu_set, expected_default
            )));
        }
        current.validate(&self.pinnable)?;
        info!(
            default_cpu_set = %current.default_cpu_set,
            pods = current.assignments.len(),
            "validated restored state"
        );
        Ok(())
    }

    fn allocate(
        &mut self,
        state: &mut dyn State,
        pod: &Pod,
        container: &Container,
    ) -> Result<Option<CpuSet>> {
        let (pod_uid, name) = (&*pod.uid, &*container.name);
        if let Some(existing) = state.get_cpu_set(pod_uid, name) {
            debug!(pod = pod_uid, container = name, cpus = %existing, "container already has cpus");
            return Ok(Some(existing));
        }
        let requested = pod.guaranteed_cpus(container);
        if requested == 0 {
            return Ok(None);
        }

        let free = state.get_default_cpu_set();
        let reusable = self.reusable_cpus(state, pod, container);
        let pool = free.union(&reusable);
        let Some(affinity) = self.pick_numa_affinity(&pool, requested) else {
            return Err(CpuManagerError::Allocation {
                requested,
                available: pool.len(),
            });
        };

        let reusable = self.cpus_in_mask(&reusable, affinity);
        let reused = take_by_topology(&self.topology, &reusable, requested.min(reusable.len()))?;
        let fresh = take_by_topology(
            &self.topology,
            &self.cpus_in_mask(&free, affinity),
            requested - reused.len(),
        )?;
        let cpus = reused.union(&fresh);

        let next = state
            .policy_state()
            .without_pod_cpus(pod_uid, &reused)
            .with_assignment(pod_uid, name, cpus.clone());
        self.commit(state, next)?;
        debug!(
            pod = pod_uid,
            container = name,
            cpus = %cpus,
            reused = %reused,
            numa_affinity = %affinity,
            "allocated exclusive cpus"
        );
        Ok(Some(cpus))
    }

    fn remove_container(
        &mut self,
        state: &mut dyn State,
        pod_uid: &str,
        container: &str,
    ) -> Result<Option<CpuSet>> {
        let Some((next, released)) = state.policy_state().without_assignment(pod_uid, container) else {
            return Ok(None);
        };
        self.commit(state, next)?;
        debug!(pod = pod_uid, container, cpus = %released, "released exclusive cpus");
        Ok(Some(released))
    }

    fn get_topology_hints(
        &self,
        state: &dyn State,
        pod: &Pod,
        container: &Container,
    ) -> Option<Vec<TopologyHint>> {
        let (pod_uid, name) = (&*pod.uid, &*container.name);
        let requested = pod.guaranteed_cpus(container);
        if let Some(allocated) = state.get_cpu_set(pod_uid, name) {
            if allocated.len() != requested {
                debug!(
                    pod = pod_uid,
                    container = name,
                    allocated = allocated.len(),
                    requested,
                    "request differs from existing allocation, no new hints"
                );
                return Some(Vec::new());
            }
            return Some(self.generate_cpu_topology_hints(&allocated, requested));
        }
        if requested == 0 {
            return None;
        }

        let available = state
            .get_default_cpu_set()
            .union(&self.reusable_cpus(state, pod, container));
        let hints = self.generate_cpu_topology_hints(&available, requested);
        debug!(pod = pod_uid, container = name, requested, hints = hints.len(), "computed topology hints");
        if hints.is_empty() {
            None
        } else {
            Some(hints)
        }
    }

    /// Per-container hints intersected, then narrowed to masks that can
    /// hold the whole pod at once.
    fn get_pod_topology_hints(&self, state: &dyn State, pod: &Pod) -> Option<Vec<TopologyHint>> {
        let hints = merge_pod_hints(self, state, pod)?;
        if hints.is_empty() {
            return Some(hints);
        }

        let total = pod.guaranteed_cpus_total();
        let held = state
            .policy_state()
            .assignments
            .get(&*pod.uid)
            .map(|containers| CpuSet::new().union_all(containers.values()))
            .unwrap_or_default();
        let capacity = state.get_default_cpu_set().union(&held);
        let hints: Vec<_> = hints
            .into_iter()
            .filter(|hint| self.cpus_in_mask(&capacity, hint.numa_node_affinity).len() >= total)
            .collect();
        debug!(pod = %pod.uid, total, hints = hints.len(), "computed pod topology hints");
        if hints.is_empty() {
            None
        } else {
            Some(hints)
        }
    }
}
