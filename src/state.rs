//! # Policy State
//!
//! The authoritative map of pod → container → exclusive CPUs plus the shared
//! default pool. Every change goes through [`State::commit`] with a complete
//! next state, so a container's set is replaced whole or not at all and
//! the checkpoint-backed store can write through before the change becomes
//! visible.

use std::collections::BTreeMap;

use tracing::{debug, error, info};

use crate::checkpoint::{CheckpointStore, CpuManagerCheckpoint, DecodedCheckpoint};
use crate::cpuset::CpuSet;
use crate::error::{CpuManagerError, Result};
use crate::ConstString;

/// pod id → container name → exclusive CPUs.
pub type ContainerCpuAssignments = BTreeMap<ConstString, BTreeMap<ConstString, CpuSet>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyState {
    /// Unassigned pinnable CPUs, shared by non-exclusive containers.
    pub default_cpu_set: CpuSet,
    pub assignments: ContainerCpuAssignments,
}

impl PolicyState {
    pub fn get(&self, pod_uid: &str, container: &str) -> Option<&CpuSet> {
        self.assignments.get(pod_uid)?.get(container)
    }

    /// Whether nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.default_cpu_set.is_empty() && self.assignments.is_empty()
    }

    /// Union of every exclusive assignment.
    pub fn assigned_cpus(&self) -> CpuSet {
        CpuSet::new().union_all(self.assignments.values().flat_map(|containers| containers.values()))
    }

    /// Next state with `cpus` moved from the default pool to the container.
    #[must_use]
    pub fn with_assignment(&self, pod_uid: &str, container: &str, cpus: CpuSet) -> PolicyState {
        let mut next = self.clone();
        next.default_cpu_set = next.default_cpu_set.difference(&cpus);
        next.assignments
            .entry(pod_uid.into())
            .or_default()
            .insert(container.into(), cpus);
        next
    }

    /// Next state with the container's CPUs returned to the default pool,
    /// together with the released set. `None` if nothing is assigned.
    #[must_use]
    pub fn without_assignment(&self, pod_uid: &str, container: &str) -> Option<(PolicyState, CpuSet)> {
        let mut next = self.clone();
        let containers = next.assignments.get_mut(pod_uid)?;
        let released = containers.remove(container)?;
        if containers.is_empty() {
            next.assignments.remove(pod_uid);
        }
        next.default_cpu_set = next.default_cpu_set.union(&released);
        Some((next, released))
    }

    /// Next state with `cpus` taken away from every container of the pod,
    /// without returning them to the default pool. Containers left with no
    /// CPUs lose their entry.
    #[must_use]
    pub fn without_pod_cpus(&self, pod_uid: &str, cpus: &CpuSet) -> PolicyState {
        let mut next = self.clone();
        if let Some(containers) = next.assignments.get_mut(pod_uid) {
            for set in containers.values_mut() {
                *set = set.difference(cpus);
            }
            containers.retain(|_, set| !set.is_empty());
            if containers.is_empty() {
                next.assignments.remove(pod_uid);
            }
        }
        next
    }

    /// Checks that assignments and the default pool partition `pinnable`.
    ///
    /// # Errors
    ///
    /// Returns [`CpuManagerError::StateInvariantViolation`] describing the
    /// first overlap or gap found.
    pub fn validate(&self, pinnable: &CpuSet) -> Result<()> {
        let violation = |msg: String| Err(CpuManagerError::StateInvariantViolation(msg));

        let mut seen = self.default_cpu_set.clone();
        for (pod, containers) in &self.assignments {
            for (container, cpus) in containers {
                if cpus.is_empty() {
                    return violation(format!("pod {pod} container {container} has an empty cpu set"));
                }
                let overlap = seen.intersection(cpus);
                if !overlap.is_empty() {
                    return violation(format!(
                        "cpus {overlap} of pod {pod} container {container} are also in the default pool or another assignment"
                    ));
                }
                seen = seen.union(cpus);
            }
        }
        if seen != *pinnable {
            return violation(format!(
                "default pool and assignments cover {seen}, expected exactly {pinnable}"
            ));
        }
        Ok(())
    }
}

/// Read and write access to the policy state.
///
/// Implementations are not synchronized; the manager serializes callers.
pub trait State: Send {
    /// The current state.
    fn policy_state(&self) -> &PolicyState;

    /// Replaces the whole state with `next`.
    ///
    /// # Errors
    ///
    /// Returns an error if `next` could not be persisted; the previous state
    /// is kept in that case.
    fn commit(&mut self, next: PolicyState) -> Result<()>;

    fn get_cpu_set(&self, pod_uid: &str, container: &str) -> Option<CpuSet> {
        self.policy_state().get(pod_uid, container).cloned()
    }

    fn get_default_cpu_set(&self) -> CpuSet {
        self.policy_state().default_cpu_set.clone()
    }

    /// The container's exclusive CPUs, or the shared pool if it has none.
    fn get_cpu_set_or_default(&self, pod_uid: &str, container: &str) -> CpuSet {
        self.get_cpu_set(pod_uid, container)
            .unwrap_or_else(|| self.get_default_cpu_set())
    }

    fn get_cpu_assignments(&self) -> ContainerCpuAssignments {
        self.policy_state().assignments.clone()
    }

    /// Records `cpus` for the container without touching the default pool.
    fn set_cpu_set(&mut self, pod_uid: &str, container: &str, cpus: CpuSet) -> Result<()> {
        let mut next = self.policy_state().clone();
        next.assignments
            .entry(pod_uid.into())
            .or_default()
            .insert(container.into(), cpus);
        self.commit(next)
    }

    fn set_default_cpu_set(&mut self, cpus: CpuSet) -> Result<()> {
        let mut next = self.policy_state().clone();
        next.default_cpu_set = cpus;
        self.commit(next)
    }

    /// Drops the container's entry without returning its CPUs to the pool.
    fn delete(&mut self, pod_uid: &str, container: &str) -> Result<()> {
        let mut next = self.policy_state().clone();
        if let Some(containers) = next.assignments.get_mut(pod_uid) {
            containers.remove(container);
            if containers.is_empty() {
                next.assignments.remove(pod_uid);
            }
        }
        self.commit(next)
    }

    fn clear_state(&mut self) -> Result<()> {
        self.commit(PolicyState::default())
    }
}

/// Volatile state with no persistence.
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    state: PolicyState,
}

impl MemoryState {
    pub fn new() -> Self {
        Self::default()
    }
}

impl State for MemoryState {
    fn policy_state(&self) -> &PolicyState {
        &self.state
    }

    fn commit(&mut self, next: PolicyState) -> Result<()> {
        self.state = next;
        Ok(())
    }
}

/// State that writes a checkpoint before every change takes effect.
pub struct CheckpointState {
    policy_name: String,
    checkpoint_name: String,
    store: Box<dyn CheckpointStore>,
    cache: PolicyState,
}

impl std::fmt::Debug for CheckpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointState")
            .field("policy_name", &self.policy_name)
            .field("checkpoint_name", &self.checkpoint_name)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl CheckpointState {
    /// Restores the checkpoint named `checkpoint_name`, or starts empty if
    /// the store has none.
    ///
    /// # Errors
    ///
    /// Fails on undecodable content, checksum mismatch, malformed CPU ranges
    /// or a checkpoint written by a policy other than `policy_name`.
    pub fn restore(
        store: Box<dyn CheckpointStore>,
        checkpoint_name: &str,
        policy_name: &str,
    ) -> Result<Self> {
        let mut state = Self {
            policy_name: policy_name.to_string(),
            checkpoint_name: checkpoint_name.to_string(),
            store,
            cache: PolicyState::default(),
        };

        let Some(blob) = state.store.restore(checkpoint_name)? else {
            info!(checkpoint = checkpoint_name, "no checkpoint found, starting with empty state");
            return Ok(state);
        };

        let checkpoint = DecodedCheckpoint::decode(checkpoint_name, &blob)
            .and_then(|decoded| decoded.into_current(checkpoint_name))
            .inspect_err(|e| error!(checkpoint = checkpoint_name, error = %e, "checkpoint rejected"))?;

        if checkpoint.policy_name != policy_name {
            let err = CpuManagerError::PolicyMismatch {
                configured: policy_name.to_string(),
                checkpoint: checkpoint.policy_name,
            };
            error!(checkpoint = checkpoint_name, error = %err, "checkpoint rejected");
            return Err(err);
        }

        state.cache = checkpoint.to_state()?;
        info!(
            checkpoint = checkpoint_name,
            default_cpu_set = %state.cache.default_cpu_set,
            pods = state.cache.assignments.len(),
            "restored checkpoint"
        );
        Ok(state)
    }

    pub fn checkpoint_name(&self) -> &str {
        &self.checkpoint_name
    }
}

impl State for CheckpointState {
    fn policy_state(&self) -> &PolicyState {
        &self.cache
    }

    fn commit(&mut self, next: PolicyState) -> Result<()> {
        let checkpoint = CpuManagerCheckpoint::from_state(&self.policy_name, &next)?;
        self.store.save(&self.checkpoint_name, &checkpoint.marshal()?)?;
        debug!(
            checkpoint = %self.checkpoint_name,
            checksum = checkpoint.checksum,
            "checkpoint written"
        );
        self.cache = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use pretty_assertions::assert_eq;

    fn pinnable() -> CpuSet {
        CpuSet::from([0, 1, 2, 3, 4, 5, 6, 7])
    }

    fn initial() -> PolicyState {
        PolicyState {
            default_cpu_set: pinnable(),
            assignments: ContainerCpuAssignments::new(),
        }
    }

    #[test]
    fn test_assign_and_release() {
        let state = initial();
        let next = state.with_assignment("pod", "app", CpuSet::from([0, 4]));
        assert_eq!(next.default_cpu_set, CpuSet::from([1, 2, 3, 5, 6, 7]));
        assert_eq!(next.get("pod", "app"), Some(&CpuSet::from([0, 4])));
        next.validate(&pinnable()).unwrap();

        let (released, cpus) = next.without_assignment("pod", "app").unwrap();
        assert_eq!(cpus, CpuSet::from([0, 4]));
        assert_eq!(released, state);
        assert!(released.without_assignment("pod", "app").is_none());
    }

    #[test]
    fn test_hand_over_pod_cpus() {
        let state = initial()
            .with_assignment("pod", "init", CpuSet::from([0, 4]))
            .with_assignment("pod", "setup", CpuSet::from([1]))
            .with_assignment("other", "app", CpuSet::from([2]));

        let next = state
            .without_pod_cpus("pod", &CpuSet::from([0, 1]))
            .with_assignment("pod", "app", CpuSet::from([0, 1]));
        assert_eq!(next.get("pod", "init"), Some(&CpuSet::from([4])));
        assert_eq!(next.get("pod", "setup"), None);
        assert_eq!(next.get("other", "app"), Some(&CpuSet::from([2])));
        assert_eq!(next.default_cpu_set, state.default_cpu_set);
        next.validate(&pinnable()).unwrap();
    }

    #[test]
    fn test_validate_detects_overlap_and_gaps() {
        let mut state = initial().with_assignment("pod", "a", CpuSet::from([0, 1]));
        state
            .assignments
            .get_mut("pod")
            .unwrap()
            .insert("b".into(), CpuSet::from([1, 2]));
        assert!(matches!(
            state.validate(&pinnable()),
            Err(CpuManagerError::StateInvariantViolation(_))
        ));

        let mut state = initial();
        state.default_cpu_set = CpuSet::from([0, 1, 2]);
        assert!(state.validate(&pinnable()).is_err());

        let mut state = initial().with_assignment("pod", "a", CpuSet::from([0]));
        state.default_cpu_set = pinnable();
        assert!(state.validate(&pinnable()).is_err());
    }

    #[test]
    fn test_state_helpers() {
        let mut state = MemoryState::new();
        state.set_default_cpu_set(pinnable()).unwrap();
        state.set_cpu_set("pod", "app", CpuSet::from([3])).unwrap();

        assert_eq!(state.get_cpu_set("pod", "app"), Some(CpuSet::from([3])));
        assert_eq!(state.get_cpu_set_or_default("pod", "other"), pinnable());
        assert_eq!(state.get_cpu_assignments().len(), 1);

        state.delete("pod", "app").unwrap();
        assert!(state.get_cpu_assignments().is_empty());
        state.clear_state().unwrap();
        assert!(state.policy_state().is_empty());
    }

    #[test]
    fn test_checkpoint_state_writes_through() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut state =
            CheckpointState::restore(Box::new(store.clone()), "cp", "static").unwrap();
        assert!(state.policy_state().is_empty());

        let next = initial().with_assignment("pod", "app", CpuSet::from([2, 6]));
        state.commit(next.clone()).unwrap();

        let restored = CheckpointState::restore(Box::new(store.clone()), "cp", "static").unwrap();
        assert_eq!(restored.policy_state(), &next);
    }

    #[test]
    fn test_checkpoint_state_rejects_other_policy() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut state = CheckpointState::restore(Box::new(store.clone()), "cp", "none").unwrap();
        state.commit(initial()).unwrap();

        let err = CheckpointState::restore(Box::new(store), "cp", "static").unwrap_err();
        assert!(matches!(err, CpuManagerError::PolicyMismatch { .. }));
    }

    #[test]
    fn test_checkpoint_state_rejects_corruption() {
        let store = Arc::new(MemoryCheckpointStore::new());
        store.save("cp", b"not json").unwrap();
        let err = CheckpointState::restore(Box::new(store), "cp", "static").unwrap_err();
        assert!(matches!(err, CpuManagerError::CorruptCheckpoint { .. }));
    }
}
