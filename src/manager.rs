//! The entry point shared by the admission coordinator and the container
//! lifecycle manager.
//!
//! Every call takes the same lock, so callers never observe a pool and an
//! assignment map that disagree.

use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::config::CpuManagerConfig;
use crate::cpuset::CpuSet;
use crate::enforce::CpuSetEnforcer;
use crate::error::Result;
use crate::hint::{ResourceHints, RESOURCE_CPU};
use crate::pod::{Container, Pod};
use crate::policy::Policy;
use crate::state::{CheckpointState, ContainerCpuAssignments, PolicyState, State};
use crate::topology::{CpuTopology, MachineInventory};
use crate::ConstString;

struct ManagerInner {
    policy: Box<dyn Policy>,
    state: Box<dyn State>,
    /// Pod whose hints were computed last and that has not been allocated
    /// yet. At most one pod is admitted at a time.
    pending_admission_pod: Option<ConstString>,
}

impl ManagerInner {
    fn mark_pending(&mut self, pod_uid: &str) {
        if let Some(pending) = &self.pending_admission_pod {
            if &**pending != pod_uid {
                warn!(
                    pending = %pending,
                    pod = pod_uid,
                    "hint request for another pod supersedes pending admission"
                );
            }
        }
        self.pending_admission_pod = Some(pod_uid.into());
    }
}

pub struct Manager {
    topology: Arc<CpuTopology>,
    enforcer: Option<Box<dyn CpuSetEnforcer>>,
    inner: Mutex<ManagerInner>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("topology", &self.topology.summary())
            .field("enforcer", &self.enforcer.is_some())
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Discovers the topology from `inventory` and restores state from the
    /// checkpoint file under `config.state_dir`.
    pub fn new(config: &CpuManagerConfig, inventory: &MachineInventory) -> anyhow::Result<Self> {
        let topology = CpuTopology::discover(inventory).context("discovering cpu topology")?;
        let store = FileCheckpointStore::new(&config.state_dir);
        Self::with_store(config, Arc::new(topology), Box::new(store)).with_context(|| {
            format!(
                "starting {} cpu manager from checkpoint {}",
                config.policy,
                config.checkpoint_path().display()
            )
        })
    }

    /// Builds the policy and restores its state from `store`.
    ///
    /// # Errors
    ///
    /// Fails on bad configuration, an unreadable or foreign checkpoint, or
    /// restored state that does not fit the machine. None of these are
    /// repaired.
    pub fn with_store(
        config: &CpuManagerConfig,
        topology: Arc<CpuTopology>,
        store: Box<dyn CheckpointStore>,
    ) -> Result<Self> {
        info!(topology = %topology.summary(), policy = %config.policy, "starting cpu manager");
        let reserved = config.resolve_reserved(&topology)?;
        let mut policy = config.policy.build(topology.clone(), reserved)?;
        let mut state: Box<dyn State> = Box::new(CheckpointState::restore(
            store,
            &config.checkpoint_name,
            policy.name(),
        )?);
        policy.start(state.as_mut())?;

        Ok(Self {
            topology,
            enforcer: None,
            inner: Mutex::new(ManagerInner {
                policy,
                state,
                pending_admission_pod: None,
            }),
        })
    }

    /// Applies every newly pinned set through `enforcer`.
    #[must_use]
    pub fn with_enforcer(mut self, enforcer: impl CpuSetEnforcer + 'static) -> Self {
        self.enforcer = Some(Box::new(enforcer));
        self
    }

    pub fn topology(&self) -> &Arc<CpuTopology> {
        &self.topology
    }

    pub fn policy_name(&self) -> &'static str {
        self.inner.lock().policy.name()
    }

    /// Pins `container` of `pod` if it qualifies.
    ///
    /// Returns `None` when the container shares the default pool. Completes
    /// the pending admission of `pod`, whether or not it succeeds. A new
    /// assignment that the enforcer rejects is rolled back before the error
    /// is returned.
    ///
    /// # Errors
    ///
    /// [`crate::CpuManagerError::Allocation`] when the pool is too small; the
    /// caller must reject the workload. Persistence and enforcement errors
    /// are passed through.
    pub fn allocate(&self, pod: &Pod, container: &Container) -> Result<Option<CpuSet>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let is_new = inner.state.get_cpu_set(&pod.uid, &container.name).is_none();
        let result = inner.policy.allocate(inner.state.as_mut(), pod, container);
        if inner.pending_admission_pod.as_deref() == Some(&*pod.uid) {
            inner.pending_admission_pod = None;
        }

        let cpus = result?;
        if let (Some(enforcer), Some(cpus)) = (&self.enforcer, &cpus) {
            if let Err(e) = enforcer.apply(&pod.uid, &container.name, cpus) {
                error!(
                    pod = %pod.uid,
                    container = %container.name,
                    error = %e,
                    "enforcing cpus failed"
                );
                if is_new {
                    inner
                        .policy
                        .remove_container(inner.state.as_mut(), &pod.uid, &container.name)
                        .inspect_err(|rollback| {
                            error!(
                                pod = %pod.uid,
                                container = %container.name,
                                error = %rollback,
                                "rolling back the assignment failed"
                            );
                        })?;
                }
                return Err(e);
            }
        }
        Ok(cpus)
    }

    /// Returns the container's CPUs to the pool, if it had any.
    ///
    /// Removal is terminal for the caller: the same pod and container name
    /// must not be allocated again. The manager keeps no record of removed
    /// containers.
    ///
    /// # Errors
    ///
    /// Returns a persistence error; the state is unchanged in that case.
    pub fn remove_container(&self, pod_uid: &str, container: &str) -> Result<Option<CpuSet>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner
            .policy
            .remove_container(inner.state.as_mut(), pod_uid, container)
    }

    /// NUMA placements for one container, keyed by resource name.
    ///
    /// Marks `pod` as the pending admission.
    pub fn get_topology_hints(&self, pod: &Pod, container: &Container) -> ResourceHints {
        let mut inner = self.inner.lock();
        inner.mark_pending(&pod.uid);
        let hints = inner
            .policy
            .get_topology_hints(inner.state.as_ref(), pod, container);
        ResourceHints::from([(RESOURCE_CPU.to_string(), hints)])
    }

    /// NUMA placements for the whole pod, keyed by resource name.
    ///
    /// Marks `pod` as the pending admission.
    pub fn get_pod_topology_hints(&self, pod: &Pod) -> ResourceHints {
        let mut inner = self.inner.lock();
        inner.mark_pending(&pod.uid);
        let hints = inner.policy.get_pod_topology_hints(inner.state.as_ref(), pod);
        ResourceHints::from([(RESOURCE_CPU.to_string(), hints)])
    }

    pub fn pending_admission_pod(&self) -> Option<ConstString> {
        self.inner.lock().pending_admission_pod.clone()
    }

    pub fn get_cpu_set(&self, pod_uid: &str, container: &str) -> Option<CpuSet> {
        self.inner.lock().state.get_cpu_set(pod_uid, container)
    }

    /// The CPUs the container may run on: its own, or the shared pool.
    pub fn get_cpu_set_or_default(&self, pod_uid: &str, container: &str) -> CpuSet {
        self.inner
            .lock()
            .state
            .get_cpu_set_or_default(pod_uid, container)
    }

    pub fn default_cpu_set(&self) -> CpuSet {
        self.inner.lock().state.get_default_cpu_set()
    }

    pub fn assignments(&self) -> ContainerCpuAssignments {
        self.inner.lock().state.get_cpu_assignments()
    }

    /// A consistent copy of the pool and all assignments.
    #[must_use]
    pub fn snapshot(&self) -> PolicyState {
        self.inner.lock().state.policy_state().clone()
    }
}
