//! The `none` policy: every container shares every online CPU.

use tracing::info;

use crate::cpuset::CpuSet;
use crate::error::Result;
use crate::hint::TopologyHint;
use crate::pod::{Container, Pod};
use crate::policy::Policy;
use crate::state::{PolicyState, State};
use crate::topology::CpuTopology;

#[derive(Debug, Clone)]
pub struct NonePolicy {
    online: CpuSet,
}

impl NonePolicy {
    pub const NAME: &'static str = "none";

    pub fn new(topology: &CpuTopology) -> Self {
        Self {
            online: topology.cpus(),
        }
    }
}

impl Policy for NonePolicy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn start(&mut self, state: &mut dyn State) -> Result<()> {
        if state.policy_state().is_empty() {
            info!(default_cpu_set = %self.online, "initializing empty state");
            return state.commit(PolicyState {
                default_cpu_set: self.online.clone(),
                assignments: Default::default(),
            });
        }
        state.policy_state().validate(&self.online)
    }

    fn allocate(
        &mut self,
        _state: &mut dyn State,
        _pod: &Pod,
        _container: &Container,
    ) -> Result<Option<CpuSet>> {
        Ok(None)
    }

    fn remove_container(
        &mut self,
        _state: &mut dyn State,
        _pod_uid: &str,
        _container: &str,
    ) -> Result<Option<CpuSet>> {
        Ok(None)
    }

    fn get_topology_hints(
        &self,
        _state: &dyn State,
        _pod: &Pod,
        _container: &Container,
    ) -> Option<Vec<TopologyHint>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CpuManagerError;
    use crate::pod::QosClass;
    use crate::state::MemoryState;
    use crate::topology::tests::dual_socket_topology;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_never_pins() {
        let topo = dual_socket_topology();
        let mut policy = NonePolicy::new(&topo);
        let mut state = MemoryState::new();
        policy.start(&mut state).unwrap();
        assert_eq!(state.get_default_cpu_set(), topo.cpus());

        let pod = Pod {
            uid: "pod".into(),
            qos_class: QosClass::Guaranteed,
            init_containers: vec![],
            containers: vec![Container::with_cpus("app", 4)],
        };
        let app = &pod.containers[0];
        assert_eq!(policy.allocate(&mut state, &pod, app).unwrap(), None);
        assert!(state.get_cpu_assignments().is_empty());
        assert_eq!(policy.remove_container(&mut state, "pod", "app").unwrap(), None);
        assert_eq!(policy.get_topology_hints(&state, &pod, app), None);
        assert_eq!(policy.get_pod_topology_hints(&state, &pod), None);
    }

    #[test]
    fn test_start_rejects_foreign_state() {
        let topo = dual_socket_topology();
        let mut policy = NonePolicy::new(&topo);
        let mut state = MemoryState::new();
        state.set_default_cpu_set(CpuSet::from([0, 1])).unwrap();
        assert!(matches!(
            policy.start(&mut state),
            Err(CpuManagerError::StateInvariantViolation(_))
        ));
    }
}
