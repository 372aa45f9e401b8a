//! Workload description consumed from the pod-admission side.
//!
//! CPU quantities are carried in millicores so that "integral" is an exact
//! check rather than a floating point one.

use serde::{Deserialize, Serialize};

use crate::ConstString;

/// Quality-of-service tier reported for the whole pod.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QosClass {
    Guaranteed,
    Burstable,
    #[default]
    BestEffort,
}

/// CPU resources of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: ConstString,
    /// CPU request in millicores, `None` when unset.
    #[serde(default)]
    pub cpu_request_millis: Option<u64>,
    /// CPU limit in millicores, `None` when unset.
    #[serde(default)]
    pub cpu_limit_millis: Option<u64>,
}

impl Container {
    /// A container whose request and limit are both `cpus` whole CPUs.
    pub fn with_cpus(name: &str, cpus: u64) -> Self {
        Self {
            name: name.into(),
            cpu_request_millis: Some(cpus * 1000),
            cpu_limit_millis: Some(cpus * 1000),
        }
    }

    /// Whole CPUs this container may pin, or 0 when request and limit are
    /// not equal, not integral or zero.
    pub fn exclusive_cpus(&self) -> usize {
        match (self.cpu_request_millis, self.cpu_limit_millis) {
            (Some(request), Some(limit)) if request == limit && request > 0 && request % 1000 == 0 => {
                (request / 1000) as usize
            }
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub uid: ConstString,
    #[serde(default)]
    pub qos_class: QosClass,
    #[serde(default)]
    pub init_containers: Vec<Container>,
    #[serde(default)]
    pub containers: Vec<Container>,
}

impl Pod {
    /// Init containers followed by main containers.
    pub fn all_containers(&self) -> impl Iterator<Item = &Container> {
        self.init_containers.iter().chain(self.containers.iter())
    }

    pub fn container(&self, name: &str) -> Option<&Container> {
        self.all_containers().find(|c| &*c.name == name)
    }

    /// Whether every container qualifies for exclusive CPUs.
    pub fn is_guaranteed(&self) -> bool {
        self.qos_class == QosClass::Guaranteed
            && self.all_containers().next().is_some()
            && self.all_containers().all(|c| c.exclusive_cpus() > 0)
    }

    /// Exclusive CPUs for `container` of this pod, 0 if the pod does not
    /// qualify.
    pub fn guaranteed_cpus(&self, container: &Container) -> usize {
        if self.is_guaranteed() {
            container.exclusive_cpus()
        } else {
            0
        }
    }

    /// Exclusive CPUs the pod needs at once.
    ///
    /// Init containers run one after another before the main containers
    /// start, so the pod needs the larger of the two phase sums.
    pub fn guaranteed_cpus_total(&self) -> usize {
        if !self.is_guaranteed() {
            return 0;
        }
        let init: usize = self.init_containers.iter().map(Container::exclusive_cpus).sum();
        let main: usize = self.containers.iter().map(Container::exclusive_cpus).sum();
        init.max(main)
    }
}
