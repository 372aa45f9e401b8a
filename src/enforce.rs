//! Applying an allocated CPU set to the workload.
//!
//! Enforcement itself (cgroups, container runtimes) lives outside this
//! crate; the manager only calls a [`CpuSetEnforcer`] once a pinned set has
//! been committed.

use std::io;

use tracing::debug;

use crate::cpuset::CpuSet;
use crate::error::{CpuManagerError, Result};

pub trait CpuSetEnforcer: Send + Sync {
    /// Restricts the container to `cpus`.
    fn apply(&self, pod_uid: &str, container: &str, cpus: &CpuSet) -> Result<()>;
}

/// Pins the thread that calls [`CpuSetEnforcer::apply`], not the container.
///
/// [`crate::Manager::allocate`] runs the enforcer on the caller's thread, so
/// this only fits when each "container" is a worker thread of this process
/// that allocates its own CPUs. Pinning another process needs a different
/// enforcer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadAffinityEnforcer;

impl CpuSetEnforcer for ThreadAffinityEnforcer {
    fn apply(&self, pod_uid: &str, container: &str, cpus: &CpuSet) -> Result<()> {
        if cpus.is_empty() {
            return Err(CpuManagerError::InvalidConfiguration(format!(
                "refusing to pin pod {pod_uid} container {container} to an empty cpu set"
            )));
        }
        affinity::set_thread_affinity(cpus.to_vec())
            .map_err(|e| CpuManagerError::Io(io::Error::other(e.to_string())))?;
        debug!(pod = pod_uid, container, cpus = %cpus, "pinned thread");
        Ok(())
    }
}
