//! Topology-aware CPU selection.
//!
//! Greedy, in three passes: whole free sockets, then whole free cores, then
//! single threads. Each pass only runs while the remaining need is at least
//! one unit of that size.

use std::cmp::Reverse;

use tracing::trace;

use crate::cpuset::CpuSet;
use crate::error::{CpuManagerError, Result};
use crate::topology::{CpuDetails, CpuTopology};

struct CpuAccumulator<'a> {
    topo: &'a CpuTopology,
    /// CPUs still free for this selection.
    details: CpuDetails,
    num_cpus_needed: usize,
    result: CpuSet,
}

impl<'a> CpuAccumulator<'a> {
    fn new(topo: &'a CpuTopology, available: &CpuSet, num_cpus: usize) -> Self {
        Self {
            topo,
            details: topo.details().keep_only(available),
            num_cpus_needed: num_cpus,
            result: CpuSet::new(),
        }
    }

    fn take(&mut self, cpus: &CpuSet) {
        self.result = self.result.union(cpus);
        self.details = self.details.keep_only(&self.details.cpus().difference(cpus));
        self.num_cpus_needed = self.num_cpus_needed.saturating_sub(cpus.len());
    }

    fn needs(&self, n: usize) -> bool {
        self.num_cpus_needed >= n
    }

    fn is_satisfied(&self) -> bool {
        self.num_cpus_needed == 0
    }

    fn is_socket_free(&self, socket: usize) -> bool {
        self.details.cpus_in_sockets(&[socket]).len() == self.topo.cpus_per_socket()
    }

    fn is_core_free(&self, core: usize) -> bool {
        self.details.cpus_in_cores(&[core]).len() == self.topo.cpus_per_core()
    }

    fn socket_of(&self, core: usize) -> usize {
        self.topo.details().get(core).map_or(0, |info| info.socket)
    }

    /// Fully free sockets, ascending by id.
    fn free_sockets(&self) -> Vec<usize> {
        self.details
            .sockets()
            .into_iter()
            .filter(|&s| self.is_socket_free(s))
            .collect()
    }

    /// Fully free cores, grouped by socket. Sockets with more free cores
    /// come first so a request stays on one socket when it can; cores are
    /// ascending within a socket.
    fn free_cores(&self) -> Vec<usize> {
        let mut sockets: Vec<(usize, Vec<usize>)> = self
            .details
            .sockets()
            .into_iter()
            .map(|s| {
                let cores = self
                    .details
                    .cores_in_sockets(&[s])
                    .into_iter()
                    .filter(|&c| self.is_core_free(c))
                    .collect();
                (s, cores)
            })
            .collect();
        sockets.sort_by_key(|(s, cores)| (Reverse(cores.len()), *s));
        sockets.into_iter().flat_map(|(_, cores)| cores).collect()
    }

    /// Free CPUs in pick order.
    ///
    /// Cores are ranked by: sockets already used by this selection first,
    /// then cores with fewer free threads (finish partial cores before
    /// breaking whole ones), then sockets with more free CPUs, then socket
    /// and core id.
    fn free_cpus(&self) -> Vec<usize> {
        let mut cores: Vec<usize> = self.details.cores().into_iter().collect();
        cores.sort_by_key(|&core| {
            let socket = self.socket_of(core);
            let socket_cpus = self.topo.details().cpus_in_sockets(&[socket]);
            (
                Reverse(socket_cpus.intersection(&self.result).len()),
                self.details.cpus_in_cores(&[core]).len(),
                Reverse(self.details.cpus_in_sockets(&[socket]).len()),
                socket,
                core,
            )
        });
        cores
            .into_iter()
            .flat_map(|core| self.details.cpus_in_cores(&[core]).to_vec())
            .collect()
    }
}

/// Picks `num_cpus` CPUs out of `available`, keeping them on as few
/// sockets and whole cores as possible.
///
/// # Errors
///
/// Returns [`CpuManagerError::Allocation`] if `available` holds fewer than
/// `num_cpus` CPUs known to `topo`.
pub fn take_by_topology(topo: &CpuTopology, available: &CpuSet, num_cpus: usize) -> Result<CpuSet> {
    let mut acc = CpuAccumulator::new(topo, available, num_cpus);
    if acc.is_satisfied() {
        return Ok(acc.result);
    }
    let free = acc.details.cpus().len();
    if num_cpus > free {
        return Err(CpuManagerError::Allocation {
            requested: num_cpus,
            available: free,
        });
    }

    if acc.needs(topo.cpus_per_socket()) {
        for socket in acc.free_sockets() {
            trace!(socket, "taking whole socket");
            let cpus = acc.details.cpus_in_sockets(&[socket]);
            acc.take(&cpus);
            if acc.is_satisfied() {
                return Ok(acc.result);
            }
            if !acc.needs(topo.cpus_per_socket()) {
                break;
            }
        }
    }

    if acc.needs(topo.cpus_per_core()) {
        for core in acc.free_cores() {
            trace!(core, "taking whole core");
            let cpus = acc.details.cpus_in_cores(&[core]);
            acc.take(&cpus);
            if acc.is_satisfied() {
                return Ok(acc.result);
            }
            if !acc.needs(topo.cpus_per_core()) {
                break;
            }
        }
    }

    for cpu in acc.free_cpus() {
        if acc.needs(1) {
            acc.take(&CpuSet::from([cpu]));
        }
        if acc.is_satisfied() {
            return Ok(acc.result);
        }
    }

    Err(CpuManagerError::Allocation {
        requested: num_cpus,
        available: free,
    })
}
