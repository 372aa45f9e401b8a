//! NUMA topology hints handed to the admission coordinator.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::bitmask::NumaMask;

/// Resource name under which CPU hints are reported.
pub const RESOURCE_CPU: &str = "cpu";

/// Hints per resource name.
///
/// `None` means the resource is not requested or cannot be satisfied;
/// `Some(vec![])` means feasible placements exist but none are new.
pub type ResourceHints = BTreeMap<String, Option<Vec<TopologyHint>>>;

/// An advisory NUMA affinity for one resource request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TopologyHint {
    pub numa_node_affinity: NumaMask,
    pub preferred: bool,
}

impl TopologyHint {
    pub fn new(numa_node_affinity: NumaMask, preferred: bool) -> Self {
        Self {
            numa_node_affinity,
            preferred,
        }
    }

    /// Coordinator ordering: preferred hints first, then narrower masks.
    pub fn is_better_than(&self, other: &TopologyHint) -> bool {
        self.cmp(other) == Ordering::Less
    }
}

impl PartialOrd for TopologyHint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TopologyHint {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .preferred
            .cmp(&self.preferred)
            .then_with(|| self.numa_node_affinity.cmp(&other.numa_node_affinity))
    }
}

/// Intersects per-container hint sequences into one pod-level sequence.
///
/// A mask survives only if every container reports it, and stays preferred
/// only if every container prefers it. Any infeasible container makes the
/// pod infeasible; any container with no new hints makes the pod report no
/// new hints. Order follows the first container's sequence.
pub fn merge_container_hints<I>(per_container: I) -> Option<Vec<TopologyHint>>
where
    I: IntoIterator<Item = Option<Vec<TopologyHint>>>,
{
    let mut merged: Option<Vec<TopologyHint>> = None;
    let mut saw_empty = false;
    for hints in per_container {
        let hints = hints?;
        if hints.is_empty() {
            saw_empty = true;
            continue;
        }
        merged = Some(match merged {
            None => hints,
            Some(acc) => acc
                .into_iter()
                .filter_map(|hint| {
                    hints
                        .iter()
                        .find(|h| h.numa_node_affinity == hint.numa_node_affinity)
                        .map(|h| TopologyHint::new(hint.numa_node_affinity, hint.preferred && h.preferred))
                })
                .collect(),
        });
    }
    if saw_empty {
        return Some(Vec::new());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn mask(nodes: &[usize]) -> NumaMask {
        NumaMask::new(nodes).unwrap()
    }

    #[test]
    fn test_ordering_prefers_preferred_then_narrow() {
        let a = TopologyHint::new(mask(&[0, 1]), true);
        let b = TopologyHint::new(mask(&[0]), false);
        let c = TopologyHint::new(mask(&[1]), true);
        assert!(a.is_better_than(&b));
        assert!(c.is_better_than(&a));

        let mut hints = vec![b, a, c];
        hints.sort();
        assert_eq!(hints, vec![c, a, b]);
    }

    #[test]
    fn test_merge_intersects_masks() {
        let first = vec![
            TopologyHint::new(mask(&[0]), true),
            TopologyHint::new(mask(&[1]), true),
            TopologyHint::new(mask(&[0, 1]), false),
        ];
        let second = vec![
            TopologyHint::new(mask(&[1]), false),
            TopologyHint::new(mask(&[0, 1]), true),
        ];
        assert_eq!(
            merge_container_hints([Some(first), Some(second)]),
            Some(vec![
                TopologyHint::new(mask(&[1]), false),
                TopologyHint::new(mask(&[0, 1]), false),
            ])
        );
    }

    #[test]
    fn test_merge_nil_and_empty() {
        let some = Some(vec![TopologyHint::new(mask(&[0]), true)]);
        assert_eq!(merge_container_hints([some.clone(), None]), None);
        assert_eq!(merge_container_hints([some, Some(vec![])]), Some(vec![]));
        assert_eq!(merge_container_hints(Vec::new()), None);
    }
}
