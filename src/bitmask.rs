//! # NUMA Affinity Masks
//!
//! One bit per NUMA node id. Masks are ordered by narrowness: fewer set
//! bits first, then smaller numeric value, which gives a total order used
//! both for hint comparison and for enumeration.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{CpuManagerError, Result};

/// Widest supported node id plus one.
pub const MAX_NUMA_NODES: usize = 64;

/// A set of NUMA node ids.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct NumaMask(u64);

impl NumaMask {
    /// Builds a mask with the given node ids set. Ids of 64 or more are rejected.
    pub fn new(nodes: &[usize]) -> Result<Self> {
        let mut mask = Self::default();
        for &node in nodes {
            if node >= MAX_NUMA_NODES {
                return Err(CpuManagerError::InvalidNumaNode(node));
            }
            mask.0 |= 1 << node;
        }
        Ok(mask)
    }

    /// Wraps a raw bit pattern.
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_set(self, node: usize) -> bool {
        node < MAX_NUMA_NODES && self.0 & (1 << node) != 0
    }

    /// Number of set bits.
    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Set node ids, ascending.
    pub fn nodes(self) -> Vec<usize> {
        (0..MAX_NUMA_NODES).filter(|&n| self.is_set(n)).collect()
    }

    pub fn and(self, other: NumaMask) -> NumaMask {
        Self(self.0 & other.0)
    }

    pub fn or(self, other: NumaMask) -> NumaMask {
        Self(self.0 | other.0)
    }

    /// Whether `self` sorts strictly before `other` in narrowness order.
    pub fn is_narrower_than(self, other: NumaMask) -> bool {
        self.cmp_narrowness(other) == Ordering::Less
    }

    /// Narrowness comparison: bit count, then numeric value.
    pub fn cmp_narrowness(self, other: NumaMask) -> Ordering {
        self.count()
            .cmp(&other.count())
            .then_with(|| self.0.cmp(&other.0))
    }

    /// Every non-empty combination of `nodes`, narrowest first.
    pub fn iterate(nodes: &[usize]) -> Result<NumaMaskIter> {
        NumaMaskIter::new(nodes)
    }
}

impl PartialOrd for NumaMask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NumaMask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_narrowness(*other)
    }
}

impl fmt::Display for NumaMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self.nodes().last().map_or(1, |n| n + 1);
        write!(f, "{:0width$b}", self.0, width = width)
    }
}

/// Lazy generator of every non-empty combination of a node list.
///
/// Combinations of size `k` are produced before size `k + 1`; within a size,
/// in ascending numeric value. Works on positions in the sorted node list so
/// the sequence is restartable by cloning and never materializes `2^n`
/// masks.
#[derive(Debug, Clone)]
pub struct NumaMaskIter {
    nodes: Vec<usize>,
    /// Current combination over positions in `nodes`, 0 when exhausted.
    positions: u64,
}

impl NumaMaskIter {
    fn new(nodes: &[usize]) -> Result<Self> {
        let mut nodes = nodes.to_vec();
        nodes.sort_unstable();
        nodes.dedup();
        if let Some(&node) = nodes.iter().find(|&&n| n >= MAX_NUMA_NODES) {
            return Err(CpuManagerError::InvalidNumaNode(node));
        }
        let positions = u64::from(!nodes.is_empty());
        Ok(Self { nodes, positions })
    }

    fn full(&self) -> u64 {
        if self.nodes.len() == MAX_NUMA_NODES {
            u64::MAX
        } else {
            (1u64 << self.nodes.len()) - 1
        }
    }

    fn to_mask(&self, positions: u64) -> NumaMask {
        let bits = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| positions & (1 << i) != 0)
            .fold(0u64, |acc, (_, &node)| acc | (1 << node));
        NumaMask(bits)
    }

    /// Next combination with the same popcount (Gosper), or the smallest
    /// combination with one more bit.
    fn advance(&self, current: u64) -> u64 {
        let full = self.full();
        if current == full {
            return 0;
        }
        let lowest = current & current.wrapping_neg();
        let ripple = current.wrapping_add(lowest);
        if ripple != 0 && ripple <= full {
            let ones = ((current ^ ripple) >> 2) / lowest;
            let next = ripple | ones;
            if next <= full {
                return next;
            }
        }
        let k = current.count_ones() + 1;
        if k as usize > self.nodes.len() {
            0
        } else if k == 64 {
            u64::MAX
        } else {
            (1u64 << k) - 1
        }
    }
}

impl Iterator for NumaMaskIter {
    type Item = NumaMask;

    fn next(&mut self) -> Option<NumaMask> {
        if self.positions == 0 {
            return None;
        }
        let mask = self.to_mask(self.positions);
        self.positions = self.advance(self.positions);
        Some(mask)
    }
}
