//! # CPU Sets
//!
//! Immutable sets of logical CPU ids. Every operation returns a new set.
//! The textual form is the Linux cpulist range notation (`"0-3,6,9-11"`),
//! which is also what the checkpoint stores.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CpuManagerError, Result};

/// Parsed CPU ids must be below this. Matches the largest `NR_CPUS` Linux
/// builds with.
pub const MAX_CPUS: usize = 8192;

/// A set of logical CPU ids, enumerated in ascending order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CpuSet {
    cpus: BTreeSet<usize>,
}

impl CpuSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of CPUs in the set.
    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    pub fn contains(&self, cpu: usize) -> bool {
        self.cpus.contains(&cpu)
    }

    /// Iterates over the CPU ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.cpus.iter().copied()
    }

    /// The CPU ids as an ascending vector.
    pub fn to_vec(&self) -> Vec<usize> {
        self.iter().collect()
    }

    #[must_use]
    pub fn union(&self, other: &CpuSet) -> CpuSet {
        self.cpus.union(&other.cpus).copied().collect()
    }

    /// Union of every set in `sets` with `self`.
    pub fn union_all<'a>(&self, sets: impl IntoIterator<Item = &'a CpuSet>) -> CpuSet {
        let mut cpus = self.cpus.clone();
        for set in sets {
            cpus.extend(set.iter());
        }
        CpuSet { cpus }
    }

    #[must_use]
    pub fn intersection(&self, other: &CpuSet) -> CpuSet {
        self.cpus.intersection(&other.cpus).copied().collect()
    }

    /// CPUs in `self` that are not in `other`.
    #[must_use]
    pub fn difference(&self, other: &CpuSet) -> CpuSet {
        self.cpus.difference(&other.cpus).copied().collect()
    }

    pub fn is_subset_of(&self, other: &CpuSet) -> bool {
        self.cpus.is_subset(&other.cpus)
    }

    pub fn is_disjoint(&self, other: &CpuSet) -> bool {
        self.cpus.is_disjoint(&other.cpus)
    }

    /// CPUs matching `predicate`.
    pub fn filter(&self, mut predicate: impl FnMut(usize) -> bool) -> CpuSet {
        self.iter().filter(|&cpu| predicate(cpu)).collect()
    }

    /// Parses range notation. The empty string is the empty set.
    ///
    /// # Errors
    ///
    /// Returns [`CpuManagerError::InvalidCpuSet`] for non-numeric parts,
    /// reversed ranges or ids of [`MAX_CPUS`] and above.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = |reason: String| CpuManagerError::InvalidCpuSet {
            input: s.to_string(),
            reason,
        };

        let mut cpus = BTreeSet::new();
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self { cpus });
        }

        for part in s.split(',') {
            let part = part.trim();
            match part.split_once('-') {
                Some((start, end)) => {
                    let start: usize = start
                        .trim()
                        .parse()
                        .map_err(|e| invalid(format!("bad range start {start:?}: {e}")))?;
                    let end: usize = end
                        .trim()
                        .parse()
                        .map_err(|e| invalid(format!("bad range end {end:?}: {e}")))?;
                    if end < start {
                        return Err(invalid(format!("range {part:?} is reversed")));
                    }
                    if end >= MAX_CPUS {
                        return Err(invalid(format!("cpu id {end} is not below {MAX_CPUS}")));
                    }
                    cpus.extend(start..=end);
                }
                None => {
                    let cpu: usize = part
                        .parse()
                        .map_err(|e| invalid(format!("bad cpu id {part:?}: {e}")))?;
                    if cpu >= MAX_CPUS {
                        return Err(invalid(format!("cpu id {cpu} is not below {MAX_CPUS}")));
                    }
                    cpus.insert(cpu);
                }
            }
        }

        Ok(Self { cpus })
    }
}

impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut iter = self.cpus.iter().copied().peekable();
        let mut first = true;
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end += 1;
                iter.next();
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        Ok(())
    }
}

impl FromStr for CpuSet {
    type Err = CpuManagerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CpuSet {
    type Error = CpuManagerError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<CpuSet> for String {
    fn from(set: CpuSet) -> Self {
        set.to_string()
    }
}

impl FromIterator<usize> for CpuSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self {
            cpus: iter.into_iter().collect(),
        }
    }
}

impl<const N: usize> From<[usize; N]> for CpuSet {
    fn from(cpus: [usize; N]) -> Self {
        cpus.into_iter().collect()
    }
}

impl<'a> IntoIterator for &'a CpuSet {
    type Item = usize;
    type IntoIter = std::iter::Copied<std::collections::btree_set::Iter<'a, usize>>;

    fn into_iter(self) -> Self::IntoIter {
        self.cpus.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_ranges() {
        assert_eq!(CpuSet::parse("0").unwrap().to_vec(), vec![0]);
        assert_eq!(CpuSet::parse("0-3").unwrap().to_vec(), vec![0, 1, 2, 3]);
        assert_eq!(
            CpuSet::parse("0-3,8-11").unwrap().to_vec(),
            vec![0, 1, 2, 3, 8, 9, 10, 11]
        );
        assert_eq!(CpuSet::parse(" 5, 1 ,3").unwrap().to_vec(), vec![1, 3, 5]);
        assert!(CpuSet::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(CpuSet::parse("a").is_err());
        assert!(CpuSet::parse("3-1").is_err());
        assert!(CpuSet::parse("1,,2").is_err());
        assert!(CpuSet::parse("1-").is_err());
        assert!(CpuSet::parse("-1").is_err());
    }

    #[test]
    fn test_parse_rejects_ids_beyond_limit() {
        let err = CpuSet::parse("0-18446744073709551615").unwrap_err();
        assert!(matches!(err, CpuManagerError::InvalidCpuSet { .. }));
        assert!(CpuSet::parse("0-20000000").is_err());
        assert!(CpuSet::parse("8192").is_err());
        assert_eq!(CpuSet::parse("8191").unwrap().to_vec(), vec![8191]);
    }

    #[test]
    fn test_format_compacts_runs() {
        let set: CpuSet = [0, 1, 2, 3, 6, 9, 10, 11].into();
        assert_eq!(set.to_string(), "0-3,6,9-11");
        assert_eq!(CpuSet::new().to_string(), "");
        assert_eq!(CpuSet::from([7]).to_string(), "7");
        assert_eq!(CpuSet::parse(&set.to_string()).unwrap(), set);
    }

    #[test]
    fn test_set_algebra() {
        let a: CpuSet = [0, 1, 2, 3].into();
        let b: CpuSet = [2, 3, 4].into();

        assert_eq!(a.union(&b), CpuSet::from([0, 1, 2, 3, 4]));
        assert_eq!(a.intersection(&b), CpuSet::from([2, 3]));
        assert_eq!(a.difference(&b), CpuSet::from([0, 1]));
        assert!(CpuSet::from([2, 3]).is_subset_of(&a));
        assert!(!b.is_subset_of(&a));
        assert!(a.difference(&b).is_disjoint(&b));
        // operands are untouched
        assert_eq!(a.len(), 4);
        assert_eq!(b.len(), 3);
    }

    #[test]
    fn test_union_all_and_filter() {
        let base: CpuSet = [0].into();
        let sets = [CpuSet::from([1, 2]), CpuSet::from([5])];
        assert_eq!(base.union_all(&sets), CpuSet::from([0, 1, 2, 5]));
        assert_eq!(
            CpuSet::from([0, 1, 2, 3]).filter(|c| c % 2 == 0),
            CpuSet::from([0, 2])
        );
    }

    #[test]
    fn test_serde_as_range_string() {
        let set: CpuSet = [0, 1, 2, 6].into();
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, "\"0-2,6\"");
        let back: CpuSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
        assert!(serde_json::from_str::<CpuSet>("\"x-1\"").is_err());
    }
}
