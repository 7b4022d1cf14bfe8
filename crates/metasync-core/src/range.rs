// # Address Range Set
//
// Value type for published network prefixes and the set algebra the engine
// runs over them.
//
// ## Semantics
//
// - A set is an ordered multiset: `merge` concatenates and never deduplicates.
// - Every member's CIDR parsed as an IPv4 or IPv6 prefix when it was added.
// - `diff` compares on the CIDR string only; labels do not take part.
// - Targets write `unique_cidrs()`, which keeps the first occurrence of each CIDR.

use crate::error::{Error, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// A single published network prefix with its category labels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRange {
    cidr: String,
    labels: BTreeSet<String>,
}

impl AddressRange {
    /// The CIDR string exactly as it was added
    pub fn cidr(&self) -> &str {
        &self.cidr
    }

    /// Category tags attached to this range
    pub fn labels(&self) -> &BTreeSet<String> {
        &self.labels
    }

    /// Parsed network prefix
    ///
    /// Always succeeds for ranges built through [`AddressRangeSet::add`].
    pub fn network(&self) -> Option<IpNet> {
        self.cidr.parse().ok()
    }

    fn matches_any(&self, wanted: &[String]) -> bool {
        wanted.iter().any(|label| self.labels.contains(label))
    }
}

/// Result of comparing a currently-applied set against a desired one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeDiff {
    /// Desired members whose CIDR is absent from the applied set
    pub added: Vec<AddressRange>,
    /// Applied members whose CIDR is absent from the desired set
    pub removed: Vec<AddressRange>,
}

impl RangeDiff {
    /// True when applying the desired set would change nothing
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Ordered collection of address ranges
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddressRangeSet {
    ranges: Vec<AddressRange>,
}

impl AddressRangeSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from CIDR strings sharing no labels
    ///
    /// Fails on the first invalid CIDR.
    pub fn from_cidrs<I, S>(cidrs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        for cidr in cidrs {
            set.add(cidr.as_ref(), std::iter::empty::<String>())?;
        }
        Ok(set)
    }

    /// Append a range after validating its CIDR
    ///
    /// Returns [`Error::InvalidRange`] and leaves the set untouched when the
    /// CIDR does not parse as a network prefix.
    pub fn add<I, L>(&mut self, cidr: &str, labels: I) -> Result<()>
    where
        I: IntoIterator<Item = L>,
        L: Into<String>,
    {
        let cidr = cidr.trim();
        cidr.parse::<IpNet>()
            .map_err(|e| Error::invalid_range(cidr, e.to_string()))?;

        self.ranges.push(AddressRange {
            cidr: cidr.to_string(),
            labels: labels.into_iter().map(Into::into).collect(),
        });
        Ok(())
    }

    /// Keep ranges matching `include` (any label, or everything when empty)
    /// and not matching `exclude`
    pub fn filter(&self, include: &[String], exclude: &[String]) -> Self {
        let ranges = self
            .ranges
            .iter()
            .filter(|r| include.is_empty() || r.matches_any(include))
            .filter(|r| exclude.is_empty() || !r.matches_any(exclude))
            .cloned()
            .collect();
        Self { ranges }
    }

    /// Concatenate another set onto this one
    pub fn merge(&mut self, other: AddressRangeSet) {
        self.ranges.extend(other.ranges);
    }

    /// Compare this (applied) set against `desired` on CIDR membership
    pub fn diff(&self, desired: &AddressRangeSet) -> RangeDiff {
        let current: HashSet<&str> = self.ranges.iter().map(|r| r.cidr.as_str()).collect();
        let wanted: HashSet<&str> = desired.ranges.iter().map(|r| r.cidr.as_str()).collect();

        RangeDiff {
            added: desired
                .ranges
                .iter()
                .filter(|r| !current.contains(r.cidr.as_str()))
                .cloned()
                .collect(),
            removed: self
                .ranges
                .iter()
                .filter(|r| !wanted.contains(r.cidr.as_str()))
                .cloned()
                .collect(),
        }
    }

    /// Number of members, duplicates included
    pub fn count(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// CIDR strings in set order, duplicates included
    pub fn cidrs(&self) -> Vec<String> {
        self.ranges.iter().map(|r| r.cidr.clone()).collect()
    }

    /// CIDR strings in first-occurrence order without duplicates
    pub fn unique_cidrs(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.ranges
            .iter()
            .filter(|r| seen.insert(r.cidr.as_str()))
            .map(|r| r.cidr.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AddressRange> {
        self.ranges.iter()
    }
}

impl<'a> IntoIterator for &'a AddressRangeSet {
    type Item = &'a AddressRange;
    type IntoIter = std::slice::Iter<'a, AddressRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn sample() -> AddressRangeSet {
        let mut set = AddressRangeSet::new();
        set.add("192.30.252.0/22", ["hooks"]).unwrap();
        set.add("185.199.108.0/22", ["web", "pages"]).unwrap();
        set.add("140.82.112.0/20", ["api"]).unwrap();
        set.add("2a0a:a440::/29", ["web"]).unwrap();
        set
    }

    #[test]
    fn invalid_cidr_leaves_set_unchanged() {
        let mut set = sample();
        let before = set.clone();

        let err = set.add("10.0.0.0/33", ["web"]).unwrap_err();
        assert!(matches!(err, Error::InvalidRange { .. }));
        let err = set.add("not-a-cidr", ["web"]).unwrap_err();
        assert!(matches!(err, Error::InvalidRange { .. }));
        // A bare address is not a prefix
        assert!(set.add("10.0.0.1", ["web"]).is_err());

        assert_eq!(set, before);
    }

    #[test]
    fn accepts_ipv4_and_ipv6() {
        let mut set = AddressRangeSet::new();
        set.add("10.0.0.0/8", ["a"]).unwrap();
        set.add("2001:db8::/32", ["b"]).unwrap();
        assert_eq!(set.count(), 2);
        assert!(set.iter().all(|r| r.network().is_some()));
    }

    #[test]
    fn empty_filter_is_identity() {
        let set = sample();
        assert_eq!(set.filter(&[], &[]), set);
    }

    #[test]
    fn exclude_wins_over_include() {
        let set = sample();
        let out = set.filter(&labels(&["web"]), &labels(&["web"]));
        assert!(out.iter().all(|r| !r.labels().contains("web")));
        assert_eq!(out.count(), 0);
    }

    #[test]
    fn filter_by_include_and_exclude() {
        let set = sample();

        let web = set.filter(&labels(&["web"]), &[]);
        assert_eq!(web.cidrs(), vec!["185.199.108.0/22", "2a0a:a440::/29"]);

        let no_pages = set.filter(&labels(&["web"]), &labels(&["pages"]));
        assert_eq!(no_pages.cidrs(), vec!["2a0a:a440::/29"]);

        let not_api = set.filter(&[], &labels(&["api"]));
        assert_eq!(not_api.count(), 3);
    }

    #[test]
    fn merge_keeps_duplicates_in_order() {
        let mut a = AddressRangeSet::from_cidrs(["10.0.0.0/8", "10.1.0.0/16"]).unwrap();
        let b = AddressRangeSet::from_cidrs(["10.0.0.0/8", "172.16.0.0/12"]).unwrap();
        a.merge(b);

        assert_eq!(a.count(), 4);
        assert_eq!(
            a.unique_cidrs(),
            vec!["10.0.0.0/8", "10.1.0.0/16", "172.16.0.0/12"]
        );
    }

    #[test]
    fn diff_laws_hold() {
        let a = AddressRangeSet::from_cidrs(["10.0.0.0/8", "10.1.0.0/16", "192.168.0.0/16"]).unwrap();
        let b = AddressRangeSet::from_cidrs(["10.0.0.0/8", "172.16.0.0/12", "2001:db8::/32"]).unwrap();
        let d = a.diff(&b);

        let a_cidrs: HashSet<String> = a.cidrs().into_iter().collect();
        let b_cidrs: HashSet<String> = b.cidrs().into_iter().collect();

        assert!(d.added.iter().all(|r| !a_cidrs.contains(r.cidr())));
        assert!(d.removed.iter().all(|r| !b_cidrs.contains(r.cidr())));

        let mut merged = a.clone();
        merged.merge(AddressRangeSet {
            ranges: d.added.clone(),
        });
        let removed: HashSet<&str> = d.removed.iter().map(|r| r.cidr()).collect();
        let result: HashSet<String> = merged
            .cidrs()
            .into_iter()
            .filter(|c| !removed.contains(c.as_str()))
            .collect();
        assert_eq!(result, b_cidrs);
    }

    #[test]
    fn diff_ignores_labels_and_order() {
        let mut a = AddressRangeSet::new();
        a.add("10.0.0.0/8", ["x"]).unwrap();
        a.add("10.1.0.0/16", ["y"]).unwrap();
        let mut b = AddressRangeSet::new();
        b.add("10.1.0.0/16", ["z"]).unwrap();
        b.add("10.0.0.0/8", Vec::<String>::new()).unwrap();

        assert!(a.diff(&b).is_empty());
    }
}
