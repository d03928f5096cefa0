/// Lamport timestamps and version vectors for causality tracking
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::SiteId;

/// Site-tagged Lamport timestamp
///
/// Ordered by counter first, then by site id, giving a deterministic total
/// order that is used for last-write-wins decisions and log ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timestamp {
    pub counter: u64,
    pub site_id: SiteId,
}

impl Timestamp {
    pub fn new(counter: u64, site_id: impl Into<SiteId>) -> Self {
        Self {
            counter,
            site_id: site_id.into(),
        }
    }

    /// Compare two timestamps: counter first, then site id
    pub fn compare(&self, other: &Timestamp) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then_with(|| self.site_id.cmp(&other.site_id))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.counter, self.site_id)
    }
}

/// Fold a remote timestamp into a local one.
///
/// The result's counter is strictly greater than both inputs.
pub fn update_timestamp(local: &Timestamp, remote: &Timestamp) -> Timestamp {
    Timestamp {
        counter: local.counter.max(remote.counter) + 1,
        site_id: local.site_id.clone(),
    }
}

/// Lamport clock owned by a single site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LamportClock {
    site_id: SiteId,
    counter: u64,
}

impl LamportClock {
    pub fn new(site_id: SiteId) -> Self {
        Self {
            site_id,
            counter: 0,
        }
    }

    pub fn with_counter(site_id: SiteId, counter: u64) -> Self {
        Self { site_id, counter }
    }

    /// Issue the next local timestamp
    pub fn generate(&mut self) -> Timestamp {
        self.counter += 1;
        Timestamp {
            counter: self.counter,
            site_id: self.site_id.clone(),
        }
    }

    /// Observe a remote timestamp before issuing the next local one
    pub fn observe(&mut self, remote: &Timestamp) {
        self.counter = self.counter.max(remote.counter) + 1;
    }

    /// Raise the counter to at least `counter` without issuing a timestamp
    pub fn advance_to(&mut self, counter: u64) {
        self.counter = self.counter.max(counter);
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn site_id(&self) -> &SiteId {
        &self.site_id
    }
}

/// Map from site to the highest counter from that site reflected in a document.
///
/// Serialized as a list of `[siteId, counter]` pairs sorted by site id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<(SiteId, u64)>", into = "Vec<(SiteId, u64)>")]
pub struct VersionVector {
    entries: BTreeMap<SiteId, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest counter seen from `site`, or 0
    pub fn get(&self, site: &SiteId) -> u64 {
        self.entries.get(site).copied().unwrap_or(0)
    }

    /// Raise the entry for `site` to `max(current, counter)`
    pub fn advance(&mut self, site: &SiteId, counter: u64) {
        let entry = self.entries.entry(site.clone()).or_insert(0);
        *entry = (*entry).max(counter);
    }

    /// Whether the event identified by `timestamp` is reflected in this vector
    pub fn includes(&self, timestamp: &Timestamp) -> bool {
        self.get(&timestamp.site_id) >= timestamp.counter
    }

    /// Per-site maximum with another vector
    pub fn merge(&mut self, other: &VersionVector) {
        for (site, &counter) in &other.entries {
            self.advance(site, counter);
        }
    }

    /// Every entry of `other` is less than or equal to ours
    pub fn dominates(&self, other: &VersionVector) -> bool {
        other
            .entries
            .iter()
            .all(|(site, &counter)| self.get(site) >= counter)
    }

    /// Neither vector dominates the other
    pub fn is_concurrent(&self, other: &VersionVector) -> bool {
        !self.dominates(other) && !other.dominates(self)
    }

    /// Entries of `self` that are ahead of `other`
    pub fn missing_from(&self, other: &VersionVector) -> Vec<(SiteId, u64)> {
        self.entries
            .iter()
            .filter(|(site, &counter)| other.get(site) < counter)
            .map(|(site, &counter)| (site.clone(), counter))
            .collect()
    }

    /// Highest counter over all sites
    pub fn max_counter(&self) -> u64 {
        self.entries.values().copied().max().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SiteId, &u64)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_pairs(&self) -> Vec<(SiteId, u64)> {
        self.entries
            .iter()
            .map(|(site, &counter)| (site.clone(), counter))
            .collect()
    }
}

impl From<Vec<(SiteId, u64)>> for VersionVector {
    fn from(pairs: Vec<(SiteId, u64)>) -> Self {
        let mut vector = VersionVector::new();
        for (site, counter) in pairs {
            vector.advance(&site, counter);
        }
        vector
    }
}

impl From<VersionVector> for Vec<(SiteId, u64)> {
    fn from(vector: VersionVector) -> Self {
        vector.to_pairs()
    }
}

impl FromIterator<(SiteId, u64)> for VersionVector {
    fn from_iter<I: IntoIterator<Item = (SiteId, u64)>>(iter: I) -> Self {
        iter.into_iter().collect::<Vec<_>>().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(s: &str) -> SiteId {
        SiteId::from(s)
    }

    #[test]
    fn test_timestamp_order_counter_then_site() {
        let a = Timestamp::new(3, "A");
        let b = Timestamp::new(5, "B");
        let c = Timestamp::new(5, "C");

        assert_eq!(a.compare(&b), Ordering::Less);
        assert_eq!(b.compare(&c), Ordering::Less);
        assert_eq!(c.compare(&c.clone()), Ordering::Equal);
        assert!(c > a);
    }

    #[test]
    fn test_update_timestamp_is_strictly_greater() {
        let local = Timestamp::new(4, "A");
        let remote = Timestamp::new(9, "B");

        let updated = update_timestamp(&local, &remote);
        assert!(updated.counter > local.counter);
        assert!(updated.counter > remote.counter);
        assert_eq!(updated.site_id, site("A"));
    }

    #[test]
    fn test_clock_generate_and_observe() {
        let mut clock = LamportClock::new(site("A"));
        assert_eq!(clock.generate().counter, 1);
        assert_eq!(clock.generate().counter, 2);

        clock.observe(&Timestamp::new(10, "B"));
        assert_eq!(clock.counter(), 11);
        assert_eq!(clock.generate().counter, 12);

        // Observing an older remote still moves forward
        clock.observe(&Timestamp::new(1, "B"));
        assert_eq!(clock.counter(), 13);
    }

    #[test]
    fn test_version_vector_dominance() {
        let mut v1 = VersionVector::new();
        v1.advance(&site("A"), 3);
        v1.advance(&site("B"), 1);

        let mut v2 = VersionVector::new();
        v2.advance(&site("A"), 1);
        v2.advance(&site("B"), 2);

        assert!(v1.is_concurrent(&v2));

        v1.merge(&v2);
        assert_eq!(v1.get(&site("A")), 3);
        assert_eq!(v1.get(&site("B")), 2);
        assert!(v1.dominates(&v2));
        assert!(!v2.dominates(&v1));
        assert!(!v1.is_concurrent(&v2));
    }

    #[test]
    fn test_advance_never_moves_backwards() {
        let mut v = VersionVector::new();
        v.advance(&site("A"), 5);
        v.advance(&site("A"), 2);
        assert_eq!(v.get(&site("A")), 5);
        assert!(v.includes(&Timestamp::new(5, "A")));
        assert!(!v.includes(&Timestamp::new(6, "A")));
    }

    #[test]
    fn test_version_vector_serializes_as_sorted_pairs() {
        let mut v = VersionVector::new();
        v.advance(&site("zeta"), 2);
        v.advance(&site("alpha"), 7);

        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#"[["alpha",7],["zeta",2]]"#);

        let back: VersionVector = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
