//! Insert / update / skip decisions.
//!
//! Existence comes from the per-run cache first; misses are resolved with a
//! single batched destination query and cached, absent IDs included.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::cache::{Existence, ExistenceCache};
use crate::destination::{Destination, DestinationError, ExistingRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpsertAction {
    Insert,
    Update,
    Skip,
}

/// Last-write-wins with the CRM as the only clock that counts.
///
/// A present row is updated only when the source timestamp is strictly newer
/// than the stored one plus `skew`. A stored timestamp that is missing or
/// unparseable loses to any source timestamp.
pub fn classify(
    source_ts: Option<DateTime<Utc>>,
    existence: &Existence,
    skew: Duration,
) -> UpsertAction {
    let existing = match existence {
        Existence::Absent => return UpsertAction::Insert,
        Existence::Present(existing) => existing,
    };
    match (source_ts, existing.update_date) {
        (None, _) => UpsertAction::Skip,
        (Some(_), None) => UpsertAction::Update,
        (Some(source), Some(dest)) if source > dest + skew => UpsertAction::Update,
        _ => UpsertAction::Skip,
    }
}

pub struct Decider<'a> {
    cache: &'a ExistenceCache,
    destination: &'a dyn Destination,
    skew: Duration,
}

impl<'a> Decider<'a> {
    pub fn new(cache: &'a ExistenceCache, destination: &'a dyn Destination, skew: Duration) -> Self {
        Self {
            cache,
            destination,
            skew,
        }
    }

    /// Existence for every ID in `ids`.
    ///
    /// At most one destination request is made, covering only the IDs the
    /// cache could not answer.
    pub async fn lookup(&self, ids: &[i64]) -> Result<HashMap<i64, Existence>, DestinationError> {
        let mut resolved = HashMap::with_capacity(ids.len());
        let mut misses = Vec::new();
        let mut seen = HashSet::with_capacity(ids.len());

        for &id in ids {
            if !seen.insert(id) {
                continue;
            }
            match self.cache.get(id) {
                Some(existence) => {
                    resolved.insert(id, existence);
                }
                None => misses.push(id),
            }
        }

        debug!(
            cached = resolved.len(),
            misses = misses.len(),
            "Resolving existence"
        );
        if misses.is_empty() {
            return Ok(resolved);
        }

        let found = self.destination.fetch_existing(&misses).await?;
        for id in misses {
            let existence = found
                .get(&id)
                .copied()
                .map_or(Existence::Absent, Existence::Present);
            self.cache.insert(id, existence);
            resolved.insert(id, existence);
        }
        Ok(resolved)
    }

    pub fn classify(&self, source_ts: Option<DateTime<Utc>>, existence: &Existence) -> UpsertAction {
        classify(source_ts, existence, self.skew)
    }

    /// Remember a successful write so later batches in this run see it.
    pub fn record_written(&self, id: i64, row: ExistingRow) {
        self.cache.insert(id, Existence::Present(row));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDestination;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 2, hour, 0, 0).unwrap()
    }

    fn present(update: Option<DateTime<Utc>>) -> Existence {
        Existence::Present(ExistingRow {
            update_date: update,
            create_date: None,
        })
    }

    #[test]
    fn test_absent_inserts() {
        assert_eq!(
            classify(Some(ts(10)), &Existence::Absent, Duration::zero()),
            UpsertAction::Insert
        );
    }

    #[test]
    fn test_strictly_newer_updates() {
        assert_eq!(
            classify(Some(ts(11)), &present(Some(ts(10))), Duration::zero()),
            UpsertAction::Update
        );
    }

    #[test]
    fn test_equal_or_older_skips() {
        assert_eq!(
            classify(Some(ts(10)), &present(Some(ts(10))), Duration::zero()),
            UpsertAction::Skip
        );
        assert_eq!(
            classify(Some(ts(9)), &present(Some(ts(10))), Duration::zero()),
            UpsertAction::Skip
        );
    }

    #[test]
    fn test_skew_tolerance() {
        let skew = Duration::minutes(90);
        assert_eq!(
            classify(Some(ts(11)), &present(Some(ts(10))), skew),
            UpsertAction::Skip
        );
        assert_eq!(
            classify(Some(ts(12)), &present(Some(ts(10))), skew),
            UpsertAction::Update
        );
    }

    #[test]
    fn test_broken_destination_timestamp_heals() {
        assert_eq!(
            classify(Some(ts(1)), &present(None), Duration::zero()),
            UpsertAction::Update
        );
    }

    #[test]
    fn test_unknown_source_timestamp_never_overwrites() {
        assert_eq!(
            classify(None, &present(Some(ts(1))), Duration::zero()),
            UpsertAction::Skip
        );
    }

    #[tokio::test]
    async fn test_lookup_batches_misses_and_caches_absent() {
        let destination = FakeDestination::default();
        destination.seed(1, Some(ts(10)));
        let cache = ExistenceCache::new(std::time::Duration::from_secs(300));
        let decider = Decider::new(&cache, &destination, Duration::zero());

        let first = decider.lookup(&[1, 2, 2]).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[&1], present(Some(ts(10))));
        assert_eq!(first[&2], Existence::Absent);
        assert_eq!(destination.existence_queries(), vec![vec![1, 2]]);

        // Both answers, including the absent one, come from the cache now.
        let second = decider.lookup(&[2, 1]).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(destination.existence_queries().len(), 1);
    }

    #[tokio::test]
    async fn test_lookup_queries_only_uncached_subset() {
        let destination = FakeDestination::default();
        let cache = ExistenceCache::new(std::time::Duration::from_secs(300));
        cache.insert(1, Existence::Absent);
        let decider = Decider::new(&cache, &destination, Duration::zero());

        decider.lookup(&[1, 2, 3]).await.unwrap();
        assert_eq!(destination.existence_queries(), vec![vec![2, 3]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_id_rechecked_after_ttl() {
        let destination = FakeDestination::default();
        let cache = ExistenceCache::new(std::time::Duration::from_secs(300));
        let decider = Decider::new(&cache, &destination, Duration::zero());

        decider.lookup(&[7]).await.unwrap();
        tokio::time::advance(std::time::Duration::from_secs(100)).await;
        decider.lookup(&[7]).await.unwrap();
        assert_eq!(destination.existence_queries().len(), 1);

        tokio::time::advance(std::time::Duration::from_secs(200)).await;
        decider.lookup(&[7]).await.unwrap();
        assert_eq!(destination.existence_queries().len(), 2);
    }

    #[tokio::test]
    async fn test_lookup_error_propagates_without_caching() {
        let destination = FakeDestination::default();
        destination.fail_existence_checks();
        let cache = ExistenceCache::new(std::time::Duration::from_secs(300));
        let decider = Decider::new(&cache, &destination, Duration::zero());

        assert!(decider.lookup(&[1]).await.is_err());
        assert_eq!(cache.entry_count(), 0);
    }
}
