//! Decides whether a feature query must go back to the client.
//!
//! Rules, in priority order:
//!
//! 1. A spatial query is fresh when an unexpired queried region contains its
//!    envelope.
//! 2. An id query is stale as soon as one id is unmapped, evicted from the
//!    cache or past its stale time.
//! 3. Any other query is stale.
//!
//! Unfiltered full scans are throttled separately through
//! [`StalenessOracle::claim_full_scan`].

use std::{
    collections::BTreeSet,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime},
};

use geo::Rect;
use log::{debug, warn};
use meridian_core::{FeatureDataStore, FeatureId, FeatureQuery, envelope_contains};

use crate::id_map::FeatureIdMap;

/// An envelope pulled from the client, fresh until `stale_time`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct QueriedRegion {
    stale_time: SystemTime,
    envelope: Rect<f64>,
}

/// What the oracle consults besides its own records.
pub(crate) struct CacheView<'a> {
    /// The local store.
    pub(crate) cache: &'a dyn FeatureDataStore,
    /// Client-to-cache feature translation.
    pub(crate) features: &'a FeatureIdMap,
    /// Item count at which the cache is reported full.
    pub(crate) max_cache_items: usize,
}

/// Freshness bookkeeping shared by every worker.
#[derive(Debug, Default)]
pub(crate) struct StalenessOracle {
    regions: Mutex<Vec<QueriedRegion>>,
    next_full_scan: Mutex<Option<SystemTime>>,
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StalenessOracle {
    /// Whether `query` needs a client round trip at `now`.
    pub(crate) fn is_stale(
        &self,
        query: &FeatureQuery,
        view: &CacheView<'_>,
        now: SystemTime,
    ) -> bool {
        if let Some(filter) = &query.spatial_filter {
            warn_if_cache_full(view);
            let fresh = self.region_is_fresh(&filter.envelope, now);
            if fresh {
                debug!("region {:?} is covered by a fresh queried region", filter.envelope);
            }
            return !fresh;
        }
        if let Some(ids) = query.ids.as_ref().filter(|ids| !ids.is_empty()) {
            return match first_stale_id(ids, view, now) {
                Some(id) => {
                    debug!("feature {id} is stale; query needs a refresh");
                    true
                }
                None => false,
            };
        }
        true
    }

    /// Whether an unexpired region contains `envelope`. Expired regions are
    /// pruned on the way.
    pub(crate) fn region_is_fresh(&self, envelope: &Rect<f64>, now: SystemTime) -> bool {
        let mut regions = relock(&self.regions);
        regions.retain(|region| now < region.stale_time);
        regions
            .iter()
            .any(|region| envelope_contains(&region.envelope, envelope))
    }

    /// Record that `envelope` was pulled from the client.
    pub(crate) fn record_region(&self, envelope: Rect<f64>, stale_time: SystemTime) {
        relock(&self.regions).push(QueriedRegion {
            stale_time,
            envelope,
        });
    }

    /// Claim the right to run an unfiltered scan at `now`.
    ///
    /// Succeeds at most once per `window`; a successful claim pushes the next
    /// allowed scan to `now + window`.
    pub(crate) fn claim_full_scan(&self, now: SystemTime, window: Duration) -> bool {
        let mut next = relock(&self.next_full_scan);
        if next.is_some_and(|allowed| now < allowed) {
            return false;
        }
        *next = Some(now.checked_add(window).unwrap_or(now));
        true
    }

    /// Give back a claim whose scan could not be scheduled.
    ///
    /// A successful claim only ever replaces a deadline that had already
    /// passed, so clearing the deadline restores the throttle's behaviour.
    pub(crate) fn release_full_scan(&self) {
        *relock(&self.next_full_scan) = None;
    }

    /// Forget every region and the full-scan throttle.
    pub(crate) fn reset(&self) {
        relock(&self.regions).clear();
        *relock(&self.next_full_scan) = None;
    }
}

fn warn_if_cache_full(view: &CacheView<'_>) {
    match view.cache.query_features_count(&FeatureQuery::default()) {
        Ok(count) if count >= view.max_cache_items => warn!(
            "cache {} holds {count} features, at or above its limit of {}",
            view.cache.uri(),
            view.max_cache_items
        ),
        Ok(_) => {}
        Err(err) => debug!("could not count cached features: {err}"),
    }
}

/// First id in `ids` whose cached copy cannot be trusted at `now`.
///
/// Checking stops at the first stale id.
fn first_stale_id(
    ids: &BTreeSet<FeatureId>,
    view: &CacheView<'_>,
    now: SystemTime,
) -> Option<FeatureId> {
    ids.iter().copied().find(|&client_id| {
        let Ok(cache_id) = view.features.cache_id(client_id) else {
            return true;
        };
        if view.cache.get_feature(cache_id).is_err() {
            return true;
        }
        view.features
            .cache_stale_time(cache_id)
            .map_or(true, |stale_time| now >= stale_time)
    })
}
