//! Shared state driving cache synchronisation.
//!
//! The engine owns both stores, both identifier maps and the staleness
//! oracle. Workers execute tasks against it and the proxy facade routes its
//! local operations through it so the same locks guard both paths.
//!
//! Lock order is always add-feature, then add-feature-set, then the
//! identifier maps' own mutexes.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::SystemTime,
};

use log::{debug, warn};
use meridian_core::{
    FeatureDataStore, FeatureQuery, FeatureSetId, FeatureSetQuery, FeatureStoreError,
};

use crate::{
    clock::Clock,
    config::ProxyConfig,
    id_map::{ClientId, FeatureIdMap, FeatureSetIdMap},
    pool::TaskHandler,
    staleness::{CacheView, StalenessOracle},
    task::ClientRequestTask,
};

mod populate;
mod refresh;

pub(crate) struct SyncEngine {
    client: Arc<dyn FeatureDataStore>,
    cache: Arc<dyn FeatureDataStore>,
    features: FeatureIdMap,
    feature_sets: FeatureSetIdMap,
    oracle: StalenessOracle,
    config: ProxyConfig,
    clock: Arc<dyn Clock>,
    add_feature: Mutex<()>,
    add_feature_set: Mutex<()>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("client", &self.client.uri())
            .field("cache", &self.cache.uri())
            .field("features", &self.features.len())
            .field("feature_sets", &self.feature_sets.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Query sent to the client on behalf of `query`.
///
/// A spatial query pulls its whole envelope, since the envelope is what gets
/// recorded as fresh afterwards. Other queries drop paging and ordering so
/// every matching row reaches the cache.
fn client_pull(query: &FeatureQuery) -> FeatureQuery {
    match &query.spatial_filter {
        Some(filter) => FeatureQuery::in_envelope(filter.envelope),
        None => FeatureQuery {
            order: Vec::new(),
            limit: None,
            offset: 0,
            ..query.clone()
        },
    }
}

fn hold(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SyncEngine {
    pub(crate) fn new(
        client: Arc<dyn FeatureDataStore>,
        cache: Arc<dyn FeatureDataStore>,
        config: ProxyConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            cache,
            features: FeatureIdMap::new(),
            feature_sets: FeatureSetIdMap::new(),
            oracle: StalenessOracle::default(),
            config,
            clock,
            add_feature: Mutex::new(()),
            add_feature_set: Mutex::new(()),
        }
    }

    pub(crate) fn client(&self) -> &dyn FeatureDataStore {
        self.client.as_ref()
    }

    pub(crate) fn cache(&self) -> &dyn FeatureDataStore {
        self.cache.as_ref()
    }

    pub(crate) const fn features(&self) -> &FeatureIdMap {
        &self.features
    }

    pub(crate) const fn feature_sets(&self) -> &FeatureSetIdMap {
        &self.feature_sets
    }

    pub(crate) const fn config(&self) -> &ProxyConfig {
        &self.config
    }

    fn stale_time(&self, now: SystemTime) -> SystemTime {
        now.checked_add(self.config.stale_window()).unwrap_or(now)
    }

    /// Claim the throttled right to pull every client feature.
    pub(crate) fn claim_full_scan(&self) -> bool {
        self.oracle
            .claim_full_scan(self.clock.now(), self.config.stale_window())
    }

    /// Undo a claim whose scan was never scheduled.
    pub(crate) fn release_full_scan(&self) {
        self.oracle.release_full_scan();
    }

    fn query_features(&self, query: &FeatureQuery) -> Result<(), FeatureStoreError> {
        let now = self.clock.now();
        let view = CacheView {
            cache: self.cache(),
            features: &self.features,
            max_cache_items: self.config.max_cache_items,
        };
        if !self.oracle.is_stale(query, &view, now) {
            debug!("cached results for {query:?} are fresh; skipping client query");
            return Ok(());
        }
        let rows = self.client.query_features(&client_pull(query))?;
        self.populate_features(rows)?;
        if let Some(filter) = query
            .spatial_filter
            .as_ref()
            .filter(|filter| !filter.is_whole_globe())
        {
            self.oracle.record_region(filter.envelope, self.stale_time(now));
        }
        Ok(())
    }

    /// Remove the feature mappings for every cached feature in `cache_set`.
    fn forget_features_in(&self, cache_set: FeatureSetId) -> Result<(), FeatureStoreError> {
        let rows = self
            .cache
            .query_features(&FeatureQuery::in_feature_set(cache_set))?;
        for row in rows {
            match row {
                Ok(feature) => {
                    self.features.remove_cache_id(feature.id);
                }
                Err(err) => warn!("skipping unreadable cached feature in set {cache_set}: {err}"),
            }
        }
        Ok(())
    }

    /// Delete the cached copy of a client feature and its mapping.
    pub(crate) fn delete_feature(&self, client_id: ClientId) -> Result<(), FeatureStoreError> {
        let _adding = hold(&self.add_feature);
        let cache_id = self
            .features
            .cache_id(client_id)
            .map_err(|_| FeatureStoreError::feature_not_found(client_id))?;
        match self.cache.delete_feature(cache_id) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => debug!("cached feature {cache_id} was already gone"),
            Err(err) => return Err(err),
        }
        self.features.remove_client_id(client_id);
        Ok(())
    }

    /// Delete the cached copy of a client feature set, its features and
    /// every related mapping.
    pub(crate) fn delete_feature_set(&self, client_id: ClientId) -> Result<(), FeatureStoreError> {
        let _adding_features = hold(&self.add_feature);
        let _adding_sets = hold(&self.add_feature_set);
        let cache_id = self
            .feature_sets
            .cache_id(client_id)
            .map_err(|_| FeatureStoreError::feature_set_not_found(client_id))?;
        self.forget_features_in(cache_id)?;
        match self.cache.delete_feature_set(cache_id) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                debug!("cached feature set {cache_id} was already gone");
            }
            Err(err) => return Err(err),
        }
        self.feature_sets.remove_client_id(client_id);
        Ok(())
    }

    /// Delete every cached feature of a client feature set, keeping the set.
    pub(crate) fn delete_all_features(&self, client_id: ClientId) -> Result<(), FeatureStoreError> {
        let _adding = hold(&self.add_feature);
        let cache_id = self
            .feature_sets
            .cache_id(client_id)
            .map_err(|_| FeatureStoreError::feature_set_not_found(client_id))?;
        self.forget_features_in(cache_id)?;
        self.cache.delete_all_features(cache_id)
    }

    /// Empty the cache, both maps and the freshness records.
    pub(crate) fn delete_all_feature_sets(&self) -> Result<(), FeatureStoreError> {
        let _adding_features = hold(&self.add_feature);
        let _adding_sets = hold(&self.add_feature_set);
        self.cache.delete_all_feature_sets()?;
        self.features.clear();
        self.feature_sets.clear();
        self.oracle.reset();
        Ok(())
    }
}

impl TaskHandler for SyncEngine {
    fn execute(&self, task: &ClientRequestTask) -> Result<(), FeatureStoreError> {
        if !self.client.is_available() {
            return Err(FeatureStoreError::Unavailable);
        }
        match task {
            ClientRequestTask::QueryAllFeatures => {
                let rows = self.client.query_features(&FeatureQuery::default())?;
                self.populate_features(rows)
            }
            ClientRequestTask::QueryFeatures(query) => self.query_features(query),
            ClientRequestTask::QueryAllFeatureSets => {
                let rows = self.client.query_feature_sets(&FeatureSetQuery::default())?;
                self.populate_feature_sets(rows)
            }
            ClientRequestTask::QueryFeatureSets(query) => {
                let rows = self.client.query_feature_sets(query)?;
                self.populate_feature_sets(rows)
            }
            ClientRequestTask::Refresh => self.refresh(),
        }
    }
}
