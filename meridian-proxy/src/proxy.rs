//! Feature store that serves reads from a local cache while a background
//! pool keeps that cache in step with a slower client store.
//!
//! Callers only ever see client identifiers. Queries are translated into
//! the cache's id space before they run and every returned row is
//! translated back. Reads never wait on the client: a query enqueues a
//! background pull and answers with whatever the cache holds now.

use std::{
    collections::BTreeSet,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use log::{debug, warn};
use meridian_core::{
    Feature, FeatureCursor, FeatureDataStore, FeatureDefinition, FeatureId,
    FeatureQuery, FeatureSet, FeatureSetCursor, FeatureSetDefinition, FeatureSetId,
    FeatureSetQuery, FeatureSetUpdate, FeatureStoreError, FeatureUpdate,
};

use crate::{
    clock::{Clock, SystemClock},
    config::ProxyConfig,
    id_map::IdMapError,
    pool::WorkerPool,
    sync::SyncEngine,
    task::{ClientRequestTask, TaskQueue},
};

/// Read-through caching proxy in front of a client store.
///
/// Content mutations are rejected with [`FeatureStoreError::Unsupported`];
/// deletes and the visibility and read-only toggles are applied to the
/// cache only.
///
/// # Examples
/// ```
/// use std::{sync::Arc, time::Duration};
/// use geo::{Geometry, Point};
/// use meridian_core::{
///     FeatureDataStore, FeatureDefinition, FeatureQuery, FeatureSetDefinition,
///     MemoryFeatureStore,
/// };
/// use meridian_proxy::{ClientCacheProxy, ProxyConfig};
///
/// # fn main() -> Result<(), meridian_core::FeatureStoreError> {
/// let client = Arc::new(MemoryFeatureStore::with_first_id("memory://client", 1));
/// let set = client.insert_feature_set(&FeatureSetDefinition::new("demo", "points", "Harbour"))?;
/// let buoy = client.insert_feature(
///     set.id,
///     &FeatureDefinition::new("buoy", Geometry::Point(Point::new(0.5, 0.5))),
/// )?;
/// let cache = Arc::new(MemoryFeatureStore::with_first_id("memory://cache", 1000));
///
/// let proxy = ClientCacheProxy::new(client, cache, ProxyConfig::default());
/// // Answered from the cold cache; the pull runs in the background.
/// let _cold = proxy.query_features(&FeatureQuery::default())?.count();
///
/// assert!(proxy.wait_for_idle(Duration::from_secs(5)));
/// let cached = proxy.get_feature(buoy.id)?;
/// assert_eq!(cached.id, buoy.id);
/// assert_eq!(cached.feature_set_id, set.id);
/// # Ok(())
/// # }
/// ```
pub struct ClientCacheProxy {
    engine: Arc<SyncEngine>,
    queue: Arc<TaskQueue>,
    pool: Mutex<Option<WorkerPool>>,
}

impl fmt::Debug for ClientCacheProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCacheProxy")
            .field("engine", &self.engine)
            .field("pending_tasks", &self.queue.len())
            .field("workers", &self.lock_pool().as_ref().map(WorkerPool::workers))
            .finish_non_exhaustive()
    }
}

const fn unsupported(operation: &'static str) -> FeatureStoreError {
    FeatureStoreError::Unsupported { operation }
}

/// Translate `ids` through `lookup`, dropping and logging unmapped ones.
fn translate_ids(
    ids: &BTreeSet<u64>,
    lookup: impl Fn(u64) -> Result<u64, IdMapError>,
) -> BTreeSet<u64> {
    ids.iter()
        .filter_map(|&id| match lookup(id) {
            Ok(translated) => Some(translated),
            Err(err) => {
                warn!("dropping id from query: {err}");
                None
            }
        })
        .collect()
}

impl ClientCacheProxy {
    /// Proxy `client` through `cache` using the system clock.
    #[must_use]
    pub fn new(
        client: Arc<dyn FeatureDataStore>,
        cache: Arc<dyn FeatureDataStore>,
        config: ProxyConfig,
    ) -> Self {
        Self::with_clock(client, cache, config, Arc::new(SystemClock))
    }

    /// Proxy `client` through `cache`, judging staleness against `clock`.
    #[must_use]
    pub fn with_clock(
        client: Arc<dyn FeatureDataStore>,
        cache: Arc<dyn FeatureDataStore>,
        config: ProxyConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            engine: Arc::new(SyncEngine::new(client, cache, config, clock)),
            queue: Arc::new(TaskQueue::default()),
            pool: Mutex::new(None),
        }
    }

    /// Configuration the proxy was built with.
    #[must_use]
    pub fn config(&self) -> &ProxyConfig {
        self.engine.config()
    }

    /// The upstream store.
    #[must_use]
    pub fn client(&self) -> &dyn FeatureDataStore {
        self.engine.client()
    }

    /// The local store.
    #[must_use]
    pub fn cache(&self) -> &dyn FeatureDataStore {
        self.engine.cache()
    }

    /// Queue a full reconciliation of the cache against the client.
    ///
    /// # Errors
    /// As for any request that starts the worker pool: the client must
    /// report at least one feature set and the proxy must not be shut down.
    pub fn refresh(&self) -> Result<(), FeatureStoreError> {
        self.submit(ClientRequestTask::Refresh)
    }

    /// Block until no background task is queued or running, or until
    /// `timeout` elapses. Returns whether the proxy went idle.
    ///
    /// Ordinary reads never wait; this is for orderly shutdown and tests.
    #[must_use]
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        self.queue.wait_for_idle(timeout)
    }

    /// Drop pending tasks and detach the workers.
    ///
    /// A task already running finishes in the background. Later queries are
    /// still answered from the cache but fail to schedule new work.
    pub fn shutdown(&self) {
        match self.lock_pool().as_ref() {
            Some(pool) => pool.shutdown(),
            None => self.queue.detach(),
        }
    }

    fn lock_pool(&self) -> MutexGuard<'_, Option<WorkerPool>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_pool(&self) -> Result<WorkerPool, FeatureStoreError> {
        let sets = self
            .engine
            .client()
            .query_feature_sets_count(&FeatureSetQuery::default())?;
        if sets == 0 {
            return Err(FeatureStoreError::IllegalState(format!(
                "client {} reports no feature sets",
                self.engine.client().uri()
            )));
        }
        let size = self.config().max_client_request_threads.min(sets);
        WorkerPool::start(size, Arc::clone(&self.queue), &self.engine)
    }

    fn submit(&self, task: ClientRequestTask) -> Result<(), FeatureStoreError> {
        if self.queue.is_detached() {
            return Err(FeatureStoreError::IllegalState(
                "client cache proxy has been shut down".to_owned(),
            ));
        }
        let mut slot = self.lock_pool();
        if slot.is_none() {
            *slot = Some(self.start_pool()?);
        }
        if slot.as_ref().is_some_and(|pool| pool.submit(task)) {
            Ok(())
        } else {
            Err(FeatureStoreError::IllegalState(
                "client cache proxy has been shut down".to_owned(),
            ))
        }
    }

    fn to_cache_feature_query(&self, query: &FeatureQuery) -> FeatureQuery {
        let mut translated = query.clone();
        translated.ids = query
            .ids
            .as_ref()
            .map(|ids| translate_ids(ids, |id| self.engine.features().cache_id(id)));
        translated.feature_set_ids = query
            .feature_set_ids
            .as_ref()
            .map(|ids| translate_ids(ids, |id| self.engine.feature_sets().cache_id(id)));
        translated
    }

    fn to_cache_feature_set_query(&self, query: &FeatureSetQuery) -> FeatureSetQuery {
        let mut translated = query.clone();
        translated.ids = query
            .ids
            .as_ref()
            .map(|ids| translate_ids(ids, |id| self.engine.feature_sets().cache_id(id)));
        translated
    }

    fn to_client_feature(&self, feature: &Feature) -> Result<Feature, IdMapError> {
        let id = self.engine.features().client_id(feature.id)?;
        let feature_set_id = self
            .engine
            .feature_sets()
            .client_id(feature.feature_set_id)?;
        Ok(feature.with_ids(id, feature_set_id))
    }

    fn to_client_feature_set(&self, set: &FeatureSet) -> Result<FeatureSet, IdMapError> {
        Ok(set.with_id(self.engine.feature_sets().client_id(set.id)?))
    }

    fn cache_feature_id(&self, id: FeatureId) -> Result<FeatureId, FeatureStoreError> {
        self.engine
            .features()
            .cache_id(id)
            .map_err(|_| FeatureStoreError::feature_not_found(id))
    }

    fn cache_feature_set_id(&self, id: FeatureSetId) -> Result<FeatureSetId, FeatureStoreError> {
        self.engine
            .feature_sets()
            .cache_id(id)
            .map_err(|_| FeatureStoreError::feature_set_not_found(id))
    }

    /// Run `op` against the cached copy of client feature `id`, reporting a
    /// missing row under the client id.
    fn on_cached_feature<T>(
        &self,
        id: FeatureId,
        op: impl FnOnce(&dyn FeatureDataStore, FeatureId) -> Result<T, FeatureStoreError>,
    ) -> Result<T, FeatureStoreError> {
        let cache_id = self.cache_feature_id(id)?;
        op(self.cache(), cache_id).map_err(|err| {
            if err.is_not_found() {
                debug!("client feature {id} is mapped but its cached row {cache_id} is gone");
                FeatureStoreError::feature_not_found(id)
            } else {
                err
            }
        })
    }

    /// Feature-set counterpart of `on_cached_feature`.
    fn on_cached_feature_set<T>(
        &self,
        id: FeatureSetId,
        op: impl FnOnce(&dyn FeatureDataStore, FeatureSetId) -> Result<T, FeatureStoreError>,
    ) -> Result<T, FeatureStoreError> {
        let cache_id = self.cache_feature_set_id(id)?;
        op(self.cache(), cache_id).map_err(|err| {
            if err.is_not_found() {
                debug!("client feature set {id} is mapped but its cached row {cache_id} is gone");
                FeatureStoreError::feature_set_not_found(id)
            } else {
                err
            }
        })
    }
}

/// Split translated rows into errors and values, errors first.
fn partition<T>(rows: Vec<Result<T, FeatureStoreError>>) -> (Vec<FeatureStoreError>, Vec<T>) {
    let mut errors = Vec::new();
    let mut values = Vec::with_capacity(rows.len());
    for row in rows {
        match row {
            Ok(value) => values.push(value),
            Err(err) => errors.push(err),
        }
    }
    (errors, values)
}

impl FeatureDataStore for ClientCacheProxy {
    fn uri(&self) -> &str {
        self.engine.client().uri()
    }

    fn is_available(&self) -> bool {
        self.engine.client().is_available()
    }

    fn get_feature(&self, id: FeatureId) -> Result<Feature, FeatureStoreError> {
        let cached = self.on_cached_feature(id, |cache, cache_id| cache.get_feature(cache_id))?;
        self.to_client_feature(&cached).map_err(|err| {
            warn!("cached feature {} lost its mapping: {err}", cached.id);
            FeatureStoreError::feature_not_found(id)
        })
    }

    fn query_features(&self, query: &FeatureQuery) -> Result<FeatureCursor<'_>, FeatureStoreError> {
        if !query.selects_all() {
            self.submit(ClientRequestTask::QueryFeatures(query.clone()))?;
        } else if self.engine.claim_full_scan() {
            if let Err(err) = self.submit(ClientRequestTask::QueryAllFeatures) {
                self.engine.release_full_scan();
                return Err(err);
            }
        }

        // Paging and ordering are applied after translation so they follow
        // client ids rather than cache ids.
        let mut cache_query = self.to_cache_feature_query(query);
        cache_query.limit = None;
        cache_query.offset = 0;
        let rows: Vec<_> = self
            .cache()
            .query_features(&cache_query)?
            .filter_map(|row| match row {
                Ok(feature) => match self.to_client_feature(&feature) {
                    Ok(translated) => Some(Ok(translated)),
                    Err(err) => {
                        warn!("skipping cached feature {} without a client id: {err}", feature.id);
                        None
                    }
                },
                Err(err) => Some(Err(err)),
            })
            .collect();
        let (errors, features) = partition(rows);
        let finished = query.finish(features);
        Ok(Box::new(
            errors.into_iter().map(Err).chain(finished.into_iter().map(Ok)),
        ))
    }

    fn query_features_count(&self, query: &FeatureQuery) -> Result<usize, FeatureStoreError> {
        self.cache()
            .query_features_count(&self.to_cache_feature_query(query))
    }

    fn get_feature_set(&self, id: FeatureSetId) -> Result<FeatureSet, FeatureStoreError> {
        let cached =
            self.on_cached_feature_set(id, |cache, cache_id| cache.get_feature_set(cache_id))?;
        self.to_client_feature_set(&cached).map_err(|err| {
            warn!("cached feature set {} lost its mapping: {err}", cached.id);
            FeatureStoreError::feature_set_not_found(id)
        })
    }

    fn query_feature_sets(
        &self,
        query: &FeatureSetQuery,
    ) -> Result<FeatureSetCursor<'_>, FeatureStoreError> {
        let task = if *query == FeatureSetQuery::default() {
            ClientRequestTask::QueryAllFeatureSets
        } else {
            ClientRequestTask::QueryFeatureSets(query.clone())
        };
        self.submit(task)?;

        let mut cache_query = self.to_cache_feature_set_query(query);
        cache_query.limit = None;
        cache_query.offset = 0;
        let rows: Vec<_> = self
            .cache()
            .query_feature_sets(&cache_query)?
            .filter_map(|row| match row {
                Ok(set) => match self.to_client_feature_set(&set) {
                    Ok(translated) => Some(Ok(translated)),
                    Err(err) => {
                        warn!("skipping cached feature set {} without a client id: {err}", set.id);
                        None
                    }
                },
                Err(err) => Some(Err(err)),
            })
            .collect();
        let (errors, sets) = partition(rows);
        let finished = query.finish(sets);
        Ok(Box::new(
            errors.into_iter().map(Err).chain(finished.into_iter().map(Ok)),
        ))
    }

    fn query_feature_sets_count(
        &self,
        query: &FeatureSetQuery,
    ) -> Result<usize, FeatureStoreError> {
        self.cache()
            .query_feature_sets_count(&self.to_cache_feature_set_query(query))
    }

    fn insert_feature_set(
        &self,
        _definition: &FeatureSetDefinition,
    ) -> Result<FeatureSet, FeatureStoreError> {
        Err(unsupported("insert_feature_set"))
    }

    fn update_feature_set(
        &self,
        _id: FeatureSetId,
        _update: &FeatureSetUpdate,
    ) -> Result<(), FeatureStoreError> {
        Err(unsupported("update_feature_set"))
    }

    fn delete_feature_set(&self, id: FeatureSetId) -> Result<(), FeatureStoreError> {
        self.engine.delete_feature_set(id)
    }

    fn delete_all_feature_sets(&self) -> Result<(), FeatureStoreError> {
        self.engine.delete_all_feature_sets()
    }

    fn insert_feature(
        &self,
        _feature_set_id: FeatureSetId,
        _definition: &FeatureDefinition,
    ) -> Result<Feature, FeatureStoreError> {
        Err(unsupported("insert_feature"))
    }

    fn update_feature(
        &self,
        _id: FeatureId,
        _update: &FeatureUpdate,
    ) -> Result<(), FeatureStoreError> {
        Err(unsupported("update_feature"))
    }

    fn delete_feature(&self, id: FeatureId) -> Result<(), FeatureStoreError> {
        self.engine.delete_feature(id)
    }

    fn delete_all_features(&self, feature_set_id: FeatureSetId) -> Result<(), FeatureStoreError> {
        self.engine.delete_all_features(feature_set_id)
    }

    fn is_feature_visible(&self, id: FeatureId) -> Result<bool, FeatureStoreError> {
        self.on_cached_feature(id, |cache, cache_id| cache.is_feature_visible(cache_id))
    }

    fn set_feature_visible(&self, id: FeatureId, visible: bool) -> Result<(), FeatureStoreError> {
        self.on_cached_feature(id, |cache, cache_id| cache.set_feature_visible(cache_id, visible))
    }

    fn set_features_visible(
        &self,
        query: &FeatureQuery,
        visible: bool,
    ) -> Result<(), FeatureStoreError> {
        self.cache()
            .set_features_visible(&self.to_cache_feature_query(query), visible)
    }

    fn is_feature_set_visible(&self, id: FeatureSetId) -> Result<bool, FeatureStoreError> {
        self.on_cached_feature_set(id, |cache, cache_id| cache.is_feature_set_visible(cache_id))
    }

    fn set_feature_set_visible(
        &self,
        id: FeatureSetId,
        visible: bool,
    ) -> Result<(), FeatureStoreError> {
        self.on_cached_feature_set(id, |cache, cache_id| {
            cache.set_feature_set_visible(cache_id, visible)
        })
    }

    fn set_feature_sets_visible(
        &self,
        query: &FeatureSetQuery,
        visible: bool,
    ) -> Result<(), FeatureStoreError> {
        self.cache()
            .set_feature_sets_visible(&self.to_cache_feature_set_query(query), visible)
    }

    fn is_feature_set_read_only(&self, id: FeatureSetId) -> Result<bool, FeatureStoreError> {
        self.on_cached_feature_set(id, |cache, cache_id| cache.is_feature_set_read_only(cache_id))
    }

    fn set_feature_set_read_only(
        &self,
        id: FeatureSetId,
        read_only: bool,
    ) -> Result<(), FeatureStoreError> {
        self.on_cached_feature_set(id, |cache, cache_id| {
            cache.set_feature_set_read_only(cache_id, read_only)
        })
    }

    fn set_feature_sets_read_only(
        &self,
        query: &FeatureSetQuery,
        read_only: bool,
    ) -> Result<(), FeatureStoreError> {
        self.cache()
            .set_feature_sets_read_only(&self.to_cache_feature_set_query(query), read_only)
    }

    fn begin_bulk_modification(&self) -> Result<(), FeatureStoreError> {
        self.cache().begin_bulk_modification()
    }

    fn end_bulk_modification(&self, successful: bool) -> Result<(), FeatureStoreError> {
        self.cache().end_bulk_modification(successful)
    }

    fn is_in_bulk_modification(&self) -> bool {
        self.cache().is_in_bulk_modification()
    }

    fn close(&self) {
        self.shutdown();
    }
}

impl Drop for ClientCacheProxy {
    fn drop(&mut self) {
        self.shutdown();
    }
}
