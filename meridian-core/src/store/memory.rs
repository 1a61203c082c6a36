//! Thread-safe in-memory feature store.
//!
//! Feature envelopes are kept in an R\*-tree so spatial queries avoid a full
//! scan. The store is suitable both as a small local cache and as a stand-in
//! for a remote source.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicBool, Ordering},
    },
};

use geo::Rect;
use rstar::{AABB, RTree, primitives::GeomWithData, primitives::Rectangle};

use super::{FeatureCursor, FeatureDataStore, FeatureSetCursor};
use crate::{
    Feature, FeatureDefinition, FeatureId, FeatureQuery, FeatureSet, FeatureSetDefinition,
    FeatureSetId, FeatureSetQuery, FeatureSetUpdate, FeatureStoreError, FeatureUpdate,
};

type IndexEntry = GeomWithData<Rectangle<[f64; 2]>, FeatureId>;

fn index_entry(feature: &Feature) -> Option<IndexEntry> {
    feature.envelope().map(|envelope| {
        GeomWithData::new(
            Rectangle::from_corners(
                [envelope.min().x, envelope.min().y],
                [envelope.max().x, envelope.max().y],
            ),
            feature.id,
        )
    })
}

fn aabb(envelope: &Rect<f64>) -> AABB<[f64; 2]> {
    AABB::from_corners(
        [envelope.min().x, envelope.min().y],
        [envelope.max().x, envelope.max().y],
    )
}

#[derive(Debug, Clone)]
struct FeatureRecord {
    feature: Feature,
    visible: bool,
}

#[derive(Debug, Clone)]
struct FeatureSetRecord {
    set: FeatureSet,
    visible: bool,
    read_only: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_feature_id: FeatureId,
    next_feature_set_id: FeatureSetId,
    feature_sets: BTreeMap<FeatureSetId, FeatureSetRecord>,
    features: BTreeMap<FeatureId, FeatureRecord>,
    index: RTree<IndexEntry>,
}

impl MemoryState {
    fn is_visible(&self, record: &FeatureRecord) -> bool {
        record.visible
            && self
                .feature_sets
                .get(&record.feature.feature_set_id)
                .is_some_and(|set| set.visible)
    }

    fn matching_features(&self, query: &FeatureQuery) -> Vec<Feature> {
        let candidates: Box<dyn Iterator<Item = &FeatureRecord> + '_> = match &query.spatial_filter {
            Some(filter) => Box::new(
                self.index
                    .locate_in_envelope_intersecting(&aabb(&filter.envelope))
                    .filter_map(|entry| self.features.get(&entry.data)),
            ),
            None => Box::new(self.features.values()),
        };
        let matching = candidates
            .filter(|record| query.matches(&record.feature, self.is_visible(record)))
            .map(|record| record.feature.clone())
            .collect();
        query.finish(matching)
    }

    fn matching_feature_sets(&self, query: &FeatureSetQuery) -> Vec<FeatureSet> {
        let matching = self
            .feature_sets
            .values()
            .filter(|record| query.matches(&record.set, record.visible))
            .map(|record| record.set.clone())
            .collect();
        query.finish(matching)
    }

    fn remove_feature(&mut self, id: FeatureId) -> Option<FeatureRecord> {
        let record = self.features.remove(&id)?;
        if let Some(entry) = index_entry(&record.feature) {
            self.index.remove(&entry);
        }
        Some(record)
    }

    fn remove_features_in(&mut self, feature_set_id: FeatureSetId) {
        let doomed: Vec<FeatureId> = self
            .features
            .values()
            .filter(|record| record.feature.feature_set_id == feature_set_id)
            .map(|record| record.feature.id)
            .collect();
        for id in doomed {
            self.remove_feature(id);
        }
    }

    fn feature_set_mut(
        &mut self,
        id: FeatureSetId,
    ) -> Result<&mut FeatureSetRecord, FeatureStoreError> {
        self.feature_sets
            .get_mut(&id)
            .ok_or(FeatureStoreError::feature_set_not_found(id))
    }
}

/// In-memory [`FeatureDataStore`] with an R\*-tree spatial index.
pub struct MemoryFeatureStore {
    uri: String,
    available: AtomicBool,
    bulk_depth: Mutex<usize>,
    state: RwLock<MemoryState>,
}

impl fmt::Debug for MemoryFeatureStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        f.debug_struct("MemoryFeatureStore")
            .field("uri", &self.uri)
            .field("feature_sets", &state.feature_sets.len())
            .field("features", &state.features.len())
            .finish_non_exhaustive()
    }
}

impl MemoryFeatureStore {
    /// Create an empty store whose ids start at 1.
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self::with_first_id(uri, 1)
    }

    /// Create an empty store whose feature and feature-set ids start at
    /// `first_id`.
    ///
    /// Distinct starting points keep the id spaces of two stores visibly
    /// apart.
    #[must_use]
    pub fn with_first_id(uri: impl Into<String>, first_id: u64) -> Self {
        Self {
            uri: uri.into(),
            available: AtomicBool::new(true),
            bulk_depth: Mutex::new(0),
            state: RwLock::new(MemoryState {
                next_feature_id: first_id,
                next_feature_set_id: first_id,
                ..MemoryState::default()
            }),
        }
    }

    /// Mark the store available or unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FeatureDataStore for MemoryFeatureStore {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn get_feature(&self, id: FeatureId) -> Result<Feature, FeatureStoreError> {
        self.read()
            .features
            .get(&id)
            .map(|record| record.feature.clone())
            .ok_or(FeatureStoreError::feature_not_found(id))
    }

    fn query_features(&self, query: &FeatureQuery) -> Result<FeatureCursor<'_>, FeatureStoreError> {
        let features = self.read().matching_features(query);
        Ok(Box::new(features.into_iter().map(Ok)))
    }

    fn query_features_count(&self, query: &FeatureQuery) -> Result<usize, FeatureStoreError> {
        let state = self.read();
        if query.selects_all() {
            return Ok(state.features.len());
        }
        Ok(state.matching_features(query).len())
    }

    fn get_feature_set(&self, id: FeatureSetId) -> Result<FeatureSet, FeatureStoreError> {
        self.read()
            .feature_sets
            .get(&id)
            .map(|record| record.set.clone())
            .ok_or(FeatureStoreError::feature_set_not_found(id))
    }

    fn query_feature_sets(
        &self,
        query: &FeatureSetQuery,
    ) -> Result<FeatureSetCursor<'_>, FeatureStoreError> {
        let sets = self.read().matching_feature_sets(query);
        Ok(Box::new(sets.into_iter().map(Ok)))
    }

    fn query_feature_sets_count(
        &self,
        query: &FeatureSetQuery,
    ) -> Result<usize, FeatureStoreError> {
        Ok(self.read().matching_feature_sets(query).len())
    }

    fn insert_feature_set(
        &self,
        definition: &FeatureSetDefinition,
    ) -> Result<FeatureSet, FeatureStoreError> {
        let mut state = self.write();
        let id = state.next_feature_set_id;
        state.next_feature_set_id = id.saturating_add(1);
        let set = definition.clone().into_feature_set(id, 1);
        state.feature_sets.insert(
            id,
            FeatureSetRecord {
                set: set.clone(),
                visible: true,
                read_only: false,
            },
        );
        Ok(set)
    }

    fn update_feature_set(
        &self,
        id: FeatureSetId,
        update: &FeatureSetUpdate,
    ) -> Result<(), FeatureStoreError> {
        let mut state = self.write();
        let record = state.feature_set_mut(id)?;
        record.set = update.apply(&record.set);
        Ok(())
    }

    fn delete_feature_set(&self, id: FeatureSetId) -> Result<(), FeatureStoreError> {
        let mut state = self.write();
        if state.feature_sets.remove(&id).is_none() {
            return Err(FeatureStoreError::feature_set_not_found(id));
        }
        state.remove_features_in(id);
        Ok(())
    }

    fn delete_all_feature_sets(&self) -> Result<(), FeatureStoreError> {
        let mut state = self.write();
        state.feature_sets.clear();
        state.features.clear();
        state.index = RTree::new();
        Ok(())
    }

    fn insert_feature(
        &self,
        feature_set_id: FeatureSetId,
        definition: &FeatureDefinition,
    ) -> Result<Feature, FeatureStoreError> {
        let mut state = self.write();
        if !state.feature_sets.contains_key(&feature_set_id) {
            return Err(FeatureStoreError::feature_set_not_found(feature_set_id));
        }
        let id = state.next_feature_id;
        state.next_feature_id = id.saturating_add(1);
        let feature = definition.clone().into_feature(id, feature_set_id, 1);
        if let Some(entry) = index_entry(&feature) {
            state.index.insert(entry);
        }
        state.features.insert(
            id,
            FeatureRecord {
                feature: feature.clone(),
                visible: true,
            },
        );
        Ok(feature)
    }

    fn update_feature(
        &self,
        id: FeatureId,
        update: &FeatureUpdate,
    ) -> Result<(), FeatureStoreError> {
        let mut state = self.write();
        let record = state
            .remove_feature(id)
            .ok_or(FeatureStoreError::feature_not_found(id))?;
        let feature = update.apply(&record.feature);
        if let Some(entry) = index_entry(&feature) {
            state.index.insert(entry);
        }
        state.features.insert(
            id,
            FeatureRecord {
                feature,
                visible: record.visible,
            },
        );
        Ok(())
    }

    fn delete_feature(&self, id: FeatureId) -> Result<(), FeatureStoreError> {
        self.write()
            .remove_feature(id)
            .map(|_| ())
            .ok_or(FeatureStoreError::feature_not_found(id))
    }

    fn delete_all_features(&self, feature_set_id: FeatureSetId) -> Result<(), FeatureStoreError> {
        let mut state = self.write();
        if !state.feature_sets.contains_key(&feature_set_id) {
            return Err(FeatureStoreError::feature_set_not_found(feature_set_id));
        }
        state.remove_features_in(feature_set_id);
        Ok(())
    }

    fn is_feature_visible(&self, id: FeatureId) -> Result<bool, FeatureStoreError> {
        let state = self.read();
        state
            .features
            .get(&id)
            .map(|record| state.is_visible(record))
            .ok_or(FeatureStoreError::feature_not_found(id))
    }

    fn set_feature_visible(&self, id: FeatureId, visible: bool) -> Result<(), FeatureStoreError> {
        let mut state = self.write();
        let record = state
            .features
            .get_mut(&id)
            .ok_or(FeatureStoreError::feature_not_found(id))?;
        record.visible = visible;
        Ok(())
    }

    fn set_features_visible(
        &self,
        query: &FeatureQuery,
        visible: bool,
    ) -> Result<(), FeatureStoreError> {
        let mut state = self.write();
        let ids: Vec<FeatureId> = state
            .matching_features(query)
            .iter()
            .map(|feature| feature.id)
            .collect();
        for id in ids {
            if let Some(record) = state.features.get_mut(&id) {
                record.visible = visible;
            }
        }
        Ok(())
    }

    fn is_feature_set_visible(&self, id: FeatureSetId) -> Result<bool, FeatureStoreError> {
        self.read()
            .feature_sets
            .get(&id)
            .map(|record| record.visible)
            .ok_or(FeatureStoreError::feature_set_not_found(id))
    }

    fn set_feature_set_visible(
        &self,
        id: FeatureSetId,
        visible: bool,
    ) -> Result<(), FeatureStoreError> {
        self.write().feature_set_mut(id)?.visible = visible;
        Ok(())
    }

    fn set_feature_sets_visible(
        &self,
        query: &FeatureSetQuery,
        visible: bool,
    ) -> Result<(), FeatureStoreError> {
        let mut state = self.write();
        for record in state.feature_sets.values_mut() {
            if query.matches(&record.set, record.visible) {
                record.visible = visible;
            }
        }
        Ok(())
    }

    fn is_feature_set_read_only(&self, id: FeatureSetId) -> Result<bool, FeatureStoreError> {
        self.read()
            .feature_sets
            .get(&id)
            .map(|record| record.read_only)
            .ok_or(FeatureStoreError::feature_set_not_found(id))
    }

    fn set_feature_set_read_only(
        &self,
        id: FeatureSetId,
        read_only: bool,
    ) -> Result<(), FeatureStoreError> {
        self.write().feature_set_mut(id)?.read_only = read_only;
        Ok(())
    }

    fn set_feature_sets_read_only(
        &self,
        query: &FeatureSetQuery,
        read_only: bool,
    ) -> Result<(), FeatureStoreError> {
        let mut state = self.write();
        for record in state.feature_sets.values_mut() {
            if query.matches(&record.set, record.visible) {
                record.read_only = read_only;
            }
        }
        Ok(())
    }

    fn begin_bulk_modification(&self) -> Result<(), FeatureStoreError> {
        let mut depth = self.bulk_depth.lock().unwrap_or_else(PoisonError::into_inner);
        *depth = depth.saturating_add(1);
        Ok(())
    }

    fn end_bulk_modification(&self, _successful: bool) -> Result<(), FeatureStoreError> {
        let mut depth = self.bulk_depth.lock().unwrap_or_else(PoisonError::into_inner);
        if *depth == 0 {
            return Err(FeatureStoreError::IllegalState(
                "bulk modification ended without a matching begin".to_owned(),
            ));
        }
        *depth -= 1;
        Ok(())
    }

    fn is_in_bulk_modification(&self) -> bool {
        *self.bulk_depth.lock().unwrap_or_else(PoisonError::into_inner) > 0
    }
}
