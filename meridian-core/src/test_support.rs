//! Test-only helpers shared by unit and behaviour tests across the workspace.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use geo::{Geometry, Point};

use crate::{
    Feature, FeatureCursor, FeatureDataStore, FeatureDefinition, FeatureId, FeatureQuery,
    FeatureSet, FeatureSetCursor, FeatureSetDefinition, FeatureSetId, FeatureSetQuery,
    FeatureSetUpdate, FeatureStoreError, FeatureUpdate,
};

/// Definition of a named point feature.
#[must_use]
pub fn point_feature(name: &str, x: f64, y: f64) -> FeatureDefinition {
    FeatureDefinition::new(name, Geometry::Point(Point::new(x, y)))
}

/// Definition of a feature set from the `test` provider.
#[must_use]
pub fn feature_set(name: &str) -> FeatureSetDefinition {
    FeatureSetDefinition::new("test", "points", name)
}

/// Snapshot of the calls a [`CountingStore`] has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// Calls to `query_features`.
    pub query_features: usize,
    /// Calls to `query_feature_sets`.
    pub query_feature_sets: usize,
    /// Calls to `get_feature`.
    pub get_feature: usize,
    /// Calls to `get_feature_set`.
    pub get_feature_set: usize,
    /// Calls to any content-mutating method.
    pub writes: usize,
}

#[derive(Debug, Default)]
struct Counters {
    query_features: AtomicUsize,
    query_feature_sets: AtomicUsize,
    get_feature: AtomicUsize,
    get_feature_set: AtomicUsize,
    writes: AtomicUsize,
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

/// Store wrapper that records how often each operation is called.
///
/// Clones share their counters, so a test can keep one handle while the
/// other is moved into the system under test.
#[derive(Clone)]
pub struct CountingStore {
    inner: Arc<dyn FeatureDataStore>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for CountingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountingStore")
            .field("inner", &self.inner.uri())
            .field("counts", &self.counts())
            .finish_non_exhaustive()
    }
}

impl CountingStore {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn FeatureDataStore>) -> Self {
        Self {
            inner,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Current call counts.
    #[must_use]
    pub fn counts(&self) -> CallCounts {
        CallCounts {
            query_features: self.counters.query_features.load(Ordering::SeqCst),
            query_feature_sets: self.counters.query_feature_sets.load(Ordering::SeqCst),
            get_feature: self.counters.get_feature.load(Ordering::SeqCst),
            get_feature_set: self.counters.get_feature_set.load(Ordering::SeqCst),
            writes: self.counters.writes.load(Ordering::SeqCst),
        }
    }
}

impl FeatureDataStore for CountingStore {
    fn uri(&self) -> &str {
        self.inner.uri()
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    fn get_feature(&self, id: FeatureId) -> Result<Feature, FeatureStoreError> {
        bump(&self.counters.get_feature);
        self.inner.get_feature(id)
    }

    fn query_features(&self, query: &FeatureQuery) -> Result<FeatureCursor<'_>, FeatureStoreError> {
        bump(&self.counters.query_features);
        self.inner.query_features(query)
    }

    fn query_features_count(&self, query: &FeatureQuery) -> Result<usize, FeatureStoreError> {
        self.inner.query_features_count(query)
    }

    fn get_feature_set(&self, id: FeatureSetId) -> Result<FeatureSet, FeatureStoreError> {
        bump(&self.counters.get_feature_set);
        self.inner.get_feature_set(id)
    }

    fn query_feature_sets(
        &self,
        query: &FeatureSetQuery,
    ) -> Result<FeatureSetCursor<'_>, FeatureStoreError> {
        bump(&self.counters.query_feature_sets);
        self.inner.query_feature_sets(query)
    }

    fn query_feature_sets_count(
        &self,
        query: &FeatureSetQuery,
    ) -> Result<usize, FeatureStoreError> {
        self.inner.query_feature_sets_count(query)
    }

    fn insert_feature_set(
        &self,
        definition: &FeatureSetDefinition,
    ) -> Result<FeatureSet, FeatureStoreError> {
        bump(&self.counters.writes);
        self.inner.insert_feature_set(definition)
    }

    fn update_feature_set(
        &self,
        id: FeatureSetId,
        update: &FeatureSetUpdate,
    ) -> Result<(), FeatureStoreError> {
        bump(&self.counters.writes);
        self.inner.update_feature_set(id, update)
    }

    fn delete_feature_set(&self, id: FeatureSetId) -> Result<(), FeatureStoreError> {
        bump(&self.counters.writes);
        self.inner.delete_feature_set(id)
    }

    fn delete_all_feature_sets(&self) -> Result<(), FeatureStoreError> {
        bump(&self.counters.writes);
        self.inner.delete_all_feature_sets()
    }

    fn insert_feature(
        &self,
        feature_set_id: FeatureSetId,
        definition: &FeatureDefinition,
    ) -> Result<Feature, FeatureStoreError> {
        bump(&self.counters.writes);
        self.inner.insert_feature(feature_set_id, definition)
    }

    fn update_feature(
        &self,
        id: FeatureId,
        update: &FeatureUpdate,
    ) -> Result<(), FeatureStoreError> {
        bump(&self.counters.writes);
        self.inner.update_feature(id, update)
    }

    fn delete_feature(&self, id: FeatureId) -> Result<(), FeatureStoreError> {
        bump(&self.counters.writes);
        self.inner.delete_feature(id)
    }

    fn delete_all_features(&self, feature_set_id: FeatureSetId) -> Result<(), FeatureStoreError> {
        bump(&self.counters.writes);
        self.inner.delete_all_features(feature_set_id)
    }

    fn is_feature_visible(&self, id: FeatureId) -> Result<bool, FeatureStoreError> {
        self.inner.is_feature_visible(id)
    }

    fn set_feature_visible(&self, id: FeatureId, visible: bool) -> Result<(), FeatureStoreError> {
        self.inner.set_feature_visible(id, visible)
    }

    fn set_features_visible(
        &self,
        query: &FeatureQuery,
        visible: bool,
    ) -> Result<(), FeatureStoreError> {
        self.inner.set_features_visible(query, visible)
    }

    fn is_feature_set_visible(&self, id: FeatureSetId) -> Result<bool, FeatureStoreError> {
        self.inner.is_feature_set_visible(id)
    }

    fn set_feature_set_visible(
        &self,
        id: FeatureSetId,
        visible: bool,
    ) -> Result<(), FeatureStoreError> {
        self.inner.set_feature_set_visible(id, visible)
    }

    fn set_feature_sets_visible(
        &self,
        query: &FeatureSetQuery,
        visible: bool,
    ) -> Result<(), FeatureStoreError> {
        self.inner.set_feature_sets_visible(query, visible)
    }

    fn is_feature_set_read_only(&self, id: FeatureSetId) -> Result<bool, FeatureStoreError> {
        self.inner.is_feature_set_read_only(id)
    }

    fn set_feature_set_read_only(
        &self,
        id: FeatureSetId,
        read_only: bool,
    ) -> Result<(), FeatureStoreError> {
        self.inner.set_feature_set_read_only(id, read_only)
    }

    fn set_feature_sets_read_only(
        &self,
        query: &FeatureSetQuery,
        read_only: bool,
    ) -> Result<(), FeatureStoreError> {
        self.inner.set_feature_sets_read_only(query, read_only)
    }

    fn begin_bulk_modification(&self) -> Result<(), FeatureStoreError> {
        self.inner.begin_bulk_modification()
    }

    fn end_bulk_modification(&self, successful: bool) -> Result<(), FeatureStoreError> {
        self.inner.end_bulk_modification(successful)
    }

    fn is_in_bulk_modification(&self) -> bool {
        self.inner.is_in_bulk_modification()
    }
}
