//! Data access contract for feature stores.
//!
//! The `FeatureDataStore` trait is implemented by every store in the
//! workspace: the in-memory store, the SQLite store, and the client/cache
//! proxy. Stores are shared across threads behind `Arc<dyn FeatureDataStore>`
//! and use interior mutability for writes.

use log::warn;

use crate::{
    Feature, FeatureDefinition, FeatureId, FeatureQuery, FeatureSet, FeatureSetDefinition,
    FeatureSetId, FeatureSetQuery, FeatureSetUpdate, FeatureStoreError, FeatureUpdate,
};

mod memory;
#[cfg(feature = "store-sqlite")]
mod sqlite;

pub use memory::MemoryFeatureStore;
#[cfg(feature = "store-sqlite")]
pub use sqlite::{SqliteFeatureStore, SqliteFeatureStoreError};

/// Forward-only cursor over query results.
///
/// Each row is a `Result` so a single unreadable row does not poison the
/// rest of the walk. Exhaustion of the iterator marks the end of results.
pub type FeatureCursor<'a> =
    Box<dyn Iterator<Item = Result<Feature, FeatureStoreError>> + Send + 'a>;

/// Forward-only cursor over feature-set query results.
pub type FeatureSetCursor<'a> =
    Box<dyn Iterator<Item = Result<FeatureSet, FeatureStoreError>> + Send + 'a>;

/// Read and write access to features grouped into feature sets.
///
/// Bounding boxes use WGS84 coordinates (`x = longitude`, `y = latitude`).
///
/// # Examples
///
/// ```rust
/// use geo::{Coord, Geometry, Point, Rect};
/// use meridian_core::{
///     FeatureDataStore, FeatureDefinition, FeatureQuery, FeatureSetDefinition,
///     MemoryFeatureStore,
/// };
///
/// # fn main() -> Result<(), meridian_core::FeatureStoreError> {
/// let store = MemoryFeatureStore::new("memory://example");
/// let set = store.insert_feature_set(&FeatureSetDefinition::new("demo", "points", "Harbour"))?;
/// let buoy = store.insert_feature(
///     set.id,
///     &FeatureDefinition::new("buoy", Geometry::Point(Point::new(0.5, 0.5))),
/// )?;
///
/// let area = Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 1.0, y: 1.0 });
/// let found: Vec<_> = store
///     .query_features(&FeatureQuery::in_envelope(area))?
///     .collect::<Result<_, _>>()?;
/// assert_eq!(found, vec![buoy]);
/// # Ok(())
/// # }
/// ```
pub trait FeatureDataStore: Send + Sync {
    /// Location of the underlying data.
    fn uri(&self) -> &str;

    /// Whether the store can currently service requests.
    fn is_available(&self) -> bool;

    /// Fetch a single feature.
    fn get_feature(&self, id: FeatureId) -> Result<Feature, FeatureStoreError>;

    /// Return every feature matching `query`.
    fn query_features(&self, query: &FeatureQuery) -> Result<FeatureCursor<'_>, FeatureStoreError>;

    /// Count the features matching `query`.
    fn query_features_count(&self, query: &FeatureQuery) -> Result<usize, FeatureStoreError>;

    /// Fetch a single feature set.
    fn get_feature_set(&self, id: FeatureSetId) -> Result<FeatureSet, FeatureStoreError>;

    /// Return every feature set matching `query`.
    fn query_feature_sets(
        &self,
        query: &FeatureSetQuery,
    ) -> Result<FeatureSetCursor<'_>, FeatureStoreError>;

    /// Count the feature sets matching `query`.
    fn query_feature_sets_count(&self, query: &FeatureSetQuery)
    -> Result<usize, FeatureStoreError>;

    /// Create a feature set and return it with its assigned id.
    fn insert_feature_set(
        &self,
        definition: &FeatureSetDefinition,
    ) -> Result<FeatureSet, FeatureStoreError>;

    /// Change the content of a feature set.
    fn update_feature_set(
        &self,
        id: FeatureSetId,
        update: &FeatureSetUpdate,
    ) -> Result<(), FeatureStoreError>;

    /// Delete a feature set and every feature in it.
    fn delete_feature_set(&self, id: FeatureSetId) -> Result<(), FeatureStoreError>;

    /// Delete every feature set and feature.
    fn delete_all_feature_sets(&self) -> Result<(), FeatureStoreError>;

    /// Create a feature in `feature_set_id` and return it with its assigned id.
    fn insert_feature(
        &self,
        feature_set_id: FeatureSetId,
        definition: &FeatureDefinition,
    ) -> Result<Feature, FeatureStoreError>;

    /// Change the content of a feature.
    fn update_feature(
        &self,
        id: FeatureId,
        update: &FeatureUpdate,
    ) -> Result<(), FeatureStoreError>;

    /// Delete a feature.
    fn delete_feature(&self, id: FeatureId) -> Result<(), FeatureStoreError>;

    /// Delete every feature in a feature set, keeping the set itself.
    fn delete_all_features(&self, feature_set_id: FeatureSetId) -> Result<(), FeatureStoreError>;

    /// Whether a feature is visible.
    fn is_feature_visible(&self, id: FeatureId) -> Result<bool, FeatureStoreError>;

    /// Show or hide a feature.
    fn set_feature_visible(&self, id: FeatureId, visible: bool) -> Result<(), FeatureStoreError>;

    /// Show or hide every feature matching `query`.
    fn set_features_visible(
        &self,
        query: &FeatureQuery,
        visible: bool,
    ) -> Result<(), FeatureStoreError>;

    /// Whether a feature set is visible.
    fn is_feature_set_visible(&self, id: FeatureSetId) -> Result<bool, FeatureStoreError>;

    /// Show or hide a feature set.
    fn set_feature_set_visible(
        &self,
        id: FeatureSetId,
        visible: bool,
    ) -> Result<(), FeatureStoreError>;

    /// Show or hide every feature set matching `query`.
    fn set_feature_sets_visible(
        &self,
        query: &FeatureSetQuery,
        visible: bool,
    ) -> Result<(), FeatureStoreError>;

    /// Whether a feature set rejects edits from the presentation layer.
    fn is_feature_set_read_only(&self, id: FeatureSetId) -> Result<bool, FeatureStoreError>;

    /// Mark a feature set read-only or editable.
    fn set_feature_set_read_only(
        &self,
        id: FeatureSetId,
        read_only: bool,
    ) -> Result<(), FeatureStoreError>;

    /// Mark every feature set matching `query` read-only or editable.
    fn set_feature_sets_read_only(
        &self,
        query: &FeatureSetQuery,
        read_only: bool,
    ) -> Result<(), FeatureStoreError>;

    /// Open a bulk-modification scope. Scopes nest and must be paired with
    /// [`FeatureDataStore::end_bulk_modification`].
    fn begin_bulk_modification(&self) -> Result<(), FeatureStoreError>;

    /// Close the innermost bulk-modification scope. The outermost close
    /// commits when `successful` is true and rolls back otherwise.
    fn end_bulk_modification(&self, successful: bool) -> Result<(), FeatureStoreError>;

    /// Whether a bulk-modification scope is open.
    fn is_in_bulk_modification(&self) -> bool;

    /// Release resources held by the store.
    fn close(&self) {}
}

/// Scope guard that keeps a bulk modification open for its lifetime.
///
/// The scope is always closed with `successful = true` when the guard drops,
/// so rows written before a failure inside the scope are kept.
///
/// # Examples
/// ```
/// use meridian_core::{BulkModification, FeatureDataStore, MemoryFeatureStore};
///
/// # fn main() -> Result<(), meridian_core::FeatureStoreError> {
/// let store = MemoryFeatureStore::new("memory://bulk");
/// {
///     let _scope = BulkModification::begin(&store)?;
///     assert!(store.is_in_bulk_modification());
/// }
/// assert!(!store.is_in_bulk_modification());
/// # Ok(())
/// # }
/// ```
#[must_use = "the bulk modification closes as soon as the guard is dropped"]
pub struct BulkModification<'a> {
    store: &'a dyn FeatureDataStore,
}

impl<'a> BulkModification<'a> {
    /// Open a scope on `store`.
    ///
    /// # Errors
    /// Propagates the store's failure to open the scope.
    pub fn begin(store: &'a dyn FeatureDataStore) -> Result<Self, FeatureStoreError> {
        store.begin_bulk_modification()?;
        Ok(Self { store })
    }
}

impl Drop for BulkModification<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.store.end_bulk_modification(true) {
            warn!(
                "failed to close bulk modification on {}: {err}",
                self.store.uri()
            );
        }
    }
}

impl std::fmt::Debug for BulkModification<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkModification")
            .field("store", &self.store.uri())
            .finish()
    }
}
