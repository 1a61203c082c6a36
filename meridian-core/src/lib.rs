//! Core domain types and the feature store contract for the Meridian engine.
//!
//! Features are geospatial entities grouped into feature sets. Every store,
//! whether local, remote, or a proxy combining both, implements
//! [`FeatureDataStore`] so stores can be substituted for one another.

#![forbid(unsafe_code)]

mod error;
mod feature;
mod query;
mod store;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use error::{EntityKind, FeatureStoreError};
pub use feature::{
    AltitudeMode, AttributeValue, Attributes, Feature, FeatureDefinition, FeatureId, FeatureSet,
    FeatureSetDefinition, FeatureSetId, FeatureSetUpdate, FeatureUpdate, Style,
};
pub use query::{
    FeatureOrder, FeatureQuery, FeatureSetQuery, SpatialFilter, envelope_contains, whole_globe,
};
pub use store::{
    BulkModification, FeatureCursor, FeatureDataStore, FeatureSetCursor, MemoryFeatureStore,
};

#[cfg(feature = "store-sqlite")]
pub use store::{SqliteFeatureStore, SqliteFeatureStoreError};
