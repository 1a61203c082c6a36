//! Materialises client rows into the cache and keeps the identifier maps in
//! step with the rows written.

use geo::Geometry;
use log::{debug, warn};
use meridian_core::{BulkModification, Feature, FeatureSet, FeatureSetId, FeatureStoreError};

use super::{SyncEngine, hold};

fn is_empty_collection(geometry: &Geometry<f64>) -> bool {
    matches!(geometry, Geometry::GeometryCollection(collection) if collection.0.is_empty())
}

impl SyncEngine {
    /// Copy every readable feature row into the cache.
    ///
    /// Rows that fail are logged and skipped. The bulk-modification scope is
    /// closed with success regardless, keeping the rows that were written.
    pub(super) fn populate_features<I>(&self, rows: I) -> Result<(), FeatureStoreError>
    where
        I: IntoIterator<Item = Result<Feature, FeatureStoreError>>,
    {
        let _scope = BulkModification::begin(self.cache())?;
        for row in rows {
            let feature = match row {
                Ok(feature) => feature,
                Err(err) => {
                    warn!("skipping unreadable client feature: {err}");
                    continue;
                }
            };
            if let Err(err) = self.populate_feature(&feature) {
                warn!("failed to cache client feature {}: {err}", feature.id);
            }
        }
        Ok(())
    }

    /// Copy every readable feature-set row into the cache.
    pub(super) fn populate_feature_sets<I>(&self, rows: I) -> Result<(), FeatureStoreError>
    where
        I: IntoIterator<Item = Result<FeatureSet, FeatureStoreError>>,
    {
        let _scope = BulkModification::begin(self.cache())?;
        for row in rows {
            let set = match row {
                Ok(set) => set,
                Err(err) => {
                    warn!("skipping unreadable client feature set: {err}");
                    continue;
                }
            };
            if let Err(err) = self.populate_feature_set(&set) {
                warn!("failed to cache client feature set {}: {err}", set.id);
            }
        }
        Ok(())
    }

    fn populate_feature(&self, feature: &Feature) -> Result<(), FeatureStoreError> {
        let _adding = hold(&self.add_feature);
        let now = self.clock.now();

        let previous = match self.features.cache_id(feature.id) {
            Ok(cache_id) => {
                let present = match self.cache.get_feature(cache_id) {
                    Ok(_) => true,
                    Err(err) if err.is_not_found() => false,
                    Err(err) => return Err(err),
                };
                let fresh = self
                    .features
                    .cache_stale_time(cache_id)
                    .is_ok_and(|stale_time| now < stale_time);
                if present && fresh {
                    debug!("client feature {} is still fresh in the cache", feature.id);
                    return Ok(());
                }
                Some(cache_id)
            }
            Err(_) => None,
        };

        let cache_set = self.resolve_feature_set(feature.feature_set_id)?;

        if is_empty_collection(&feature.geometry) {
            warn!(
                "client feature {} has an empty geometry collection; not caching it",
                feature.id
            );
            return Ok(());
        }

        let inserted = self.cache.insert_feature(cache_set, &feature.to_definition())?;
        let stale_time = self.stale_time(now);
        let mapped = match previous {
            Some(old_cache_id) => self
                .features
                .update(feature.id, old_cache_id, inserted.id, stale_time)
                .map(|()| Some(old_cache_id)),
            None => self
                .features
                .add(feature.id, inserted.id, stale_time)
                .map(|()| None),
        };
        match mapped {
            Ok(Some(old_cache_id)) => {
                self.discard_cached_feature(old_cache_id);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                self.discard_cached_feature(inserted.id);
                Err(err.into())
            }
        }
    }

    fn discard_cached_feature(&self, cache_id: u64) {
        match self.cache.delete_feature(cache_id) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => warn!("failed to delete cached feature {cache_id}: {err}"),
        }
    }

    /// Cache id of the client feature set, pulling it from the client first
    /// when it has not been seen yet.
    fn resolve_feature_set(
        &self,
        client_id: FeatureSetId,
    ) -> Result<FeatureSetId, FeatureStoreError> {
        if let Ok(cache_id) = self.feature_sets.cache_id(client_id) {
            return Ok(cache_id);
        }
        let pulled = self
            .client
            .get_feature_set(client_id)
            .and_then(|set| self.populate_feature_set(&set));
        if let Err(err) = pulled {
            warn!("could not pull client feature set {client_id}: {err}");
        }
        self.feature_sets.cache_id(client_id).map_err(|_| {
            FeatureStoreError::IllegalState(format!(
                "client feature set {client_id} has no cache counterpart after population"
            ))
        })
    }

    fn populate_feature_set(&self, set: &FeatureSet) -> Result<(), FeatureStoreError> {
        let _adding = hold(&self.add_feature_set);

        let previous = match self.feature_sets.cache_id(set.id) {
            Ok(cache_id) => match self.cache.get_feature_set(cache_id) {
                Ok(_) => {
                    debug!("client feature set {} is already cached", set.id);
                    return Ok(());
                }
                Err(err) if err.is_not_found() => Some(cache_id),
                Err(err) => return Err(err),
            },
            Err(_) => None,
        };

        let inserted = self.cache.insert_feature_set(&set.to_definition())?;
        let mapped = match previous {
            Some(old_cache_id) => self.feature_sets.update(set.id, old_cache_id, inserted.id),
            None => self.feature_sets.add(set.id, inserted.id),
        };
        if let Err(err) = mapped {
            if let Err(cleanup) = self.cache.delete_feature_set(inserted.id) {
                warn!("failed to delete cached feature set {}: {cleanup}", inserted.id);
            }
            return Err(err.into());
        }
        Ok(())
    }
}
