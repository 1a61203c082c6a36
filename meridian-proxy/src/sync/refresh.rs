//! Full reconciliation of the cache against the client.

use std::collections::BTreeSet;

use log::{debug, warn};
use meridian_core::{BulkModification, FeatureQuery, FeatureSetQuery, FeatureStoreError};

use super::{SyncEngine, hold};
use crate::id_map::ClientId;

impl SyncEngine {
    /// Pull every client feature set and feature, then drop cached entries
    /// the client no longer reports.
    ///
    /// Removal is skipped for a pass whose client cursor yielded an
    /// unreadable row, since the set of reported ids is then incomplete.
    pub(super) fn refresh(&self) -> Result<(), FeatureStoreError> {
        let mut reported_sets = BTreeSet::new();
        let mut sets_complete = true;
        let set_rows = self
            .client
            .query_feature_sets(&FeatureSetQuery::default())?
            .inspect(|row| match row {
                Ok(set) => {
                    reported_sets.insert(set.id);
                }
                Err(_) => sets_complete = false,
            });
        self.populate_feature_sets(set_rows)?;
        if sets_complete {
            self.drop_unreported_feature_sets(&reported_sets)?;
        }

        let mut reported_features = BTreeSet::new();
        let mut features_complete = true;
        let feature_rows = self
            .client
            .query_features(&FeatureQuery::default())?
            .inspect(|row| match row {
                Ok(feature) => {
                    reported_features.insert(feature.id);
                }
                Err(_) => features_complete = false,
            });
        self.populate_features(feature_rows)?;
        if features_complete {
            self.drop_unreported_features(&reported_features)?;
        }
        Ok(())
    }

    fn drop_unreported_feature_sets(
        &self,
        reported: &BTreeSet<ClientId>,
    ) -> Result<(), FeatureStoreError> {
        let _adding_features = hold(&self.add_feature);
        let _adding_sets = hold(&self.add_feature_set);
        let _scope = BulkModification::begin(self.cache())?;
        for (client_id, cache_id) in self.feature_sets.client_ids() {
            if reported.contains(&client_id) {
                continue;
            }
            debug!("client no longer reports feature set {client_id}; removing it");
            if let Err(err) = self.forget_features_in(cache_id) {
                warn!("could not forget features of cached set {cache_id}: {err}");
            }
            match self.cache.delete_feature_set(cache_id) {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    warn!("failed to delete cached feature set {cache_id}: {err}");
                    continue;
                }
            }
            self.feature_sets.remove_client_id(client_id);
        }
        Ok(())
    }

    fn drop_unreported_features(
        &self,
        reported: &BTreeSet<ClientId>,
    ) -> Result<(), FeatureStoreError> {
        let _adding = hold(&self.add_feature);
        let _scope = BulkModification::begin(self.cache())?;
        for (client_id, cache_id) in self.features.client_ids() {
            if reported.contains(&client_id) {
                continue;
            }
            debug!("client no longer reports feature {client_id}; removing it");
            match self.cache.delete_feature(cache_id) {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    warn!("failed to delete cached feature {cache_id}: {err}");
                    continue;
                }
            }
            self.features.remove_client_id(client_id);
        }
        Ok(())
    }
}
