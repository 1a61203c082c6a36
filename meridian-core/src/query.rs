//! Query parameters accepted by [`crate::FeatureDataStore`] implementations.
//!
//! Both parameter types derive `PartialEq` so that background work keyed on
//! a query can be coalesced by structural equality.

use std::collections::BTreeSet;

use geo::{Coord, Geometry, Intersects, Rect};

use crate::{Feature, FeatureId, FeatureSet, FeatureSetId};

/// Longitude/latitude envelope covering the whole globe.
#[must_use]
pub fn whole_globe() -> Rect<f64> {
    Rect::new(Coord { x: -180.0, y: -90.0 }, Coord { x: 180.0, y: 90.0 })
}

/// Whether `outer` fully contains `inner`. Boundaries are inclusive.
///
/// # Examples
/// ```
/// use geo::{Coord, Rect};
/// use meridian_core::envelope_contains;
///
/// let outer = Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 10.0, y: 10.0 });
/// let inner = Rect::new(Coord { x: 0.0, y: 2.0 }, Coord { x: 5.0, y: 10.0 });
/// assert!(envelope_contains(&outer, &inner));
/// assert!(!envelope_contains(&inner, &outer));
/// ```
#[must_use]
pub fn envelope_contains(outer: &Rect<f64>, inner: &Rect<f64>) -> bool {
    outer.min().x <= inner.min().x
        && outer.min().y <= inner.min().y
        && outer.max().x >= inner.max().x
        && outer.max().y >= inner.max().y
}

/// Spatial restriction of a feature query.
///
/// The envelope drives index lookups and freshness bookkeeping. The optional
/// geometry narrows matches to features that intersect it.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialFilter {
    /// Axis-aligned envelope of the filter region.
    pub envelope: Rect<f64>,
    /// Exact filter geometry, when narrower than the envelope.
    pub geometry: Option<Geometry<f64>>,
}

impl SpatialFilter {
    /// Filter on an envelope alone.
    #[must_use]
    pub const fn envelope(envelope: Rect<f64>) -> Self {
        Self {
            envelope,
            geometry: None,
        }
    }

    /// Whether the filter covers the whole globe and so restricts nothing.
    #[must_use]
    pub fn is_whole_globe(&self) -> bool {
        envelope_contains(&self.envelope, &whole_globe())
    }

    /// Whether `feature` satisfies the filter.
    #[must_use]
    pub fn matches(&self, feature: &Feature) -> bool {
        if !self.envelope.intersects(&feature.geometry) {
            return false;
        }
        self.geometry
            .as_ref()
            .is_none_or(|geometry| geometry.intersects(&feature.geometry))
    }
}

/// Sort key for feature query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureOrder {
    /// Ascending feature id.
    Id,
    /// Ascending feature name.
    Name,
    /// Ascending parent feature-set id.
    FeatureSet,
}

/// Parameters selecting features.
///
/// A default value selects every feature.
///
/// # Examples
/// ```
/// use geo::{Coord, Rect};
/// use meridian_core::{FeatureQuery, SpatialFilter};
///
/// let area = Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 1.0, y: 1.0 });
/// let query = FeatureQuery::in_envelope(area).with_limit(10);
/// assert!(query.spatial_filter.is_some());
/// assert_eq!(query, FeatureQuery::in_envelope(area).with_limit(10));
/// assert!(FeatureQuery::default().selects_all());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureQuery {
    /// Restrict to these feature ids.
    pub ids: Option<BTreeSet<FeatureId>>,
    /// Restrict to features in these feature sets.
    pub feature_set_ids: Option<BTreeSet<FeatureSetId>>,
    /// Restrict to features with one of these names.
    pub names: Option<BTreeSet<String>>,
    /// Restrict to features intersecting a region.
    pub spatial_filter: Option<SpatialFilter>,
    /// Only return visible features.
    pub visible_only: bool,
    /// Sort keys applied in order; results default to ascending id.
    pub order: Vec<FeatureOrder>,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Number of leading results to skip.
    pub offset: usize,
}

impl FeatureQuery {
    /// Query for an explicit set of ids.
    #[must_use]
    pub fn by_ids(ids: impl IntoIterator<Item = FeatureId>) -> Self {
        Self {
            ids: Some(ids.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Query for features in one feature set.
    #[must_use]
    pub fn in_feature_set(feature_set_id: FeatureSetId) -> Self {
        Self {
            feature_set_ids: Some(BTreeSet::from([feature_set_id])),
            ..Self::default()
        }
    }

    /// Query for features intersecting an envelope.
    #[must_use]
    pub fn in_envelope(envelope: Rect<f64>) -> Self {
        Self {
            spatial_filter: Some(SpatialFilter::envelope(envelope)),
            ..Self::default()
        }
    }

    /// Set the result limit while consuming `self`.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether the query is unfiltered and unpaged, selecting every feature.
    #[must_use]
    pub fn selects_all(&self) -> bool {
        *self == Self::default()
    }

    /// Whether `feature` satisfies every filter. Paging is not considered.
    #[must_use]
    pub fn matches(&self, feature: &Feature, visible: bool) -> bool {
        if self.visible_only && !visible {
            return false;
        }
        if let Some(ids) = &self.ids {
            if !ids.contains(&feature.id) {
                return false;
            }
        }
        if let Some(sets) = &self.feature_set_ids {
            if !sets.contains(&feature.feature_set_id) {
                return false;
            }
        }
        if let Some(names) = &self.names {
            if !names.contains(&feature.name) {
                return false;
            }
        }
        self.spatial_filter
            .as_ref()
            .is_none_or(|filter| filter.matches(feature))
    }

    /// Sort and page a set of matching features.
    #[must_use]
    pub fn finish(&self, mut features: Vec<Feature>) -> Vec<Feature> {
        features.sort_by(|a, b| {
            self.order
                .iter()
                .map(|key| match key {
                    FeatureOrder::Id => a.id.cmp(&b.id),
                    FeatureOrder::Name => a.name.cmp(&b.name),
                    FeatureOrder::FeatureSet => a.feature_set_id.cmp(&b.feature_set_id),
                })
                .find(|ordering| ordering.is_ne())
                .unwrap_or_else(|| a.id.cmp(&b.id))
        });
        page(features, self.offset, self.limit)
    }
}

/// Parameters selecting feature sets.
///
/// A default value selects every feature set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureSetQuery {
    /// Restrict to these feature-set ids.
    pub ids: Option<BTreeSet<FeatureSetId>>,
    /// Restrict to sets with one of these names.
    pub names: Option<BTreeSet<String>>,
    /// Restrict to sets from one of these providers.
    pub providers: Option<BTreeSet<String>>,
    /// Restrict to sets of one of these types.
    pub kinds: Option<BTreeSet<String>>,
    /// Restrict to sets displayable at this resolution in metres per pixel.
    pub resolution: Option<f64>,
    /// Only return visible sets.
    pub visible_only: bool,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Number of leading results to skip.
    pub offset: usize,
}

impl FeatureSetQuery {
    /// Query for an explicit set of ids.
    #[must_use]
    pub fn by_ids(ids: impl IntoIterator<Item = FeatureSetId>) -> Self {
        Self {
            ids: Some(ids.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Whether `set` satisfies every filter. Paging is not considered.
    #[must_use]
    pub fn matches(&self, set: &FeatureSet, visible: bool) -> bool {
        if self.visible_only && !visible {
            return false;
        }
        let filters = [
            (&self.names, &set.name),
            (&self.providers, &set.provider),
            (&self.kinds, &set.kind),
        ];
        if filters
            .iter()
            .any(|(allowed, value)| allowed.as_ref().is_some_and(|names| !names.contains(*value)))
        {
            return false;
        }
        if let Some(ids) = &self.ids {
            if !ids.contains(&set.id) {
                return false;
            }
        }
        self.resolution
            .is_none_or(|resolution| set.displays_at(resolution))
    }

    /// Sort by id and page a set of matching feature sets.
    #[must_use]
    pub fn finish(&self, mut sets: Vec<FeatureSet>) -> Vec<FeatureSet> {
        sets.sort_unstable_by_key(|set| set.id);
        page(sets, self.offset, self.limit)
    }
}

fn page<T>(items: Vec<T>, offset: usize, limit: Option<usize>) -> Vec<T> {
    items
        .into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FeatureDefinition;
    use geo::Point;
    use rstest::rstest;

    fn rect(x1: f64, y1: f64, x2: f64, y2: f64) -> Rect<f64> {
        Rect::new(Coord { x: x1, y: y1 }, Coord { x: x2, y: y2 })
    }

    fn point_feature(id: FeatureId, name: &str, x: f64, y: f64) -> Feature {
        FeatureDefinition::new(name, Geometry::Point(Point::new(x, y))).into_feature(id, 1, 1)
    }

    #[rstest]
    #[case(rect(0.0, 0.0, 10.0, 10.0), rect(1.0, 1.0, 2.0, 2.0), true)]
    #[case(rect(0.0, 0.0, 10.0, 10.0), rect(0.0, 0.0, 10.0, 10.0), true)]
    #[case(rect(0.0, 0.0, 10.0, 10.0), rect(5.0, 5.0, 11.0, 6.0), false)]
    #[case(rect(0.0, 0.0, 10.0, 10.0), rect(-1.0, -1.0, 1.0, 1.0), false)]
    fn containment(#[case] outer: Rect<f64>, #[case] inner: Rect<f64>, #[case] expected: bool) {
        assert_eq!(envelope_contains(&outer, &inner), expected);
    }

    #[rstest]
    fn whole_globe_filter_is_detected() {
        assert!(SpatialFilter::envelope(whole_globe()).is_whole_globe());
        assert!(!SpatialFilter::envelope(rect(-10.0, -10.0, 10.0, 10.0)).is_whole_globe());
    }

    #[rstest]
    fn only_the_default_query_selects_all() {
        assert!(FeatureQuery::default().selects_all());
        assert!(!FeatureQuery::by_ids([]).selects_all());
        assert!(!FeatureQuery::default().with_limit(5).selects_all());
        assert!(!FeatureQuery::in_envelope(rect(0.0, 0.0, 1.0, 1.0)).selects_all());
    }

    #[rstest]
    fn matches_respects_visibility_and_region() {
        let feature = point_feature(1, "a", 0.5, 0.5);
        let mut query = FeatureQuery::in_envelope(rect(0.0, 0.0, 1.0, 1.0));
        assert!(query.matches(&feature, false));
        query.visible_only = true;
        assert!(!query.matches(&feature, false));
        assert!(query.matches(&feature, true));
        let elsewhere = FeatureQuery::in_envelope(rect(2.0, 2.0, 3.0, 3.0));
        assert!(!elsewhere.matches(&feature, true));
    }

    #[rstest]
    fn finish_orders_then_pages() {
        let features = vec![
            point_feature(3, "c", 0.0, 0.0),
            point_feature(1, "b", 0.0, 0.0),
            point_feature(2, "a", 0.0, 0.0),
        ];
        let query = FeatureQuery {
            order: vec![FeatureOrder::Name],
            offset: 1,
            limit: Some(1),
            ..FeatureQuery::default()
        };
        let names: Vec<_> = query.finish(features).into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["b".to_owned()]);
    }

    #[rstest]
    fn feature_set_filters() {
        let set = crate::FeatureSetDefinition::new("wfs", "roads", "Roads").into_feature_set(4, 1);
        let mut query = FeatureSetQuery::by_ids([4]);
        assert!(query.matches(&set, true));
        query.providers = Some(BTreeSet::from(["kml".to_owned()]));
        assert!(!query.matches(&set, true));
    }
}
