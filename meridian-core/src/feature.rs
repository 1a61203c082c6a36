//! Feature and feature set value types.
//!
//! Values are immutable once constructed. Stores hand out fresh copies on
//! every read, and an update produces a new value with a bumped version.

use std::{collections::BTreeMap, time::SystemTime};

use geo::{BoundingRect, Geometry, Rect};

/// Identifier of a feature within a single store.
pub type FeatureId = u64;

/// Identifier of a feature set within a single store.
pub type FeatureSetId = u64;

/// How a feature's altitude values are interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AltitudeMode {
    /// Altitude is ignored and the feature is draped on the terrain.
    #[default]
    ClampToGround,
    /// Altitude is relative to the terrain surface.
    Relative,
    /// Altitude is relative to the ellipsoid.
    Absolute,
}

/// Opaque style description attached to a feature.
///
/// # Examples
/// ```
/// use meridian_core::Style;
///
/// let style = Style::new("PEN(c:#FF0000FF,w:2px)");
/// assert_eq!(style.as_str(), "PEN(c:#FF0000FF,w:2px)");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Style(String);

impl Style {
    /// Wrap a style string.
    #[must_use]
    pub fn new(style: impl Into<String>) -> Self {
        Self(style.into())
    }

    /// Borrow the underlying style string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A single typed attribute value.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AttributeValue {
    /// Signed integer value.
    Int(i64),
    /// Floating point value.
    Double(f64),
    /// UTF-8 text value.
    Text(String),
    /// Opaque binary payload.
    Blob(Vec<u8>),
    /// Homogeneous or mixed list of values.
    List(Vec<AttributeValue>),
    /// Nested attribute set.
    Nested(Attributes),
}

/// Key to typed-value mapping attached to a feature.
///
/// Keys are kept ordered so equality and serialisation are deterministic.
///
/// # Examples
/// ```
/// use meridian_core::{AttributeValue, Attributes};
///
/// let mut inner = Attributes::new();
/// inner.insert("depth", AttributeValue::Double(4.5));
///
/// let attributes = Attributes::new()
///     .with("name", AttributeValue::Text("Harbour".into()))
///     .with("survey", AttributeValue::Nested(inner));
///
/// assert_eq!(attributes.len(), 2);
/// assert!(matches!(attributes.get("name"), Some(AttributeValue::Text(_))));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Attributes(BTreeMap<String, AttributeValue>);

impl Attributes {
    /// Create an empty attribute set.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Insert a value, returning the previous value for the key.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: AttributeValue,
    ) -> Option<AttributeValue> {
        self.0.insert(key.into(), value)
    }

    /// Add a value while consuming `self`, enabling chaining.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: AttributeValue) -> Self {
        self.insert(key, value);
        self
    }

    /// Look up a value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.0.get(key)
    }

    /// Number of top-level keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the top-level entries in key order.
    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value))
    }
}

/// A geospatial feature held by a [`crate::FeatureDataStore`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Feature {
    /// Identifier in the owning store's namespace.
    pub id: FeatureId,
    /// Parent feature set in the owning store's namespace.
    pub feature_set_id: FeatureSetId,
    /// Monotonic version, bumped by every update.
    pub version: u64,
    /// Display name.
    pub name: String,
    /// Geometry in WGS84 (`x = longitude`, `y = latitude`).
    pub geometry: Geometry<f64>,
    /// Altitude interpretation.
    pub altitude_mode: AltitudeMode,
    /// Extrusion height in metres; zero disables extrusion.
    pub extrude: f64,
    /// Optional style.
    pub style: Option<Style>,
    /// Attribute set.
    pub attributes: Attributes,
    /// Optional timestamp carried by the source.
    pub timestamp: Option<SystemTime>,
}

impl Feature {
    /// Bounding envelope of the geometry, if it has one.
    ///
    /// Empty geometry collections have no envelope.
    #[must_use]
    pub fn envelope(&self) -> Option<Rect<f64>> {
        self.geometry.bounding_rect()
    }

    /// Produce a copy of this feature re-addressed into another id space.
    #[must_use]
    pub fn with_ids(&self, id: FeatureId, feature_set_id: FeatureSetId) -> Self {
        Self {
            id,
            feature_set_id,
            ..self.clone()
        }
    }

    /// Build the insert payload that recreates this feature in another store.
    ///
    /// The attribute set is copied so the new row never shares state with
    /// the source value.
    #[must_use]
    pub fn to_definition(&self) -> FeatureDefinition {
        FeatureDefinition {
            name: self.name.clone(),
            geometry: self.geometry.clone(),
            altitude_mode: self.altitude_mode,
            extrude: self.extrude,
            style: self.style.clone(),
            attributes: self.attributes.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Grouping and styling-threshold container for features.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FeatureSet {
    /// Identifier in the owning store's namespace.
    pub id: FeatureSetId,
    /// Name of the provider that produced the set.
    pub provider: String,
    /// Free-form type of the set's content.
    pub kind: String,
    /// Display name.
    pub name: String,
    /// Coarsest display resolution in metres per pixel; zero means unbounded.
    pub min_resolution: f64,
    /// Finest display resolution in metres per pixel; zero means unbounded.
    pub max_resolution: f64,
    /// Monotonic version, bumped by every update.
    pub version: u64,
}

impl FeatureSet {
    /// Produce a copy of this feature set re-addressed into another id space.
    #[must_use]
    pub fn with_id(&self, id: FeatureSetId) -> Self {
        Self { id, ..self.clone() }
    }

    /// Build the insert payload that recreates this set in another store.
    #[must_use]
    pub fn to_definition(&self) -> FeatureSetDefinition {
        FeatureSetDefinition {
            provider: self.provider.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            min_resolution: self.min_resolution,
            max_resolution: self.max_resolution,
        }
    }

    /// Whether the set is displayable at `resolution` metres per pixel.
    #[must_use]
    pub fn displays_at(&self, resolution: f64) -> bool {
        let coarse_ok = self.min_resolution <= 0.0 || resolution <= self.min_resolution;
        let fine_ok = self.max_resolution <= 0.0 || resolution >= self.max_resolution;
        coarse_ok && fine_ok
    }
}

/// Insert payload for a feature.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FeatureDefinition {
    /// Display name.
    pub name: String,
    /// Geometry in WGS84.
    pub geometry: Geometry<f64>,
    /// Altitude interpretation.
    pub altitude_mode: AltitudeMode,
    /// Extrusion height in metres.
    pub extrude: f64,
    /// Optional style.
    pub style: Option<Style>,
    /// Attribute set.
    pub attributes: Attributes,
    /// Optional timestamp.
    pub timestamp: Option<SystemTime>,
}

impl FeatureDefinition {
    /// Definition with the given name and geometry and default everything else.
    ///
    /// # Examples
    /// ```
    /// use geo::{Geometry, Point};
    /// use meridian_core::{AltitudeMode, FeatureDefinition};
    ///
    /// let definition = FeatureDefinition::new("buoy", Geometry::Point(Point::new(1.0, 2.0)));
    /// assert_eq!(definition.altitude_mode, AltitudeMode::ClampToGround);
    /// assert!(definition.attributes.is_empty());
    /// ```
    #[must_use]
    pub fn new(name: impl Into<String>, geometry: Geometry<f64>) -> Self {
        Self {
            name: name.into(),
            geometry,
            altitude_mode: AltitudeMode::default(),
            extrude: 0.0,
            style: None,
            attributes: Attributes::new(),
            timestamp: None,
        }
    }

    /// Replace the attribute set while consuming `self`.
    #[must_use]
    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Replace the style while consuming `self`.
    #[must_use]
    pub fn with_style(mut self, style: Style) -> Self {
        self.style = Some(style);
        self
    }

    /// Materialise the definition as a feature with the given addressing.
    #[must_use]
    pub fn into_feature(
        self,
        id: FeatureId,
        feature_set_id: FeatureSetId,
        version: u64,
    ) -> Feature {
        Feature {
            id,
            feature_set_id,
            version,
            name: self.name,
            geometry: self.geometry,
            altitude_mode: self.altitude_mode,
            extrude: self.extrude,
            style: self.style,
            attributes: self.attributes,
            timestamp: self.timestamp,
        }
    }
}

/// Insert payload for a feature set.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FeatureSetDefinition {
    /// Provider name.
    pub provider: String,
    /// Content type.
    pub kind: String,
    /// Display name.
    pub name: String,
    /// Coarsest display resolution; zero means unbounded.
    pub min_resolution: f64,
    /// Finest display resolution; zero means unbounded.
    pub max_resolution: f64,
}

impl FeatureSetDefinition {
    /// Definition without resolution thresholds.
    #[must_use]
    pub fn new(
        provider: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            kind: kind.into(),
            name: name.into(),
            min_resolution: 0.0,
            max_resolution: 0.0,
        }
    }

    /// Materialise the definition as a feature set with the given id.
    #[must_use]
    pub fn into_feature_set(self, id: FeatureSetId, version: u64) -> FeatureSet {
        FeatureSet {
            id,
            provider: self.provider,
            kind: self.kind,
            name: self.name,
            min_resolution: self.min_resolution,
            max_resolution: self.max_resolution,
            version,
        }
    }
}

/// Content change applied to an existing feature.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureUpdate {
    /// Rename the feature.
    Name(String),
    /// Replace the geometry.
    Geometry(Geometry<f64>),
    /// Replace or clear the style.
    Style(Option<Style>),
    /// Replace the attribute set.
    Attributes(Attributes),
    /// Replace every content field.
    All(FeatureDefinition),
}

impl FeatureUpdate {
    /// Apply the change, producing the next version of `feature`.
    #[must_use]
    pub fn apply(&self, feature: &Feature) -> Feature {
        let mut next = feature.clone();
        match self {
            Self::Name(name) => next.name.clone_from(name),
            Self::Geometry(geometry) => next.geometry = geometry.clone(),
            Self::Style(style) => next.style.clone_from(style),
            Self::Attributes(attributes) => next.attributes = attributes.clone(),
            Self::All(definition) => {
                next = definition
                    .clone()
                    .into_feature(feature.id, feature.feature_set_id, feature.version);
            }
        }
        next.version = feature.version.saturating_add(1);
        next
    }
}

/// Content change applied to an existing feature set.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureSetUpdate {
    /// Rename the set.
    Name(String),
    /// Replace the display resolution thresholds (`min`, `max`).
    Resolution(f64, f64),
    /// Rename the set and replace its thresholds.
    NameAndResolution(String, f64, f64),
}

impl FeatureSetUpdate {
    /// Apply the change, producing the next version of `set`.
    #[must_use]
    pub fn apply(&self, set: &FeatureSet) -> FeatureSet {
        let mut next = set.clone();
        match self {
            Self::Name(name) => next.name.clone_from(name),
            Self::Resolution(min, max) => {
                next.min_resolution = *min;
                next.max_resolution = *max;
            }
            Self::NameAndResolution(name, min, max) => {
                next.name.clone_from(name);
                next.min_resolution = *min;
                next.max_resolution = *max;
            }
        }
        next.version = set.version.saturating_add(1);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{GeometryCollection, Point};
    use rstest::{fixture, rstest};

    #[fixture]
    fn buoy() -> Feature {
        FeatureDefinition::new("buoy", Geometry::Point(Point::new(1.0, 2.0)))
            .with_attributes(Attributes::new().with("colour", AttributeValue::Text("red".into())))
            .into_feature(7, 3, 1)
    }

    #[rstest]
    fn update_bumps_version_and_keeps_addressing(buoy: Feature) {
        let renamed = FeatureUpdate::Name("marker".into()).apply(&buoy);
        assert_eq!(renamed.name, "marker");
        assert_eq!(renamed.version, 2);
        assert_eq!((renamed.id, renamed.feature_set_id), (7, 3));
        assert_eq!(buoy.name, "buoy", "source value must not change");
    }

    #[rstest]
    fn full_update_replaces_content(buoy: Feature) {
        let definition = FeatureDefinition::new("pier", Geometry::Point(Point::new(5.0, 5.0)));
        let updated = FeatureUpdate::All(definition).apply(&buoy);
        assert_eq!(updated.name, "pier");
        assert!(updated.attributes.is_empty());
        assert_eq!(updated.id, 7);
    }

    #[rstest]
    fn with_ids_readdresses_copy(buoy: Feature) {
        let moved = buoy.with_ids(100, 200);
        assert_eq!((moved.id, moved.feature_set_id), (100, 200));
        assert_eq!(moved.attributes, buoy.attributes);
    }

    #[rstest]
    fn empty_collection_has_no_envelope(buoy: Feature) {
        let mut empty = buoy;
        empty.geometry = Geometry::GeometryCollection(GeometryCollection::default());
        assert!(empty.envelope().is_none());
    }

    #[rstest]
    #[case(0.0, 0.0, 1_000.0, true)]
    #[case(500.0, 10.0, 100.0, true)]
    #[case(500.0, 10.0, 1_000.0, false)]
    #[case(500.0, 10.0, 1.0, false)]
    fn display_thresholds(
        #[case] min_resolution: f64,
        #[case] max_resolution: f64,
        #[case] resolution: f64,
        #[case] expected: bool,
    ) {
        let mut definition = FeatureSetDefinition::new("test", "points", "set");
        definition.min_resolution = min_resolution;
        definition.max_resolution = max_resolution;
        let set = definition.into_feature_set(1, 1);
        assert_eq!(set.displays_at(resolution), expected);
    }
}
