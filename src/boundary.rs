//! Boundary datasets.
//!
//! Only the canonical name of each feature is kept; geometry stays in the
//! GeoJSON file and is handed to the map renderer untouched.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::model::RegionLevel;

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    #[serde(default)]
    properties: Map<String, Value>,
}

/// Canonical region names of one boundary dataset.
#[derive(Debug, Clone)]
pub struct BoundaryDataset {
    level: RegionLevel,
    name_property: String,
    /// Feature order, used as the region universe for animation frames.
    names: Vec<String>,
    lookup: HashSet<String>,
}

impl BoundaryDataset {
    /// Build a dataset from an explicit list of names.
    pub fn from_names<I, S>(level: RegionLevel, name_property: &str, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ordered = Vec::new();
        let mut lookup = HashSet::new();
        for name in names {
            let name = name.into();
            if lookup.insert(name.clone()) {
                ordered.push(name);
            }
        }
        Self {
            level,
            name_property: name_property.to_string(),
            names: ordered,
            lookup,
        }
    }

    /// Parse a GeoJSON feature collection, keying each feature by `name_property`.
    pub fn from_geojson(level: RegionLevel, name_property: &str, raw: &str) -> PipelineResult<Self> {
        let collection: FeatureCollection =
            serde_json::from_str(raw).map_err(|e| PipelineError::Schema {
                record: format!("{level} boundary dataset"),
                reason: e.to_string(),
            })?;

        let mut names = Vec::with_capacity(collection.features.len());
        for (idx, feature) in collection.features.iter().enumerate() {
            match feature.properties.get(name_property).and_then(Value::as_str) {
                Some(name) => names.push(name.to_string()),
                None => warn!(
                    level = %level,
                    feature = idx,
                    property = name_property,
                    "Boundary feature has no name property, skipping"
                ),
            }
        }

        let dataset = Self::from_names(level, name_property, names);
        debug!(level = %level, regions = dataset.len(), "Boundary dataset loaded");
        Ok(dataset)
    }

    /// Load a GeoJSON file from disk.
    pub async fn load(level: RegionLevel, name_property: &str, path: &Path) -> PipelineResult<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_geojson(level, name_property, &raw)
    }

    pub fn level(&self) -> RegionLevel {
        self.level
    }

    /// GeoJSON property the renderer joins on, e.g. `properties.NAME`.
    pub fn feature_id_key(&self) -> String {
        format!("properties.{}", self.name_property)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup.contains(name)
    }

    /// Names in feature order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
