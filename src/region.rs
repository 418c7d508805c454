//! Геометрия районов: GeoJSON из внешнего источника или центроид с буфером.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::district::default_centroid;
use crate::error::PipelineError;

const DISTRICT_NAME_PROPERTY: &str = "NAME_3";
const CITY_NAME_PROPERTY: &str = "NAME_2";

/// Геометрия, передаваемая источнику снимков как есть.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Geometry {
    Feature { geometry: serde_json::Value },
    Buffer { lat: f64, lon: f64, radius_m: f64 },
}

pub trait RegionProvider {
    fn resolve_region(&self, name: &str) -> Option<Geometry>;
}

/// Провайдер без данных: всегда отдаёт `None`, и работают центроиды по умолчанию.
pub struct NoRegions;

impl RegionProvider for NoRegions {
    fn resolve_region(&self, _name: &str) -> Option<Geometry> {
        None
    }
}

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    #[serde(default)]
    properties: serde_json::Map<String, serde_json::Value>,
    geometry: Option<serde_json::Value>,
}

impl Feature {
    fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(serde_json::Value::as_str)
    }
}

/// Районы из GeoJSON `FeatureCollection`, отфильтрованные по городу.
pub struct GeoJsonRegions {
    city: String,
    features: Vec<Feature>,
}

impl GeoJsonRegions {
    pub fn from_path(path: &Path, city: &str) -> Result<Self, PipelineError> {
        let raw = std::fs::read(path).map_err(|err| {
            PipelineError::Io(format!("Failed to read GeoJSON {}: {err}", path.display()))
        })?;
        let regions = Self::from_slice(&raw, city)?;
        info!(
            path = %path.display(),
            features = regions.features.len(),
            "Loaded district geometries"
        );
        Ok(regions)
    }

    pub fn from_slice(raw: &[u8], city: &str) -> Result<Self, PipelineError> {
        let collection: FeatureCollection = serde_json::from_slice(raw)?;
        let features = collection
            .features
            .into_iter()
            .filter(|feature| feature.property(CITY_NAME_PROPERTY) == Some(city))
            .collect();
        Ok(Self {
            city: city.to_string(),
            features,
        })
    }
}

impl RegionProvider for GeoJsonRegions {
    fn resolve_region(&self, name: &str) -> Option<Geometry> {
        let feature = self
            .features
            .iter()
            .find(|feature| feature.property(DISTRICT_NAME_PROPERTY) == Some(name));
        match feature.and_then(|feature| feature.geometry.clone()) {
            Some(geometry) => Some(Geometry::Feature { geometry }),
            None => {
                warn!(district = name, city = %self.city, "District geometry not found");
                None
            }
        }
    }
}

/// Провайдер, выбранный конфигурацией при старте.
pub enum ConfiguredRegions {
    GeoJson(GeoJsonRegions),
    None(NoRegions),
}

impl RegionProvider for ConfiguredRegions {
    fn resolve_region(&self, name: &str) -> Option<Geometry> {
        match self {
            Self::GeoJson(regions) => regions.resolve_region(name),
            Self::None(regions) => regions.resolve_region(name),
        }
    }
}

/// Геометрия района: сперва провайдер, затем центроид по умолчанию с буфером.
pub fn resolve_geometry<R: RegionProvider>(
    provider: &R,
    name: &str,
    buffer_m: f64,
) -> Result<Geometry, PipelineError> {
    if let Some(geometry) = provider.resolve_region(name) {
        return Ok(geometry);
    }
    let (lat, lon) =
        default_centroid(name).ok_or_else(|| PipelineError::RegionNotFound(name.to_string()))?;
    info!(district = name, lat, lon, buffer_m, "Using default district centroid");
    Ok(Geometry::Buffer {
        lat,
        lon,
        radius_m: buffer_m,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLLECTION: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {"type": "Feature",
             "properties": {"NAME_2": "Kota Semarang", "NAME_3": "Tembalang"},
             "geometry": {"type": "Point", "coordinates": [110.35, -7.1]}},
            {"type": "Feature",
             "properties": {"NAME_2": "Kota Surakarta", "NAME_3": "Banjarsari"},
             "geometry": {"type": "Point", "coordinates": [110.8, -7.55]}},
            {"type": "Feature",
             "properties": {"NAME_2": "Kota Semarang", "NAME_3": "Tugu"},
             "geometry": null}
        ]
    }"#;

    #[test]
    fn geojson_filters_by_city_and_name() {
        let regions = GeoJsonRegions::from_slice(COLLECTION.as_bytes(), "Kota Semarang").unwrap();
        assert!(matches!(
            regions.resolve_region("Tembalang"),
            Some(Geometry::Feature { .. })
        ));
        assert_eq!(regions.resolve_region("Banjarsari"), None);
        assert_eq!(regions.resolve_region("Tugu"), None);
    }

    #[test]
    fn missing_geometry_falls_back_to_centroid_buffer() {
        let regions = GeoJsonRegions::from_slice(COLLECTION.as_bytes(), "Kota Semarang").unwrap();
        let geometry = resolve_geometry(&regions, "Tugu", 1000.0).unwrap();
        assert_eq!(
            geometry,
            Geometry::Buffer {
                lat: -6.8667,
                lon: 110.3167,
                radius_m: 1000.0
            }
        );
    }

    #[test]
    fn unknown_district_without_default_fails() {
        let err = resolve_geometry(&NoRegions, "Atlantis", 1000.0).unwrap_err();
        assert!(matches!(err, PipelineError::RegionNotFound(name) if name == "Atlantis"));
    }
}
