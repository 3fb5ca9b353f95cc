//! Parsing and validation of download spec files.
//!
//! A spec names a region (either stored already, or defined inline) and
//! the layers to fill, e.g.:
//!
//! ```yaml
//! name: new-england
//! region: 41,-74 45,-74 45,-69 41,-69
//! layers:
//!   osmmapnik:
//!     zoom: 13
//!   bingsatlab:
//!     zoom: 11
//!     refresh-older-than: 30
//! ```
//!
//! Anything malformed is fatal here, before a single request goes out.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::{CacheError, Result};
use crate::layers::LayerRegistry;
use crate::pipeline::{LayerRequest, Refresh};
use crate::region::{Region, WORLD_NAME};
use crate::store::TileStore;

#[derive(Debug, Deserialize)]
struct RawSpec {
    name: String,
    #[serde(default)]
    update: bool,
    region: Option<String>,
    layers: BTreeMap<String, RawLayer>,
}

#[derive(Debug, Deserialize)]
struct RawLayer {
    zoom: i64,
    #[serde(rename = "refresh-older-than")]
    refresh_older_than: Option<f64>,
    #[serde(rename = "refresh-mode")]
    refresh_mode: Option<String>,
}

/// A validated download request.
#[derive(Debug, Clone)]
pub struct DownloadSpec {
    pub name: String,
    pub update: bool,
    /// Inline boundary, when the spec defines one.
    pub region: Option<Region>,
    pub layers: Vec<LayerRequest>,
}

/// Parse and validate a spec document against the layer registry.
pub fn parse_spec(source: &str, registry: &LayerRegistry) -> Result<DownloadSpec> {
    let raw: RawSpec = serde_yaml::from_str(source)
        .map_err(|err| CacheError::Spec(format!("cannot parse directives: {err}")))?;

    if raw.name.is_empty() {
        return Err(CacheError::Spec("region name required".into()));
    }
    if raw.update && raw.name == WORLD_NAME {
        return Err(CacheError::RegionReadOnly(WORLD_NAME.into()));
    }
    if raw.layers.is_empty() {
        return Err(CacheError::Spec("at least one layer required".into()));
    }

    let region = raw.region.as_deref().map(parse_region).transpose()?;

    let mut layers = Vec::new();
    for (id, layer) in &raw.layers {
        if !(0..=30).contains(&layer.zoom) {
            return Err(CacheError::Spec("zoom level outside allowed range".into()));
        }
        let refresh = match (layer.refresh_older_than, layer.refresh_mode.as_deref()) {
            (Some(days), _) => Refresh::Days(days),
            (None, Some("always")) => Refresh::Always,
            (None, Some("never")) | (None, None) => Refresh::Never,
            (None, Some(_)) => {
                return Err(CacheError::Spec("unrecognized refresh mode".into()));
            }
        };

        let def = registry
            .get(id)
            .ok_or_else(|| CacheError::UnknownLayer(id.clone()))?;
        if !def.cacheable {
            return Err(CacheError::LayerNotCacheable(id.clone()));
        }

        layers.push(LayerRequest {
            layer: id.clone(),
            max_zoom: layer.zoom as u8,
            refresh,
        });
    }

    Ok(DownloadSpec {
        name: raw.name,
        update: raw.update,
        region,
        layers,
    })
}

/// Parse a region value: the literal `world`, or a whitespace/comma
/// vertex list like `42.1,-71 43,-70.5 41,-70`.
fn parse_region(def: &str) -> Result<Region> {
    if def.trim() == WORLD_NAME {
        return Ok(Region::world());
    }

    // tokenize into value / comma runs, whitespace-insensitive
    let mut tokens: Vec<&str> = Vec::new();
    for part in def.split_whitespace() {
        for (i, sub) in part.split(',').enumerate() {
            if i > 0 {
                tokens.push(",");
            }
            if !sub.is_empty() {
                tokens.push(sub);
            }
        }
    }

    if tokens.is_empty() || tokens.len() % 3 != 0 {
        return Err(CacheError::Spec("can't parse region boundary".into()));
    }
    let mut vertices = Vec::new();
    for triple in tokens.chunks(3) {
        let [lat, comma, lon] = triple else {
            return Err(CacheError::Spec("can't parse region boundary".into()));
        };
        if *comma != "," {
            return Err(CacheError::Spec("can't parse region boundary".into()));
        }
        let (lat, lon) = match (lat.parse(), lon.parse()) {
            (Ok(lat), Ok(lon)) => (lat, lon),
            _ => return Err(CacheError::Spec("can't parse region boundary".into())),
        };
        vertices.push((lat, lon));
    }
    Region::new("__", vertices)
}

/// Resolve the spec's region against the store: fetch an existing
/// boundary by name, insert a new one, or replace it when `update` is
/// set. Returns the region to tessellate.
pub async fn resolve_region(spec: &DownloadSpec, store: &TileStore) -> Result<Region> {
    if spec.name == WORLD_NAME {
        // reserved and read-only; never hits the regions table
        match &spec.region {
            Some(region) if !region.same_boundary(&Region::world()) => {
                Err(CacheError::RegionReadOnly(WORLD_NAME.into()))
            }
            _ => Ok(Region::world()),
        }
    } else {
        match store.find_region(&spec.name).await? {
            Some(existing) => match &spec.region {
                Some(supplied) => {
                    let mut named = supplied.clone();
                    named.set_name(&spec.name);
                    if spec.update {
                        store.update_region(&named).await?;
                        Ok(named)
                    } else if existing.same_boundary(&named) {
                        Ok(existing)
                    } else {
                        Err(CacheError::RegionExists(spec.name.clone()))
                    }
                }
                None => Ok(existing),
            },
            None => {
                let Some(supplied) = &spec.region else {
                    return Err(CacheError::RegionMissing(spec.name.clone()));
                };
                let mut named = supplied.clone();
                named.set_name(&spec.name);
                store.insert_region(&named).await?;
                Ok(named)
            }
        }
    }
}
