//! Map layer configuration and the tile-URL template engine.
//!
//! Templates are compiled once per layer and invoked per tile. The
//! recognized placeholders:
//!
//! - `{z}`, `{x}`, `{y}` - integer tile coordinates
//! - `{-y}` - inverted y (`2^z - 1 - y`, for TMS-style servers)
//! - `{qt}` / `{qt:ABCD}` - quadkey, optionally over a custom alphabet
//! - `{s:abc}` / `{s:0-3}` - shard picked by `(x + y) mod #shards`
//! - `{type}` - the layer's file extension
//!
//! Anything else inside braces, and all `%` characters, pass through
//! literally.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{CacheError, Result};
use crate::mercator::to_quadkey;

/// Where a layer's tile URLs come from.
pub enum UrlSpec {
    /// A template string.
    Template(String),
    /// A factory called once, the first time the layer is used, returning
    /// a template string.
    Provider(Box<dyn Fn() -> String + Send + Sync>),
    /// A factory called for every tile, returning a template string.
    PerTile(Box<dyn Fn(u8, u32, u32) -> String + Send + Sync>),
}

/// Static configuration for one map layer.
pub struct LayerDef {
    pub url: UrlSpec,
    /// File extension for stored blobs ("png", "jpg", ...).
    pub file_type: String,
    /// Human-readable name.
    pub name: String,
    /// Drawn over a base layer rather than standing alone.
    pub overlay: bool,
    /// Whether bulk download is permitted.
    pub cacheable: bool,
    /// Tiles shallower than this are not worth fetching for this layer.
    pub min_depth: u8,
    /// Separate refresh window for tiles recorded as missing; None means
    /// known-missing tiles are never refetched by a `days` refresh.
    pub refresh_missing: Option<Duration>,
}

impl LayerDef {
    pub fn new(
        url_template: impl Into<String>,
        file_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            url: UrlSpec::Template(url_template.into()),
            file_type: file_type.into(),
            name: name.into(),
            overlay: false,
            cacheable: true,
            min_depth: 0,
            refresh_missing: None,
        }
    }
}

/// The set of configured layers, with compiled URL templates memoized.
/// Built once at startup and passed to the components that need it.
pub struct LayerRegistry {
    layers: HashMap<String, LayerDef>,
    compiled: Mutex<HashMap<String, Arc<CompiledTemplate>>>,
}

impl LayerRegistry {
    pub fn new(layers: HashMap<String, LayerDef>) -> Self {
        Self {
            layers,
            compiled: Mutex::new(HashMap::new()),
        }
    }

    /// The default layer table.
    pub fn builtin() -> Self {
        let mut layers = HashMap::new();
        layers.insert(
            "osmmapnik".to_string(),
            LayerDef::new(
                "http://{s:abc}.tile.openstreetmap.org/{z}/{x}/{y}.png",
                "png",
                "openstreetmap standard (mapnik)",
            ),
        );
        layers.insert(
            "bingsatlab".to_string(),
            LayerDef {
                min_depth: 1,
                ..LayerDef::new(
                    "http://ecn.dynamic.t{s:0-3}.tiles.virtualearth.net/comp/CompositionHandler/{qt}?it=A,G,L&n=z",
                    "jpg",
                    "bing satellite labelled",
                )
            },
        );
        layers.insert(
            "chartbundle".to_string(),
            LayerDef::new(
                "http://wms.chartbundle.com/tms/1.0.0/sec/{z}/{x}/{-y}.{type}",
                "png",
                "faa aeronautical (vfr sectional)",
            ),
        );
        Self::new(layers)
    }

    pub fn get(&self, id: &str) -> Option<&LayerDef> {
        self.layers.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.layers.keys().map(String::as_str)
    }

    /// Download URL for a tile of the given layer.
    pub fn tile_url(&self, layer_id: &str, z: u8, x: u32, y: u32) -> Result<String> {
        let layer = self
            .layers
            .get(layer_id)
            .ok_or_else(|| CacheError::UnknownLayer(layer_id.to_string()))?;

        match &layer.url {
            UrlSpec::PerTile(factory) => {
                // per-tile templates cannot be memoized
                let template = factory(z, x, y);
                Ok(CompiledTemplate::compile(&template, &layer.file_type).url(z, x, y))
            }
            other => {
                let mut compiled = self.compiled.lock().unwrap();
                let tmpl = match compiled.get(layer_id) {
                    Some(t) => Arc::clone(t),
                    None => {
                        let source = match other {
                            UrlSpec::Template(t) => t.clone(),
                            UrlSpec::Provider(f) => f(),
                            UrlSpec::PerTile(_) => unreachable!(),
                        };
                        let t = Arc::new(CompiledTemplate::compile(&source, &layer.file_type));
                        compiled.insert(layer_id.to_string(), Arc::clone(&t));
                        t
                    }
                };
                Ok(tmpl.url(z, x, y))
            }
        }
    }
}

enum Seg {
    Lit(String),
    Z,
    X,
    Y,
    InvY,
    Qt(Option<String>),
    Shard(Vec<String>),
}

/// A tile-URL template parsed into segments, ready for per-tile
/// substitution. Compilation never fails: unrecognized tags stay literal.
pub struct CompiledTemplate {
    segs: Vec<Seg>,
}

impl CompiledTemplate {
    pub fn compile(template: &str, file_type: &str) -> Self {
        let mut segs = Vec::new();
        let mut lit = String::new();
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            let (before, tail) = rest.split_at(open);
            lit.push_str(before);
            let Some(close) = tail.find('}') else {
                lit.push_str(tail);
                rest = "";
                break;
            };
            let tag = &tail[1..close];
            let seg = match tag {
                "z" => Some(Seg::Z),
                "x" => Some(Seg::X),
                "y" => Some(Seg::Y),
                "-y" => Some(Seg::InvY),
                "qt" => Some(Seg::Qt(None)),
                "type" => Some(Seg::Lit(file_type.to_string())),
                _ => {
                    if let Some(spec) = tag.strip_prefix("qt:") {
                        Some(Seg::Qt(Some(spec.to_string())))
                    } else {
                        tag.strip_prefix("s:").map(|spec| Seg::Shard(parse_shards(spec)))
                    }
                }
            };
            match seg {
                Some(seg) => {
                    if !lit.is_empty() {
                        segs.push(Seg::Lit(std::mem::take(&mut lit)));
                    }
                    segs.push(seg);
                }
                None => {
                    // unknown tag: keep the braces verbatim
                    lit.push_str(&tail[..=close]);
                }
            }
            rest = &tail[close + 1..];
        }
        lit.push_str(rest);
        if !lit.is_empty() {
            segs.push(Seg::Lit(lit));
        }
        Self { segs }
    }

    pub fn url(&self, z: u8, x: u32, y: u32) -> String {
        let mut out = String::new();
        for seg in &self.segs {
            match seg {
                Seg::Lit(s) => out.push_str(s),
                Seg::Z => out.push_str(&z.to_string()),
                Seg::X => out.push_str(&x.to_string()),
                Seg::Y => out.push_str(&y.to_string()),
                Seg::InvY => {
                    let inv = (1u64 << z) - 1 - y as u64;
                    out.push_str(&inv.to_string());
                }
                Seg::Qt(alphabet) => {
                    out.push_str(&to_quadkey(z, x, y, alphabet.as_deref()));
                }
                Seg::Shard(shards) => {
                    if !shards.is_empty() {
                        let i = (x as u64 + y as u64) % shards.len() as u64;
                        out.push_str(&shards[i as usize]);
                    }
                }
            }
        }
        out
    }
}

/// Shard spec: either "LO-HI" (inclusive integer range) or a list of
/// single-character shards.
fn parse_shards(spec: &str) -> Vec<String> {
    if let Some((lo, hi)) = spec.split_once('-') {
        if let (Ok(lo), Ok(hi)) = (lo.parse::<i64>(), hi.parse::<i64>()) {
            return (lo..=hi).map(|n| n.to_string()).collect();
        }
    }
    spec.chars().map(|c| c.to_string()).collect()
}
