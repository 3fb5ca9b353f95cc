//! Error types for the tile cache.

use thiserror::Error;

/// Errors surfaced by the cache core.
#[derive(Debug, Error)]
pub enum CacheError {
    /// I/O error reading or writing a blob file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error from the tile index.
    #[error("tile index error: {0}")]
    Db(#[from] sqlx::Error),

    /// Malformed download spec or region definition.
    #[error("invalid download spec: {0}")]
    Spec(String),

    /// Layer id not present in the registry.
    #[error("unrecognized layer {0:?}")]
    UnknownLayer(String),

    /// Layer is flagged as non-downloadable.
    #[error("layer {0:?} is flagged as non-downloadable")]
    LayerNotCacheable(String),

    /// Region exists and differs but the update flag was not set.
    #[error("region {0:?} already exists (set \"update\" flag?)")]
    RegionExists(String),

    /// Region name not found and no boundary supplied.
    #[error("region {0:?} does not exist (supply a region boundary?)")]
    RegionMissing(String),

    /// The reserved world region cannot be replaced.
    #[error("{0:?} region is read-only")]
    RegionReadOnly(String),

    /// Tile image could not be decoded for the fallback path.
    #[error("image decode error: {0}")]
    Image(#[from] image::ImageError),

    /// The service or pipeline was shut down before the request completed.
    #[error("shut down before completion")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, CacheError>;
