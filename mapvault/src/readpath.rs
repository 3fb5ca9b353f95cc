//! The cache read path: exact tile bytes when cached, otherwise a crop of
//! the nearest cached ancestor, otherwise an opaque "missing" image.

use std::sync::Arc;

use image::imageops::{crop_imm, resize, FilterType};
use image::{Rgba, RgbaImage};

use crate::error::Result;
use crate::layers::LayerRegistry;
use crate::mercator::TileCoord;
use crate::store::{TileData, TileStore};

/// Native tile edge in pixels.
pub const TILE_SIZE: u32 = 256;

/// Per-level brightness decay applied to fallback tiles, making stale
/// resolution visibly different from real data.
const FALLBACK_DIM: f32 = 0.9;

const MISSING_SHADE: u8 = 41;

/// Where a returned tile image came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileProvenance {
    /// Exact cached tile.
    Cached,
    /// Cropped and resampled from the ancestor this many levels up.
    Fallback(u8),
    /// Nothing cached within the lookback; sentinel image.
    Missing,
}

pub struct TileRead {
    pub image: RgbaImage,
    pub provenance: TileProvenance,
}

pub struct TileReader {
    store: Arc<TileStore>,
    registry: Arc<LayerRegistry>,
    /// How many ancestor levels to search before giving up.
    lookback: u8,
}

impl TileReader {
    pub fn new(store: Arc<TileStore>, registry: Arc<LayerRegistry>, lookback: u8) -> Self {
        Self {
            store,
            registry,
            lookback,
        }
    }

    /// Raw cached bytes for a tile, if present (no fallback).
    pub async fn raw(&self, layer: &str, coord: TileCoord) -> Result<TileData> {
        let file_type = self.file_type(layer);
        self.store.get_data(layer, coord, &file_type).await
    }

    /// A drawable image for the tile, falling back to ancestors.
    pub async fn read(&self, layer: &str, coord: TileCoord) -> Result<TileRead> {
        let file_type = self.file_type(layer);

        if let TileData::Present(bytes) = self.store.get_data(layer, coord, &file_type).await? {
            let image = image::load_from_memory(&bytes)?.to_rgba8();
            return Ok(TileRead {
                image,
                provenance: TileProvenance::Cached,
            });
        }

        for zdiff in 1..=self.lookback.min(coord.z) {
            let ancestor = TileCoord::new(
                coord.z - zdiff,
                coord.x >> zdiff,
                coord.y >> zdiff,
            );
            let TileData::Present(bytes) =
                self.store.get_data(layer, ancestor, &file_type).await?
            else {
                continue;
            };
            let image = image::load_from_memory(&bytes)?.to_rgba8();
            return Ok(TileRead {
                image: fallback_crop(&image, coord, zdiff),
                provenance: TileProvenance::Fallback(zdiff),
            });
        }

        Ok(TileRead {
            image: missing_sentinel(),
            provenance: TileProvenance::Missing,
        })
    }

    fn file_type(&self, layer: &str) -> String {
        self.registry
            .get(layer)
            .map(|l| l.file_type.clone())
            .unwrap_or_default()
    }
}

/// Cut the sub-rectangle of `ancestor` covering `coord` (which lives
/// `zdiff` levels deeper), resample to native size, and dim.
fn fallback_crop(ancestor: &RgbaImage, coord: TileCoord, zdiff: u8) -> RgbaImage {
    let span = 1u32 << zdiff;
    let sub = (TILE_SIZE / span).max(1);
    let diffx = coord.x - (coord.x >> zdiff << zdiff);
    let diffy = coord.y - (coord.y >> zdiff << zdiff);

    let cropped = crop_imm(ancestor, diffx * sub, diffy * sub, sub, sub).to_image();
    let mut out = resize(&cropped, TILE_SIZE, TILE_SIZE, FilterType::CatmullRom);

    let dim = FALLBACK_DIM.powi(zdiff as i32);
    for pixel in out.pixels_mut() {
        for channel in 0..3 {
            pixel[channel] = (pixel[channel] as f32 * dim).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// The opaque placeholder returned when nothing is cached.
pub fn missing_sentinel() -> RgbaImage {
    RgbaImage::from_pixel(
        TILE_SIZE,
        TILE_SIZE,
        Rgba([MISSING_SHADE, MISSING_SHADE, MISSING_SHADE, 255]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::LayerDef;
    use std::collections::HashMap;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn png(img: &RgbaImage) -> Vec<u8> {
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgba8(img.clone())
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    fn solid(color: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(TILE_SIZE, TILE_SIZE, Rgba(color))
    }

    /// Parent tile with four distinctly-colored quadrants.
    fn quadrants() -> RgbaImage {
        let colors = [
            [200u8, 0, 0, 255],   // NW
            [0, 200, 0, 255],     // NE
            [0, 0, 200, 255],     // SW
            [200, 200, 0, 255],   // SE
        ];
        RgbaImage::from_fn(TILE_SIZE, TILE_SIZE, |x, y| {
            let idx = (y >= TILE_SIZE / 2) as usize * 2 + (x >= TILE_SIZE / 2) as usize;
            Rgba(colors[idx])
        })
    }

    async fn reader() -> (TempDir, Arc<TileStore>, TileReader) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            TileStore::open_memory(&dir.path().join("tiles"), vec![3])
                .await
                .unwrap(),
        );
        let mut layers = HashMap::new();
        layers.insert(
            "test".to_string(),
            LayerDef::new("http://unused/{z}/{x}/{y}", "png", "test layer"),
        );
        let registry = Arc::new(LayerRegistry::new(layers));
        let reader = TileReader::new(Arc::clone(&store), registry, 3);
        (dir, store, reader)
    }

    #[tokio::test]
    async fn cached_tile_returned_as_is() {
        let (_dir, store, reader) = reader().await;
        let coord = TileCoord::new(4, 3, 3);
        let img = solid([10, 120, 10, 255]);
        store
            .save("test", coord, Some(&png(&img)), "png")
            .await
            .unwrap();

        let read = reader.read("test", coord).await.unwrap();
        assert_eq!(read.provenance, TileProvenance::Cached);
        assert_eq!(read.image.dimensions(), (TILE_SIZE, TILE_SIZE));
        assert_eq!(read.image.get_pixel(128, 128), &Rgba([10, 120, 10, 255]));
    }

    #[tokio::test]
    async fn fallback_crops_the_right_quadrant() {
        let (_dir, store, reader) = reader().await;
        let parent = TileCoord::new(3, 2, 5);
        store
            .save("test", parent, Some(&png(&quadrants())), "png")
            .await
            .unwrap();

        // child (z+1, 2x+1, 2y) sits in the parent's NE quadrant
        let child = TileCoord::new(4, 5, 10);
        let read = reader.read("test", child).await.unwrap();
        assert_eq!(read.provenance, TileProvenance::Fallback(1));
        assert_eq!(read.image.dimensions(), (TILE_SIZE, TILE_SIZE));

        // NE quadrant is green, dimmed one fallback step
        let expected = (200.0 * FALLBACK_DIM).round() as u8;
        let center = read.image.get_pixel(128, 128);
        assert_eq!(center[0], 0);
        assert_eq!(center[1], expected);
        assert_eq!(center[2], 0);
    }

    #[tokio::test]
    async fn two_level_fallback_dims_twice() {
        let (_dir, store, reader) = reader().await;
        let grandparent = TileCoord::new(2, 1, 1);
        store
            .save("test", grandparent, Some(&png(&solid([100, 100, 100, 255]))), "png")
            .await
            .unwrap();

        let child = TileCoord::new(4, 4, 4);
        let read = reader.read("test", child).await.unwrap();
        assert_eq!(read.provenance, TileProvenance::Fallback(2));
        let expected = (100.0 * FALLBACK_DIM * FALLBACK_DIM).round() as u8;
        assert_eq!(read.image.get_pixel(128, 128)[0], expected);
    }

    #[tokio::test]
    async fn known_missing_row_still_falls_back() {
        let (_dir, store, reader) = reader().await;
        let coord = TileCoord::new(4, 3, 3);
        store.save("test", coord, None, "png").await.unwrap();
        store
            .save(
                "test",
                TileCoord::new(3, 1, 1),
                Some(&png(&solid([50, 50, 50, 255]))),
                "png",
            )
            .await
            .unwrap();

        let read = reader.read("test", coord).await.unwrap();
        assert_eq!(read.provenance, TileProvenance::Fallback(1));
    }

    #[tokio::test]
    async fn nothing_cached_returns_sentinel() {
        let (_dir, _store, reader) = reader().await;
        let read = reader.read("test", TileCoord::new(5, 1, 1)).await.unwrap();
        assert_eq!(read.provenance, TileProvenance::Missing);
        assert_eq!(read.image.dimensions(), (TILE_SIZE, TILE_SIZE));
        assert_eq!(
            read.image.get_pixel(0, 0),
            &Rgba([MISSING_SHADE, MISSING_SHADE, MISSING_SHADE, 255])
        );
    }

    #[tokio::test]
    async fn ancestors_beyond_lookback_are_ignored() {
        let (_dir, store, reader) = reader().await;
        // ancestor 4 levels up, but lookback is 3
        store
            .save(
                "test",
                TileCoord::new(2, 0, 0),
                Some(&png(&solid([90, 90, 90, 255]))),
                "png",
            )
            .await
            .unwrap();

        let read = reader.read("test", TileCoord::new(6, 1, 1)).await.unwrap();
        assert_eq!(read.provenance, TileProvenance::Missing);
    }
}
