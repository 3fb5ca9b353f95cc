//! Recursive enumeration of the tiles covering a region, bounded per zoom
//! level by the latitude scale extents.

use crate::mercator::{mercator_to_xy, tilef_to_xy, MercZoom, TileCoord};
use crate::polygon::{MultiPoly, Rect};

/// Lazy tile enumeration for one region and zoom range.
///
/// Probes the quadtree from the root: a tile outside the zoom's latitude
/// extent or not overlapping the region prunes its whole subtree; a tile
/// fully covered by the region switches to a rectangular fill of its
/// descendants; anything else recurses into the four children.
pub struct RegionTessellation<'a> {
    poly: &'a MultiPoly,
    zoom: MercZoom,
    extents: Vec<(i64, i64)>,
    max_zoom: u8,
    min_zoom: u8,
    probes: Vec<TileCoord>,
    fill: Option<Fill>,
}

impl<'a> RegionTessellation<'a> {
    pub fn new(poly: &'a MultiPoly, max_zoom: u8, min_zoom: u8) -> Self {
        let zoom = MercZoom::default();
        let extents = zoom.extents(max_zoom);
        Self {
            poly,
            zoom,
            extents,
            max_zoom,
            min_zoom,
            probes: vec![TileCoord::new(0, 0, 0)],
            fill: None,
        }
    }

    /// Predicted tile count, for progress display before enumeration
    /// finishes. Sums per-level clipped areas times `4^z`, pads the total
    /// with a fudge factor shrinking as `1/sqrt(total)`, and caps at the
    /// quadtree total `floor(4/3 * 4^max_zoom)`.
    pub fn size_estimate(&self) -> u64 {
        let brackets = self.zoom.brackets();
        let ymins: Vec<f64> = brackets
            .iter()
            .map(|&b| mercator_to_xy(0.0, b).1.max(0.0))
            .collect();
        let base_area = self.poly.area();

        let mut total = 0.0f64;
        for z in 0..=self.max_zoom {
            let area = if usize::from(self.max_zoom - z) >= ymins.len() {
                base_area
            } else {
                let ymin = ymins[usize::from(self.max_zoom - z)];
                self.poly.clip_rect_area(&Rect::new(0.0, ymin, 1.0, 1.0 - ymin))
            };
            total += (area * 4f64.powi(z as i32)).ceil();
        }

        let fudge = if total > 0.0 {
            (5.0 / total.sqrt()).min(0.75)
        } else {
            0.0
        };
        let fudged = (total * (1.0 + fudge)).ceil();
        let max_possible = (4.0 / 3.0 * 4f64.powi(self.max_zoom as i32)).floor();
        fudged.min(max_possible) as u64
    }

    fn within_extent(&self, z: u8, y: i64) -> bool {
        let (ymin, ymax) = self.extents[z as usize];
        y >= ymin && y <= ymax
    }

    fn tile_rect(&self, t: TileCoord) -> Rect {
        let (x0, y0) = tilef_to_xy((t.x as f64, t.y as f64), t.z);
        let (x1, y1) = tilef_to_xy(((t.x + 1) as f64, (t.y + 1) as f64), t.z);
        Rect::new(x0, y0, x1, y1)
    }
}

impl Iterator for RegionTessellation<'_> {
    type Item = TileCoord;

    fn next(&mut self) -> Option<TileCoord> {
        loop {
            if let Some(fill) = &mut self.fill {
                match fill.next_tile(&self.extents) {
                    Some(t) => {
                        if t.z >= self.min_zoom {
                            return Some(t);
                        }
                        continue;
                    }
                    None => self.fill = None,
                }
            }

            let t = self.probes.pop()?;
            if !self.within_extent(t.z, t.y as i64) {
                continue;
            }
            let rect = self.tile_rect(t);
            if !self.poly.overlaps_rect(&rect) {
                continue;
            }

            if self.poly.covers_rect(&rect) {
                self.fill = Some(Fill::new(t));
            } else if t.z < self.max_zoom {
                for xo in 0..2 {
                    for yo in 0..2 {
                        self.probes
                            .push(TileCoord::new(t.z + 1, 2 * t.x + xo, 2 * t.y + yo));
                    }
                }
            }

            if t.z >= self.min_zoom {
                return Some(t);
            }
        }
    }
}

/// Rectangular fill of all descendants of a covered tile, one zoom level
/// at a time, each level's rows clamped to the scale extent.
struct Fill {
    root: TileCoord,
    z: u8,
    xmin: u32,
    xmax: u32, // exclusive
    ymax: i64, // exclusive
    tx: u32,
    ty: i64,
    exhausted: bool,
}

impl Fill {
    fn new(root: TileCoord) -> Self {
        Self {
            root,
            z: root.z, // advanced before the first row
            xmin: 0,
            xmax: 0,
            ymax: 0,
            tx: 0,
            ty: 0,
            exhausted: false,
        }
    }

    fn start_level(&mut self, extents: &[(i64, i64)]) -> bool {
        self.z += 1;
        if usize::from(self.z) >= extents.len() {
            return false;
        }
        let zdiff = self.z - self.root.z;
        self.xmin = self.root.x << zdiff;
        self.xmax = (self.root.x + 1) << zdiff;
        let ymin = (self.root.y as i64) << zdiff;
        let ymax = ((self.root.y + 1) as i64) << zdiff;

        let (ext_ymin, ext_ymax) = extents[self.z as usize];
        self.ty = ymin.max(ext_ymin);
        self.ymax = ymax.min(ext_ymax + 1);
        self.tx = self.xmin;
        self.ty < self.ymax
    }

    fn next_tile(&mut self, extents: &[(i64, i64)]) -> Option<TileCoord> {
        if self.exhausted {
            return None;
        }
        loop {
            if self.z > self.root.z && self.ty < self.ymax {
                let t = TileCoord::new(self.z, self.tx, self.ty as u32);
                self.tx += 1;
                if self.tx == self.xmax {
                    self.tx = self.xmin;
                    self.ty += 1;
                }
                return Some(t);
            }
            if !self.start_level(extents) {
                self.exhausted = true;
                return None;
            }
        }
    }
}
