//! Web-mercator projection, quadtree tile math, quadkeys, and the
//! latitude scale brackets used to bound polar tile rows.

use std::f64::consts::PI;

/// Tile coordinates on the quadtree grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    /// Zoom level.
    pub z: u8,
    /// Column (0 at the west edge, increases eastward).
    pub x: u32,
    /// Row (0 at the north edge, increases southward).
    pub y: u32,
}

impl TileCoord {
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// Quadkey for this tile (digits 0-3, MSB first).
    pub fn quadkey(&self) -> String {
        to_quadkey(self.z, self.x, self.y, None)
    }

    /// Parent tile, or None at the root.
    pub fn parent(&self) -> Option<TileCoord> {
        if self.z == 0 {
            None
        } else {
            Some(TileCoord::new(self.z - 1, self.x / 2, self.y / 2))
        }
    }
}

/// Project lat/lon (degrees) to mercator lon/lat in radians.
/// `ln(tan(lat) + sec(lat))` is `ln(tan(pi/4 + lat/2))` in a form that is
/// exact at the equator.
pub fn ll_to_mercator(lat: f64, lon: f64) -> (f64, f64) {
    let rlat = lat.to_radians();
    (lon.to_radians(), (rlat.tan() + 1.0 / rlat.cos()).ln())
}

/// Inverse of `ll_to_mercator`.
pub fn mercator_to_ll(x: f64, y: f64) -> (f64, f64) {
    (
        (2.0 * (y.exp().atan() - PI / 4.0)).to_degrees(),
        x.to_degrees(),
    )
}

/// Transform mercator lon/lat to quadtree plane coordinates
/// (top-left = (0, 0); bottom-right = (1, 1)).
pub fn mercator_to_xy(x: f64, y: f64) -> (f64, f64) {
    (x / (2.0 * PI) + 0.5, -y / (2.0 * PI) + 0.5)
}

/// Inverse of `mercator_to_xy`.
pub fn xy_to_mercator(x: f64, y: f64) -> (f64, f64) {
    (2.0 * PI * (x - 0.5), 2.0 * PI * (0.5 - y))
}

/// Map quadtree plane coordinates to tile coordinates at the given zoom.
/// Unclipped: the plane edges can land one past the valid tile range.
pub fn xy_to_tile(p: (f64, f64), zoom: u8) -> (i64, i64) {
    let (x, y) = xy_to_tilef(p, zoom);
    (x.floor() as i64, y.floor() as i64)
}

/// Same as `xy_to_tile`, but keep the fractional part.
pub fn xy_to_tilef(p: (f64, f64), zoom: u8) -> (f64, f64) {
    let scale = (1u64 << zoom) as f64;
    (scale * p.0, scale * p.1)
}

/// Inverse of `xy_to_tilef`.
pub fn tilef_to_xy(p: (f64, f64), zoom: u8) -> (f64, f64) {
    let scale = (1u64 << zoom) as f64;
    (p.0 / scale, p.1 / scale)
}

/// Quadkey for (z, x, y): one digit per zoom level, MSB first, where the
/// digit is `2*ybit + xbit`. An optional 4-char alphabet replaces "0123".
pub fn to_quadkey(z: u8, x: u32, y: u32, alphabet: Option<&str>) -> String {
    let chars: Vec<char> = match alphabet {
        Some(a) => a.chars().collect(),
        None => vec!['0', '1', '2', '3'],
    };
    (0..z)
        .rev()
        .map(|i| {
            let xbit = (x >> i) & 1;
            let ybit = (y >> i) & 1;
            chars[(2 * ybit + xbit) as usize]
        })
        .collect()
}

/// Inverse of `to_quadkey`; None if a digit is outside the alphabet.
pub fn from_quadkey(qt: &str, alphabet: Option<&str>) -> Option<(u8, u32, u32)> {
    let chars: Vec<char> = match alphabet {
        Some(a) => a.chars().collect(),
        None => vec!['0', '1', '2', '3'],
    };
    let mut x = 0u32;
    let mut y = 0u32;
    let mut z = 0u8;
    for c in qt.chars() {
        let digit = chars.iter().position(|&a| a == c)? as u32;
        x = 2 * x + (digit & 1);
        y = 2 * y + (digit >> 1);
        z += 1;
    }
    Some((z, x, y))
}

/// Latitude-dependent scale compensation.
///
/// `brackets[i]` is the mercator-y at which linear distortion reaches
/// `2^(i + offset)` times the equator scale; rows beyond the bracket for a
/// given zoom difference carry no extra information and are skipped.
#[derive(Debug, Clone)]
pub struct MercZoom {
    brackets: Vec<f64>,
}

impl MercZoom {
    /// Build the bracket table. `offset` shifts the distortion thresholds
    /// (must be in (0, 1]); the list stops at the edge of the quadtree
    /// plane (~85.05 degrees latitude).
    pub fn new(offset: f64) -> Self {
        assert!(offset > 0.0 && offset <= 1.0, "offset must be in (0, 1]");
        let mut brackets = Vec::new();
        let mut i = 0;
        loop {
            let disc_lat = (1.0 / 2f64.powf(i as f64 + offset)).acos().to_degrees();
            let disc_merc = ll_to_mercator(disc_lat, 0.0).1;
            if disc_merc >= PI {
                break;
            }
            brackets.push(disc_merc);
            i += 1;
        }
        Self { brackets }
    }

    /// Zoom level difference, for the given y-tile and zoom level, that
    /// gives the same effective scale as at the equator. Uses the tile
    /// corner closest to the equator (least distortion, so any error is
    /// toward higher resolution).
    pub fn adjust(&self, zoom: u8, y: u32) -> usize {
        let yr = if zoom == 0 {
            0.5
        } else if (y as u64) < (1u64 << (zoom - 1)) {
            (y + 1) as f64
        } else {
            y as f64
        };
        let (px, py) = tilef_to_xy((0.0, yr), zoom);
        let merc_y = xy_to_mercator(px, py).1.abs();
        self.brackets.partition_point(|&b| b <= merc_y)
    }

    /// Minimum and maximum y-tiles at `zoom` for which the effective scale
    /// does not exceed `max_zoom`. Empty (min > max) when zoom > max_zoom.
    pub fn max_y(&self, zoom: u8, max_zoom: u8) -> (i64, i64) {
        if zoom > max_zoom {
            let mid = 1i64 << (zoom - 1);
            return (mid, mid - 1);
        }
        let zdiff = (max_zoom - zoom) as usize;
        let max_merc_y = self.brackets.get(zdiff).copied().unwrap_or(PI);

        let limit = (1i64 << zoom) - 1;
        let clip = |y: i64| y.clamp(0, limit);
        let (ux, uy) = mercator_to_xy(0.0, max_merc_y);
        let (lx, ly) = mercator_to_xy(0.0, -max_merc_y);
        // clamp fixes y = -pi mapping one past the plane edge
        let ymin = clip(xy_to_tile((ux, uy), zoom).1);
        let ymax = clip(xy_to_tile((lx, ly), zoom).1);
        (ymin, ymax)
    }

    /// Per-zoom y-tile extents for a download to `max_zoom`: entries for
    /// zoom levels 0 through `max_zoom + 1` (the last one empty).
    pub fn extents(&self, max_zoom: u8) -> Vec<(i64, i64)> {
        (0..=max_zoom + 1).map(|z| self.max_y(z, max_zoom)).collect()
    }

    pub fn brackets(&self) -> &[f64] {
        &self.brackets
    }
}

impl Default for MercZoom {
    fn default() -> Self {
        MercZoom::new(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn origin_projects_to_origin() {
        assert_eq!(ll_to_mercator(0.0, 0.0), (0.0, 0.0));
    }

    #[test]
    fn mercator_round_trip() {
        for &(lat, lon) in &[
            (0.0, 0.0),
            (45.0, 90.0),
            (-33.86, 151.21),
            (84.9, -179.9),
            (-84.9, 179.9),
        ] {
            let (mx, my) = ll_to_mercator(lat, lon);
            let (rlat, rlon) = mercator_to_ll(mx, my);
            assert_relative_eq!(rlat, lat, epsilon = 1e-9);
            assert_relative_eq!(rlon, lon, epsilon = 1e-9);
        }
    }

    #[test]
    fn xy_round_trip() {
        let (mx, my) = ll_to_mercator(37.0, -122.0);
        let (u, v) = mercator_to_xy(mx, my);
        let (bx, by) = xy_to_mercator(u, v);
        assert_relative_eq!(bx, mx, epsilon = 1e-12);
        assert_relative_eq!(by, my, epsilon = 1e-12);
    }

    #[test]
    fn quadkey_matches_bing_encoding() {
        // digit = 2*ybit + xbit, MSB first
        assert_eq!(to_quadkey(3, 3, 5, None), "213");
        assert_eq!(to_quadkey(3, 5, 2, None), "121");
        assert_eq!(to_quadkey(0, 0, 0, None), "");
    }

    #[test]
    fn quadkey_round_trip() {
        for z in 0..=6u8 {
            let n = 1u32 << z;
            for x in (0..n).step_by(3) {
                for y in (0..n).step_by(3) {
                    let qt = to_quadkey(z, x, y, None);
                    assert_eq!(qt.len(), z as usize);
                    assert_eq!(from_quadkey(&qt, None), Some((z, x, y)));
                }
            }
        }
    }

    #[test]
    fn quadkey_custom_alphabet() {
        let qt = to_quadkey(3, 3, 5, Some("qrts"));
        assert_eq!(qt, "trs");
        assert_eq!(from_quadkey(&qt, Some("qrts")), Some((3, 3, 5)));
    }

    #[test]
    fn first_bracket_is_sixty_degrees() {
        // cos(lat) = 1/2 at the first power-of-two distortion threshold
        let mz = MercZoom::default();
        let (lat, _) = mercator_to_ll(0.0, mz.brackets()[0]);
        assert_relative_eq!(lat, 60.0, epsilon = 1e-9);
    }

    #[test]
    fn extents_cover_full_range_at_low_zoom() {
        let mz = MercZoom::default();
        let ext = mz.extents(4);
        // zoom 0 is never restricted
        assert_eq!(ext[0], (0, 0));
        // max zoom rows are clipped near the poles but non-empty
        let (ymin, ymax) = ext[4];
        assert!(ymin >= 0 && ymax <= 15 && ymin <= ymax);
        // the entry past max zoom is empty
        let (ymin, ymax) = ext[5];
        assert!(ymin > ymax);
    }

    #[test]
    fn adjust_grows_toward_the_poles() {
        let mz = MercZoom::default();
        // equator-adjacent rows need no compensation
        assert_eq!(mz.adjust(0, 0), 0);
        assert_eq!(mz.adjust(4, 8), 0);
        // top row at zoom 4 sits past the first distortion bracket
        assert!(mz.adjust(4, 0) >= 1);
        // monotone toward the pole
        assert!(mz.adjust(6, 0) >= mz.adjust(6, 16));
    }

    #[test]
    fn max_y_tightens_with_zoom_gap() {
        let mz = MercZoom::default();
        // at the same zoom, a larger remaining gap to max_zoom allows
        // rows farther toward the poles
        let tight = mz.max_y(6, 6);
        let loose = mz.max_y(6, 10);
        assert!(loose.0 <= tight.0);
        assert!(loose.1 >= tight.1);
    }
}
