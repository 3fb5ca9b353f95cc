//! Geographic regions: named lat/lon polygons, date-line-safe projection
//! into the quadtree plane, and the boundary string stored in the index.

use std::f64::consts::PI;

use crate::error::{CacheError, Result};
use crate::mercator::{ll_to_mercator, mercator_to_xy};
use crate::polygon::{MultiPoly, Polygon};

/// Reserved name for the read-only whole-globe region.
pub const WORLD_NAME: &str = "world";

/// A named region bounded by lat/lon vertices.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    name: String,
    vertices: Vec<(f64, f64)>,
}

impl Region {
    /// Build a region from `(lat, lon)` vertices, validating ranges.
    pub fn new<S: Into<String>>(name: S, vertices: Vec<(f64, f64)>) -> Result<Self> {
        if vertices.len() < 3 {
            return Err(CacheError::Spec(
                "region must have at least 3 coordinates".into(),
            ));
        }
        for &(lat, lon) in &vertices {
            if !(lat.is_finite() && lon.is_finite()) || lat.abs() > 90.0 || lon.abs() > 180.0 {
                return Err(CacheError::Spec("region coordinates out of range".into()));
            }
        }
        Ok(Self {
            name: name.into(),
            vertices,
        })
    }

    /// The reserved whole-globe region.
    pub fn world() -> Self {
        Self {
            name: WORLD_NAME.to_string(),
            vertices: vec![
                (90.0, -180.0),
                (90.0, 180.0),
                (-90.0, 180.0),
                (-90.0, -180.0),
            ],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name<S: Into<String>>(&mut self, name: S) {
        self.name = name.into();
    }

    pub fn vertices(&self) -> &[(f64, f64)] {
        &self.vertices
    }

    /// Boundary as the whitespace/comma string stored in the `regions`
    /// table: "lat,lon lat,lon ...".
    pub fn boundary(&self) -> String {
        self.vertices
            .iter()
            .map(|&(lat, lon)| format!("{lat},{lon}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Parse a boundary string back into a region.
    pub fn from_boundary<S: Into<String>>(name: S, boundary: &str) -> Result<Self> {
        let mut vertices = Vec::new();
        for pair in boundary.split_whitespace() {
            let Some((lat, lon)) = pair.split_once(',') else {
                return Err(CacheError::Spec("can't parse region boundary".into()));
            };
            let (lat, lon) = match (lat.trim().parse(), lon.trim().parse()) {
                (Ok(lat), Ok(lon)) => (lat, lon),
                _ => return Err(CacheError::Spec("can't parse region boundary".into())),
            };
            vertices.push((lat, lon));
        }
        Region::new(name, vertices)
    }

    /// Whether two boundaries describe the same ring, up to rotation,
    /// direction, and a small numeric tolerance.
    pub fn same_boundary(&self, other: &Region) -> bool {
        let a = &self.vertices;
        let b = &other.vertices;
        if a.len() != b.len() {
            return false;
        }
        let n = a.len();
        let eq = |p: (f64, f64), q: (f64, f64)| {
            (p.0 - q.0).abs() < 1e-6 && (p.1 - q.1).abs() < 1e-6
        };
        (0..n).any(|shift| {
            (0..n).all(|i| eq(a[i], b[(i + shift) % n]))
                || (0..n).all(|i| eq(a[i], b[(n + shift - i) % n]))
        })
    }

    /// Project the boundary into the quadtree plane, handling rings that
    /// cross the international date line.
    ///
    /// The ring is first unrolled so consecutive longitudes differ by at
    /// most 180 degrees (the unrolled values may leave the +-180 range),
    /// then split into 360-degree-wide windows which are shifted back into
    /// the plane. Vertex ordering does not matter: both windings unroll to
    /// the same shape.
    pub fn merc_polys(&self) -> MultiPoly {
        if self.name == WORLD_NAME {
            // full quadtree plane, already split at 180-degree meridians
            return MultiPoly::new(vec![
                Polygon::new(vec![(0.0, 0.0), (0.5, 0.0), (0.5, 1.0), (0.0, 1.0)]),
                Polygon::new(vec![(0.5, 0.0), (1.0, 0.0), (1.0, 1.0), (0.5, 1.0)]),
            ]);
        }

        // project to mercator with an unrolled x, clamping y at the plane
        // edge so +-90-degree vertices stay finite
        let mut ring: Vec<(f64, f64)> = Vec::with_capacity(self.vertices.len());
        let mut prev_x: Option<f64> = None;
        for &(lat, lon) in &self.vertices {
            let (mut mx, my) = ll_to_mercator(lat, lon);
            if let Some(px) = prev_x {
                while mx - px > PI {
                    mx -= 2.0 * PI;
                }
                while px - mx > PI {
                    mx += 2.0 * PI;
                }
            }
            prev_x = Some(mx);
            ring.push((mx, my.clamp(-PI, PI)));
        }

        let min_x = ring.iter().map(|p| p.0).fold(f64::MAX, f64::min);
        let max_x = ring.iter().map(|p| p.0).fold(f64::MIN, f64::max);
        let k_min = ((min_x + PI) / (2.0 * PI)).floor() as i32;
        let k_max = ((max_x + PI) / (2.0 * PI)).ceil() as i32;

        let unrolled = Polygon::new(ring);
        let mut parts = Vec::new();
        for k in k_min..k_max {
            let center = 2.0 * PI * k as f64;
            let window = crate::polygon::Rect::new(center - PI, -PI, center + PI, PI);
            let clipped = unrolled.clip_rect(&window);
            if clipped.points().len() < 3 {
                continue;
            }
            let shifted: Vec<(f64, f64)> = clipped
                .points()
                .iter()
                .map(|&(x, y)| mercator_to_xy(x - center, y))
                .collect();
            let part = Polygon::new(shifted);
            if part.area() > 0.0 {
                parts.push(part);
            }
        }
        MultiPoly::new(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::polygon::Rect;
    use approx::assert_relative_eq;

    #[test]
    fn rejects_bad_regions() {
        assert!(Region::new("a", vec![(0.0, 0.0), (1.0, 1.0)]).is_err());
        assert!(Region::new("a", vec![(91.0, 0.0), (0.0, 0.0), (0.0, 1.0)]).is_err());
        assert!(Region::new("a", vec![(0.0, 181.0), (0.0, 0.0), (1.0, 0.0)]).is_err());
    }

    #[test]
    fn boundary_string_round_trip() {
        let r = Region::new("r", vec![(42.5, -71.0), (43.0, -70.0), (41.5, -70.5)]).unwrap();
        let parsed = Region::from_boundary("r", &r.boundary()).unwrap();
        assert_eq!(r, parsed);
    }

    #[test]
    fn same_boundary_up_to_rotation_and_direction() {
        let a = Region::new("a", vec![(0.0, 0.0), (0.0, 1.0), (1.0, 1.0)]).unwrap();
        let rotated = Region::new("b", vec![(1.0, 1.0), (0.0, 0.0), (0.0, 1.0)]).unwrap();
        let reversed = Region::new("c", vec![(1.0, 1.0), (0.0, 1.0), (0.0, 0.0)]).unwrap();
        let other = Region::new("d", vec![(0.0, 0.0), (0.0, 1.0), (1.0, 2.0)]).unwrap();
        assert!(a.same_boundary(&rotated));
        assert!(a.same_boundary(&reversed));
        assert!(!a.same_boundary(&other));
    }

    #[test]
    fn world_covers_plane() {
        let mp = Region::world().merc_polys();
        assert_relative_eq!(mp.area(), 1.0, epsilon = 1e-12);
        assert!(mp.covers_rect(&Rect::new(0.0, 0.0, 1.0, 1.0)));
    }

    #[test]
    fn simple_region_projects_to_one_part() {
        let r = Region::new("ne", vec![(42.0, -73.0), (45.0, -73.0), (45.0, -69.0), (42.0, -69.0)])
            .unwrap();
        let mp = r.merc_polys();
        assert_eq!(mp.parts().len(), 1);
        assert!(mp.area() > 0.0);
    }

    #[test]
    fn date_line_strip_is_order_independent() {
        // a strip crossing the IDL, defined with either winding
        let fwd = Region::new(
            "strip",
            vec![(10.0, 170.0), (10.0, -170.0), (-10.0, -170.0), (-10.0, 170.0)],
        )
        .unwrap();
        let rev = Region::new(
            "strip",
            vec![(-10.0, 170.0), (-10.0, -170.0), (10.0, -170.0), (10.0, 170.0)],
        )
        .unwrap();

        let (a, b) = (fwd.merc_polys(), rev.merc_polys());
        assert_eq!(a.parts().len(), 2);
        assert_relative_eq!(a.area(), b.area(), epsilon = 1e-12);

        // both sides of the seam are present
        let west_side = Rect::new(0.97, 0.49, 0.99, 0.51);
        let east_side = Rect::new(0.01, 0.49, 0.03, 0.51);
        for mp in [&a, &b] {
            assert!(mp.overlaps_rect(&west_side));
            assert!(mp.overlaps_rect(&east_side));
        }
    }
}
