//! Minimal 2-D polygon support for tile intersection tests: area,
//! axis-aligned-rectangle overlap/cover, and rectangle clipping.

/// Axis-aligned rectangle with `x0 <= x1`, `y0 <= y1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl Rect {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn area(&self) -> f64 {
        (self.x1 - self.x0) * (self.y1 - self.y0)
    }
}

/// A simple polygon ring (implicitly closed).
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    points: Vec<(f64, f64)>,
}

impl Polygon {
    pub fn new(points: Vec<(f64, f64)>) -> Self {
        Self { points }
    }

    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    /// Unsigned area (shoelace formula).
    pub fn area(&self) -> f64 {
        ring_area(&self.points).abs()
    }

    fn bbox(&self) -> Rect {
        let mut r = Rect::new(f64::MAX, f64::MAX, f64::MIN, f64::MIN);
        for &(x, y) in &self.points {
            r.x0 = r.x0.min(x);
            r.y0 = r.y0.min(y);
            r.x1 = r.x1.max(x);
            r.y1 = r.y1.max(y);
        }
        r
    }

    /// Clip this polygon to `rect` (Sutherland-Hodgman; the clip region
    /// is convex so an arbitrary subject ring is fine).
    pub fn clip_rect(&self, rect: &Rect) -> Polygon {
        let bb = self.bbox();
        if bb.x1 <= rect.x0 || bb.x0 >= rect.x1 || bb.y1 <= rect.y0 || bb.y0 >= rect.y1 {
            return Polygon::new(Vec::new());
        }

        let mut pts = self.points.clone();
        pts = clip_edge(&pts, |p| p.0 >= rect.x0, |a, b| cross_x(a, b, rect.x0));
        pts = clip_edge(&pts, |p| p.0 <= rect.x1, |a, b| cross_x(a, b, rect.x1));
        pts = clip_edge(&pts, |p| p.1 >= rect.y0, |a, b| cross_y(a, b, rect.y0));
        pts = clip_edge(&pts, |p| p.1 <= rect.y1, |a, b| cross_y(a, b, rect.y1));
        Polygon::new(pts)
    }

    /// Area of this polygon clipped to `rect`.
    pub fn clip_rect_area(&self, rect: &Rect) -> f64 {
        self.clip_rect(rect).area()
    }

    /// Whether the polygon interior shares area with `rect`.
    pub fn overlaps_rect(&self, rect: &Rect) -> bool {
        self.clip_rect_area(rect) > rect.area() * 1e-12
    }

    /// Whether the polygon fully covers `rect`.
    pub fn covers_rect(&self, rect: &Rect) -> bool {
        self.clip_rect_area(rect) >= rect.area() * (1.0 - 1e-9)
    }
}

/// Signed ring area (positive for counter-clockwise winding).
fn ring_area(points: &[(f64, f64)]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut acc = 0.0;
    for i in 0..points.len() {
        let (x0, y0) = points[i];
        let (x1, y1) = points[(i + 1) % points.len()];
        acc += x0 * y1 - x1 * y0;
    }
    acc / 2.0
}

fn clip_edge(
    pts: &[(f64, f64)],
    inside: impl Fn((f64, f64)) -> bool,
    crossing: impl Fn((f64, f64), (f64, f64)) -> (f64, f64),
) -> Vec<(f64, f64)> {
    let mut out = Vec::with_capacity(pts.len() + 2);
    for i in 0..pts.len() {
        let cur = pts[i];
        let prev = pts[(i + pts.len() - 1) % pts.len()];
        match (inside(prev), inside(cur)) {
            (true, true) => out.push(cur),
            (true, false) => out.push(crossing(prev, cur)),
            (false, true) => {
                out.push(crossing(prev, cur));
                out.push(cur);
            }
            (false, false) => {}
        }
    }
    out
}

fn cross_x(a: (f64, f64), b: (f64, f64), x: f64) -> (f64, f64) {
    let t = (x - a.0) / (b.0 - a.0);
    (x, a.1 + t * (b.1 - a.1))
}

fn cross_y(a: (f64, f64), b: (f64, f64), y: f64) -> (f64, f64) {
    let t = (y - a.1) / (b.1 - a.1);
    (a.0 + t * (b.0 - a.0), y)
}

/// A set of disjoint polygon parts (a region split at the date line).
#[derive(Debug, Clone, PartialEq)]
pub struct MultiPoly {
    parts: Vec<Polygon>,
}

impl MultiPoly {
    pub fn new(parts: Vec<Polygon>) -> Self {
        Self { parts }
    }

    pub fn parts(&self) -> &[Polygon] {
        &self.parts
    }

    pub fn area(&self) -> f64 {
        self.parts.iter().map(Polygon::area).sum()
    }

    /// Summed clipped area; the parts are disjoint so this is the area of
    /// the union intersected with `rect`.
    pub fn clip_rect_area(&self, rect: &Rect) -> f64 {
        self.parts.iter().map(|p| p.clip_rect_area(rect)).sum()
    }

    pub fn overlaps_rect(&self, rect: &Rect) -> bool {
        self.clip_rect_area(rect) > rect.area() * 1e-12
    }

    pub fn covers_rect(&self, rect: &Rect) -> bool {
        self.clip_rect_area(rect) >= rect.area() * (1.0 - 1e-9)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn unit_square() -> Polygon {
        Polygon::new(vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)])
    }

    #[test]
    fn shoelace_area() {
        assert_relative_eq!(unit_square().area(), 1.0);
        let tri = Polygon::new(vec![(0.0, 0.0), (2.0, 0.0), (0.0, 2.0)]);
        assert_relative_eq!(tri.area(), 2.0);
    }

    #[test]
    fn clip_partial_overlap() {
        let r = Rect::new(0.5, 0.5, 1.5, 1.5);
        assert_relative_eq!(unit_square().clip_rect_area(&r), 0.25);
        assert!(unit_square().overlaps_rect(&r));
        assert!(!unit_square().covers_rect(&r));
    }

    #[test]
    fn covers_interior_rect() {
        let r = Rect::new(0.25, 0.25, 0.75, 0.75);
        assert!(unit_square().covers_rect(&r));
    }

    #[test]
    fn disjoint_rect() {
        let r = Rect::new(2.0, 2.0, 3.0, 3.0);
        assert!(!unit_square().overlaps_rect(&r));
        assert_relative_eq!(unit_square().clip_rect_area(&r), 0.0);
    }

    #[test]
    fn touching_edge_does_not_overlap() {
        let r = Rect::new(1.0, 0.0, 2.0, 1.0);
        assert!(!unit_square().overlaps_rect(&r));
    }

    #[test]
    fn notched_polygon_does_not_cover_notch() {
        // L-shape: unit square minus its upper-right quadrant
        let l = Polygon::new(vec![
            (0.0, 0.0),
            (1.0, 0.0),
            (1.0, 0.5),
            (0.5, 0.5),
            (0.5, 1.0),
            (0.0, 1.0),
        ]);
        let notch = Rect::new(0.6, 0.6, 0.9, 0.9);
        assert!(!l.overlaps_rect(&notch));
        let spanning = Rect::new(0.25, 0.25, 0.75, 0.75);
        assert!(l.overlaps_rect(&spanning));
        assert!(!l.covers_rect(&spanning));
    }

    #[test]
    fn multipoly_union_covers_across_seam() {
        // two adjacent halves cover a rect spanning the shared edge
        let west = Polygon::new(vec![(0.0, 0.0), (0.5, 0.0), (0.5, 1.0), (0.0, 1.0)]);
        let east = Polygon::new(vec![(0.5, 0.0), (1.0, 0.0), (1.0, 1.0), (0.5, 1.0)]);
        let mp = MultiPoly::new(vec![west, east]);
        let seam = Rect::new(0.4, 0.4, 0.6, 0.6);
        assert!(mp.covers_rect(&seam));
        assert_relative_eq!(mp.area(), 1.0);
    }
}
