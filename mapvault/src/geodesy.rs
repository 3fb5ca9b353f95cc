//! Geodesic computations: distances, bearings, and great-circle plotting.
//! All calculations assume a spherical earth.

pub const EARTH_EQ_RAD: f64 = 6_378_137.0;
pub const EARTH_POL_RAD: f64 = 6_356_752.3;
pub const EARTH_MEAN_RAD: f64 = 6_371_009.0;

const EPSILON: f64 = 1.0e-9;

/// A point on the unit sphere (ECEF direction vector).
#[derive(Debug, Clone, Copy, PartialEq)]
struct Vec3([f64; 3]);

impl Vec3 {
    fn dot(self, other: Vec3) -> f64 {
        self.0.iter().zip(other.0.iter()).map(|(a, b)| a * b).sum()
    }

    fn cross(self, other: Vec3) -> Vec3 {
        let (i, j) = (self.0, other.0);
        Vec3([
            i[1] * j[2] - i[2] * j[1],
            i[2] * j[0] - i[0] * j[2],
            i[0] * j[1] - i[1] * j[0],
        ])
    }

    fn len(self) -> f64 {
        self.dot(self).sqrt()
    }

    fn scale(self, k: f64) -> Vec3 {
        Vec3(self.0.map(|x| x * k))
    }

    fn add(self, other: Vec3) -> Vec3 {
        Vec3([
            self.0[0] + other.0[0],
            self.0[1] + other.0[1],
            self.0[2] + other.0[2],
        ])
    }

    /// Normalize; None if the vector is (numerically) zero.
    fn norm(self) -> Option<Vec3> {
        let len = self.len();
        if len < EPSILON {
            None
        } else {
            Some(self.scale(1.0 / len))
        }
    }

    /// Component of `other` orthogonal to self, plus the cosine of the angle
    /// between them. Both vectors must be unit length.
    fn ortho(self, other: Vec3) -> (Vec3, f64) {
        let kcos = self.dot(other);
        (other.add(self.scale(-kcos)), kcos)
    }
}

/// Combine orthogonal basis vectors `u` and `v` at angle `theta` (radians).
fn angle_vec(u: Vec3, v: Vec3, theta: f64) -> Vec3 {
    u.scale(theta.cos()).add(v.scale(theta.sin()))
}

/// Point on the unit sphere for a (lat, lon) position in degrees.
fn ll_to_ecefu(lat: f64, lon: f64) -> Vec3 {
    let (rlat, rlon) = (lat.to_radians(), lon.to_radians());
    let latcos = rlat.cos();
    Vec3([rlon.cos() * latcos, rlon.sin() * latcos, rlat.sin()])
}

/// Inverse of `ll_to_ecefu`.
fn ecefu_to_ll(v: Vec3) -> (f64, f64) {
    let [x, y, z] = v.0;
    let rlat = z.clamp(-1.0, 1.0).asin();
    let rlon = if x.abs() < EPSILON && y.abs() < EPSILON {
        0.0
    } else {
        y.atan2(x)
    };
    (rlat.to_degrees(), rlon.to_degrees())
}

/// North and east unit vectors at a position vector. At a pole, the
/// direction of 0 longitude is treated as north.
fn orientate(vp: Vec3) -> (Vec3, Vec3) {
    let veast = match Vec3([0.0, 0.0, 1.0]).cross(vp).norm() {
        Some(v) => v,
        None => Vec3([0.0, -vp.0[2], 0.0]),
    };
    let vnorth = vp.cross(veast);
    (vnorth, veast)
}

/// Bearing vector for a position vector and compass bearing in degrees.
fn bearing_vec(vp: Vec3, bearing: f64) -> Vec3 {
    let (vnorth, veast) = orientate(vp);
    angle_vec(vnorth, veast, bearing.to_radians())
}

fn bearing_at(vp: Vec3, vdir: Vec3) -> f64 {
    let (vnorth, veast) = orientate(vp);
    vdir.dot(veast).atan2(vdir.dot(vnorth)).to_degrees()
}

/// Distance in meters between lat/lon coordinates `p0` and `p1`.
pub fn distance(p0: (f64, f64), p1: (f64, f64)) -> f64 {
    let v0 = ll_to_ecefu(p0.0, p0.1);
    let v1 = ll_to_ecefu(p1.0, p1.1);
    let (vo, kcos) = v0.ortho(v1);
    let ksin = vo.len();
    EARTH_MEAN_RAD * ksin.atan2(kcos)
}

/// Compass bearing from `src` to `dst` in degrees; None if antipodal.
pub fn bearing(src: (f64, f64), dst: (f64, f64)) -> Option<f64> {
    let vsrc = ll_to_ecefu(src.0, src.1);
    let vdst = ll_to_ecefu(dst.0, dst.1);
    let (vdir, _) = vsrc.ortho(vdst);
    if vdir.len() < EPSILON {
        return None;
    }
    Some(bearing_at(vsrc, vdir))
}

/// Position `dist` meters from `p` in direction `bearing`, plus the new
/// bearing at the target point.
pub fn plot(p: (f64, f64), bearing: f64, dist: f64) -> ((f64, f64), f64) {
    let vp = ll_to_ecefu(p.0, p.1);
    let vdir = bearing_vec(vp, bearing);
    plot_vec(vp, vdir, dist / EARTH_MEAN_RAD)
}

fn plot_vec(vp: Vec3, vdir: Vec3, theta: f64) -> ((f64, f64), f64) {
    let vp_plot = angle_vec(vp, vdir, theta);
    let vdir_plot = angle_vec(vdir, vp.scale(-1.0), theta);
    (ecefu_to_ll(vp_plot), bearing_at(vp_plot, vdir_plot))
}

/// Points along the great circle leaving `p` at `bearing`, one every
/// `step` meters out to `dist_max`. The end point is always included.
pub fn great_circle(
    p: (f64, f64),
    bearing: f64,
    step: f64,
    dist_max: f64,
) -> impl Iterator<Item = (f64, f64)> {
    let vp = ll_to_ecefu(p.0, p.1);
    let vdir = bearing_vec(vp, bearing);
    let n = (dist_max / step).ceil().max(1.0) as usize;
    (0..=n).map(move |i| {
        let d = (i as f64 * step).min(dist_max);
        plot_vec(vp, vdir, d / EARTH_MEAN_RAD).0
    })
}
