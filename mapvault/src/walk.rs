//! Random-walk traversal order for tile downloads.
//!
//! Raster-scanning a tile server is an easy fingerprint to ban. Instead,
//! tiles go out grouped by zoom (shallow first), and within a zoom in a
//! walk: start somewhere random, repeatedly jump to the nearest unvisited
//! tile (Manhattan metric), and download a shuffled window around each
//! stop. Locality stays high enough for keep-alive to pay off.

use std::collections::HashSet;

use rand::seq::{IndexedRandom, IteratorRandom, SliceRandom};
use rand::Rng;

use crate::mercator::TileCoord;

/// Width of the shuffled "screen view" around each walk stop.
const WINDOW: i64 = 10;

/// Order all tiles for download: zoom levels ascending, random-walk
/// within each zoom.
pub fn random_walk<R: Rng>(tiles: &HashSet<TileCoord>, rng: &mut R) -> Vec<TileCoord> {
    let mut zooms: Vec<u8> = tiles.iter().map(|t| t.z).collect::<HashSet<_>>().into_iter().collect();
    zooms.sort_unstable();

    let mut out = Vec::with_capacity(tiles.len());
    for zoom in zooms {
        let level: HashSet<TileCoord> = tiles.iter().filter(|t| t.z == zoom).copied().collect();
        random_walk_level(level, rng, &mut out);
    }
    out
}

fn random_walk_level<R: Rng>(
    mut remaining: HashSet<TileCoord>,
    rng: &mut R,
    out: &mut Vec<TileCoord>,
) {
    let mut target: Option<(i64, i64)> = None;

    while !remaining.is_empty() {
        let stop = match target {
            None => *remaining.iter().choose(rng).unwrap(),
            Some(prev) => {
                let closest = remaining
                    .iter()
                    .map(|t| manhattan(prev, (t.x as i64, t.y as i64)))
                    .min()
                    .unwrap();
                let candidates: Vec<TileCoord> = remaining
                    .iter()
                    .filter(|t| manhattan(prev, (t.x as i64, t.y as i64)) == closest)
                    .copied()
                    .collect();
                *candidates.choose(rng).unwrap()
            }
        };
        target = Some((stop.x as i64, stop.y as i64));

        let xmin = stop.x as i64 - WINDOW / 2;
        let ymin = stop.y as i64 - WINDOW / 2;
        let (xmax, ymax) = (xmin + WINDOW - 1, ymin + WINDOW - 1);

        let mut swatch: Vec<TileCoord> = remaining
            .iter()
            .filter(|t| {
                let (x, y) = (t.x as i64, t.y as i64);
                x >= xmin && x <= xmax && y >= ymin && y <= ymax
            })
            .copied()
            .collect();
        for t in &swatch {
            remaining.remove(t);
        }
        swatch.shuffle(rng);
        out.extend(swatch);
    }
}

fn manhattan(a: (i64, i64), b: (i64, i64)) -> i64 {
    (a.0 - b.0).abs() + (a.1 - b.1).abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn grid(z: u8, n: u32) -> HashSet<TileCoord> {
        (0..n)
            .flat_map(|x| (0..n).map(move |y| TileCoord::new(z, x, y)))
            .collect()
    }

    #[test]
    fn visits_every_tile_exactly_once() {
        let tiles: HashSet<TileCoord> = grid(4, 13).into_iter().chain(grid(3, 5)).collect();
        let mut rng = StdRng::seed_from_u64(7);
        let order = random_walk(&tiles, &mut rng);

        assert_eq!(order.len(), tiles.len());
        let seen: HashSet<TileCoord> = order.iter().copied().collect();
        assert_eq!(seen, tiles);
    }

    #[test]
    fn zoom_levels_come_out_ascending() {
        let tiles: HashSet<TileCoord> = grid(2, 3)
            .into_iter()
            .chain(grid(5, 6))
            .chain(grid(3, 4))
            .collect();
        let mut rng = StdRng::seed_from_u64(1);
        let order = random_walk(&tiles, &mut rng);

        let zooms: Vec<u8> = order.iter().map(|t| t.z).collect();
        let mut sorted = zooms.clone();
        sorted.sort_unstable();
        assert_eq!(zooms, sorted);
    }

    #[test]
    fn walk_is_not_a_raster_scan() {
        let tiles = grid(6, 20);
        let mut rng = StdRng::seed_from_u64(42);
        let order = random_walk(&tiles, &mut rng);

        let raster: Vec<TileCoord> = {
            let mut v: Vec<TileCoord> = tiles.iter().copied().collect();
            v.sort();
            v
        };
        assert_ne!(order, raster);
    }

    #[test]
    fn single_tile_set() {
        let tiles: HashSet<TileCoord> = [TileCoord::new(0, 0, 0)].into_iter().collect();
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(random_walk(&tiles, &mut rng), vec![TileCoord::new(0, 0, 0)]);
    }
}
