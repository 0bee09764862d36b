//! Coordinate mapping between line space, world space, and tiles.
//!
//! We convert freely between three spaces:
//!
//! - *line space*: a 1D range `[0, layout.line_count)` covering every
//!   line of every file, in lexicographic path order;
//! - *world space*: a 2D square of side `n` (a power of two), each line
//!   owning exactly one cell;
//! - *tile space*: world space cut into `TILE_SIZE`-sided tiles per LOD.
//!
//! Line ↔ world uses a Hilbert curve so consecutive lines land in
//! adjacent cells. This is the rotation-state formulation (`d2xy` /
//! `xy2d`); the quadtree encoder's orientation machine in
//! [`crate::quadtree`] is keyed to exactly this curve and tested
//! against it.
//!
//! Everything here is pure math over plain values.

use serde::{Deserialize, Serialize};

use crate::constants::TILE_SIZE;
use crate::repo::ObjectHash;

/// Index of a line in line space.
pub type LinePosition = i64;

/// Total line count, from which the world-square side is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileLayout {
    pub line_count: i64,
}

impl TileLayout {
    /// Side length of the world square: the smallest power of two `n`
    /// with `n² ≥ line_count`, and never less than 2.
    pub fn grid_side_length(&self) -> i64 {
        let mut n: i64 = 2;
        while n * n < self.line_count {
            n *= 2;
        }
        n
    }
}

/// A cell in world space, `(x, y)` in `[0, n)²`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldPosition {
    pub x: i64,
    pub y: i64,
}

/// A sample position inside one tile of the pyramid. Offsets are in
/// `[0, TILE_SIZE)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TilePosition {
    pub lod: i64,
    pub tile_x: i64,
    pub tile_y: i64,
    pub offset_x: i64,
    pub offset_y: i64,
}

/// World-space extent covered by one tile at `lod`: `TILE_SIZE · 2^lod`.
pub fn lod_size(lod: i64) -> i64 {
    TILE_SIZE << lod
}

pub fn line_to_world(line: LinePosition, layout: TileLayout) -> WorldPosition {
    let n = layout.grid_side_length();
    let (x, y) = hilbert_d2xy(n, line);
    WorldPosition { x, y }
}

pub fn world_to_line(world: WorldPosition, layout: TileLayout) -> LinePosition {
    let n = layout.grid_side_length();
    hilbert_xy2d(n, world.x, world.y)
}

/// Maps a world position into the lod-0 tile containing it.
pub fn world_to_tile(world: WorldPosition, _layout: TileLayout) -> TilePosition {
    TilePosition {
        lod: 0,
        tile_x: world.x / TILE_SIZE,
        tile_y: world.y / TILE_SIZE,
        offset_x: world.x % TILE_SIZE,
        offset_y: world.y % TILE_SIZE,
    }
}

/// Maps a tile-relative position back to world space, at any LOD.
pub fn tile_to_world(tile: TilePosition, _layout: TileLayout) -> WorldPosition {
    let size = lod_size(tile.lod);
    WorldPosition {
        x: tile.tile_x * size + tile.offset_x,
        y: tile.tile_y * size + tile.offset_y,
    }
}

/// An i32 fingerprint of an object id: the first four hash bytes,
/// little-endian. Used as a pixel value so same-file cells share color.
pub fn hash_to_i32(hash: ObjectHash) -> i32 {
    let bytes = hash.as_bytes();
    i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

// ============================================================================
// Hilbert curve
// ============================================================================

/// Rotate/flip a quadrant so the curve threads through it in the right
/// direction.
fn hilbert_rot(s: i64, x: &mut i64, y: &mut i64, rx: i64, ry: i64) {
    if ry == 0 {
        if rx == 1 {
            *x = s - 1 - *x;
            *y = s - 1 - *y;
        }
        std::mem::swap(x, y);
    }
}

/// Distance along the curve → cell, on an `n × n` grid.
fn hilbert_d2xy(n: i64, d: i64) -> (i64, i64) {
    let mut t = d;
    let mut x = 0;
    let mut y = 0;
    let mut s = 1;
    while s < n {
        let rx = 1 & (t / 2);
        let ry = 1 & (t ^ rx);
        hilbert_rot(s, &mut x, &mut y, rx, ry);
        x += s * rx;
        y += s * ry;
        t /= 4;
        s *= 2;
    }
    (x, y)
}

/// Cell → distance along the curve, on an `n × n` grid.
fn hilbert_xy2d(n: i64, mut x: i64, mut y: i64) -> i64 {
    let mut d = 0;
    let mut s = n / 2;
    while s > 0 {
        let rx = if (x & s) > 0 { 1 } else { 0 };
        let ry = if (y & s) > 0 { 1 } else { 0 };
        d += s * s * ((3 * rx) ^ ry);
        hilbert_rot(s, &mut x, &mut y, rx, ry);
        s /= 2;
    }
    d
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_side_length_boundaries() {
        // (line_count, expected side)
        let table = [
            (1, 2),
            (4, 2),
            (5, 4),
            (16, 4),
            (17, 8),
            (64, 8),
            (65, 16),
        ];
        for (count, side) in table {
            let layout = TileLayout { line_count: count };
            assert_eq!(
                layout.grid_side_length(),
                side,
                "grid_side_length({count})"
            );
        }
    }

    #[test]
    fn test_grid_side_is_power_of_two_and_big_enough() {
        for count in 0..=1025 {
            let layout = TileLayout { line_count: count };
            let n = layout.grid_side_length();
            assert!(n >= 2);
            assert_eq!(n & (n - 1), 0, "side {n} not a power of two");
            assert!(n * n >= count);
        }
    }

    #[test]
    fn test_line_world_round_trip_exhaustive() {
        let layout = TileLayout { line_count: 1024 }; // 32x32 grid
        let n = layout.grid_side_length();
        for line in 0..n * n {
            let world = line_to_world(line, layout);
            assert!(world.x >= 0 && world.x < n);
            assert!(world.y >= 0 && world.y < n);
            assert_eq!(world_to_line(world, layout), line, "line {line}");
        }
    }

    #[test]
    fn test_world_line_round_trip_exhaustive() {
        let layout = TileLayout { line_count: 256 };
        let n = layout.grid_side_length();
        for x in 0..n {
            for y in 0..n {
                let world = WorldPosition { x, y };
                let line = world_to_line(world, layout);
                assert_eq!(line_to_world(line, layout), world, "({x}, {y})");
            }
        }
    }

    #[test]
    fn test_curve_adjacency() {
        // Consecutive lines are always 4-neighbors in world space.
        let layout = TileLayout { line_count: 4096 };
        let n = layout.grid_side_length();
        let mut prev = line_to_world(0, layout);
        for line in 1..n * n {
            let cur = line_to_world(line, layout);
            let dist = (cur.x - prev.x).abs() + (cur.y - prev.y).abs();
            assert_eq!(dist, 1, "jump between line {} and {}", line - 1, line);
            prev = cur;
        }
    }

    #[test]
    fn test_tile_world_round_trip() {
        let layout = TileLayout { line_count: 1024 };
        let positions = [
            WorldPosition { x: 0, y: 0 },
            WorldPosition { x: 1, y: 1 },
            WorldPosition { x: 63, y: 63 },
            WorldPosition { x: 64, y: 64 },
            WorldPosition { x: 127, y: 128 },
            WorldPosition { x: 128, y: 192 },
            WorldPosition { x: 255, y: 255 },
        ];
        for world in positions {
            let tile = world_to_tile(world, layout);
            assert!(tile.offset_x < TILE_SIZE && tile.offset_y < TILE_SIZE);
            assert_eq!(tile_to_world(tile, layout), world, "{world:?}");
        }
    }

    #[test]
    fn test_tile_to_world_at_higher_lods() {
        let layout = TileLayout { line_count: 1 << 20 };
        let tile = TilePosition {
            lod: 2,
            tile_x: 1,
            tile_y: 3,
            offset_x: 5,
            offset_y: 7,
        };
        // One lod-2 tile spans TILE_SIZE * 4 world cells.
        assert_eq!(lod_size(2), TILE_SIZE * 4);
        assert_eq!(
            tile_to_world(tile, layout),
            WorldPosition {
                x: TILE_SIZE * 4 + 5,
                y: 3 * TILE_SIZE * 4 + 7,
            }
        );
    }

    #[test]
    fn test_hash_to_i32() {
        let hash: ObjectHash = "09030652af16811842314a2c8fa5e344c2bb5c34".parse().unwrap();
        assert_eq!(hash_to_i32(hash), 1376125705);
        let hash: ObjectHash = "c5ff5b84be06c42e15a35a312a7a2bb3760d29d9".parse().unwrap();
        assert_eq!(hash_to_i32(hash), -2074345531);
        assert_eq!(hash_to_i32(ObjectHash::ZERO), 0);
    }
}
