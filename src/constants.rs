//! Crate-wide constants shared with the serving layer and the client.

use std::time::Duration;

/// Side length of a tile in samples. Every tile holds
/// `TILE_SIZE * TILE_SIZE` pixels regardless of LOD.
pub const TILE_SIZE: i64 = 128;

/// Samples per tile.
pub const TILE_PIXELS: usize = (TILE_SIZE * TILE_SIZE) as usize;

/// Bumped whenever the serialized shape of any cached computation
/// changes. The version participates in every cache key, so a bump
/// orphans stale entries instead of deserializing them wrongly.
pub const SCHEMA_VERSION: &str = "1";

/// How many leading bytes of a blob are sniffed for a NUL byte when
/// deciding whether it is binary. Mirrors git's own heuristic.
pub const BINARY_SNIFF_LEN: usize = 8000;

/// TTL for object- and commit-keyed computations. The key is derived
/// from immutable hashes, so entries never go stale and never expire.
pub const OBJECT_TTL: Option<Duration> = None;

/// TTL for tile payloads. Tiles are requested far more often than
/// objects, so they get a short TTL to bound cache memory.
pub const TILE_TTL: Option<Duration> = Some(Duration::from_secs(30 * 60));
