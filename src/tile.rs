//! The LOD tile pyramid.
//!
//! LOD 0 tiles are computed pixel-by-pixel: each world position in the
//! tile resolves to a line via the index, and a [`PixelMetric`] turns
//! that line into an i32 sample. Higher LODs are macro tiles composed
//! from their four children at the LOD below: all four are fetched
//! concurrently, and every parent pixel aggregates the matching 2×2
//! child block. A failed child fails the whole macro tile — there are
//! no partial tiles and no partial caching.
//!
//! Tile payloads travel as packed little-endian i32s, both in the cache
//! and on the wire.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::compute::{Core, TileComputation};
use crate::constants::{TILE_PIXELS, TILE_SIZE, TILE_TTL};
use crate::coords::{hash_to_i32, tile_to_world, world_to_line, TilePosition, WorldPosition};
use crate::error::{Error, Result};
use crate::index::{compute_index, BlobLinesCache, IndexEntry};
use crate::repo::{ObjectHash, ObjectKind};

// ============================================================================
// Aggregation
// ============================================================================

/// How a parent pixel combines its 2×2 child block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    /// Integer-truncating average.
    Mean,
    Max,
    Min,
    /// Most frequent value; ties go to the first-seen value.
    Mode,
}

impl Aggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Mean => "mean",
            Aggregation::Max => "max",
            Aggregation::Min => "min",
            Aggregation::Mode => "mode",
        }
    }

    pub fn aggregate(&self, values: &[i32]) -> i32 {
        if values.is_empty() {
            return 0;
        }
        match self {
            Aggregation::Mean => {
                let sum: i64 = values.iter().map(|&v| v as i64).sum();
                (sum / values.len() as i64) as i32
            }
            Aggregation::Max => values.iter().copied().max().unwrap_or(0),
            Aggregation::Min => values.iter().copied().min().unwrap_or(0),
            Aggregation::Mode => {
                let mut counts: HashMap<i32, usize> = HashMap::new();
                for &v in values {
                    *counts.entry(v).or_insert(0) += 1;
                }
                // Scan in input order so ties resolve to first-seen.
                let mut best = values[0];
                let mut best_count = 0;
                for &v in values {
                    let count = counts[&v];
                    if count > best_count {
                        best = v;
                        best_count = count;
                    }
                }
                best
            }
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Aggregation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mean" => Ok(Aggregation::Mean),
            "max" => Ok(Aggregation::Max),
            "min" => Ok(Aggregation::Min),
            "mode" => Ok(Aggregation::Mode),
            other => Err(Error::invalid(format!(
                "invalid aggregation type '{other}'. Valid options: mean, mode, max, min"
            ))),
        }
    }
}

// ============================================================================
// Pixel wire encoding
// ============================================================================

/// Packs samples as little-endian i32s.
pub fn encode_pixels(pixels: &[i32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(pixels.len() * 4);
    for &pixel in pixels {
        bytes.extend_from_slice(&pixel.to_le_bytes());
    }
    bytes
}

/// Unpacks little-endian i32s; a trailing partial word is dropped.
pub fn decode_pixels(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

// ============================================================================
// Macro tiles
// ============================================================================

/// Which child of a macro tile, in screen orientation (y grows down).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quadrant {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl fmt::Display for Quadrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Quadrant::TopLeft => "top-left",
            Quadrant::TopRight => "top-right",
            Quadrant::BottomLeft => "bottom-left",
            Quadrant::BottomRight => "bottom-right",
        })
    }
}

/// Fetches or computes one tile. LOD 0 delegates to the registered
/// computation; higher LODs compose the four children at `lod - 1`.
/// Either way the result is cached under the tile's coordinates with
/// the short tile TTL.
pub fn get_tile<'a>(
    core: &'a Core,
    computation_id: &'a str,
    repo_id: &'a str,
    commit: ObjectHash,
    lod: i64,
    x: i64,
    y: i64,
    agg: Aggregation,
) -> BoxFuture<'a, Result<Vec<i32>>> {
    async move {
        if lod < 0 {
            return Err(Error::invalid(format!("lod must be non-negative, got {lod}")));
        }
        if x < 0 || y < 0 {
            return Err(Error::invalid(format!(
                "tile coordinates must be non-negative, got ({x}, {y})"
            )));
        }

        let commit_hex = commit.to_hex();
        let lod_s = lod.to_string();
        let x_s = x.to_string();
        let y_s = y.to_string();

        let bytes = if lod == 0 {
            let computation = core.tile_computation(computation_id)?;
            core.memoized_bytes(
                &[computation_id, &commit_hex, &lod_s, &x_s, &y_s],
                TILE_TTL,
                || async move {
                    let pixels = computation
                        .execute(core, repo_id, commit, lod, x, y)
                        .await?;
                    Ok(encode_pixels(&pixels))
                },
            )
            .await?
        } else {
            core.memoized_bytes(
                &[
                    "macro_tile",
                    computation_id,
                    &commit_hex,
                    &lod_s,
                    &x_s,
                    &y_s,
                    agg.as_str(),
                ],
                TILE_TTL,
                || async move {
                    let pixels =
                        macro_tile(core, computation_id, repo_id, commit, lod, x, y, agg).await?;
                    Ok(encode_pixels(&pixels))
                },
            )
            .await?
        };

        Ok(decode_pixels(&bytes))
    }
    .boxed()
}

/// Composes a macro tile from its four children, fetched concurrently.
/// The first child failure aborts the composition.
#[instrument(skip(core))]
async fn macro_tile(
    core: &Core,
    computation_id: &str,
    repo_id: &str,
    commit: ObjectHash,
    lod: i64,
    x: i64,
    y: i64,
    agg: Aggregation,
) -> Result<Vec<i32>> {
    let child_lod = lod - 1;

    let fetch = |quadrant: Quadrant, child_x: i64, child_y: i64| async move {
        get_tile(core, computation_id, repo_id, commit, child_lod, child_x, child_y, agg)
            .await
            .map_err(|source| Error::ChildTile {
                quadrant,
                lod: child_lod,
                x: child_x,
                y: child_y,
                source: Box::new(source),
            })
    };

    let (top_left, top_right, bottom_left, bottom_right) = tokio::try_join!(
        fetch(Quadrant::TopLeft, 2 * x, 2 * y),
        fetch(Quadrant::TopRight, 2 * x + 1, 2 * y),
        fetch(Quadrant::BottomLeft, 2 * x, 2 * y + 1),
        fetch(Quadrant::BottomRight, 2 * x + 1, 2 * y + 1),
    )?;

    Ok(downsample(
        [&top_left, &top_right, &bottom_left, &bottom_right],
        agg,
    ))
}

/// Aggregates four child tiles into one parent tile. Each parent pixel
/// covers a 2×2 block of the combined 2·TILE_SIZE square, so blocks on
/// the middle seams span child-tile boundaries.
fn downsample(children: [&[i32]; 4], agg: Aggregation) -> Vec<i32> {
    let mut result = vec![0i32; TILE_PIXELS];

    for parent_y in 0..TILE_SIZE {
        for parent_x in 0..TILE_SIZE {
            let mut block = [0i32; 4];
            let mut count = 0;

            for dy in 0..2 {
                for dx in 0..2 {
                    let mut child_x = parent_x * 2 + dx;
                    let mut child_y = parent_y * 2 + dy;

                    // [top-left, top-right, bottom-left, bottom-right]
                    let mut child = 0;
                    if child_x >= TILE_SIZE {
                        child += 1;
                        child_x -= TILE_SIZE;
                    }
                    if child_y >= TILE_SIZE {
                        child += 2;
                        child_y -= TILE_SIZE;
                    }

                    let idx = (child_y * TILE_SIZE + child_x) as usize;
                    if let Some(&value) = children[child].get(idx) {
                        block[count] = value;
                        count += 1;
                    }
                }
            }

            result[(parent_y * TILE_SIZE + parent_x) as usize] =
                agg.aggregate(&block[..count]);
        }
    }

    result
}

// ============================================================================
// Pixel metrics
// ============================================================================

/// One line of one file, resolved for a single pixel.
#[derive(Debug)]
pub struct PixelSample<'a> {
    pub entry: &'a IndexEntry,
    /// Line index within the owning file.
    pub line_in_file: i64,
    /// Byte length of the line; `None` when line data is unavailable.
    pub length: Option<i64>,
    /// Leading whitespace bytes of the line.
    pub indent: Option<i64>,
}

/// Strategy turning one resolved line into one i32 sample. Each metric
/// is registered as its own tile computation.
pub trait PixelMetric: Send + Sync {
    fn id(&self) -> &'static str;
    fn sample(&self, sample: &PixelSample<'_>) -> i32;
}

fn saturate(value: i64) -> i32 {
    value.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// Byte length of the line.
pub struct LengthMetric;

impl PixelMetric for LengthMetric {
    fn id(&self) -> &'static str {
        "length"
    }

    fn sample(&self, sample: &PixelSample<'_>) -> i32 {
        saturate(sample.length.unwrap_or(0))
    }
}

/// Leading-whitespace width of the line.
pub struct IndentMetric;

impl PixelMetric for IndentMetric {
    fn id(&self) -> &'static str {
        "indent"
    }

    fn sample(&self, sample: &PixelSample<'_>) -> i32 {
        saturate(sample.indent.unwrap_or(0))
    }
}

/// The line's offset within its file, giving a per-file gradient.
pub struct OffsetMetric;

impl PixelMetric for OffsetMetric {
    fn id(&self) -> &'static str {
        "offset"
    }

    fn sample(&self, sample: &PixelSample<'_>) -> i32 {
        saturate(sample.line_in_file)
    }
}

/// Fingerprint of the owning blob, so each file renders as one flat
/// color.
pub struct FileHashMetric;

impl PixelMetric for FileHashMetric {
    fn id(&self) -> &'static str {
        "file"
    }

    fn sample(&self, sample: &PixelSample<'_>) -> i32 {
        hash_to_i32(sample.entry.hash)
    }
}

/// Small integer code for the file extension: up to four lowercase
/// bytes packed little-endian, 0 for files without an extension.
pub struct ExtensionMetric;

impl PixelMetric for ExtensionMetric {
    fn id(&self) -> &'static str {
        "ext"
    }

    fn sample(&self, sample: &PixelSample<'_>) -> i32 {
        extension_code(&sample.entry.path)
    }
}

pub(crate) fn extension_code(path: &str) -> i32 {
    let Some(ext) = Path::new(path).extension().and_then(|e| e.to_str()) else {
        return 0;
    };
    let mut bytes = [0u8; 4];
    for (slot, byte) in bytes.iter_mut().zip(ext.bytes()) {
        *slot = byte.to_ascii_lowercase();
    }
    i32::from_le_bytes(bytes)
}

// ============================================================================
// LOD 0 computation
// ============================================================================

/// The lod-0 tile computation: resolves every world position in the
/// tile to a line and samples `metric` on it. Positions outside the
/// grid or past the last line stay 0.
pub struct MetricTile {
    metric: Arc<dyn PixelMetric>,
}

impl MetricTile {
    pub fn new(metric: Arc<dyn PixelMetric>) -> Self {
        MetricTile { metric }
    }
}

#[async_trait]
impl TileComputation for MetricTile {
    async fn execute(
        &self,
        core: &Core,
        repo_id: &str,
        commit: ObjectHash,
        lod: i64,
        x: i64,
        y: i64,
    ) -> Result<Vec<i32>> {
        let repo = core.repo(repo_id)?;
        let tree = match repo.object_kind(commit).await? {
            ObjectKind::Commit => repo.commit_tree(commit).await?,
            ObjectKind::Blob | ObjectKind::Tree => commit,
        };

        let index = compute_index(core, repo_id, tree).await?;
        let layout = index.to_tile_layout();
        let n = layout.grid_side_length();
        let origin = tile_to_world(
            TilePosition {
                lod,
                tile_x: x,
                tile_y: y,
                offset_x: 0,
                offset_y: 0,
            },
            layout,
        );

        let mut pixels = vec![0i32; TILE_PIXELS];
        let mut blob_cache = BlobLinesCache::new();

        for offset_y in 0..TILE_SIZE {
            for offset_x in 0..TILE_SIZE {
                let world = WorldPosition {
                    x: origin.x + offset_x,
                    y: origin.y + offset_y,
                };
                if world.x >= n || world.y >= n {
                    continue;
                }
                let line = world_to_line(world, layout);
                if line >= layout.line_count {
                    continue;
                }
                let Some(entry) = index.find_file_by_line(line) else {
                    continue;
                };

                let line_in_file = line - entry.line_offset;
                let granular = blob_cache.get(core, repo_id, entry.hash).await?;
                let idx = line_in_file as usize;
                let sample = PixelSample {
                    entry,
                    line_in_file,
                    length: granular.lengths.get(idx).copied(),
                    indent: granular.indents.get(idx).copied(),
                };

                pixels[(offset_y * TILE_SIZE + offset_x) as usize] =
                    self.metric.sample(&sample);
            }
        }

        Ok(pixels)
    }
}

// ============================================================================
// Serving-layer surface
// ============================================================================

/// Echo of the requested tile coordinates, returned alongside pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileMetadata {
    pub x: i64,
    pub y: i64,
    pub lod: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileResponse {
    pub metadata: TileMetadata,
    pub pixels: Vec<i32>,
}

/// The full tile operation as the serving layer calls it: resolve the
/// committish, default the aggregation to mean, fetch the tile.
pub async fn tile_op(
    core: &Core,
    computation_id: &str,
    repo_id: &str,
    committish: &str,
    lod: i64,
    x: i64,
    y: i64,
    agg: Option<&str>,
) -> Result<TileResponse> {
    let agg = match agg {
        Some(s) => s.parse()?,
        None => Aggregation::Mean,
    };
    let repo = core.repo(repo_id)?;
    let commit = repo.resolve_committish(committish).await?;
    let pixels = get_tile(core, computation_id, repo_id, commit, lod, x, y, agg).await?;
    Ok(TileResponse {
        metadata: TileMetadata { x, y, lod },
        pixels,
    })
}

/// Registers one tile computation per built-in pixel metric.
pub fn register_computations(core: &Core) {
    let metrics: [Arc<dyn PixelMetric>; 5] = [
        Arc::new(LengthMetric),
        Arc::new(IndentMetric),
        Arc::new(OffsetMetric),
        Arc::new(FileHashMetric),
        Arc::new(ExtensionMetric),
    ];
    for metric in metrics {
        let id = metric.id();
        core.register_tile_computation(id, Arc::new(MetricTile::new(metric)));
    }
}
