//! Line-range → quadtree bitmask encoding.
//!
//! The viewer highlights a file by shading the world-space region its
//! lines occupy. Because line ↔ world is a Hilbert curve, a contiguous
//! line range is a union of aligned quadtree cells, so the region
//! serializes as a breadth-first walk of 4-bit child masks.
//!
//! Walk contract:
//!
//! - nodes are visited breadth-first starting at the whole square;
//! - a node fully inside the range emits mask 0 and stops — the client
//!   shades the node's whole square;
//! - a partially covered node emits one bit per child quadrant that
//!   intersects the range (bit 0 = NW, 1 = SW, 2 = SE, 3 = NE) and the
//!   walk descends into those children, down to 2×2 nodes;
//! - masks pack two per byte, first mask in the high nibble.
//!
//! Which line quarter lands in which spatial quadrant depends on the
//! node's curve orientation; [`Orientation`] tracks that through the
//! descent and is tested against the curve in [`crate::coords`].

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::instrument;

use crate::compute::{CommitComputation, Core};
use crate::error::{Error, Result};
use crate::index::compute_index;
use crate::repo::{ObjectHash, ObjectKind};

// ============================================================================
// Curve orientation
// ============================================================================

/// How the Hilbert curve threads a node's four quadrants. `A` is the
/// whole square's orientation; children inherit per the tables below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Orientation {
    A,
    B,
    C,
    D,
}

impl Orientation {
    /// For each spatial quadrant in bit order `[NW, SW, SE, NE]`: which
    /// quarter of the node's line range lives there, and the child's
    /// orientation.
    fn children(self) -> [(i64, Orientation); 4] {
        use Orientation::*;
        match self {
            A => [(0, D), (1, A), (2, A), (3, B)],
            B => [(2, B), (1, B), (0, C), (3, A)],
            C => [(2, C), (3, D), (0, B), (1, C)],
            D => [(0, A), (3, C), (2, D), (1, D)],
        }
    }
}

// ============================================================================
// Encoding
// ============================================================================

struct Node {
    offset: i64,
    side: i64,
    orientation: Orientation,
}

/// Encodes the line range `[start, end)` over a `side × side` world
/// square (`side` a power of two ≥ 2). The range is clamped to the
/// square; an empty range encodes to no bytes.
pub fn encode_range(start: i64, end: i64, side: i64) -> Vec<u8> {
    let total = side * side;
    let start = start.max(0);
    let end = end.min(total);
    if start >= end {
        return Vec::new();
    }

    let mut masks: Vec<u8> = Vec::new();
    let mut queue = VecDeque::new();
    queue.push_back(Node {
        offset: 0,
        side,
        orientation: Orientation::A,
    });

    while let Some(node) = queue.pop_front() {
        let span = node.side * node.side;
        if start <= node.offset && node.offset + span <= end {
            // Fully covered: shade the whole node.
            masks.push(0);
            continue;
        }

        let child_side = node.side / 2;
        let child_span = child_side * child_side;
        let mut mask = 0u8;
        for (bit, (segment, orientation)) in node.orientation.children().into_iter().enumerate() {
            let child_offset = node.offset + segment * child_span;
            if child_offset < end && start < child_offset + child_span {
                mask |= 1 << bit;
                if child_side >= 2 {
                    queue.push_back(Node {
                        offset: child_offset,
                        side: child_side,
                        orientation,
                    });
                }
            }
        }
        masks.push(mask);
    }

    pack_masks(&masks)
}

/// Two masks per byte, first in the high nibble; a trailing odd mask
/// leaves the low nibble zero.
fn pack_masks(masks: &[u8]) -> Vec<u8> {
    masks
        .chunks(2)
        .map(|pair| (pair[0] << 4) | pair.get(1).copied().unwrap_or(0))
        .collect()
}

// ============================================================================
// Registered computation
// ============================================================================

/// Encodes the world-space region of one file within a commit, returned
/// base64-encoded for the wire.
#[instrument(skip(core))]
pub async fn file_quadtree(
    core: &Core,
    repo_id: &str,
    commit: ObjectHash,
    file_hash: ObjectHash,
) -> Result<String> {
    let repo = core.repo(repo_id)?;
    let tree = match repo.object_kind(commit).await? {
        ObjectKind::Commit => repo.commit_tree(commit).await?,
        ObjectKind::Blob | ObjectKind::Tree => commit,
    };

    let index = compute_index(core, repo_id, tree).await?;
    let entry = index
        .entries
        .iter()
        .find(|e| e.hash == file_hash)
        .ok_or_else(|| Error::not_found("file", file_hash.to_hex()))?;

    let side = index.to_tile_layout().grid_side_length();
    let encoded = encode_range(entry.line_offset, entry.line_offset + entry.line_count, side);
    Ok(STANDARD.encode(encoded))
}

struct FileQuadtreeComputation;

#[async_trait]
impl CommitComputation for FileQuadtreeComputation {
    async fn execute(
        &self,
        core: &Core,
        repo_id: &str,
        commit: ObjectHash,
        hash: ObjectHash,
    ) -> Result<serde_json::Value> {
        let encoded = file_quadtree(core, repo_id, commit, hash).await?;
        Ok(serde_json::Value::String(encoded))
    }
}

/// Registers the `file_quadtree` commit computation.
pub fn register_computations(core: &Core) {
    core.register_commit_computation("file_quadtree", Arc::new(FileQuadtreeComputation));
}
