//! The content index: a line-offset table over a tree or blob.
//!
//! A blob indexes to a single entry at offset 0 with path `"."`. A tree
//! indexes to the name-sorted concatenation of its children's indices,
//! child paths re-rooted under the entry name and offsets accumulated,
//! so the entries tile line space contiguously. Submodules are skipped.
//!
//! All index computations are memoized per object hash through the
//! [`Core`] — a subtree shared between two commits is indexed once.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::compute::{Core, ObjectComputation};
use crate::constants::{BINARY_SNIFF_LEN, OBJECT_TTL};
use crate::coords::{
    line_to_world, world_to_tile, LinePosition, TileLayout, TilePosition, WorldPosition,
};
use crate::error::{Error, Result};
use crate::repo::{resolve_committish_to_tree, ObjectHash, ObjectKind};

// ============================================================================
// Index
// ============================================================================

/// One file's span in line space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub path: String,
    pub line_offset: i64,
    pub line_count: i64,
    pub hash: ObjectHash,
}

/// Ordered, contiguous line-offset index:
/// `entries[i].line_offset + entries[i].line_count ==
/// entries[i+1].line_offset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub entries: Vec<IndexEntry>,
}

impl Index {
    /// Binary search for the entry owning `line`
    /// (`offset ≤ line < offset + count`). Zero-length entries own no
    /// lines.
    pub fn find_file_by_line(&self, line: LinePosition) -> Option<&IndexEntry> {
        if line < 0 {
            return None;
        }
        // Last entry with line_offset <= line. Contiguity guarantees
        // any zero-length entries at the same offset sort before the
        // entry that actually covers it.
        let idx = self.entries.partition_point(|e| e.line_offset <= line);
        if idx == 0 {
            return None;
        }
        let entry = &self.entries[idx - 1];
        if line < entry.line_offset + entry.line_count {
            Some(entry)
        } else {
            None
        }
    }

    /// Total line count, from the tail of the index.
    pub fn to_tile_layout(&self) -> TileLayout {
        let line_count = self
            .entries
            .last()
            .map(|e| e.line_offset + e.line_count)
            .unwrap_or(0);
        TileLayout { line_count }
    }
}

/// Builds the index for a blob or tree, memoized per hash. Boxed
/// because trees recurse.
pub fn compute_index<'a>(
    core: &'a Core,
    repo_id: &'a str,
    hash: ObjectHash,
) -> BoxFuture<'a, Result<Index>> {
    async move {
        let hash_hex = hash.to_hex();
        core.memoized(&["index", &hash_hex], OBJECT_TTL, || async move {
            let repo = core.repo(repo_id)?;
            match repo.object_kind(hash).await? {
                ObjectKind::Blob => {
                    let content = repo.blob_bytes(hash).await?;
                    Ok(Index {
                        entries: vec![IndexEntry {
                            path: ".".to_string(),
                            line_offset: 0,
                            line_count: count_lines(&content),
                            hash,
                        }],
                    })
                }
                ObjectKind::Tree => {
                    let mut tree_entries = repo.tree_entries(hash).await?;
                    tree_entries.sort_by(|a, b| a.name.cmp(&b.name));

                    let mut entries = Vec::new();
                    let mut offset: i64 = 0;
                    for tree_entry in tree_entries {
                        if tree_entry.is_submodule {
                            continue;
                        }
                        let child = compute_index(core, repo_id, tree_entry.hash).await?;
                        for child_entry in child.entries {
                            let path = if child_entry.path == "." {
                                tree_entry.name.clone()
                            } else {
                                format!("{}/{}", tree_entry.name, child_entry.path)
                            };
                            entries.push(IndexEntry {
                                path,
                                line_offset: offset,
                                line_count: child_entry.line_count,
                                hash: child_entry.hash,
                            });
                            offset += child_entry.line_count;
                        }
                    }
                    Ok(Index { entries })
                }
                ObjectKind::Commit => Err(Error::invalid(format!(
                    "cannot index commit object {hash}; resolve it to a tree first"
                ))),
            }
        })
        .await
    }
    .boxed()
}

// ============================================================================
// Line counting
// ============================================================================

/// NUL within the first [`BINARY_SNIFF_LEN`] bytes marks a blob binary,
/// mirroring git's heuristic.
pub fn is_binary(content: &[u8]) -> bool {
    let sniff = &content[..content.len().min(BINARY_SNIFF_LEN)];
    sniff.contains(&0)
}

/// Line count for blob content. A binary blob is one opaque unit
/// (a single line); text counts `\n`-terminated segments plus a
/// trailing unterminated one; empty content has no lines.
pub fn count_lines(content: &[u8]) -> i64 {
    if content.is_empty() {
        return 0;
    }
    if is_binary(content) {
        return 1;
    }
    let newlines = content.iter().filter(|&&b| b == b'\n').count() as i64;
    if content.ends_with(b"\n") {
        newlines
    } else {
        newlines + 1
    }
}

/// Iterates line contents without trailing newlines.
fn lines(content: &[u8]) -> impl Iterator<Item = &[u8]> {
    let trimmed = content.strip_suffix(b"\n").unwrap_or(content);
    let empty = content.is_empty();
    trimmed
        .split(|&b| b == b'\n')
        .filter(move |_| !empty)
}

// ============================================================================
// Per-line blob data
// ============================================================================

/// Granular per-line data for one blob, feeding the pixel metrics.
/// For a binary blob this is a single pseudo-line whose length is the
/// byte length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobLines {
    /// Byte length of each line, newline excluded.
    pub lengths: Vec<i64>,
    /// Leading whitespace bytes (spaces and tabs) of each line.
    pub indents: Vec<i64>,
}

/// Computes [`BlobLines`] for a blob, memoized per hash.
pub async fn blob_lines(core: &Core, repo_id: &str, hash: ObjectHash) -> Result<BlobLines> {
    let hash_hex = hash.to_hex();
    core.memoized(&["blob_lines", &hash_hex], OBJECT_TTL, || async move {
        let repo = core.repo(repo_id)?;
        let content = repo.blob_bytes(hash).await?;

        if content.is_empty() {
            return Ok(BlobLines {
                lengths: Vec::new(),
                indents: Vec::new(),
            });
        }
        if is_binary(&content) {
            return Ok(BlobLines {
                lengths: vec![content.len() as i64],
                indents: vec![0],
            });
        }

        let mut lengths = Vec::new();
        let mut indents = Vec::new();
        for line in lines(&content) {
            lengths.push(line.len() as i64);
            indents.push(
                line.iter()
                    .take_while(|&&b| b == b' ' || b == b'\t')
                    .count() as i64,
            );
        }
        Ok(BlobLines { lengths, indents })
    })
    .await
}

// ============================================================================
// Maximum line length
// ============================================================================

/// Maximum line length anywhere under a tree or blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineLength {
    pub maximum: i64,
}

/// Computes the maximum line length over a blob or tree, memoized per
/// hash.
pub fn compute_line_length<'a>(
    core: &'a Core,
    repo_id: &'a str,
    hash: ObjectHash,
) -> BoxFuture<'a, Result<LineLength>> {
    async move {
        let hash_hex = hash.to_hex();
        core.memoized(&["line_length", &hash_hex], OBJECT_TTL, || async move {
            let repo = core.repo(repo_id)?;
            match repo.object_kind(hash).await? {
                ObjectKind::Blob => {
                    let granular = blob_lines(core, repo_id, hash).await?;
                    Ok(LineLength {
                        maximum: granular.lengths.iter().copied().max().unwrap_or(0),
                    })
                }
                ObjectKind::Tree => {
                    let mut maximum = 0;
                    for entry in repo.tree_entries(hash).await? {
                        if entry.is_submodule {
                            continue;
                        }
                        let child = compute_line_length(core, repo_id, entry.hash).await?;
                        maximum = maximum.max(child.maximum);
                    }
                    Ok(LineLength { maximum })
                }
                ObjectKind::Commit => Err(Error::invalid(format!(
                    "cannot measure commit object {hash}; resolve it to a tree first"
                ))),
            }
        })
        .await
    }
    .boxed()
}

// ============================================================================
// Line lookup
// ============================================================================

/// Everything the viewer needs to focus one line: its owning file, the
/// line text, and where it sits in world and tile space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineLookup {
    pub entry: IndexEntry,
    pub content: String,
    pub world_position: WorldPosition,
    pub tile_position: TilePosition,
}

/// Resolves a committish and locates `line` within that revision.
/// Binary blobs report empty content.
#[instrument(skip(core))]
pub async fn lookup_line(
    core: &Core,
    repo_id: &str,
    committish: &str,
    line: LinePosition,
) -> Result<LineLookup> {
    let repo = core.repo(repo_id)?;
    let tree = resolve_committish_to_tree(repo.as_ref(), committish).await?;
    let index = compute_index(core, repo_id, tree).await?;

    let entry = index
        .find_file_by_line(line)
        .ok_or_else(|| Error::not_found("line", line.to_string()))?
        .clone();

    let content = repo.blob_bytes(entry.hash).await?;
    let line_in_file = (line - entry.line_offset) as usize;
    let text = if is_binary(&content) {
        String::new()
    } else {
        lines(&content)
            .nth(line_in_file)
            .map(|l| String::from_utf8_lossy(l).into_owned())
            .unwrap_or_default()
    };

    let layout = index.to_tile_layout();
    let world_position = line_to_world(line, layout);
    let tile_position = world_to_tile(world_position, layout);

    Ok(LineLookup {
        entry,
        content: text,
        world_position,
        tile_position,
    })
}

// ============================================================================
// Registered computations
// ============================================================================

struct IndexComputation;

#[async_trait]
impl ObjectComputation for IndexComputation {
    async fn execute(
        &self,
        core: &Core,
        repo_id: &str,
        hash: ObjectHash,
    ) -> Result<serde_json::Value> {
        let index = compute_index(core, repo_id, hash).await?;
        serde_json::to_value(index).map_err(|e| Error::upstream(e.to_string()))
    }
}

struct LineLengthComputation;

#[async_trait]
impl ObjectComputation for LineLengthComputation {
    async fn execute(
        &self,
        core: &Core,
        repo_id: &str,
        hash: ObjectHash,
    ) -> Result<serde_json::Value> {
        let length = compute_line_length(core, repo_id, hash).await?;
        serde_json::to_value(length).map_err(|e| Error::upstream(e.to_string()))
    }
}

/// Registers the `index` and `line_length` object computations.
pub fn register_computations(core: &Core) {
    core.register_object_computation("index", Arc::new(IndexComputation));
    core.register_object_computation("line_length", Arc::new(LineLengthComputation));
}

/// Fetches [`BlobLines`] for several blobs, deduplicated. Used by tile
/// computations that touch many pixels of the same few files.
pub(crate) struct BlobLinesCache {
    loaded: HashMap<ObjectHash, Arc<BlobLines>>,
}

impl BlobLinesCache {
    pub fn new() -> Self {
        BlobLinesCache {
            loaded: HashMap::new(),
        }
    }

    pub async fn get(
        &mut self,
        core: &Core,
        repo_id: &str,
        hash: ObjectHash,
    ) -> Result<Arc<BlobLines>> {
        if let Some(cached) = self.loaded.get(&hash) {
            return Ok(Arc::clone(cached));
        }
        let fresh = Arc::new(blob_lines(core, repo_id, hash).await?);
        self.loaded.insert(hash, Arc::clone(&fresh));
        Ok(fresh)
    }
}
