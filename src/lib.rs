//! linemap — a source tree rendered as a zoomable tile pyramid.
//!
//! Every line of every file in a repository is assigned a position in a
//! single 1D "line space" (files in path order, lines in file order).
//! Line space is folded onto a 2D square with a Hilbert curve so nearby
//! lines land in nearby pixels, and the square is served as a standard
//! multi-resolution tile pyramid.
//!
//! The crate is the computation core only. HTTP routing, templating,
//! schema codegen and CLI wiring live in the serving layer and consume
//! the operations exposed here:
//!
//! - [`compute::Core`] — the process context: cache handle, repository
//!   handles, and computation registries.
//! - [`index`] — line-offset index over a tree or blob.
//! - [`coords`] — line ↔ world ↔ tile coordinate mapping.
//! - [`tile`] — per-LOD tile computation and aggregation.
//! - [`quadtree`] — line-range → spatial bitmask encoding.

pub mod cache;
pub mod compute;
pub mod config;
pub mod constants;
pub mod coords;
pub mod error;
pub mod index;
pub mod quadtree;
pub mod repo;
pub mod tile;

pub use compute::Core;
pub use error::{Error, Result};
pub use repo::ObjectHash;

/// Registers the built-in computations on a freshly constructed [`Core`]:
/// the `index` and `line_length` object computations, the
/// `file_quadtree` commit computation, and one tile computation per
/// pixel metric. Call exactly once at startup; registering a second
/// time panics on the duplicate ids.
pub fn register_builtin_computations(core: &Core) {
    index::register_computations(core);
    tile::register_computations(core);
    quadtree::register_computations(core);
}
