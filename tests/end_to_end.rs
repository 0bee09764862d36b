//! End-to-end exercises over an in-memory repository: index, lookup,
//! tile pyramid, and quadtree, all through the registered computations.

use std::sync::Arc;

use linemap::cache::MemoryCache;
use linemap::constants::{TILE_PIXELS, TILE_SIZE};
use linemap::index::lookup_line;
use linemap::repo::{tree_entry, MemoryRepo};
use linemap::tile::{get_tile, tile_op, Aggregation, TileMetadata};
use linemap::{register_builtin_computations, Core, ObjectHash};

struct Fixture {
    core: Core,
    commit: ObjectHash,
    lib_rs: ObjectHash,
}

/// Three files, seven lines total: README.md [0, 3), src/lib.rs [3, 4),
/// src/main.rs [4, 7). A 4×4 world square.
fn fixture() -> Fixture {
    let core = Core::new(Arc::new(MemoryCache::new()));
    register_builtin_computations(&core);

    let repo = Arc::new(MemoryRepo::new());
    let readme = repo.add_blob(b"# demo\n\nwords\n");
    let lib_rs = repo.add_blob(b"pub mod tiles;\n");
    let main_rs = repo.add_blob(b"fn main() {\n    run();\n}\n");
    let src = repo.add_tree(vec![
        tree_entry("main.rs", main_rs),
        tree_entry("lib.rs", lib_rs),
    ]);
    let root = repo.add_tree(vec![tree_entry("src", src), tree_entry("README.md", readme)]);
    let commit = repo.add_commit(root);
    repo.set_ref("main", commit);
    core.register_repo("demo", repo).unwrap();

    Fixture { core, commit, lib_rs }
}

#[tokio::test]
async fn test_builtin_computations_are_registered() {
    let fx = fixture();
    assert_eq!(fx.core.list_object_computations(), vec!["index", "line_length"]);
    assert_eq!(fx.core.list_commit_computations(), vec!["file_quadtree"]);
    assert_eq!(
        fx.core.list_tile_computations(),
        vec!["ext", "file", "indent", "length", "offset"]
    );
    assert_eq!(fx.core.list_repos(), vec!["demo"]);
}

#[tokio::test]
async fn test_index_through_registered_computation() -> anyhow::Result<()> {
    let fx = fixture();
    let tree = fx.core.repo("demo")?.commit_tree(fx.commit).await?;

    let value = fx.core.object_compute("index", "demo", tree).await?;
    let entries = value["entries"]
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("entries missing"))?;
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0]["path"], "README.md");
    assert_eq!(entries[1]["path"], "src/lib.rs");
    assert_eq!(entries[1]["lineOffset"], 3);
    assert_eq!(entries[2]["path"], "src/main.rs");
    assert_eq!(entries[2]["lineCount"], 3);
    Ok(())
}

#[tokio::test]
async fn test_lod0_tiles_sample_real_lines() {
    let fx = fixture();
    let response = tile_op(&fx.core, "length", "demo", "main", 0, 0, 0, None)
        .await
        .unwrap();
    assert_eq!(response.metadata, TileMetadata { x: 0, y: 0, lod: 0 });
    assert_eq!(response.pixels.len(), TILE_PIXELS);

    // Locate lines through the lookup operation rather than assuming
    // curve positions.
    let pixel_of = |lookup: &linemap::index::LineLookup| {
        (lookup.world_position.y * TILE_SIZE + lookup.world_position.x) as usize
    };

    let readme_first = lookup_line(&fx.core, "demo", "main", 0).await.unwrap();
    assert_eq!(readme_first.entry.path, "README.md");
    assert_eq!(response.pixels[pixel_of(&readme_first)], 6); // "# demo"

    let lib_line = lookup_line(&fx.core, "demo", "main", 3).await.unwrap();
    assert_eq!(lib_line.entry.path, "src/lib.rs");
    assert_eq!(response.pixels[pixel_of(&lib_line)], 14); // "pub mod tiles;"

    let ext = tile_op(&fx.core, "ext", "demo", "main", 0, 0, 0, None)
        .await
        .unwrap();
    assert_eq!(
        ext.pixels[pixel_of(&readme_first)],
        i32::from_le_bytes([b'm', b'd', 0, 0])
    );
    assert_eq!(
        ext.pixels[pixel_of(&lib_line)],
        i32::from_le_bytes([b'r', b's', 0, 0])
    );

    let indent = tile_op(&fx.core, "indent", "demo", "main", 0, 0, 0, None)
        .await
        .unwrap();
    let indented = lookup_line(&fx.core, "demo", "main", 5).await.unwrap();
    assert_eq!(indented.content, "    run();");
    assert_eq!(indent.pixels[pixel_of(&indented)], 4);
}

#[tokio::test]
async fn test_macro_tile_aggregates_lod0() {
    let fx = fixture();
    let lod0 = get_tile(&fx.core, "length", "demo", fx.commit, 0, 0, 0, Aggregation::Mean)
        .await
        .unwrap();
    let lod1 = get_tile(&fx.core, "length", "demo", fx.commit, 1, 0, 0, Aggregation::Mean)
        .await
        .unwrap();
    assert_eq!(lod1.len(), TILE_PIXELS);

    // Parent pixel (0, 0) averages the 2x2 block at the lod-0 origin.
    let at = |tile: &[i32], x: i64, y: i64| tile[(y * TILE_SIZE + x) as usize] as i64;
    let expected = (at(&lod0, 0, 0) + at(&lod0, 1, 0) + at(&lod0, 0, 1) + at(&lod0, 1, 1)) / 4;
    assert_eq!(at(&lod1, 0, 0), expected);

    // Max aggregation is cached under a different key and differs when
    // the block is uneven.
    let lod1_max = get_tile(&fx.core, "length", "demo", fx.commit, 1, 0, 0, Aggregation::Max)
        .await
        .unwrap();
    let expected_max = [
        at(&lod0, 0, 0),
        at(&lod0, 1, 0),
        at(&lod0, 0, 1),
        at(&lod0, 1, 1),
    ]
    .into_iter()
    .max()
    .unwrap();
    assert_eq!(at(&lod1_max, 0, 0), expected_max);
}

#[tokio::test]
async fn test_file_quadtree_through_commit_computation() {
    let fx = fixture();
    // src/lib.rs owns the single line [3, 4) of a 4x4 square.
    let value = fx
        .core
        .commit_compute("file_quadtree", "demo", fx.commit, fx.lib_rs)
        .await
        .unwrap();
    assert_eq!(value, serde_json::Value::String("Eg==".to_string()));

    let err = fx
        .core
        .commit_compute("file_quadtree", "demo", fx.commit, ObjectHash::ZERO)
        .await
        .unwrap_err();
    assert!(err.is_user_error());
}

#[tokio::test]
async fn test_lookup_past_the_end_is_not_found() {
    let fx = fixture();
    let err = lookup_line(&fx.core, "demo", "main", 7).await.unwrap_err();
    assert!(err.is_user_error());
}

#[tokio::test]
async fn test_repeated_requests_hit_the_cache() {
    let fx = fixture();
    let first = tile_op(&fx.core, "file", "demo", "main", 1, 0, 0, Some("mode"))
        .await
        .unwrap();
    let second = tile_op(&fx.core, "file", "demo", "main", 1, 0, 0, Some("mode"))
        .await
        .unwrap();
    assert_eq!(first, second);
}
