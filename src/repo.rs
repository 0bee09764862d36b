//! Repository backend boundary.
//!
//! The core never talks to a git object store directly; it goes through
//! [`RepoBackend`]. The serving layer registers one backend per
//! repository id on the [`Core`](crate::compute::Core). [`MemoryRepo`]
//! is a complete in-process implementation used by tests and fixtures.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

// ============================================================================
// Object ids
// ============================================================================

/// A 20-byte object id, displayed and serialized as 40 hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHash([u8; 20]);

impl ObjectHash {
    pub const ZERO: ObjectHash = ObjectHash([0; 20]);

    pub fn new(bytes: [u8; 20]) -> Self {
        ObjectHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Derives an id from arbitrary content. Backends that do not carry
    /// real git ids (the in-memory store) use this so equal content
    /// still gets equal, content-addressed ids.
    pub fn of_content(content: &[u8]) -> Self {
        let digest = Sha256::digest(content);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest[..20]);
        ObjectHash(bytes)
    }
}

impl fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ObjectHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 40 {
            return Err(Error::invalid(format!("could not parse hash '{s}'")));
        }
        let raw = hex::decode(s)
            .map_err(|_| Error::invalid(format!("could not parse hash '{s}'")))?;
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&raw);
        Ok(ObjectHash(bytes))
    }
}

impl Serialize for ObjectHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

// ============================================================================
// Backend trait
// ============================================================================

/// What kind of object a hash names. Exhaustively matched wherever the
/// core branches on object kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

/// One entry of a tree object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    pub hash: ObjectHash,
    pub mode: u32,
    /// Submodule entries are skipped during indexing; their hashes point
    /// into another repository entirely.
    pub is_submodule: bool,
}

/// Read access to one repository's object store.
#[async_trait]
pub trait RepoBackend: Send + Sync + fmt::Debug {
    async fn object_kind(&self, hash: ObjectHash) -> Result<ObjectKind>;

    async fn blob_bytes(&self, hash: ObjectHash) -> Result<Vec<u8>>;

    async fn tree_entries(&self, hash: ObjectHash) -> Result<Vec<TreeEntry>>;

    /// Root tree hash of a commit.
    async fn commit_tree(&self, commit: ObjectHash) -> Result<ObjectHash>;

    /// Resolves a human-supplied revision reference ("HEAD", a branch,
    /// a full hex hash) to a concrete hash.
    async fn resolve_committish(&self, committish: &str) -> Result<ObjectHash>;
}

/// Resolves a committish all the way down to a treeish: commits resolve
/// to their root tree, trees and blobs resolve to themselves.
pub async fn resolve_committish_to_tree(
    backend: &dyn RepoBackend,
    committish: &str,
) -> Result<ObjectHash> {
    let hash = backend.resolve_committish(committish).await?;
    match backend.object_kind(hash).await? {
        ObjectKind::Commit => backend.commit_tree(hash).await,
        ObjectKind::Blob | ObjectKind::Tree => Ok(hash),
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Debug, Clone)]
enum MemoryObject {
    Blob(Vec<u8>),
    Tree(Vec<TreeEntry>),
    Commit { tree: ObjectHash },
}

/// An in-process object store implementing [`RepoBackend`]. Content is
/// addressed by [`ObjectHash::of_content`] over a canonical encoding,
/// so identical blobs and trees share ids just like a real store.
#[derive(Debug, Default)]
pub struct MemoryRepo {
    objects: RwLock<HashMap<ObjectHash, MemoryObject>>,
    refs: RwLock<HashMap<String, ObjectHash>>,
}

impl MemoryRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_blob(&self, content: &[u8]) -> ObjectHash {
        let hash = ObjectHash::of_content(content);
        self.objects
            .write()
            .unwrap()
            .insert(hash, MemoryObject::Blob(content.to_vec()));
        hash
    }

    /// Adds a tree from `(name, hash)` pairs. Entries are stored as
    /// given; the indexer sorts by name itself.
    pub fn add_tree(&self, entries: Vec<TreeEntry>) -> ObjectHash {
        let mut canonical = Vec::new();
        for entry in &entries {
            canonical.extend_from_slice(entry.name.as_bytes());
            canonical.push(0);
            canonical.extend_from_slice(entry.hash.as_bytes());
        }
        let hash = ObjectHash::of_content(&canonical);
        self.objects
            .write()
            .unwrap()
            .insert(hash, MemoryObject::Tree(entries));
        hash
    }

    pub fn add_commit(&self, tree: ObjectHash) -> ObjectHash {
        let mut canonical = b"commit:".to_vec();
        canonical.extend_from_slice(tree.as_bytes());
        let hash = ObjectHash::of_content(&canonical);
        self.objects
            .write()
            .unwrap()
            .insert(hash, MemoryObject::Commit { tree });
        hash
    }

    /// Points a named ref ("HEAD", "main") at a hash.
    pub fn set_ref(&self, name: &str, hash: ObjectHash) {
        self.refs.write().unwrap().insert(name.to_string(), hash);
    }

    fn get(&self, hash: ObjectHash) -> Result<MemoryObject> {
        self.objects
            .read()
            .unwrap()
            .get(&hash)
            .cloned()
            .ok_or_else(|| Error::not_found("object", hash.to_hex()))
    }
}

#[async_trait]
impl RepoBackend for MemoryRepo {
    async fn object_kind(&self, hash: ObjectHash) -> Result<ObjectKind> {
        Ok(match self.get(hash)? {
            MemoryObject::Blob(_) => ObjectKind::Blob,
            MemoryObject::Tree(_) => ObjectKind::Tree,
            MemoryObject::Commit { .. } => ObjectKind::Commit,
        })
    }

    async fn blob_bytes(&self, hash: ObjectHash) -> Result<Vec<u8>> {
        match self.get(hash)? {
            MemoryObject::Blob(bytes) => Ok(bytes),
            _ => Err(Error::invalid(format!("object {hash} is not a blob"))),
        }
    }

    async fn tree_entries(&self, hash: ObjectHash) -> Result<Vec<TreeEntry>> {
        match self.get(hash)? {
            MemoryObject::Tree(entries) => Ok(entries),
            _ => Err(Error::invalid(format!("object {hash} is not a tree"))),
        }
    }

    async fn commit_tree(&self, commit: ObjectHash) -> Result<ObjectHash> {
        match self.get(commit)? {
            MemoryObject::Commit { tree } => Ok(tree),
            _ => Err(Error::invalid(format!("object {commit} is not a commit"))),
        }
    }

    async fn resolve_committish(&self, committish: &str) -> Result<ObjectHash> {
        if let Some(hash) = self.refs.read().unwrap().get(committish) {
            return Ok(*hash);
        }
        if let Ok(hash) = committish.parse::<ObjectHash>() {
            if self.objects.read().unwrap().contains_key(&hash) {
                return Ok(hash);
            }
        }
        Err(Error::invalid(format!(
            "unable to resolve committish '{committish}'"
        )))
    }
}

/// Convenience for fixture trees.
pub fn tree_entry(name: &str, hash: ObjectHash) -> TreeEntry {
    TreeEntry {
        name: name.to_string(),
        hash,
        mode: 0o100644,
        is_submodule: false,
    }
}
