//! Folder and file tree consulted by repair.
//!
//! The manager does not own file metadata; it only reads the tree and writes
//! back corrections during a repair run.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::DataChunk;

pub const ROOT: &str = "/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub full_path: String,
    pub parent: Option<String>,
    /// Names of child folders.
    #[serde(default)]
    pub folders: BTreeSet<String>,
    /// Names of files directly in this folder.
    #[serde(default)]
    pub files: BTreeSet<String>,
}

impl Folder {
    pub fn new(full_path: &str) -> Self {
        let full_path = normalize(full_path);
        Self {
            parent: parent_of(&full_path),
            full_path,
            folders: BTreeSet::new(),
            files: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub full_path: String,
    pub size: u64,
    pub chunks: Vec<DataChunk>,
    /// Set when at least one chunk could not be located.
    #[serde(default)]
    pub zombie: bool,
}

impl File {
    pub fn new(full_path: &str, chunks: Vec<DataChunk>) -> Self {
        Self {
            full_path: normalize(full_path),
            size: chunks.iter().map(|c| c.size).sum(),
            chunks,
            zombie: false,
        }
    }

    pub fn folder(&self) -> String {
        parent_of(&self.full_path).unwrap_or_else(|| ROOT.to_string())
    }

    pub fn name(&self) -> &str {
        name_of(&self.full_path)
    }
}

/// Storage backend for the folder tree.
pub trait MetadataStore: Send + Sync {
    fn folders(&self) -> Result<Vec<Folder>>;

    /// Writes `changed` folders and removes the `deleted` paths.
    fn save_folders(&self, changed: &[Folder], deleted: &[String]) -> Result<()>;

    fn files(&self) -> Result<Vec<File>>;

    fn save_file(&self, file: &File) -> Result<()>;
}

#[derive(Default)]
struct Tree {
    folders: BTreeMap<String, Folder>,
    files: BTreeMap<String, File>,
}

/// In-memory tree.
#[derive(Default)]
pub struct MemoryMetadata {
    tree: RwLock<Tree>,
}

impl MemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn folder(&self, path: &str) -> Option<Folder> {
        let tree = self.tree.read().unwrap_or_else(PoisonError::into_inner);
        tree.folders.get(&normalize(path)).cloned()
    }

    pub fn file(&self, path: &str) -> Option<File> {
        let tree = self.tree.read().unwrap_or_else(PoisonError::into_inner);
        tree.files.get(&normalize(path)).cloned()
    }
}

impl MetadataStore for MemoryMetadata {
    fn folders(&self) -> Result<Vec<Folder>> {
        let tree = self.tree.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tree.folders.values().cloned().collect())
    }

    fn save_folders(&self, changed: &[Folder], deleted: &[String]) -> Result<()> {
        let mut tree = self.tree.write().unwrap_or_else(PoisonError::into_inner);
        for path in deleted {
            tree.folders.remove(path);
        }
        for folder in changed {
            tree.folders.insert(folder.full_path.clone(), folder.clone());
        }
        Ok(())
    }

    fn files(&self) -> Result<Vec<File>> {
        let tree = self.tree.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tree.files.values().cloned().collect())
    }

    fn save_file(&self, file: &File) -> Result<()> {
        let mut tree = self.tree.write().unwrap_or_else(PoisonError::into_inner);
        tree.files.insert(file.full_path.clone(), file.clone());
        Ok(())
    }
}

/// Collapses repeated and trailing separators; always absolute.
pub fn normalize(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

pub fn parent_of(path: &str) -> Option<String> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT.to_string()),
        Some(i) => Some(path[..i].to_string()),
        None => Some(ROOT.to_string()),
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Corrections needed to make the folder tree consistent.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TreeFix {
    pub changed: Vec<Folder>,
    pub deleted: Vec<String>,
}

impl TreeFix {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }
}

/// Rebuilds the tree from every known folder and file path, creating
/// missing intermediate folders, and returns only what differs from `folders`.
pub fn rebuild_tree(folders: &[Folder], files: &[File]) -> TreeFix {
    let mut wanted: BTreeMap<String, Folder> = BTreeMap::new();
    wanted.insert(ROOT.to_string(), Folder::new(ROOT));

    for folder in folders {
        ensure_folder(&folder.full_path, &mut wanted);
    }
    for file in files {
        let folder = file.folder();
        ensure_folder(&folder, &mut wanted);
        if let Some(entry) = wanted.get_mut(&folder) {
            entry.files.insert(file.name().to_string());
        }
    }

    let existing: BTreeMap<&str, &Folder> =
        folders.iter().map(|f| (f.full_path.as_str(), f)).collect();
    let changed = wanted
        .values()
        .filter(|f| existing.get(f.full_path.as_str()).copied() != Some(*f))
        .cloned()
        .collect();
    let deleted = folders
        .iter()
        .filter(|f| normalize(&f.full_path) != f.full_path)
        .map(|f| f.full_path.clone())
        .collect();
    TreeFix { changed, deleted }
}

/// Adds `path` and all of its ancestors, linking each to its parent.
fn ensure_folder(path: &str, wanted: &mut BTreeMap<String, Folder>) {
    let mut current = normalize(path);
    while let Some(parent) = parent_of(&current) {
        let name = name_of(&current).to_string();
        wanted
            .entry(current.clone())
            .or_insert_with(|| Folder::new(&current));
        wanted
            .entry(parent.clone())
            .or_insert_with(|| Folder::new(&parent))
            .folders
            .insert(name);
        current = parent;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkHash;

    fn chunk(n: u8, size: u64) -> DataChunk {
        DataChunk {
            sequence: 0,
            size,
            hash: ChunkHash::from_bytes([n; 32]),
        }
    }

    #[test]
    fn paths() {
        assert_eq!(normalize("a//b/"), "/a/b");
        assert_eq!(normalize(""), "/");
        assert_eq!(parent_of("/a/b").as_deref(), Some("/a"));
        assert_eq!(parent_of("/a").as_deref(), Some("/"));
        assert_eq!(parent_of("/"), None);
        assert_eq!(File::new("/x/y.txt", vec![chunk(1, 5)]).size, 5);
    }

    #[test]
    fn consistent_tree_needs_no_fix() {
        let mut root = Folder::new("/");
        root.folders.insert("docs".into());
        let mut docs = Folder::new("/docs");
        docs.files.insert("a.txt".into());
        let files = vec![File::new("/docs/a.txt", vec![chunk(1, 3)])];
        assert!(rebuild_tree(&[root, docs], &files).is_empty());
    }

    #[test]
    fn missing_intermediates_are_created() {
        let files = vec![File::new("/a/b/c.txt", vec![chunk(1, 3)])];
        let fix = rebuild_tree(&[], &files);
        let paths: Vec<&str> = fix.changed.iter().map(|f| f.full_path.as_str()).collect();
        assert_eq!(paths, vec!["/", "/a", "/a/b"]);
        let leaf = fix.changed.iter().find(|f| f.full_path == "/a/b").unwrap();
        assert!(leaf.files.contains("c.txt"));
        assert_eq!(leaf.parent.as_deref(), Some("/a"));
    }

    #[test]
    fn dangling_children_are_dropped() {
        let mut root = Folder::new("/");
        root.folders.insert("gone".into());
        root.files.insert("ghost.bin".into());
        let fix = rebuild_tree(&[root], &[]);
        assert_eq!(fix.changed, vec![Folder::new("/")]);
    }

    #[test]
    fn memory_store_round_trips() {
        let store = MemoryMetadata::new();
        store.save_folders(&[Folder::new("/x")], &[]).unwrap();
        store.save_file(&File::new("/x/f", vec![chunk(2, 9)])).unwrap();
        assert!(store.folder("/x").is_some());
        assert_eq!(store.files().unwrap().len(), 1);
        store.save_folders(&[], &["/x".to_string()]).unwrap();
        assert!(store.folders().unwrap().is_empty());
    }
}
