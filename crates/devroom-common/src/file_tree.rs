use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Recursive mapping of path → file-or-directory node.
///
/// Keys are opaque: the engine never validates hierarchy beyond the recursive
/// structure itself, and every update replaces a whole tree. The wire format is
/// the one browser sandboxes mount directly:
///
/// ```json
/// { "index.js": { "file": { "contents": "..." } },
///   "src":      { "directory": { "app.js": { "file": { "contents": "..." } } } } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileTree(BTreeMap<String, FileNode>);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileNode {
    File { contents: String },
    Directory(FileTree),
}

/// A tree key that cannot be materialized on a real filesystem.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("empty path segment")]
    Empty,
    #[error("absolute path '{0}' is not allowed")]
    Absolute(String),
    #[error("path '{0}' escapes the workspace")]
    Traversal(String),
}

impl FileNode {
    pub fn file(contents: impl Into<String>) -> Self {
        FileNode::File {
            contents: contents.into(),
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, FileNode::Directory(_))
    }
}

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&FileNode> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, node: FileNode) -> Option<FileNode> {
        self.0.insert(key.into(), node)
    }

    pub fn remove(&mut self, key: &str) -> Option<FileNode> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileNode)> {
        self.0.iter()
    }

    /// Builder-style insert of a file node.
    pub fn with_file(mut self, key: impl Into<String>, contents: impl Into<String>) -> Self {
        self.insert(key, FileNode::file(contents));
        self
    }

    /// Builder-style insert of a directory node.
    pub fn with_directory(mut self, key: impl Into<String>, tree: FileTree) -> Self {
        self.insert(key, FileNode::Directory(tree));
        self
    }

    /// Copy of this tree without `key`.
    pub fn without(&self, key: &str) -> FileTree {
        let mut next = self.clone();
        next.remove(key);
        next
    }

    /// Slash-joined paths of every file node, depth first.
    pub fn file_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_paths("", &mut out);
        out
    }

    fn collect_paths(&self, prefix: &str, out: &mut Vec<String>) {
        for (key, node) in &self.0 {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{}/{}", prefix, key)
            };
            match node {
                FileNode::File { .. } => out.push(path),
                FileNode::Directory(tree) => tree.collect_paths(&path, out),
            }
        }
    }

    /// Contents of the file at `path`, following directory nodes on `/`.
    ///
    /// A key containing `/` at the current level wins over descending, since
    /// keys are opaque.
    pub fn file_contents(&self, path: &str) -> Option<&str> {
        if let Some(FileNode::File { contents }) = self.0.get(path) {
            return Some(contents);
        }
        let (head, rest) = path.split_once('/')?;
        match self.0.get(head)? {
            FileNode::Directory(tree) => tree.file_contents(rest),
            FileNode::File { .. } => None,
        }
    }

    /// Total number of file nodes at any depth.
    pub fn file_count(&self) -> usize {
        self.0
            .values()
            .map(|node| match node {
                FileNode::File { .. } => 1,
                FileNode::Directory(tree) => tree.file_count(),
            })
            .sum()
    }

    /// Reject a key that would land outside a workspace root when written to disk.
    pub fn check_key(key: &str) -> Result<(), PathError> {
        if key.is_empty() {
            return Err(PathError::Empty);
        }
        if key.starts_with('/') || key.starts_with('\\') || key.contains(':') {
            return Err(PathError::Absolute(key.to_string()));
        }
        if key
            .split(['/', '\\'])
            .any(|segment| segment == ".." || segment.is_empty())
        {
            return Err(PathError::Traversal(key.to_string()));
        }
        Ok(())
    }
}

impl FromIterator<(String, FileNode)> for FileTree {
    fn from_iter<I: IntoIterator<Item = (String, FileNode)>>(iter: I) -> Self {
        FileTree(iter.into_iter().collect())
    }
}
