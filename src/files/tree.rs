use crate::models::FileMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Nested mount format: leaves are `{"file": {"contents": ..}}`, inner nodes
/// are `{"directory": {..}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileSystemTree(BTreeMap<String, TreeNode>);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeNode {
    File { contents: String },
    Directory(FileSystemTree),
}

impl FileSystemTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the tree from flat `a/b/c.ts` keys. Empty segments are ignored;
    /// a path that would nest under an existing file is skipped.
    pub fn from_files(files: &FileMap) -> Self {
        let mut tree = Self::new();
        for (path, contents) in files {
            let segments: Vec<&str> = path.split('/').filter(|segment| !segment.is_empty()).collect();
            if segments.is_empty() {
                continue;
            }
            if !tree.insert(&segments, contents) {
                tracing::warn!(path = %path, "skipping file nested under an existing file");
            }
        }
        tree
    }

    fn insert(&mut self, segments: &[&str], contents: &str) -> bool {
        let Some((name, rest)) = segments.split_first() else {
            return false;
        };
        if rest.is_empty() {
            if matches!(self.0.get(*name), Some(TreeNode::Directory(_))) {
                return false;
            }
            self.0.insert(
                (*name).to_string(),
                TreeNode::File {
                    contents: contents.to_string(),
                },
            );
            return true;
        }
        let node = self
            .0
            .entry((*name).to_string())
            .or_insert_with(|| TreeNode::Directory(FileSystemTree::new()));
        match node {
            TreeNode::Directory(child) => child.insert(rest, contents),
            TreeNode::File { .. } => false,
        }
    }

    pub fn get(&self, path: &str) -> Option<&TreeNode> {
        let mut current = self;
        let mut segments = path.split('/').filter(|segment| !segment.is_empty()).peekable();
        while let Some(segment) = segments.next() {
            let node = current.0.get(segment)?;
            if segments.peek().is_none() {
                return Some(node);
            }
            match node {
                TreeNode::Directory(child) => current = child,
                TreeNode::File { .. } => return None,
            }
        }
        None
    }

    pub fn file_contents(&self, path: &str) -> Option<&str> {
        match self.get(path)? {
            TreeNode::File { contents } => Some(contents),
            TreeNode::Directory(_) => None,
        }
    }

    /// Flattens back to `path -> contents`, depth first in key order.
    pub fn to_files(&self) -> FileMap {
        let mut files = FileMap::new();
        self.collect_into("", &mut files);
        files
    }

    fn collect_into(&self, prefix: &str, files: &mut FileMap) {
        for (name, node) in &self.0 {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", prefix, name)
            };
            match node {
                TreeNode::File { contents } => {
                    files.insert(path, contents.clone());
                }
                TreeNode::Directory(child) => child.collect_into(&path, files),
            }
        }
    }

    pub fn file_count(&self) -> usize {
        self.0
            .values()
            .map(|node| match node {
                TreeNode::File { .. } => 1,
                TreeNode::Directory(child) => child.file_count(),
            })
            .sum()
    }
}
