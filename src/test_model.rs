//! Test model definitions
//!
//! The discovered tests form a Root → Folder → File → TestCase hierarchy.
//! Nodes live in an arena keyed by a stable string id; parents are held by
//! id and children are an ordered list of ids owned by the parent.

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{ExplorerError, Result};
use crate::marker::LineRange;

/// File name suffix that marks an SVUnit test file.
pub const TEST_FILE_SUFFIX: &str = "_unit_test.sv";
/// Suffix the runner uses for the per-file test namespace.
pub const UNIT_PREFIX_SUFFIX: &str = "_ut";
/// Folder label for test files sitting directly in a root.
pub const ROOT_FOLDER_LABEL: &str = "./";

pub type NodeId = String;

/// Status of a test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    /// Test has not been run in this session
    #[default]
    Pending,
    /// Test is currently running
    Running,
    /// Test passed
    Passed,
    /// Test failed
    Failed,
    /// Runner stopped before the test reported a result
    Errored,
}

impl TestStatus {
    pub fn symbol(&self) -> &'static str {
        match self {
            TestStatus::Pending => "○",
            TestStatus::Running => "●",
            TestStatus::Passed => "✓",
            TestStatus::Failed => "✗",
            TestStatus::Errored => "!",
        }
    }

    pub fn color(&self) -> colored::Color {
        use colored::Color;
        match self {
            TestStatus::Pending => Color::White,
            TestStatus::Running => Color::Yellow,
            TestStatus::Passed => Color::Green,
            TestStatus::Failed => Color::Red,
            TestStatus::Errored => Color::Magenta,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Root,
    Folder,
    File,
    TestCase,
}

/// Where a node lives on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Location {
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<LineRange>,
}

impl Location {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            range: None,
        }
    }

    pub fn span(path: impl Into<PathBuf>, range: LineRange) -> Self {
        Self {
            path: path.into(),
            range: Some(range),
        }
    }
}

/// A node in the test tree
#[derive(Debug, Clone)]
pub struct TreeNode {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Base name for files, marker label for test cases, relative
    /// directory (`tests/unit/` or `./`) for folders.
    pub label: String,
    pub location: Option<Location>,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Set when the backing file could not be read.
    pub error: Option<String>,
}

impl TreeNode {
    pub fn is_test(&self) -> bool {
        self.kind == NodeKind::TestCase
    }

    pub fn path(&self) -> Option<&Path> {
        self.location.as_ref().map(|l| l.path.as_path())
    }
}

/// Everything needed to create a node, minus its links.
#[derive(Debug, Clone)]
pub struct NewNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub label: String,
    pub location: Option<Location>,
}

impl NewNode {
    pub fn new(id: impl Into<NodeId>, kind: NodeKind, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            location: None,
        }
    }

    pub fn at(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }
}

/// Serializable nested view of the visible tree
#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub id: NodeId,
    pub kind: NodeKind,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeView>,
}

/// Runner namespace for a test file: `a_unit_test.sv` → `a_ut`.
pub fn short_file_name(file_label: &str) -> String {
    match file_label.strip_suffix(TEST_FILE_SUFFIX) {
        Some(stem) => format!("{stem}{UNIT_PREFIX_SUFFIX}"),
        None => file_label.to_string(),
    }
}

/// Id of a test case, scoped to its file so it survives re-parsing.
pub fn test_case_id(file_id: &str, label: &str) -> NodeId {
    format!("{file_id}/{label}")
}

/// The arena holding every discovered node.
///
/// Roots are created eagerly but only listed in [`TestTree::roots`] once
/// they contain a file; every mutation leaves the arena fully linked
/// before returning.
#[derive(Debug, Default)]
pub struct TestTree {
    nodes: HashMap<NodeId, TreeNode>,
    visible_roots: Vec<NodeId>,
}

impl TestTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&TreeNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Visible roots, in the order they became non-empty.
    pub fn roots(&self) -> impl Iterator<Item = &TreeNode> {
        self.visible_roots.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Every registered root, visible or not.
    pub fn all_roots(&self) -> impl Iterator<Item = &TreeNode> {
        self.nodes.values().filter(|n| n.kind == NodeKind::Root)
    }

    pub fn is_visible_root(&self, id: &str) -> bool {
        self.visible_roots.iter().any(|r| r == id)
    }

    pub fn children(&self, id: &str) -> impl Iterator<Item = &TreeNode> {
        self.nodes
            .get(id)
            .map(|n| n.children.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|c| self.nodes.get(c))
    }

    pub fn find_child_by_label(&self, id: &str, label: &str) -> Option<&TreeNode> {
        self.children(id).find(|c| c.label == label)
    }

    /// Ancestor ids of `id`, nearest first.
    pub fn ancestors(&self, id: &str) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.nodes.get(id).and_then(|n| n.parent.clone());
        while let Some(parent_id) = current {
            current = self.nodes.get(&parent_id).and_then(|n| n.parent.clone());
            out.push(parent_id);
        }
        out
    }

    /// The root a node belongs to.
    pub fn root_of(&self, id: &str) -> Option<&TreeNode> {
        let top = self.ancestors(id).pop().unwrap_or_else(|| id.to_string());
        self.nodes.get(&top).filter(|n| n.kind == NodeKind::Root)
    }

    /// Return the node with `node.id`, creating it under `parent` if it is
    /// missing. Roots are created with no parent and stay hidden until
    /// [`TestTree::show_root`] is called.
    pub fn get_or_create(&mut self, parent: Option<&str>, node: NewNode) -> Result<NodeId> {
        if self.nodes.contains_key(&node.id) {
            return Ok(node.id);
        }

        if let Some(parent_id) = parent {
            let parent_node = self.nodes.get_mut(parent_id).ok_or_else(|| {
                ExplorerError::UnknownNode {
                    id: parent_id.to_string(),
                }
            })?;
            parent_node.children.push(node.id.clone());
        }

        let id = node.id.clone();
        self.nodes.insert(
            id.clone(),
            TreeNode {
                id: node.id,
                kind: node.kind,
                label: node.label,
                location: node.location,
                parent: parent.map(str::to_string),
                children: Vec::new(),
                error: None,
            },
        );
        Ok(id)
    }

    /// Make a root part of the visible tree.
    pub fn show_root(&mut self, id: &str) -> Result<()> {
        if !self.nodes.contains_key(id) {
            return Err(ExplorerError::UnknownNode { id: id.to_string() });
        }
        if !self.is_visible_root(id) {
            self.visible_roots.push(id.to_string());
        }
        Ok(())
    }

    pub fn hide_root(&mut self, id: &str) {
        self.visible_roots.retain(|r| r != id);
    }

    /// Swap every child of `id` for `children` in one step.
    ///
    /// Duplicate ids among `children` keep their first occurrence.
    pub fn replace_children(&mut self, id: &str, children: Vec<NewNode>) -> Result<()> {
        let old = match self.nodes.get_mut(id) {
            Some(node) => std::mem::take(&mut node.children),
            None => return Err(ExplorerError::UnknownNode { id: id.to_string() }),
        };
        for child in old {
            self.remove_subtree(&child);
        }

        let mut ids = Vec::with_capacity(children.len());
        for child in children {
            if self.nodes.contains_key(&child.id) {
                tracing::debug!(id = %child.id, "Skipping duplicate child");
                continue;
            }
            ids.push(child.id.clone());
            self.nodes.insert(
                child.id.clone(),
                TreeNode {
                    id: child.id,
                    kind: child.kind,
                    label: child.label,
                    location: child.location,
                    parent: Some(id.to_string()),
                    children: Vec::new(),
                    error: None,
                },
            );
        }

        if let Some(node) = self.nodes.get_mut(id) {
            node.children = ids;
        }
        Ok(())
    }

    /// Remove a node and its subtree, then prune ancestors left empty.
    ///
    /// Empty folders are removed recursively; an emptied root stays in the
    /// arena but leaves the visible tree.
    pub fn delete(&mut self, id: &str) -> Result<()> {
        let parent = match self.nodes.get(id) {
            Some(node) => node.parent.clone(),
            None => return Err(ExplorerError::UnknownNode { id: id.to_string() }),
        };

        self.remove_subtree(id);
        self.hide_root(id);

        let mut removed = id.to_string();
        let mut current = parent;
        while let Some(parent_id) = current.take() {
            let Some(node) = self.nodes.get_mut(&parent_id) else {
                break;
            };
            node.children.retain(|c| *c != removed);
            if !node.children.is_empty() {
                break;
            }
            match node.kind {
                NodeKind::Root => {
                    tracing::debug!(root = %parent_id, "Root emptied, hiding");
                    self.hide_root(&parent_id);
                }
                NodeKind::Folder => {
                    tracing::debug!(folder = %parent_id, "Pruning empty folder");
                    current = node.parent.clone();
                    self.nodes.remove(&parent_id);
                    removed = parent_id;
                }
                NodeKind::File | NodeKind::TestCase => {}
            }
        }
        Ok(())
    }

    fn remove_subtree(&mut self, id: &str) {
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                stack.extend(node.children);
            }
        }
    }

    /// Resolve a filesystem path back to its node, searching visible roots
    /// depth first.
    pub fn find_by_location(&self, path: &Path) -> Option<&TreeNode> {
        let mut stack: Vec<&NodeId> = self.visible_roots.iter().rev().collect();
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            if node.path() == Some(path) {
                return Some(node);
            }
            stack.extend(node.children.iter().rev());
        }
        None
    }

    /// Ids of every file node at or below `path`.
    pub fn files_under(&self, path: &Path) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.kind == NodeKind::File)
            .filter(|n| n.path().is_some_and(|p| p.starts_with(path)))
            .map(|n| n.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Look up a test case by the names the runner prints.
    pub fn find_test(&self, folder_id: &str, short_file: &str, test_name: &str) -> Option<&TreeNode> {
        self.children(folder_id)
            .find(|f| f.kind == NodeKind::File && short_file_name(&f.label) == short_file)
            .and_then(|f| self.find_child_by_label(&f.id, test_name))
            .filter(|t| t.is_test())
    }

    pub fn set_error(&mut self, id: &str, error: Option<String>) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.error = error;
        }
    }

    /// Number of test cases under `id`.
    pub fn test_count(&self, id: &str) -> usize {
        match self.nodes.get(id) {
            Some(node) if node.is_test() => 1,
            Some(node) => node.children.iter().map(|c| self.test_count(c)).sum(),
            None => 0,
        }
    }

    pub fn snapshot(&self) -> Vec<NodeView> {
        self.visible_roots.iter().filter_map(|id| self.view(id)).collect()
    }

    fn view(&self, id: &str) -> Option<NodeView> {
        let node = self.nodes.get(id)?;
        Some(NodeView {
            id: node.id.clone(),
            kind: node.kind,
            label: node.label.clone(),
            location: node.location.clone(),
            error: node.error.clone(),
            children: node.children.iter().filter_map(|c| self.view(c)).collect(),
        })
    }
}

/// Shared handle to the tree.
///
/// Discovery takes the write side for structural changes; filter
/// compilation and output parsing take the read side for lookups.
#[derive(Debug, Clone, Default)]
pub struct TreeStore {
    inner: Arc<RwLock<TestTree>>,
}

impl TreeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, TestTree> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, TestTree> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
