//! Test discovery module
//!
//! Walks each workspace root for SVUnit test files, attaches them to the
//! tree under their folder, and parses their test cases. Also applies the
//! created/changed/deleted notifications coming from the file watcher.

use futures::future::join_all;
use glob::{MatchOptions, Pattern};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use crate::error::{ExplorerError, Result};
use crate::marker;
use crate::test_model::{
    test_case_id, Location, NewNode, NodeId, NodeKind, TestTree, TreeStore, ROOT_FOLDER_LABEL,
};

/// Default pattern for SVUnit test files, relative to a root.
pub const DEFAULT_TEST_FILE_PATTERN: &str = "**/*unit_test.sv";

/// A change to a single file, as delivered by the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    Created(PathBuf),
    Changed(PathBuf),
    Deleted(PathBuf),
}

impl FileEvent {
    pub fn path(&self) -> &Path {
        match self {
            FileEvent::Created(p) | FileEvent::Changed(p) | FileEvent::Deleted(p) => p,
        }
    }
}

/// Outcome of discovering one root.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    pub root_id: NodeId,
    pub root: PathBuf,
    pub files: usize,
    pub tests: usize,
    /// Files that could not be read, with the reason.
    pub errors: Vec<(PathBuf, String)>,
}

/// What a watcher notification did to the tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Applied {
    /// Test files created or re-parsed.
    pub updated: Vec<NodeId>,
    /// Test files removed, with their emptied folders.
    pub removed: Vec<NodeId>,
}

impl Applied {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.removed.is_empty()
    }

    /// Fold `other` in, keeping each id once.
    pub fn merge(&mut self, other: Applied) {
        for id in other.updated {
            self.removed.retain(|r| *r != id);
            if !self.updated.contains(&id) {
                self.updated.push(id);
            }
        }
        for id in other.removed {
            self.updated.retain(|u| *u != id);
            if !self.removed.contains(&id) {
                self.removed.push(id);
            }
        }
    }
}

/// Builds and maintains the tree from the filesystem.
#[derive(Debug, Clone)]
pub struct Discovery {
    store: TreeStore,
    pattern: Pattern,
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

impl Discovery {
    pub fn new(store: TreeStore, pattern: &str) -> Result<Self> {
        let pattern = Pattern::new(pattern).map_err(|source| ExplorerError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self { store, pattern })
    }

    pub fn store(&self) -> &TreeStore {
        &self.store
    }

    /// Create the (hidden) root node for a workspace directory.
    pub fn register_root(&self, root: &Path) -> Result<NodeId> {
        let label = root
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| root.display().to_string());
        let node = NewNode::new(root_id(root), NodeKind::Root, label).at(Location::file(root));
        self.store.write().get_or_create(None, node)
    }

    /// Discover every root concurrently. Roots share no state, so a failure
    /// in one leaves the others untouched.
    pub async fn discover_all(&self, roots: &[PathBuf]) -> Vec<Result<DiscoveryReport>> {
        let handles = roots.iter().cloned().map(|root| {
            let discovery = self.clone();
            tokio::task::spawn_blocking(move || discovery.discover_root(&root))
        });

        join_all(handles)
            .await
            .into_iter()
            .map(|joined| match joined {
                Ok(result) => result,
                Err(e) => Err(ExplorerError::Io(std::io::Error::other(e))),
            })
            .collect()
    }

    /// Enumerate, attach and parse every test file under `root`.
    ///
    /// Files that were known from an earlier pass but no longer exist are
    /// removed. The root only joins the visible tree once it holds a file.
    pub fn discover_root(&self, root: &Path) -> Result<DiscoveryReport> {
        let root = std::fs::canonicalize(root)?;
        let root_id = self.register_root(&root)?;
        tracing::info!(root = %root.display(), "Discovering test files");

        let files = self.enumerate(&root)?;
        tracing::info!(count = files.len(), root = %root.display(), "Found test files");

        let mut report = DiscoveryReport {
            root_id: root_id.clone(),
            root: root.clone(),
            ..Default::default()
        };

        let mut seen = HashSet::new();
        for file in &files {
            let Some(file_id) = self.attach_file(&root_id, &root, file)? else {
                continue;
            };
            seen.insert(file_id.clone());
            report.files += 1;
            match self.parse_file(&file_id) {
                Ok(count) => report.tests += count,
                Err(e) => report.errors.push((file.clone(), e.to_string())),
            }
        }

        self.remove_stale_files(&root_id, &seen)?;

        let mut tree = self.store.write();
        if tree.children(&root_id).next().is_some() {
            tree.show_root(&root_id)?;
        }

        Ok(report)
    }

    fn enumerate(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let full_pattern = format!(
            "{}/{}",
            Pattern::escape(&root.to_string_lossy()),
            self.pattern.as_str()
        );
        let paths = glob::glob_with(&full_pattern, MATCH_OPTIONS).map_err(|source| {
            ExplorerError::InvalidPattern {
                pattern: full_pattern.clone(),
                source,
            }
        })?;

        let mut files = Vec::new();
        for entry in paths {
            match entry {
                Ok(path) if path.is_file() => files.push(path),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable path"),
            }
        }
        Ok(files)
    }

    fn remove_stale_files(&self, root_id: &str, seen: &HashSet<NodeId>) -> Result<()> {
        let mut tree = self.store.write();
        let stale: Vec<NodeId> = {
            let view: &TestTree = &tree;
            view.children(root_id)
                .flat_map(|folder| view.children(&folder.id))
                .filter(|file| file.kind == NodeKind::File && !seen.contains(&file.id))
                .map(|file| file.id.clone())
                .collect()
        };
        for id in stale {
            tracing::debug!(file = %id, "Removing file no longer on disk");
            tree.delete(&id)?;
        }
        Ok(())
    }

    /// Does `path` look like a test file under `root`?
    pub fn matches(&self, root: &Path, path: &Path) -> bool {
        path.strip_prefix(root)
            .map(|rel| self.pattern.matches_path_with(rel, MATCH_OPTIONS))
            .unwrap_or(false)
    }

    /// The registered root that contains `path`, deepest first.
    pub fn root_for(&self, path: &Path) -> Option<(NodeId, PathBuf)> {
        deepest_root(&self.store.read(), path)
    }

    /// Attach `file` under its folder, creating the folder when needed.
    ///
    /// A file belongs to the deepest root containing it. `None` means a
    /// nested root owns the file; a file held by a shallower root moves
    /// here.
    pub fn attach_file(&self, root_id: &str, root: &Path, file: &Path) -> Result<Option<NodeId>> {
        let rel = file.strip_prefix(root).unwrap_or(file);
        let segments: Vec<String> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().to_string()),
                _ => None,
            })
            .collect();

        let (dirs, name) = match segments.split_last() {
            Some((name, dirs)) => (dirs, name.clone()),
            None => (&[][..], file.display().to_string()),
        };

        let (folder_label, folder_path) = if dirs.is_empty() {
            (ROOT_FOLDER_LABEL.to_string(), root.to_path_buf())
        } else {
            (format!("{}/", dirs.join("/")), dirs.iter().fold(root.to_path_buf(), |p, d| p.join(d)))
        };

        let mut tree = self.store.write();
        if deepest_root(&tree, file).is_some_and(|(owner, _)| owner != root_id) {
            tracing::debug!(file = %file.display(), "Left to a nested root");
            return Ok(None);
        }
        let id = file_id(file);
        let held_elsewhere = tree.root_of(&id).is_some_and(|r| r.id != root_id);
        if held_elsewhere {
            tracing::debug!(file = %id, root = %root_id, "Moving file to a nested root");
            tree.delete(&id)?;
        }

        let folder_id = tree.get_or_create(
            Some(root_id),
            NewNode::new(format!("{root_id}/{folder_label}"), NodeKind::Folder, folder_label)
                .at(Location::file(folder_path)),
        )?;
        let file_id = tree.get_or_create(
            Some(&folder_id),
            NewNode::new(id, NodeKind::File, name).at(Location::file(file)),
        )?;
        tracing::debug!(file = %file_id, "Attached test file");
        Ok(Some(file_id))
    }

    /// Re-read a file and replace all of its test cases.
    ///
    /// A read failure is recorded on the file node and leaves it with no
    /// test cases.
    pub fn parse_file(&self, file_id: &str) -> Result<usize> {
        let path = {
            let tree = self.store.read();
            tree.get(file_id)
                .and_then(|n| n.path().map(Path::to_path_buf))
                .ok_or_else(|| ExplorerError::UnknownNode {
                    id: file_id.to_string(),
                })?
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => self.parse_contents(file_id, &path, &contents),
            Err(source) => {
                tracing::warn!(file = %path.display(), error = %source, "Error reading test file");
                let mut tree = self.store.write();
                tree.replace_children(file_id, Vec::new())?;
                tree.set_error(file_id, Some(source.to_string()));
                Err(ExplorerError::DiscoveryRead { path, source })
            }
        }
    }

    /// Replace the test cases of `file_id` with those found in `contents`.
    pub fn parse_contents(&self, file_id: &str, path: &Path, contents: &str) -> Result<usize> {
        let children: Vec<NewNode> = marker::scan(contents)
            .map(|m| {
                tracing::debug!(test = %m.label, "Added test case");
                NewNode::new(test_case_id(file_id, &m.label), NodeKind::TestCase, m.label)
                    .at(Location::span(path, m.range))
            })
            .collect();
        let count = children.len();

        let mut tree = self.store.write();
        tree.replace_children(file_id, children)?;
        tree.set_error(file_id, None);
        Ok(count)
    }

    /// Apply one watcher notification.
    ///
    /// A created directory brings in every test file below it. A deleted
    /// path removes every file at or below it.
    pub fn apply(&self, event: &FileEvent) -> Result<Applied> {
        let path = event.path();
        let mut applied = Applied::default();
        let Some((root_id, root)) = self.root_for(path) else {
            tracing::debug!(path = %path.display(), "Event outside any root");
            return Ok(applied);
        };

        match event {
            FileEvent::Created(_) | FileEvent::Changed(_) => {
                let files: Vec<PathBuf> = match event {
                    FileEvent::Created(_) if path.is_dir() => self
                        .enumerate(&root)?
                        .into_iter()
                        .filter(|f| f.starts_with(path))
                        .collect(),
                    _ if path.is_file() && self.matches(&root, path) => vec![path.to_path_buf()],
                    _ => Vec::new(),
                };
                for file in files {
                    let Some(file_id) = self.attach_file(&root_id, &root, &file)? else {
                        continue;
                    };
                    tracing::info!(file = %file.display(), "Test file created or changed");
                    if let Err(e) = self.parse_file(&file_id) {
                        tracing::warn!(error = %e, "Test file kept without test cases");
                    }
                    applied.updated.push(file_id);
                }
                if !applied.updated.is_empty() {
                    self.store.write().show_root(&root_id)?;
                }
            }
            FileEvent::Deleted(_) => {
                let mut tree = self.store.write();
                for id in tree.files_under(path) {
                    if tree.contains(&id) {
                        tree.delete(&id)?;
                        applied.removed.push(id);
                    }
                }
                if !applied.removed.is_empty() {
                    tracing::info!(path = %path.display(), count = applied.removed.len(), "Test files deleted");
                }
            }
        }
        Ok(applied)
    }
}

fn deepest_root(tree: &TestTree, path: &Path) -> Option<(NodeId, PathBuf)> {
    tree.all_roots()
        .filter_map(|r| r.path().map(|p| (r.id.clone(), p.to_path_buf())))
        .filter(|(_, p)| path.starts_with(p))
        .max_by_key(|(_, p)| p.components().count())
}

/// Root ids are the canonical directory path.
pub fn root_id(root: &Path) -> NodeId {
    root.display().to_string()
}

/// File ids are the absolute file path.
pub fn file_id(path: &Path) -> NodeId {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const TWO_TESTS: &str = "\
module a_unit_test;
  `SVUNIT_TESTS_BEGIN
  `SVTEST(foo)
  `SVTEST_END
  `SVTEST(bar)
  `SVTEST_END
  `SVUNIT_TESTS_END
endmodule
";

    fn setup() -> (tempfile::TempDir, PathBuf, Discovery) {
        let dir = tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        let discovery = Discovery::new(TreeStore::new(), DEFAULT_TEST_FILE_PATTERN).unwrap();
        (dir, root, discovery)
    }

    #[test]
    fn test_discover_root_builds_hierarchy() {
        let (_dir, root, discovery) = setup();
        fs::create_dir_all(root.join("tests/unit")).unwrap();
        fs::write(root.join("top_unit_test.sv"), TWO_TESTS).unwrap();
        fs::write(root.join("tests/unit/a_unit_test.sv"), TWO_TESTS).unwrap();
        fs::write(root.join("tests/unit/readme.txt"), "not a test").unwrap();

        let report = discovery.discover_root(&root).unwrap();
        assert_eq!(report.files, 2);
        assert_eq!(report.tests, 4);
        assert!(report.errors.is_empty());

        let tree = discovery.store().read();
        assert_eq!(tree.roots().count(), 1);
        let folders: Vec<_> = tree.children(&report.root_id).map(|f| f.label.clone()).collect();
        assert!(folders.contains(&"./".to_string()));
        assert!(folders.contains(&"tests/unit/".to_string()));

        let folder_id = format!("{}/tests/unit/", report.root_id);
        let foo = tree.find_test(&folder_id, "a_ut", "foo").unwrap();
        assert_eq!(foo.location.as_ref().unwrap().range.unwrap().start_line, 2);
    }

    #[test]
    fn test_empty_root_stays_hidden() {
        let (_dir, root, discovery) = setup();
        fs::write(root.join("design.sv"), "module d; endmodule").unwrap();

        let report = discovery.discover_root(&root).unwrap();
        assert_eq!(report.files, 0);
        let tree = discovery.store().read();
        assert_eq!(tree.roots().count(), 0);
        assert!(tree.contains(&report.root_id));
    }

    #[test]
    fn test_changed_event_replaces_tests() {
        let (_dir, root, discovery) = setup();
        let file = root.join("a_unit_test.sv");
        fs::write(&file, TWO_TESTS).unwrap();
        discovery.discover_root(&root).unwrap();

        fs::write(&file, "`SVTEST(only)\n`SVTEST_END\n").unwrap();
        discovery.apply(&FileEvent::Changed(file.clone())).unwrap();

        let tree = discovery.store().read();
        let labels: Vec<_> = tree.children(&file_id(&file)).map(|t| t.label.clone()).collect();
        assert_eq!(labels, vec!["only"]);
    }

    #[test]
    fn test_created_event_shows_root() {
        let (_dir, root, discovery) = setup();
        discovery.discover_root(&root).unwrap();
        assert_eq!(discovery.store().read().roots().count(), 0);

        fs::create_dir_all(root.join("sub")).unwrap();
        let file = root.join("sub/b_unit_test.sv");
        fs::write(&file, TWO_TESTS).unwrap();
        discovery.apply(&FileEvent::Created(file.clone())).unwrap();

        let tree = discovery.store().read();
        assert_eq!(tree.roots().count(), 1);
        assert_eq!(tree.test_count(&root_id(&root)), 2);
    }

    #[test]
    fn test_created_event_ignores_non_matching_files() {
        let (_dir, root, discovery) = setup();
        discovery.discover_root(&root).unwrap();
        let file = root.join("helper.sv");
        fs::write(&file, TWO_TESTS).unwrap();
        discovery.apply(&FileEvent::Created(file)).unwrap();
        assert_eq!(discovery.store().read().roots().count(), 0);
    }

    #[test]
    fn test_deleted_event_prunes_folder_and_root() {
        let (_dir, root, discovery) = setup();
        fs::create_dir_all(root.join("tests")).unwrap();
        let file = root.join("tests/a_unit_test.sv");
        fs::write(&file, TWO_TESTS).unwrap();
        discovery.discover_root(&root).unwrap();

        fs::remove_file(&file).unwrap();
        discovery.apply(&FileEvent::Deleted(file.clone())).unwrap();

        let tree = discovery.store().read();
        assert!(!tree.contains(&file_id(&file)));
        assert!(!tree.contains(&format!("{}/tests/", root_id(&root))));
        assert_eq!(tree.roots().count(), 0);
    }

    #[test]
    fn test_deleted_directory_removes_files_below_it() {
        let (_dir, root, discovery) = setup();
        fs::create_dir_all(root.join("verif/unit")).unwrap();
        let file = root.join("verif/unit/a_unit_test.sv");
        fs::write(&file, TWO_TESTS).unwrap();
        discovery.discover_root(&root).unwrap();

        fs::remove_dir_all(root.join("verif")).unwrap();
        let applied = discovery.apply(&FileEvent::Deleted(root.join("verif"))).unwrap();
        assert_eq!(applied.removed, vec![file_id(&file)]);

        let tree = discovery.store().read();
        assert!(!tree.contains(&file_id(&file)));
        assert!(!tree.contains(&format!("{}/verif/unit/", root_id(&root))));
        assert_eq!(tree.roots().count(), 0);
    }

    #[test]
    fn test_deleting_unrelated_path_removes_nothing() {
        let (_dir, root, discovery) = setup();
        fs::write(root.join("a_unit_test.sv"), TWO_TESTS).unwrap();
        fs::write(root.join("notes.txt"), "x").unwrap();
        discovery.discover_root(&root).unwrap();

        fs::remove_file(root.join("notes.txt")).unwrap();
        let applied = discovery.apply(&FileEvent::Deleted(root.join("notes.txt"))).unwrap();
        assert!(applied.is_empty());
        assert_eq!(discovery.store().read().test_count(&root_id(&root)), 2);
    }

    #[test]
    fn test_created_directory_brings_in_its_files() {
        let (_dir, root, discovery) = setup();
        discovery.discover_root(&root).unwrap();

        // A directory moved in whole produces a single event for the directory.
        fs::create_dir_all(root.join("verif/unit")).unwrap();
        let file = root.join("verif/unit/a_unit_test.sv");
        fs::write(&file, TWO_TESTS).unwrap();
        fs::write(root.join("verif/helper.sv"), TWO_TESTS).unwrap();
        let applied = discovery.apply(&FileEvent::Created(root.join("verif"))).unwrap();
        assert_eq!(applied.updated, vec![file_id(&file)]);

        let tree = discovery.store().read();
        assert_eq!(tree.roots().count(), 1);
        assert_eq!(tree.test_count(&root_id(&root)), 2);
        assert!(tree.contains(&format!("{}/verif/unit/", root_id(&root))));
    }

    #[test]
    fn test_nested_root_owns_its_files() {
        let (_dir, root, discovery) = setup();
        let sub = root.join("sub");
        fs::create_dir_all(&sub).unwrap();
        let file = sub.join("a_unit_test.sv");
        fs::write(&file, TWO_TESTS).unwrap();

        discovery.discover_root(&root).unwrap();
        let report = discovery.discover_root(&sub).unwrap();
        assert_eq!(report.files, 1);

        let tree = discovery.store().read();
        assert_eq!(tree.root_of(&file_id(&file)).unwrap().id, root_id(&sub));
        assert!(!tree.is_visible_root(&root_id(&root)));
        for visible in tree.roots() {
            for folder in tree.children(&visible.id) {
                assert!(!folder.children.is_empty(), "empty folder {}", folder.id);
            }
        }
        assert_eq!(tree.test_count(&root_id(&sub)), 2);
    }

    #[test]
    fn test_outer_root_skips_files_of_nested_root() {
        let (_dir, root, discovery) = setup();
        let sub = root.join("sub");
        fs::create_dir_all(&sub).unwrap();
        fs::write(sub.join("a_unit_test.sv"), TWO_TESTS).unwrap();
        fs::write(root.join("top_unit_test.sv"), TWO_TESTS).unwrap();

        discovery.discover_root(&sub).unwrap();
        let report = discovery.discover_root(&root).unwrap();
        assert_eq!(report.files, 1);

        let tree = discovery.store().read();
        let folders: Vec<_> = tree.children(&root_id(&root)).map(|f| f.label.clone()).collect();
        assert_eq!(folders, vec!["./"]);
        assert_eq!(tree.test_count(&root_id(&root)), 2);
        assert_eq!(tree.test_count(&root_id(&sub)), 2);
    }

    #[test]
    fn test_rediscovery_drops_removed_files() {
        let (_dir, root, discovery) = setup();
        fs::write(root.join("a_unit_test.sv"), TWO_TESTS).unwrap();
        fs::write(root.join("b_unit_test.sv"), TWO_TESTS).unwrap();
        discovery.discover_root(&root).unwrap();

        fs::remove_file(root.join("b_unit_test.sv")).unwrap();
        let report = discovery.discover_root(&root).unwrap();
        assert_eq!(report.files, 1);
        assert!(!discovery.store().read().contains(&file_id(&root.join("b_unit_test.sv"))));
    }

    #[test]
    fn test_parse_contents_on_unreadable_file_records_error() {
        let (_dir, root, discovery) = setup();
        let file = root.join("a_unit_test.sv");
        fs::write(&file, TWO_TESTS).unwrap();
        discovery.discover_root(&root).unwrap();

        fs::remove_file(&file).unwrap();
        let err = discovery.parse_file(&file_id(&file)).unwrap_err();
        assert!(matches!(err, ExplorerError::DiscoveryRead { .. }));

        let tree = discovery.store().read();
        let node = tree.get(&file_id(&file)).unwrap();
        assert!(node.error.is_some());
        assert!(node.children.is_empty());
    }

    #[tokio::test]
    async fn test_discover_all_roots_concurrently() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        fs::write(a.path().join("a_unit_test.sv"), TWO_TESTS).unwrap();
        fs::write(b.path().join("b_unit_test.sv"), TWO_TESTS).unwrap();

        let discovery = Discovery::new(TreeStore::new(), DEFAULT_TEST_FILE_PATTERN).unwrap();
        let reports = discovery
            .discover_all(&[a.path().to_path_buf(), b.path().to_path_buf()])
            .await;
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.as_ref().unwrap().tests == 2));
        assert_eq!(discovery.store().read().roots().count(), 2);
    }

    #[test]
    fn test_applied_merge_keeps_latest_outcome() {
        let mut applied = Applied {
            updated: vec!["/ws/a_unit_test.sv".to_string()],
            removed: vec!["/ws/b_unit_test.sv".to_string()],
        };
        applied.merge(Applied {
            updated: vec!["/ws/b_unit_test.sv".to_string(), "/ws/a_unit_test.sv".to_string()],
            removed: Vec::new(),
        });
        assert_eq!(applied.updated, vec!["/ws/a_unit_test.sv", "/ws/b_unit_test.sv"]);
        assert!(applied.removed.is_empty());
    }

    #[test]
    fn test_invalid_pattern() {
        let err = Discovery::new(TreeStore::new(), "[").unwrap_err();
        assert!(matches!(err, ExplorerError::InvalidPattern { .. }));
    }
}
