//! Command line selectors
//!
//! A selector is a directory (root or folder), a test file, or
//! `path/to/file_unit_test.sv:test_name` for a single test case.

use std::path::Path;

use svunit_explorer::discovery::file_id;
use svunit_explorer::test_model::{test_case_id, NodeId, NodeKind, TestTree};
use svunit_explorer::ExplorerError;

/// Resolve one selector, relative to `base_dir`, into tree node ids.
pub fn resolve(tree: &TestTree, selector: &str, base_dir: &Path) -> Result<Vec<NodeId>, ExplorerError> {
    let unresolved = || ExplorerError::UnresolvedSelector {
        selector: selector.to_string(),
    };

    if let Some((file, test)) = selector.rsplit_once(':') {
        let is_name = !test.is_empty() && test.chars().all(|c| c.is_alphanumeric() || c == '_');
        if is_name {
            if let Ok(path) = std::fs::canonicalize(base_dir.join(file)) {
                if path.is_file() {
                    let id = test_case_id(&file_id(&path), test);
                    return if tree.get(&id).is_some_and(|n| n.is_test()) {
                        Ok(vec![id])
                    } else {
                        Err(unresolved())
                    };
                }
            }
        }
    }

    let path = std::fs::canonicalize(base_dir.join(selector)).map_err(|_| unresolved())?;
    if let Some(node) = tree.find_by_location(&path) {
        return Ok(vec![node.id.clone()]);
    }

    // A directory between a root and its folders selects every folder below it.
    if path.is_dir() {
        let ids: Vec<NodeId> = tree
            .roots()
            .flat_map(|root| tree.children(&root.id))
            .filter(|f| f.kind == NodeKind::Folder)
            .filter(|f| f.path().is_some_and(|p| p.starts_with(&path)))
            .map(|f| f.id.clone())
            .collect();
        if !ids.is_empty() {
            return Ok(ids);
        }
    }

    Err(unresolved())
}

/// Resolve every selector, failing on the first that matches nothing.
pub fn resolve_all(tree: &TestTree, selectors: &[String], base_dir: &Path) -> Result<Vec<NodeId>, ExplorerError> {
    let mut ids = Vec::new();
    for selector in selectors {
        ids.extend(resolve(tree, selector, base_dir)?);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use svunit_explorer::discovery::{root_id, Discovery, DEFAULT_TEST_FILE_PATTERN};
    use svunit_explorer::TreeStore;

    fn workspace() -> (tempfile::TempDir, std::path::PathBuf, TreeStore) {
        let dir = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        fs::create_dir_all(root.join("verif/unit")).unwrap();
        fs::write(
            root.join("verif/unit/a_unit_test.sv"),
            "`SVTEST(foo)\n`SVTEST_END\n",
        )
        .unwrap();
        let store = TreeStore::new();
        Discovery::new(store.clone(), DEFAULT_TEST_FILE_PATTERN)
            .unwrap()
            .discover_root(&root)
            .unwrap();
        (dir, root, store)
    }

    #[test]
    fn test_resolve_file_and_test_case() {
        let (_dir, root, store) = workspace();
        let tree = store.read();
        let file = root.join("verif/unit/a_unit_test.sv");

        let ids = resolve(&tree, "verif/unit/a_unit_test.sv", &root).unwrap();
        assert_eq!(ids, vec![file_id(&file)]);

        let ids = resolve(&tree, "verif/unit/a_unit_test.sv:foo", &root).unwrap();
        assert_eq!(ids, vec![test_case_id(&file_id(&file), "foo")]);
    }

    #[test]
    fn test_resolve_directories() {
        let (_dir, root, store) = workspace();
        let tree = store.read();

        assert_eq!(resolve(&tree, ".", &root).unwrap(), vec![root_id(&root)]);

        let folder = format!("{}/verif/unit/", root_id(&root));
        assert_eq!(resolve(&tree, "verif/unit", &root).unwrap(), vec![folder.clone()]);
        // No folder node for `verif/` itself; it covers the folders below.
        assert_eq!(resolve(&tree, "verif", &root).unwrap(), vec![folder]);
    }

    #[test]
    fn test_unknown_selectors_fail() {
        let (_dir, root, store) = workspace();
        let tree = store.read();
        for selector in ["missing_unit_test.sv", "verif/unit/a_unit_test.sv:nope"] {
            let err = resolve(&tree, selector, &root).unwrap_err();
            assert!(matches!(err, ExplorerError::UnresolvedSelector { .. }));
        }
        assert!(resolve_all(&tree, &["verif".to_string(), "nope".to_string()], &root).is_err());
    }
}
