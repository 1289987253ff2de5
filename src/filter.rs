//! Selection to runner filter compilation
//!
//! Turns a set of included and excluded tree nodes into the `-t <file>` and
//! `--filter <includes>-<excludes>` arguments understood by `runSVUnit`,
//! one folder at a time, leaving out every clause the runner's defaults
//! already cover.

use std::collections::HashSet;
use std::fmt;

use crate::test_model::{short_file_name, NodeId, NodeKind, TestTree, ROOT_FOLDER_LABEL};

/// The nodes a run request asks for.
///
/// An empty include set means everything is a candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub include: HashSet<NodeId>,
    pub exclude: HashSet<NodeId>,
}

impl Selection {
    /// Select every discovered test.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn including<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        Self {
            include: ids.into_iter().map(Into::into).collect(),
            exclude: HashSet::new(),
        }
    }

    pub fn excluding<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        self.exclude.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Is `id`, or any of its ancestors, explicitly excluded?
    pub fn is_excluded(&self, tree: &TestTree, id: &str) -> bool {
        self.exclude.contains(id) || tree.ancestors(id).iter().any(|a| self.exclude.contains(a))
    }

    /// Is `id`, or any of its ancestors, explicitly included?
    fn covers(&self, tree: &TestTree, id: &str) -> bool {
        self.include.contains(id) || tree.ancestors(id).iter().any(|a| self.include.contains(a))
    }
}

/// Compiled runner arguments for one folder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestSelect {
    /// Files for `-t`; empty when the runner's default file scope matches.
    pub files: Vec<String>,
    /// `namespace.test` include terms; empty means "all selected files".
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
}

impl TestSelect {
    /// The `--filter` argument value, if one is needed.
    pub fn filter_expression(&self) -> Option<String> {
        let mut text = self.includes.join(":");
        if !self.excludes.is_empty() {
            text.push('-');
            text.push_str(&self.excludes.join(":"));
        }
        (!text.is_empty()).then_some(text)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.includes.is_empty() && self.excludes.is_empty()
    }
}

impl fmt::Display for TestSelect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self.files.iter().map(|file| format!("-t {file}")).collect();
        if let Some(filter) = self.filter_expression() {
            parts.push(format!("--filter {filter}"));
        }
        write!(f, "{}", parts.join(" "))
    }
}

/// Compile `selection` for the files directly inside `folder_id`.
///
/// Returns `None` when nothing in the folder is selected, in which case no
/// runner should be started for it.
pub fn compile(tree: &TestTree, folder_id: &str, selection: &Selection) -> Option<TestSelect> {
    let folder = tree.get(folder_id)?;
    if selection.is_excluded(tree, folder_id) {
        return None;
    }
    let folder_included = selection.include.is_empty() || selection.covers(tree, folder_id);

    let mut total_files = 0;
    let mut files = Vec::new();
    let mut includes = Vec::new();
    let mut excludes = Vec::new();
    let mut all_wildcards = HashSet::new();

    for file in tree.children(folder_id).filter(|c| c.kind == NodeKind::File) {
        total_files += 1;
        if selection.exclude.contains(&file.id) {
            continue;
        }

        let short = short_file_name(&file.label);
        let mut included_tests = Vec::new();
        let mut excluded_tests = Vec::new();
        for test in tree.children(&file.id) {
            let term = format!("{short}.{}", test.label);
            if selection.exclude.contains(&test.id) {
                excluded_tests.push(term);
            } else if selection.include.contains(&test.id) {
                included_tests.push(term);
            }
        }

        let file_included = folder_included || selection.include.contains(&file.id);
        if !file_included && included_tests.is_empty() {
            continue;
        }

        let wildcard = format!("{short}.*");
        all_wildcards.insert(wildcard.clone());
        if included_tests.is_empty() {
            includes.push(wildcard);
        } else {
            includes.extend(included_tests);
        }
        excludes.extend(excluded_tests);
        files.push(file.label.clone());
    }

    if files.is_empty() {
        tracing::debug!(folder = %folder.label, "No selected files in folder");
        return None;
    }

    let needs_file_clause = files.len() < total_files || has_nested_folders(tree, folder_id);
    if !needs_file_clause {
        files.clear();
    }

    let include_set: HashSet<&String> = includes.iter().collect();
    if include_set.len() == all_wildcards.len() && include_set.iter().all(|i| all_wildcards.contains(*i)) {
        includes.clear();
    }

    Some(TestSelect {
        files,
        includes,
        excludes,
    })
}

/// Does the runner's recursive file search from this folder reach into
/// another discovered folder? True for sibling folders whose label extends
/// this one, and for the root folder whenever any other folder exists.
fn has_nested_folders(tree: &TestTree, folder_id: &str) -> bool {
    let Some(folder) = tree.get(folder_id) else {
        return false;
    };
    let Some(parent) = folder.parent.as_deref() else {
        return false;
    };
    tree.children(parent)
        .filter(|s| s.kind == NodeKind::Folder && s.id != folder.id)
        .any(|s| folder.label == ROOT_FOLDER_LABEL || s.label.starts_with(&folder.label))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_model::tests::sample_tree;
    use crate::test_model::{test_case_id, Location, NewNode};

    const FOLDER: &str = "/ws/tests/";
    const A: &str = "/ws/tests/a_unit_test.sv";
    const B: &str = "/ws/tests/b_unit_test.sv";

    fn two_files() -> TestTree {
        sample_tree(&[
            ("a_unit_test.sv", &["foo", "bar"]),
            ("b_unit_test.sv", &["baz"]),
        ])
    }

    #[test]
    fn test_everything_selected_compiles_to_empty() {
        let tree = two_files();
        let select = compile(&tree, FOLDER, &Selection::all()).unwrap();
        assert!(select.is_empty());
        assert_eq!(select.to_string(), "");
    }

    #[test]
    fn test_single_test_case() {
        let tree = two_files();
        let selection = Selection::including([test_case_id(A, "foo")]);
        let select = compile(&tree, FOLDER, &selection).unwrap();
        assert_eq!(select.to_string(), "-t a_unit_test.sv --filter a_ut.foo");
    }

    #[test]
    fn test_single_file() {
        let tree = two_files();
        let select = compile(&tree, FOLDER, &Selection::including([A])).unwrap();
        assert_eq!(select.files, vec!["a_unit_test.sv"]);
        assert!(select.includes.is_empty());
        assert_eq!(select.to_string(), "-t a_unit_test.sv");
    }

    #[test]
    fn test_file_and_specific_test_prefers_specific_list() {
        let tree = two_files();
        let selection = Selection::including([A.to_string(), test_case_id(A, "bar")]);
        let select = compile(&tree, FOLDER, &selection).unwrap();
        assert_eq!(select.includes, vec!["a_ut.bar"]);
    }

    #[test]
    fn test_folder_with_excluded_test() {
        let tree = two_files();
        let selection = Selection::including([FOLDER]).excluding([test_case_id(B, "baz")]);
        let select = compile(&tree, FOLDER, &selection).unwrap();
        assert_eq!(select.to_string(), "--filter -b_ut.baz");
    }

    #[test]
    fn test_excluded_file_is_skipped() {
        let tree = two_files();
        let selection = Selection::all().excluding([B]);
        let select = compile(&tree, FOLDER, &selection).unwrap();
        assert_eq!(select.to_string(), "-t a_unit_test.sv");
    }

    #[test]
    fn test_excluded_folder_is_no_work() {
        let tree = two_files();
        let selection = Selection::all().excluding(["/ws"]);
        assert!(compile(&tree, FOLDER, &selection).is_none());
    }

    #[test]
    fn test_selection_elsewhere_is_no_work() {
        let tree = two_files();
        let selection = Selection::including(["/elsewhere/file_unit_test.sv"]);
        assert!(compile(&tree, FOLDER, &selection).is_none());
    }

    #[test]
    fn test_tests_from_both_files_keep_order() {
        let tree = two_files();
        let selection = Selection::including([test_case_id(B, "baz"), test_case_id(A, "foo")]);
        let select = compile(&tree, FOLDER, &selection).unwrap();
        assert!(select.files.is_empty());
        assert_eq!(select.includes, vec!["a_ut.foo", "b_ut.baz"]);
        assert_eq!(select.to_string(), "--filter a_ut.foo:b_ut.baz");
    }

    #[test]
    fn test_nested_folder_forces_file_clause() {
        let mut tree = two_files();
        let sub = tree
            .get_or_create(
                Some("/ws"),
                NewNode::new("/ws/tests/sub/", NodeKind::Folder, "tests/sub/")
                    .at(Location::file("/ws/tests/sub")),
            )
            .unwrap();
        tree.get_or_create(
            Some(&sub),
            NewNode::new("/ws/tests/sub/c_unit_test.sv", NodeKind::File, "c_unit_test.sv"),
        )
        .unwrap();

        let select = compile(&tree, FOLDER, &Selection::all()).unwrap();
        assert_eq!(select.to_string(), "-t a_unit_test.sv -t b_unit_test.sv");

        // The nested folder has no folder extending its own label.
        let nested = compile(&tree, &sub, &Selection::all()).unwrap();
        assert_eq!(nested.to_string(), "");
    }

    #[test]
    fn test_include_equality_ignores_order() {
        let tree = two_files();
        // Both files included explicitly, in reverse order.
        let selection = Selection::including([B, A]);
        let select = compile(&tree, FOLDER, &selection).unwrap();
        assert!(select.includes.is_empty());
    }
}
