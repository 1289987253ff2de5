//! File watcher keeping the test tree in sync
//!
//! Watches every root recursively, turns notify events into
//! [`FileEvent`]s, and hands them to [`Discovery::apply`].

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::discovery::{Applied, Discovery, FileEvent};
use crate::error::Result;

/// Quiet period used to coalesce bursts of editor writes.
const DEBOUNCE: Duration = Duration::from_millis(300);
const EXCLUDED_DIRS: &[&str] = &[".git", "node_modules", "work", "obj_dir"];

/// Live watch over a set of roots
pub struct TreeWatcher {
    discovery: Discovery,
    // Dropping the watcher stops notifications.
    _watcher: RecommendedWatcher,
    rx: UnboundedReceiver<notify::Result<Event>>,
}

impl TreeWatcher {
    pub fn start(discovery: Discovery, roots: &[PathBuf]) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = tx.send(res);
            },
            Config::default(),
        )?;

        for root in roots {
            watcher.watch(root, RecursiveMode::Recursive)?;
            tracing::info!(root = %root.display(), "Watching for changes");
        }

        Ok(Self {
            discovery,
            _watcher: watcher,
            rx,
        })
    }

    /// Wait for the next burst of changes. `None` once the watcher is gone.
    pub async fn next_batch(&mut self) -> Option<Vec<FileEvent>> {
        let mut events = Vec::new();
        let first = self.rx.recv().await?;
        self.collect(first, &mut events);

        while let Ok(Some(res)) = tokio::time::timeout(DEBOUNCE, self.rx.recv()).await {
            self.collect(res, &mut events);
        }
        Some(coalesce(events))
    }

    fn collect(&self, res: notify::Result<Event>, out: &mut Vec<FileEvent>) {
        match res {
            Ok(event) => out.extend(translate(&event)),
            Err(e) => tracing::warn!(error = %e, "Watch error"),
        }
    }

    /// Apply a batch to the tree and report the test files it updated and
    /// removed.
    pub fn apply(&self, events: &[FileEvent]) -> Applied {
        let mut applied = Applied::default();
        for event in events {
            match self.discovery.apply(event) {
                Ok(outcome) => applied.merge(outcome),
                Err(e) => {
                    tracing::warn!(path = %event.path().display(), error = %e, "Could not apply change")
                }
            }
        }
        applied
    }
}

/// Map one notify event onto tree-level file events.
pub fn translate(event: &Event) -> Vec<FileEvent> {
    let paths = event.paths.iter().filter(|p| !is_excluded(p));
    match event.kind {
        EventKind::Create(_) => paths.cloned().map(FileEvent::Created).collect(),
        EventKind::Remove(_) => paths.cloned().map(FileEvent::Deleted).collect(),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => paths.cloned().map(FileEvent::Deleted).collect(),
            RenameMode::To => paths.cloned().map(FileEvent::Created).collect(),
            RenameMode::Both => {
                let mut out = Vec::new();
                if let Some(from) = event.paths.first().filter(|p| !is_excluded(p)) {
                    out.push(FileEvent::Deleted(from.clone()));
                }
                if let Some(to) = event.paths.get(1).filter(|p| !is_excluded(p)) {
                    out.push(FileEvent::Created(to.clone()));
                }
                out
            }
            _ => paths
                .map(|p| {
                    if p.exists() {
                        FileEvent::Created(p.clone())
                    } else {
                        FileEvent::Deleted(p.clone())
                    }
                })
                .collect(),
        },
        EventKind::Modify(_) => paths.cloned().map(FileEvent::Changed).collect(),
        _ => Vec::new(),
    }
}

/// Keep only the latest event per path, in order of last occurrence.
pub fn coalesce(events: Vec<FileEvent>) -> Vec<FileEvent> {
    let mut out: Vec<FileEvent> = Vec::with_capacity(events.len());
    for event in events {
        out.retain(|e| e.path() != event.path());
        out.push(event);
    }
    out
}

/// Is the path inside a build or VCS directory?
pub fn is_excluded(path: &Path) -> bool {
    path.components().any(|c| match c {
        Component::Normal(name) => EXCLUDED_DIRS.iter().any(|d| name == *d),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{file_id, DEFAULT_TEST_FILE_PATTERN};
    use crate::test_model::TreeStore;
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use std::fs;
    use std::time::Instant;

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |e, p| e.add_path(PathBuf::from(p)))
    }

    #[test]
    fn test_translate_basic_kinds() {
        let created = event(EventKind::Create(CreateKind::File), &["/ws/a_unit_test.sv"]);
        assert_eq!(
            translate(&created),
            vec![FileEvent::Created(PathBuf::from("/ws/a_unit_test.sv"))]
        );

        let changed = event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            &["/ws/a_unit_test.sv"],
        );
        assert_eq!(
            translate(&changed),
            vec![FileEvent::Changed(PathBuf::from("/ws/a_unit_test.sv"))]
        );

        let removed = event(EventKind::Remove(RemoveKind::Any), &["/ws/tests"]);
        assert_eq!(translate(&removed), vec![FileEvent::Deleted(PathBuf::from("/ws/tests"))]);
    }

    #[test]
    fn test_rename_is_delete_then_create() {
        let renamed = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/ws/old_unit_test.sv", "/ws/new_unit_test.sv"],
        );
        assert_eq!(
            translate(&renamed),
            vec![
                FileEvent::Deleted(PathBuf::from("/ws/old_unit_test.sv")),
                FileEvent::Created(PathBuf::from("/ws/new_unit_test.sv")),
            ]
        );
    }

    #[test]
    fn test_excluded_dirs_are_ignored() {
        assert!(is_excluded(Path::new("/ws/.git/index")));
        assert!(is_excluded(Path::new("/ws/sim/obj_dir/a_unit_test.sv")));
        assert!(!is_excluded(Path::new("/ws/workspace/a_unit_test.sv")));

        let noisy = event(EventKind::Create(CreateKind::File), &["/ws/work/x_unit_test.sv"]);
        assert!(translate(&noisy).is_empty());
    }

    #[test]
    fn test_coalesce_keeps_last_event_per_path() {
        let a = PathBuf::from("/ws/a_unit_test.sv");
        let b = PathBuf::from("/ws/b_unit_test.sv");
        let events = vec![
            FileEvent::Created(a.clone()),
            FileEvent::Changed(b.clone()),
            FileEvent::Deleted(a.clone()),
        ];
        assert_eq!(
            coalesce(events),
            vec![FileEvent::Changed(b), FileEvent::Deleted(a)]
        );
    }

    #[tokio::test]
    async fn test_new_file_reaches_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        let discovery = Discovery::new(TreeStore::new(), DEFAULT_TEST_FILE_PATTERN).unwrap();
        discovery.discover_root(&root).unwrap();
        let mut watcher = TreeWatcher::start(discovery.clone(), &[root.clone()]).unwrap();

        let file = root.join("a_unit_test.sv");
        fs::write(&file, "`SVTEST(foo)\n`SVTEST_END\n").unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut applied = Applied::default();
        while applied.updated.is_empty() && Instant::now() < deadline {
            let batch = tokio::time::timeout(Duration::from_secs(2), watcher.next_batch()).await;
            if let Ok(Some(batch)) = batch {
                applied.merge(watcher.apply(&batch));
            }
        }

        assert_eq!(applied.updated, vec![file_id(&file)]);
        assert!(applied.removed.is_empty());
        let tree = discovery.store().read();
        assert_eq!(tree.roots().count(), 1);
        assert_eq!(tree.children(&file_id(&file)).count(), 1);
    }
}
