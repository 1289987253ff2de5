//! SVUnit Explorer - SystemVerilog test explorer
//!
//! A library for discovering and running SVUnit tests with:
//! - Test discovery by scanning sources for `SVTEST` markers
//! - Root → Folder → File → TestCase tree kept in sync with the filesystem
//! - Compilation of a selection into `runSVUnit` filter arguments
//! - Per-folder runs with streaming output parsed into live test events

pub mod command;
pub mod discovery;
pub mod error;
pub mod filter;
pub mod marker;
pub mod output_parser;
pub mod test_model;
pub mod test_runner;
pub mod watcher;

pub use command::RunnerSettings;
pub use discovery::{Applied, Discovery, DiscoveryReport, FileEvent};
pub use error::{ExplorerError, Result};
pub use filter::{Selection, TestSelect};
pub use test_model::{NodeId, NodeKind, NodeView, TestStatus, TestTree, TreeNode, TreeStore};
pub use test_runner::{RunSummary, TestEvent, TestRunner};
pub use watcher::TreeWatcher;
