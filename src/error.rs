//! Error types for the explorer library.
//!
//! Failures are contained at the smallest scope that can absorb them: a
//! read error stays on its File node, a malformed output line is dropped,
//! and a launch failure only aborts its own folder. The variants here are
//! the ones that actually cross a function boundary.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExplorerError {
    /// A test file could not be read during discovery.
    #[error("Failed to read test file '{path}': {source}")]
    DiscoveryRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configured test file pattern is not a valid glob.
    #[error("Invalid test file pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    /// The runner subprocess could not be started.
    #[error("Failed to launch '{command}' in folder '{folder}': {source}")]
    Launch {
        folder: String,
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A node id was passed that the tree does not contain.
    #[error("Unknown tree node: {id}")]
    UnknownNode { id: String },

    /// A command line selector did not match any discovered node.
    #[error("No test, file or folder matches '{selector}'")]
    UnresolvedSelector { selector: String },

    /// Configuration values failed validation.
    #[error("Invalid configuration in {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Watch(#[from] notify::Error),
}

pub type Result<T> = std::result::Result<T, ExplorerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_error_message_names_folder_and_command() {
        let err = ExplorerError::Launch {
            folder: "tests/".to_string(),
            command: "runSVUnit".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        let text = err.to_string();
        assert!(text.contains("tests/"));
        assert!(text.contains("runSVUnit"));
    }
}
