use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use svunit_explorer::command::{RunnerSettings, DEFAULT_RUN_COMMAND, DEFAULT_SIMULATOR};
use svunit_explorer::discovery::DEFAULT_TEST_FILE_PATTERN;
use svunit_explorer::ExplorerError;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runner: RunnerSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
}

#[derive(Debug, Deserialize)]
pub struct RunnerSection {
    #[serde(default = "default_simulator")]
    pub simulator: String,
    #[serde(default)]
    pub setup_command: String,
    #[serde(default = "default_run_commands")]
    pub run_commands: Vec<String>,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            simulator: default_simulator(),
            setup_command: String::new(),
            run_commands: default_run_commands(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DiscoverySection {
    /// Workspace roots, relative to the config file
    #[serde(default = "default_roots")]
    pub roots: Vec<String>,
    #[serde(default = "default_pattern")]
    pub test_file_pattern: String,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            roots: default_roots(),
            test_file_pattern: default_pattern(),
        }
    }
}

fn default_simulator() -> String {
    DEFAULT_SIMULATOR.to_string()
}

fn default_run_commands() -> Vec<String> {
    vec![DEFAULT_RUN_COMMAND.to_string()]
}

fn default_roots() -> Vec<String> {
    vec![".".to_string()]
}

fn default_pattern() -> String {
    DEFAULT_TEST_FILE_PATTERN.to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        config.validate().map_err(|e| ExplorerError::Config {
            path: path.to_path_buf(),
            reason: format!("{e:#}"),
        })?;

        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        let Some(first) = self.runner.run_commands.first() else {
            anyhow::bail!("runner.run_commands must contain at least one command");
        };

        if first.starts_with(&format!("{}: ", self.runner.simulator)) {
            anyhow::bail!(
                "The first run command is the default and cannot be keyed to a simulator: '{}'",
                first
            );
        }

        if self.discovery.roots.is_empty() {
            anyhow::bail!("discovery.roots must name at least one directory");
        }

        glob::Pattern::new(&self.discovery.test_file_pattern).with_context(|| {
            format!(
                "Invalid discovery.test_file_pattern '{}'",
                self.discovery.test_file_pattern
            )
        })?;

        Ok(())
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            simulator: self.runner.simulator.clone(),
            setup_command: self.runner.setup_command.clone(),
            run_commands: self.runner.run_commands.clone(),
        }
    }

    /// Roots resolved against `base_dir`.
    pub fn roots(&self, base_dir: &Path) -> Vec<PathBuf> {
        self.discovery
            .roots
            .iter()
            .map(|r| base_dir.join(r))
            .collect()
    }
}
