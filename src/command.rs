//! Runner command templates
//!
//! The run command is a shell template with two tokens: `$SIMULATOR` and
//! `$TEST_SELECT`. Extra templates may be keyed by simulator name as
//! `"<simulator>: <command>"`.

use serde::{Deserialize, Serialize};

pub const SIMULATOR_TOKEN: &str = "$SIMULATOR";
pub const TEST_SELECT_TOKEN: &str = "$TEST_SELECT";
pub const DEFAULT_SIMULATOR: &str = "verilator";
pub const DEFAULT_RUN_COMMAND: &str = "runSVUnit -s $SIMULATOR $TEST_SELECT";

/// Resolved runner settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerSettings {
    pub simulator: String,
    /// Run before the test command, joined with `&&`.
    pub setup_command: String,
    /// First entry is the default; later `sim: cmd` entries override it
    /// for that simulator.
    pub run_commands: Vec<String>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            simulator: DEFAULT_SIMULATOR.to_string(),
            setup_command: String::new(),
            run_commands: vec![DEFAULT_RUN_COMMAND.to_string()],
        }
    }
}

impl RunnerSettings {
    /// The template chosen for the configured simulator.
    pub fn template(&self) -> &str {
        let Some((default, keyed)) = self.run_commands.split_first() else {
            return DEFAULT_RUN_COMMAND;
        };
        let prefix = format!("{}: ", self.simulator);
        keyed
            .iter()
            .filter_map(|c| c.strip_prefix(&prefix))
            .last()
            .unwrap_or(default.as_str())
    }

    /// Build the shell command line for one folder's test selection.
    pub fn resolve(&self, test_select: &str) -> String {
        let command = self
            .template()
            .replace(SIMULATOR_TOKEN, &self.simulator)
            .replace(TEST_SELECT_TOKEN, test_select);
        if self.setup_command.is_empty() {
            command
        } else {
            format!("{} && {}", self.setup_command, command)
        }
    }
}
