//! Test runner module
//!
//! Drives `runSVUnit` once per folder, strictly one subprocess at a time,
//! and streams its output through an [`OutputParser`] into a channel of
//! [`TestEvent`]s.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::command::RunnerSettings;
use crate::error::ExplorerError;
use crate::filter::{self, Selection, TestSelect};
use crate::output_parser::{FinishReason, OutputParser};
use crate::test_model::{Location, NodeId, NodeKind, TreeStore};

const READ_BUFFER: usize = 8 * 1024;

/// Which pipe a piece of raw output came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One diagnostic attached to a failed test
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestMessage {
    pub check: String,
    pub message: String,
    pub location: Option<Location>,
}

/// Event from the test runner
#[derive(Debug, Clone)]
pub enum TestEvent {
    /// A test reported RUNNING
    Started { test_id: NodeId },
    Passed { test_id: NodeId, duration_ms: u64 },
    Failed {
        test_id: NodeId,
        messages: Vec<TestMessage>,
        duration_ms: u64,
    },
    /// The runner went away before the test reported a result
    Errored {
        test_id: NodeId,
        message: String,
        duration_ms: u64,
    },
    /// Raw runner output, tagged with the test running at the time
    Output {
        test_id: Option<NodeId>,
        text: String,
        stream: OutputStream,
    },
    /// Something the user has to see, outside any single test
    Notification { message: String },
    /// The run reached its terminal state
    RunEnded { cancelled: bool },
}

/// Chunk of subprocess output on its way to the parser
#[derive(Debug)]
enum OutputChunk {
    Stdout(String),
    Stderr(String),
}

/// Lifecycle of one run request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    /// Index into the sorted folder list
    Running(usize),
    Ended,
}

/// Totals for one run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub folders_run: usize,
    pub folders_skipped: usize,
    pub cancelled: bool,
}

impl RunSummary {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            passed: 0,
            failed: 0,
            errored: 0,
            folders_run: 0,
            folders_skipped: 0,
            cancelled: false,
        }
    }

    pub fn success(&self) -> bool {
        self.failed == 0 && self.errored == 0
    }

    pub fn duration_ms(&self) -> i64 {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
            .unwrap_or(0)
    }
}

/// A folder scheduled for this run
#[derive(Debug, Clone)]
struct FolderJob {
    id: NodeId,
    label: String,
    cwd: PathBuf,
}

/// Sequential per-folder test runner
pub struct TestRunner {
    store: TreeStore,
    settings: RunnerSettings,
    events: UnboundedSender<TestEvent>,
    cancel: CancellationToken,
    state: RunState,
}

impl TestRunner {
    pub fn new(store: TreeStore, settings: RunnerSettings, events: UnboundedSender<TestEvent>) -> Self {
        Self {
            store,
            settings,
            events,
            cancel: CancellationToken::new(),
            state: RunState::Pending,
        }
    }

    /// Share an externally owned cancellation token (e.g. bound to Ctrl-C)
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Run every folder that has selected work, in label order.
    ///
    /// Launch failures only abort their own folder. Cancellation kills the
    /// active runner and ends the run before any further folder starts.
    pub async fn run(&mut self, selection: &Selection) -> RunSummary {
        let mut summary = RunSummary::new();
        let folders = self.folders();
        tracing::info!(run = %summary.run_id, folders = folders.len(), "Starting test run");
        self.state = RunState::Running(0);

        for (index, folder) in folders.iter().enumerate() {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            self.state = RunState::Running(index);

            let select = {
                let tree = self.store.read();
                filter::compile(&tree, &folder.id, selection)
            };
            let Some(select) = select else {
                tracing::debug!(folder = %folder.label, "Nothing selected, skipping folder");
                summary.folders_skipped += 1;
                continue;
            };

            summary.folders_run += 1;
            if self.run_folder(folder, &select, &mut summary).await == FolderOutcome::Cancelled {
                summary.cancelled = true;
                break;
            }
        }

        self.end(summary.cancelled);
        summary.finished_at = Some(Utc::now());
        tracing::info!(
            run = %summary.run_id,
            passed = summary.passed,
            failed = summary.failed,
            errored = summary.errored,
            cancelled = summary.cancelled,
            "Test run ended"
        );
        summary
    }

    /// Move to the terminal state. Only the first call emits `RunEnded`.
    fn end(&mut self, cancelled: bool) {
        if self.state == RunState::Ended {
            return;
        }
        self.state = RunState::Ended;
        let _ = self.events.send(TestEvent::RunEnded { cancelled });
    }

    /// Folders of every visible root, each root's folders sorted by label.
    fn folders(&self) -> Vec<FolderJob> {
        let tree = self.store.read();
        let mut jobs = Vec::new();
        for root in tree.roots() {
            let mut folders: Vec<FolderJob> = tree
                .children(&root.id)
                .filter(|c| c.kind == NodeKind::Folder)
                .filter_map(|f| {
                    f.path().map(|cwd| FolderJob {
                        id: f.id.clone(),
                        label: f.label.clone(),
                        cwd: cwd.to_path_buf(),
                    })
                })
                .collect();
            folders.sort_by(|a, b| a.label.cmp(&b.label));
            jobs.extend(folders);
        }
        jobs
    }

    async fn run_folder(&self, folder: &FolderJob, select: &TestSelect, summary: &mut RunSummary) -> FolderOutcome {
        let command = self.settings.resolve(&select.to_string());
        self.transcript(&format!("cd {}", folder.cwd.display()));
        self.transcript(&command);
        self.transcript(&format!("Processing folder: {}", folder.label));
        tracing::info!(folder = %folder.label, %command, "Processing folder");

        let mut child = match spawn_runner(&command, folder) {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(error = %e, "Could not start runner");
                let _ = self.events.send(TestEvent::Notification { message: e.to_string() });
                self.transcript(&e.to_string());
                return FolderOutcome::LaunchFailed;
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, tx.clone(), OutputChunk::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, tx.clone(), OutputChunk::Stderr);
        }
        drop(tx);

        let mut parser = OutputParser::new(
            self.store.clone(),
            folder.id.clone(),
            folder.cwd.clone(),
            self.events.clone(),
        );

        let reason = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    let reason = kill(&mut child, &folder.label).await;
                    drain_queued(&mut rx, &mut parser);
                    break reason;
                }
                chunk = rx.recv() => match chunk {
                    Some(chunk) => feed(&mut parser, chunk),
                    None => break wait_for_exit(&mut child, &self.cancel, &folder.label).await,
                },
            }
        };

        let counts = parser.finish(reason);
        summary.passed += counts.passed;
        summary.failed += counts.failed;
        summary.errored += counts.errored;

        if reason == FinishReason::Cancelled {
            FolderOutcome::Cancelled
        } else {
            FolderOutcome::Completed
        }
    }

    fn transcript(&self, line: &str) {
        let _ = self.events.send(TestEvent::Output {
            test_id: None,
            text: format!("{line}\r\n"),
            stream: OutputStream::Stdout,
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FolderOutcome {
    Completed,
    LaunchFailed,
    Cancelled,
}

/// The runner gets its own process group so that cancelling reaches the
/// setup command, `runSVUnit` and the simulator alike.
fn spawn_runner(command: &str, folder: &FolderJob) -> Result<Child, ExplorerError> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(&folder.cwd)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    cmd.spawn().map_err(|source| ExplorerError::Launch {
        folder: folder.label.clone(),
        command: command.to_string(),
        source,
    })
}

async fn kill(child: &mut Child, folder: &str) -> FinishReason {
    tracing::info!(%folder, "Run cancelled, killing runner");
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            kill_process_group(pid).await;
        }
    }
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "Runner already gone");
    }
    FinishReason::Cancelled
}

/// SIGKILL every process in the group led by `pgid`.
#[cfg(unix)]
async fn kill_process_group(pgid: u32) {
    let result = Command::new("kill")
        .args(["-9", "--", &format!("-{pgid}")])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await;
    match result {
        Ok(status) if status.success() => {}
        Ok(status) => tracing::debug!(pgid, code = ?status.code(), "Process group already gone"),
        Err(e) => tracing::warn!(pgid, error = %e, "Could not signal runner process group"),
    }
}

fn feed(parser: &mut OutputParser, chunk: OutputChunk) {
    match chunk {
        OutputChunk::Stdout(text) => parser.feed_stdout(&text),
        OutputChunk::Stderr(text) => parser.feed_stderr(&text),
    }
}

/// Hand over output that was read before the runner was killed.
fn drain_queued(rx: &mut UnboundedReceiver<OutputChunk>, parser: &mut OutputParser) {
    while let Ok(chunk) = rx.try_recv() {
        feed(parser, chunk);
    }
}

/// Both pipes are closed; wait for the exit status unless cancelled first.
async fn wait_for_exit(child: &mut Child, cancel: &CancellationToken, folder: &str) -> FinishReason {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => kill(child, folder).await,
        status = child.wait() => match status {
            Ok(status) => {
                tracing::info!(%folder, code = ?status.code(), "Runner exited");
                FinishReason::Exited(status.code())
            }
            Err(e) => {
                tracing::warn!(%folder, error = %e, "Could not wait for runner");
                FinishReason::Exited(None)
            }
        },
    }
}

/// Forward everything read from `reader` until EOF.
fn spawn_reader<R>(mut reader: R, tx: UnboundedSender<OutputChunk>, wrap: fn(String) -> OutputChunk)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUFFER];
        let mut decoder = Utf8Decoder::default();
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let text = decoder.decode(&buf[..n]);
                    if !text.is_empty() && tx.send(wrap(text)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Runner output stream failed");
                    break;
                }
            }
        }
        let rest = decoder.finish();
        if !rest.is_empty() {
            let _ = tx.send(wrap(rest));
        }
    });
}

/// Decodes UTF-8 across read boundaries, holding back split sequences.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).to_string();
        self.pending.clear();
        rest
    }
}
