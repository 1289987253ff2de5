//! Streaming parser for `runSVUnit` output
//!
//! Consumes stdout in arbitrary chunks, reassembles lines, and turns the
//! SVUnit log grammar into started/passed/failed events for the tests of
//! one folder. Every byte is also forwarded as raw output, tagged with the
//! test that was running when it arrived.

use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;

use crate::marker::LineRange;
use crate::test_model::{Location, NodeId, TreeStore};
use crate::test_runner::{OutputStream, TestEvent, TestMessage};

static STATUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^INFO:\s+\[(\d+)\]\[(\w+)\]: (\w+)::(RUNNING|PASSED|FAILED)")
        .expect("status line regex")
});

static FAILURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^ERROR:\s+\[(\d+)\]\[(\w+)\]: (\w+): (.*) \(at (?:(.+?) line:(\d+)|(.+):(\d+))\)")
        .expect("failure line regex")
});

/// Prefix of the runner's fatal usage message.
pub const USAGE_PREFIX: &str = "Usage:";

const ANSI_RED: &str = "\x1b[31m";
const ANSI_RESET: &str = "\x1b[0m";

/// Splits a byte stream into complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every line it completes, without the
    /// trailing newline. The unterminated tail stays buffered.
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.partial.push_str(chunk);
        let Some(last_newline) = self.partial.rfind('\n') else {
            return Vec::new();
        };
        let rest = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, rest);
        complete
            .strip_suffix('\n')
            .unwrap_or(&complete)
            .split('\n')
            .map(str::to_string)
            .collect()
    }

    pub fn partial(&self) -> &str {
        &self.partial
    }

    /// Remove and return the unterminated tail, if any.
    pub fn take_partial(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.partial);
        (!rest.is_empty()).then_some(rest)
    }
}

/// Status reported on an `INFO:` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    Running,
    Passed,
    Failed,
}

/// One recognised line of runner output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    Status {
        short_file: String,
        test_name: String,
        status: LineStatus,
    },
    Failure {
        check: String,
        message: String,
        file: PathBuf,
        /// One-based, as printed.
        line: usize,
    },
    Usage(String),
    Other,
}

/// Classify a single complete line.
pub fn parse_line(line: &str) -> ParsedLine {
    if let Some(caps) = STATUS_RE.captures(line) {
        let status = match &caps[4] {
            "RUNNING" => LineStatus::Running,
            "PASSED" => LineStatus::Passed,
            _ => LineStatus::Failed,
        };
        return ParsedLine::Status {
            short_file: caps[2].to_string(),
            test_name: caps[3].to_string(),
            status,
        };
    }

    if let Some(caps) = FAILURE_RE.captures(line) {
        let (file, line_no) = match (caps.get(5), caps.get(6)) {
            (Some(file), Some(line_no)) => (file.as_str(), line_no.as_str()),
            _ => (
                caps.get(7).map_or("", |m| m.as_str()),
                caps.get(8).map_or("", |m| m.as_str()),
            ),
        };
        if let Ok(line_no) = line_no.parse::<usize>() {
            return ParsedLine::Failure {
                check: caps[3].to_string(),
                message: caps[4].to_string(),
                file: PathBuf::from(file),
                line: line_no,
            };
        }
    }

    if line.starts_with(USAGE_PREFIX) {
        return ParsedLine::Usage(line.to_string());
    }

    ParsedLine::Other
}

/// Why a parser is being finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Exited(Option<i32>),
    Cancelled,
}

/// Terminal events emitted by one parser.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseCounts {
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
}

/// Per-invocation output state machine.
pub struct OutputParser {
    store: TreeStore,
    folder_id: NodeId,
    cwd: PathBuf,
    events: UnboundedSender<TestEvent>,
    stdout: LineBuffer,
    /// Bytes of the buffered partial line already forwarded as output.
    echoed: usize,
    current_test: Option<NodeId>,
    failure_messages: Vec<TestMessage>,
    started_at: Instant,
    counts: ParseCounts,
}

impl OutputParser {
    pub fn new(
        store: TreeStore,
        folder_id: impl Into<NodeId>,
        cwd: impl Into<PathBuf>,
        events: UnboundedSender<TestEvent>,
    ) -> Self {
        Self {
            store,
            folder_id: folder_id.into(),
            cwd: cwd.into(),
            events,
            stdout: LineBuffer::new(),
            echoed: 0,
            current_test: None,
            failure_messages: Vec::new(),
            started_at: Instant::now(),
            counts: ParseCounts::default(),
        }
    }

    pub fn current_test(&self) -> Option<&str> {
        self.current_test.as_deref()
    }

    pub fn counts(&self) -> ParseCounts {
        self.counts
    }

    /// Consume a chunk of stdout.
    pub fn feed_stdout(&mut self, chunk: &str) {
        let lines = self.stdout.feed(chunk);
        for (i, line) in lines.iter().enumerate() {
            let already_echoed = if i == 0 { std::mem::take(&mut self.echoed) } else { 0 };
            self.process_line(line, already_echoed);
        }

        // Forward the new part of an unfinished line right away.
        let partial = self.stdout.partial();
        if partial.len() > self.echoed {
            let text = partial[self.echoed..].to_string();
            self.echoed = partial.len();
            self.emit_output(text, OutputStream::Stdout);
        }
    }

    /// Consume a chunk of stderr. Never parsed for status.
    pub fn feed_stderr(&mut self, chunk: &str) {
        let text = format!("{ANSI_RED}{}{ANSI_RESET}", normalize_newlines(chunk));
        self.emit_output(text, OutputStream::Stderr);
    }

    /// Flush the last partial line and close out a test left running.
    pub fn finish(mut self, reason: FinishReason) -> ParseCounts {
        if let Some(tail) = self.stdout.take_partial() {
            let already_echoed = std::mem::take(&mut self.echoed);
            self.process_line(&tail, already_echoed);
        }

        if let Some(test_id) = self.current_test.take() {
            let message = match reason {
                FinishReason::Exited(Some(code)) => {
                    format!("Runner exited with code {code} before the test finished")
                }
                FinishReason::Exited(None) => {
                    "Runner was terminated before the test finished".to_string()
                }
                FinishReason::Cancelled => "Run cancelled before the test finished".to_string(),
            };
            tracing::warn!(test = %test_id, %message, "Test left without a result");
            self.counts.errored += 1;
            let _ = self.events.send(TestEvent::Errored {
                test_id,
                message,
                duration_ms: self.elapsed_ms(),
            });
        }
        self.counts
    }

    fn process_line(&mut self, raw: &str, already_echoed: usize) {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        let mut done = false;

        match parse_line(line) {
            ParsedLine::Status {
                short_file,
                test_name,
                status,
            } => {
                let resolved = {
                    let tree = self.store.read();
                    tree.find_test(&self.folder_id, &short_file, &test_name)
                        .map(|t| t.id.clone())
                };
                match resolved {
                    Some(test_id) => {
                        done = self.apply_status(test_id, status);
                    }
                    None => {
                        tracing::debug!(%short_file, %test_name, "Status for unknown test");
                    }
                }
            }
            ParsedLine::Failure {
                check,
                message,
                file,
                line: line_no,
            } => {
                if self.current_test.is_some() {
                    let path = self.cwd.join(&file);
                    let at = line_no.saturating_sub(1);
                    self.failure_messages.push(TestMessage {
                        check,
                        message,
                        location: Some(Location::span(path, point(at))),
                    });
                }
            }
            ParsedLine::Usage(text) => {
                tracing::warn!(%text, "Runner reported a usage error");
                let _ = self.events.send(TestEvent::Notification { message: text });
            }
            ParsedLine::Other => {}
        }

        let echo = raw.get(already_echoed..).unwrap_or("");
        let echo = echo.strip_suffix('\r').unwrap_or(echo);
        self.emit_output(format!("{echo}\r\n"), OutputStream::Stdout);

        if done {
            self.current_test = None;
        }
    }

    /// Returns true when the status ends the test.
    fn apply_status(&mut self, test_id: NodeId, status: LineStatus) -> bool {
        match status {
            LineStatus::Running => {
                self.started_at = Instant::now();
                self.failure_messages.clear();
                self.current_test = Some(test_id.clone());
                let _ = self.events.send(TestEvent::Started { test_id });
                false
            }
            LineStatus::Passed => {
                self.current_test = Some(test_id.clone());
                self.counts.passed += 1;
                let _ = self.events.send(TestEvent::Passed {
                    test_id,
                    duration_ms: self.elapsed_ms(),
                });
                true
            }
            LineStatus::Failed => {
                self.current_test = Some(test_id.clone());
                self.counts.failed += 1;
                let _ = self.events.send(TestEvent::Failed {
                    test_id,
                    messages: std::mem::take(&mut self.failure_messages),
                    duration_ms: self.elapsed_ms(),
                });
                true
            }
        }
    }

    fn emit_output(&self, text: String, stream: OutputStream) {
        let _ = self.events.send(TestEvent::Output {
            test_id: self.current_test.clone(),
            text,
            stream,
        });
    }

    fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

fn point(line: usize) -> LineRange {
    LineRange {
        start_line: line,
        start_column: 0,
        end_line: line,
        end_column: 0,
    }
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', "\r\n")
}
