mod config;
mod selector;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::{ColoredString, Colorize};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use config::Config;
use svunit_explorer::test_model::{NodeView, TestStatus};
use svunit_explorer::test_runner::{OutputStream, RunSummary, TestEvent};
use svunit_explorer::{
    Discovery, NodeKind, RunnerSettings, Selection, TestRunner, TreeStore, TreeWatcher,
};

const CONFIG_FILE: &str = "svx.toml";
const LOG_ENV: &str = "SVX_LOG";

#[derive(Parser)]
#[command(name = "svx")]
#[command(about = "Discover and run SVUnit tests with live results")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file (default: svx.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Workspace root to search (repeatable, overrides the config)
    #[arg(long = "root", global = true)]
    roots: Vec<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List discovered tests
    List {
        /// Print the tree as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run all tests, or those matching the selectors
    Run {
        /// Directory, test file, or `file_unit_test.sv:test_name`
        selectors: Vec<String>,

        /// Leave these out of the run
        #[arg(short, long)]
        exclude: Vec<String>,

        /// Simulator passed to the run command
        #[arg(short, long)]
        simulator: Option<String>,

        /// Command run before the tests, joined with `&&`
        #[arg(long)]
        setup: Option<String>,

        /// Echo raw runner output
        #[arg(long)]
        output: bool,
    },

    /// Keep the tree in sync with the filesystem
    Watch {
        /// Re-run the tests of every created or changed file
        #[arg(long)]
        run: bool,
    },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cwd = std::env::current_dir().context("Could not read the current directory")?;
    let (config, base_dir) = match cli.config {
        Some(path) => {
            let config = Config::load(&path)
                .with_context(|| format!("Could not load {}", path.display()))?;
            let base_dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(|p| cwd.join(p))
                .unwrap_or_else(|| cwd.clone());
            (config, base_dir)
        }
        None => (Config::load_or_default(&cwd.join(CONFIG_FILE))?, cwd.clone()),
    };

    let roots = if cli.roots.is_empty() {
        config.roots(&base_dir)
    } else {
        cli.roots.iter().map(|r| cwd.join(r)).collect()
    };

    let discovery = Discovery::new(TreeStore::new(), &config.discovery.test_file_pattern)?;
    let roots = discover(&discovery, &roots).await?;

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    match cli.command {
        Commands::List { json } => cmd_list(discovery.store(), json),
        Commands::Run {
            selectors,
            exclude,
            simulator,
            setup,
            output,
        } => {
            let mut settings = config.runner_settings();
            if let Some(simulator) = simulator {
                settings.simulator = simulator;
            }
            if let Some(setup) = setup {
                settings.setup_command = setup;
            }
            let selection = {
                let tree = discovery.store().read();
                let include = selector::resolve_all(&tree, &selectors, &cwd)?;
                let exclude = selector::resolve_all(&tree, &exclude, &cwd)?;
                Selection::including(include).excluding(exclude)
            };

            let summary = execute(discovery.store(), settings, &selection, &shutdown, output).await;
            print_summary(&summary);
            if !summary.success() {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Watch { run } => {
            cmd_watch(discovery, &roots, config.runner_settings(), run, &shutdown).await
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Discover every root; returns the canonical roots that were found.
async fn discover(discovery: &Discovery, roots: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for (root, result) in roots.iter().zip(discovery.discover_all(roots).await) {
        match result {
            Ok(report) => {
                for (path, reason) in &report.errors {
                    eprintln!("{} {}: {}", "⚠".yellow(), path.display(), reason.dimmed());
                }
                found.push(report.root);
            }
            Err(e) => eprintln!("{} Skipping root {}: {}", "⚠".yellow(), root.display(), e),
        }
    }

    if found.is_empty() {
        anyhow::bail!("None of the workspace roots could be searched");
    }
    Ok(found)
}

fn cmd_list(store: &TreeStore, json: bool) -> Result<()> {
    let views = store.read().snapshot();

    if json {
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }

    if views.is_empty() {
        println!("  {}", "No tests found".dimmed());
        return Ok(());
    }

    let count: usize = {
        let tree = store.read();
        tree.roots().map(|r| tree.test_count(&r.id)).sum()
    };
    println!("\n{} {} test(s)\n", "🔍".cyan(), count.to_string().bold());
    for view in &views {
        print_view(view, 0);
    }
    println!();
    Ok(())
}

fn print_view(view: &NodeView, depth: usize) {
    let indent = "  ".repeat(depth);
    let label = match view.kind {
        NodeKind::Root => view.label.bold().to_string(),
        NodeKind::Folder => view.label.cyan().to_string(),
        NodeKind::File => view.label.normal().to_string(),
        NodeKind::TestCase => format!("{} {}", TestStatus::Pending.symbol().dimmed(), view.label),
    };
    match &view.error {
        Some(error) => println!("{indent}{label} {}", error.red()),
        None => println!("{indent}{label}"),
    }
    for child in &view.children {
        print_view(child, depth + 1);
    }
}

/// Run `selection` while printing events as they arrive.
async fn execute(
    store: &TreeStore,
    settings: RunnerSettings,
    selection: &Selection,
    shutdown: &CancellationToken,
    show_output: bool,
) -> RunSummary {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer_store = store.clone();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&printer_store, &event, show_output);
        }
    });

    let mut runner = TestRunner::new(store.clone(), settings, tx).with_cancellation(shutdown.child_token());
    let summary = runner.run(selection).await;
    drop(runner);
    let _ = printer.await;
    summary
}

fn print_event(store: &TreeStore, event: &TestEvent, show_output: bool) {
    match event {
        TestEvent::Started { test_id } => {
            tracing::debug!(test = %test_id, "Test started");
        }
        TestEvent::Passed { test_id, duration_ms } => {
            println!(
                "  {} {} {}",
                TestStatus::Passed.symbol().color(TestStatus::Passed.color()),
                display_name(store, test_id),
                format!("({duration_ms}ms)").dimmed()
            );
        }
        TestEvent::Failed {
            test_id,
            messages,
            duration_ms,
        } => {
            println!(
                "  {} {} {}",
                TestStatus::Failed.symbol().color(TestStatus::Failed.color()),
                display_name(store, test_id).red(),
                format!("({duration_ms}ms)").dimmed()
            );
            for message in messages {
                let at = message
                    .location
                    .as_ref()
                    .map(|l| {
                        let line = l.range.map(|r| r.start_line + 1).unwrap_or(0);
                        format!("{}:{} ", l.path.display(), line)
                    })
                    .unwrap_or_default();
                println!("      {}{}: {}", at.dimmed(), message.check, message.message);
            }
        }
        TestEvent::Errored { test_id, message, .. } => {
            println!(
                "  {} {} {}",
                TestStatus::Errored.symbol().color(TestStatus::Errored.color()),
                display_name(store, test_id),
                message.dimmed()
            );
        }
        TestEvent::Output { text, stream, .. } => {
            if show_output {
                match stream {
                    OutputStream::Stdout => print!("{text}"),
                    OutputStream::Stderr => eprint!("{text}"),
                }
            }
        }
        TestEvent::Notification { message } => {
            eprintln!("{} {}", "⚠".yellow(), message);
        }
        TestEvent::RunEnded { cancelled } => {
            if *cancelled {
                println!("\n{}", "Run cancelled".yellow());
            }
        }
    }
}

/// `file_unit_test.sv::test` for test cases, the id otherwise.
fn display_name(store: &TreeStore, id: &str) -> String {
    let tree = store.read();
    let Some(node) = tree.get(id) else {
        return id.to_string();
    };
    match node.parent.as_deref().and_then(|p| tree.get(p)) {
        Some(file) if node.is_test() => format!("{}::{}", file.label, node.label),
        _ => node.label.clone(),
    }
}

fn print_summary(summary: &RunSummary) {
    println!();
    if summary.success() {
        println!(
            "{} {} test(s) passed {}",
            "✓".green(),
            summary.passed.to_string().green(),
            format!("in {}ms", summary.duration_ms()).dimmed()
        );
    } else {
        println!(
            "{} {} passed, {} failed, {} errored {}",
            "✗".red(),
            summary.passed.to_string().green(),
            summary.failed.to_string().red(),
            summary.errored.to_string().magenta(),
            format!("in {}ms", summary.duration_ms()).dimmed()
        );
    }
    if summary.folders_skipped > 0 {
        println!(
            "  {}",
            format!("{} folder(s) had nothing selected", summary.folders_skipped).dimmed()
        );
    }
}

async fn cmd_watch(
    discovery: Discovery,
    roots: &[PathBuf],
    settings: RunnerSettings,
    run_changed: bool,
    shutdown: &CancellationToken,
) -> Result<()> {
    let store = discovery.store().clone();
    let mut watcher = TreeWatcher::start(discovery, roots)?;

    for root in roots {
        println!("{} {} {}", "👀".cyan(), "Watching".bold(), root.display());
    }
    println!("{}", "Press Ctrl+C to stop\n".dimmed());

    loop {
        let batch = tokio::select! {
            _ = shutdown.cancelled() => break,
            batch = watcher.next_batch() => match batch {
                Some(batch) => batch,
                None => break,
            },
        };

        let applied = watcher.apply(&batch);
        for id in &applied.removed {
            print_file_change("-".red(), id, roots);
        }
        for id in &applied.updated {
            print_file_change("↻".yellow(), id, roots);
        }

        if run_changed && !applied.updated.is_empty() {
            let selection = Selection::including(applied.updated);
            let summary = execute(&store, settings.clone(), &selection, shutdown, false).await;
            print_summary(&summary);
            println!("\n{}", "Watching for changes...".dimmed());
        }
    }

    Ok(())
}

/// One line per test file the watcher added, re-parsed or removed.
fn print_file_change(symbol: ColoredString, file_id: &str, roots: &[PathBuf]) {
    let path = Path::new(file_id);
    let shown = roots
        .iter()
        .find_map(|r| path.strip_prefix(r).ok())
        .unwrap_or(path);
    println!("{} {}", symbol, shown.display().to_string().dimmed());
}
