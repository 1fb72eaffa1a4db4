//! vibe-preview: build and preview generated apps from the command line.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use vibe_preview_lib::models::RunDisposition;
use vibe_preview_lib::{
    stream, telemetry, FileMap, LocalBooter, PreviewOrchestrator, PreviewRequest, PreviewSettings, ReportStore,
    SessionManager,
};

#[derive(Parser, Debug)]
#[command(name = "vibe-preview", about = "Preview build orchestrator for generated web apps", version)]
struct Args {
    /// JSON settings file layered over the defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Write JSON logs to a daily rolling file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Emit JSON logs on stderr
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Install, start and await the first render of a generated app
    Run {
        /// JSON object mapping file paths to contents
        #[arg(long, conflicts_with = "stream", required_unless_present = "stream")]
        files: Option<PathBuf>,

        /// Recorded generation event stream (`data: {...}` frames)
        #[arg(long)]
        stream: Option<PathBuf>,

        #[arg(long, default_value = "")]
        prompt: String,

        #[arg(long, default_value = "default")]
        theme: String,

        /// Read preview messages (one JSON object per line) from stdin
        #[arg(long)]
        messages_from_stdin: bool,

        /// Skip persisting the build report
        #[arg(long)]
        no_save: bool,
    },
    /// List persisted build reports, or print one in full
    Reports {
        #[arg(long, default_value_t = 20)]
        limit: u32,

        /// Print the full report for this run id
        #[arg(long)]
        show: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    telemetry::init_tracing(args.log_dir.as_deref(), args.json_logs)
        .map_err(|error| anyhow::anyhow!("failed to initialize logging: {}", error))?;

    let settings = PreviewSettings::load(args.config.as_deref())?;

    match args.command {
        Command::Run {
            files,
            stream,
            prompt,
            theme,
            messages_from_stdin,
            no_save,
        } => {
            let files = load_files(files.as_deref(), stream.as_deref())?;
            let request = PreviewRequest {
                files,
                prompt,
                theme_name: theme,
            };
            run_preview(settings, request, messages_from_stdin, no_save).await
        }
        Command::Reports { limit, show } => {
            let store = open_store(&settings)?;
            match show {
                Some(run_id) => {
                    let report = store
                        .get_report(&run_id)?
                        .with_context(|| format!("no report for run {}", run_id))?;
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                None => {
                    for summary in store.list_reports(limit)? {
                        println!("{}", serde_json::to_string(&summary)?);
                    }
                }
            }
            Ok(())
        }
    }
}

fn load_files(files: Option<&Path>, stream: Option<&Path>) -> Result<FileMap> {
    if let Some(path) = files {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        return serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()));
    }
    let path = stream.context("either --files or --stream is required")?;
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(stream::collect_files(&raw)?)
}

fn open_store(settings: &PreviewSettings) -> Result<ReportStore> {
    let path = settings
        .report_database
        .clone()
        .unwrap_or_else(|| settings.sandbox_root.join("reports.db"));
    Ok(ReportStore::open(&path)?)
}

async fn run_preview(
    settings: PreviewSettings,
    request: PreviewRequest,
    messages_from_stdin: bool,
    no_save: bool,
) -> Result<()> {
    let store = if no_save { None } else { Some(open_store(&settings)?) };
    let sessions = Arc::new(SessionManager::new(Arc::new(LocalBooter::new(
        settings.sandbox_root.clone(),
    ))));
    let retention = settings.report_retention;
    let orchestrator = PreviewOrchestrator::new(sessions.clone(), settings);

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                eprintln!("{}", line);
            }
        }
    });

    if messages_from_stdin {
        let inbox = orchestrator.inbox();
        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                if let Err(error) = inbox.deliver_str(&line) {
                    tracing::warn!(error = %error, "rejected preview message");
                }
            }
        });
    }

    let outcome = tokio::select! {
        outcome = orchestrator.run(request) => Some(outcome),
        _ = tokio::signal::ctrl_c() => None,
    };
    sessions.teardown().await;

    let Some(outcome) = outcome else {
        orchestrator.cancel();
        anyhow::bail!("interrupted");
    };

    if let (Some(store), Some(report)) = (store.as_ref(), outcome.report.as_ref()) {
        store.save_report(report)?;
        let pruned = store.prune(retention)?;
        if pruned > 0 {
            tracing::info!(pruned, "pruned old build reports");
        }
    }

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if outcome.disposition == RunDisposition::Failed {
        std::process::exit(1);
    }
    Ok(())
}
