use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tcrawl_adapters::{
    adapter_for_target, TrackerTarget, DEFAULT_BUGZILLA_URL, DEFAULT_JIRA_URL, DEFAULT_MYSQL_URL,
};
use tcrawl_sync::{CrawlConfig, CrawlPipeline, CrawlRunSummary};
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "tcrawl")]
#[command(about = "Crawl issue trackers into JSON and CSV snapshots")]
struct Cli {
    /// Root directory for cached pages, outputs and logs.
    #[arg(long, global = true, env = "DATA")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl a Bugzilla product through the REST API.
    Bugzilla {
        #[arg(long)]
        project_name: String,
        #[arg(long, default_value = DEFAULT_BUGZILLA_URL)]
        project_issue_url: String,
        #[arg(long)]
        page_size: Option<usize>,
    },
    /// Crawl a Jira project through the v2 search API.
    Jira {
        #[arg(long)]
        project_name: String,
        #[arg(long)]
        project_key: String,
        #[arg(long, default_value = DEFAULT_JIRA_URL)]
        project_issue_url: String,
        #[arg(long)]
        component: Option<String>,
        #[arg(long)]
        page_size: Option<usize>,
    },
    /// Crawl one bug category of bugs.mysql.com.
    Mysql {
        #[arg(long = "type")]
        bug_type: String,
        #[arg(long, default_value = DEFAULT_MYSQL_URL)]
        base_url: String,
    },
}

impl Commands {
    fn into_target(self) -> TrackerTarget {
        match self {
            Commands::Bugzilla {
                project_name,
                project_issue_url,
                page_size,
            } => TrackerTarget::Bugzilla {
                base_url: project_issue_url,
                project_name,
                page_size,
            },
            Commands::Jira {
                project_name,
                project_key,
                project_issue_url,
                component,
                page_size,
            } => TrackerTarget::Jira {
                base_url: project_issue_url,
                project_name,
                project_key,
                component,
                page_size,
            },
            Commands::Mysql { bug_type, base_url } => TrackerTarget::Mysql { base_url, bug_type },
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut config = CrawlConfig::from_env();
    if let Some(data_dir) = cli.data_dir {
        config = config.with_data_dir(data_dir);
    }

    let target = cli.command.into_target();
    let pipeline = match CrawlPipeline::new(config, adapter_for_target(&target)) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            eprintln!("failed to set up crawler: {e:#}");
            return ExitCode::from(2);
        }
    };

    if let Err(e) = init_tracing(&pipeline.layout().log_path()) {
        eprintln!("failed to open crawl log: {e:#}");
        return ExitCode::from(2);
    }

    match pipeline.run_once().await {
        Ok(summary) => {
            print_summary(&summary);
            if summary.has_failures() {
                ExitCode::from(1)
            } else {
                ExitCode::from(0)
            }
        }
        Err(e) => {
            let message = format!("{e:#}");
            error!(error = %message, "crawl aborted");
            ExitCode::from(2)
        }
    }
}

/// Console output plus an append-only `crawl.log` next to the outputs.
/// Filtering follows `RUST_LOG`, defaulting to `info`.
fn init_tracing(log_path: &Path) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("opening {}", log_path.display()))?;

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(std::sync::Mutex::new(log_file)),
        )
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    Ok(())
}

fn print_summary(summary: &CrawlRunSummary) {
    println!(
        "crawl complete: run_id={} tracker={} project={} issues={} duplicates={} missing_fields={} pages={}/{} cached={}",
        summary.run_id,
        summary.tracker,
        summary.project,
        summary.issues_saved,
        summary.duplicates,
        summary.missing_fields,
        summary.pages_from_cache + summary.pages_fetched,
        summary.pages_planned,
        summary.pages_from_cache,
    );
    println!("  json: {}", summary.json_path);
    println!("  csv:  {}", summary.csv_path);
    for failure in &summary.failed_pages {
        println!("  failed page {}: {}", failure.index, failure.error);
    }
}
