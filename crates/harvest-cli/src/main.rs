use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use harvest_core::{CollectionWindow, TargetSpan};
use harvest_storage::PersistenceWriter;
use harvest_sync::{log_run_result, run_sources, HarvestRuntime, RunReport, RunRequest};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt as tfmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "harvest-cli")]
#[command(about = "Incremental harvest and dedup engine")]
struct Cli {
    /// Print run reports as JSON.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect the next window for one source.
    Run {
        #[arg(long)]
        source: String,
        /// Window length such as 30d, 2w or 1m; defaults to the registry value.
        #[arg(long)]
        span: Option<TargetSpan>,
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long)]
        dry_run: bool,
        /// Collect exactly [from, to) instead of resolving a window (RFC 3339).
        #[arg(long, requires = "to")]
        from: Option<DateTime<Utc>>,
        #[arg(long, requires = "from")]
        to: Option<DateTime<Utc>>,
    },
    /// Collect the next window for every enabled source, concurrently.
    RunAll,
    /// Run enabled sources on the HARVEST_CRON schedule until interrupted.
    Schedule,
    /// Print the covered windows and seen-set sizes of a source.
    Status {
        #[arg(long)]
        source: String,
    },
    /// Forget a source's tracking state (and any stale lease) so the next run starts cold.
    Reset {
        #[arg(long)]
        source: String,
    },
    /// Remove a source's lease left behind by a crashed run; tracking state is kept.
    Unlock {
        #[arg(long)]
        source: String,
    },
    /// Rebuild a source's tracking state from its artifacts.
    Rebuild {
        #[arg(long)]
        source: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let cli = Cli::parse();
    let runtime = HarvestRuntime::from_env().await?;
    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    match cli.command.unwrap_or(Commands::RunAll) {
        Commands::Run {
            source,
            span,
            concurrency,
            dry_run,
            from,
            to,
        } => {
            let harvest_source = runtime.source(&source)?;
            let mut request = RunRequest::for_source(&harvest_source).dry_run(dry_run);
            if let Some(span) = span {
                request.target_span = span;
            }
            if let Some(limit) = concurrency {
                request.concurrency_limit = limit;
            }
            if let (Some(from), Some(to)) = (from, to) {
                if from >= to {
                    bail!("--from must be before --to");
                }
                request = request.with_window(CollectionWindow::new(&source, from, to));
            }
            let report = runtime
                .orchestrator
                .run(&harvest_source, &request, &cancel)
                .await
                .with_context(|| format!("harvest run for {source}"))?;
            print_report(&report, cli.json)?;
        }
        Commands::RunAll => {
            let sources = runtime.enabled_sources();
            if sources.is_empty() {
                warn!("no enabled sources in registry");
            }
            let mut failures = 0usize;
            for (source_id, result) in run_sources(runtime.orchestrator.clone(), &sources, &cancel).await {
                log_run_result(&source_id, &result);
                match result {
                    Ok(report) => print_report(&report, cli.json)?,
                    Err(err) => {
                        failures += 1;
                        eprintln!("{source_id}: {err}");
                    }
                }
            }
            if failures > 0 {
                bail!("{failures} of {} sources failed", sources.len());
            }
        }
        Commands::Schedule => {
            let Some(mut scheduler) = runtime.maybe_build_scheduler(cancel.clone()).await? else {
                bail!("scheduler disabled; set HARVEST_SCHEDULER_ENABLED=true");
            };
            scheduler.start().await.context("starting scheduler")?;
            info!(cron = %runtime.config.harvest_cron, "scheduler running; ctrl-c to stop");
            cancel.cancelled().await;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Status { source } => {
            let harvest_source = runtime.source(&source)?;
            let state = runtime.orchestrator.persistence().load_tracking(&source).await?;
            println!(
                "{source} ({}{}): windows={} seen_keys={} seen_hashes={} last_run_at={}",
                harvest_source.display_name,
                if harvest_source.enabled { "" } else { ", disabled" },
                state.covered_windows.len(),
                state.seen_entity_keys.len(),
                state.seen_hashes.len(),
                state
                    .last_run_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string())
            );
            if let Some(notes) = &harvest_source.notes {
                println!("  notes   {notes}");
            }
            for span in &state.covered_windows {
                println!("  covered [{} .. {})", span.start.to_rfc3339(), span.end.to_rfc3339());
            }
            for gap in state.gaps() {
                println!("  gap     [{} .. {})", gap.start.to_rfc3339(), gap.end.to_rfc3339());
            }
        }
        Commands::Reset { source } => {
            runtime.source(&source)?;
            let removed = runtime.orchestrator.persistence().reset_tracking(&source).await?;
            println!("{source}: tracking state {}", if removed { "reset" } else { "already empty" });
        }
        Commands::Unlock { source } => {
            runtime.source(&source)?;
            let removed = runtime.orchestrator.persistence().clear_lease(&source).await?;
            if removed {
                warn!(source_id = %source, "lease removed by operator");
            }
            println!("{source}: lease {}", if removed { "removed" } else { "not held" });
        }
        Commands::Rebuild { source } => {
            runtime.source(&source)?;
            let persistence = runtime.orchestrator.persistence();
            let _lease = persistence.acquire_lease(&source).await?;
            let state = persistence.rebuild_tracking(&source).await?;
            persistence.commit_tracking(&state).await?;
            println!(
                "{source}: rebuilt windows={} seen_keys={}",
                state.covered_windows.len(),
                state.seen_entity_keys.len()
            );
        }
    }

    Ok(())
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling outstanding work");
            cancel.cancel();
        }
    });
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    let window = report
        .window
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{}: outcome={:?} window={} fetched={} failed={} cancelled={} new={} seen={} merged={} written={} artifact={}",
        report.source_id,
        report.outcome,
        window,
        report.fetched,
        report.failed,
        report.cancelled,
        report.admissions.new,
        report.admissions.duplicate_of_seen,
        report.admissions.duplicate_within_run + report.admissions.merged,
        report.entities_written,
        report
            .artifact_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    Ok(())
}
