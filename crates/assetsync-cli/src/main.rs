//! assetsync - migrate character assets into an object store.
//!
//! `assetsync migrate` runs a dry run unless `--apply` is given, prints a
//! summary and exits non-zero when any entity recorded an error.
//! `assetsync drift --entity ID` prints one `identity<TAB>state` line per
//! asset without touching the destination.

use anyhow::{Context, Result};
use assetsync_core::{
    EntityFilter, MigrationConfig, MigrationMode, MigrationOrchestrator, MigrationRun, SyncReport,
};
use clap::{Parser, Subcommand};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "assetsync")]
#[command(about = "Hash-verified asset migration")]
struct Args {
    /// Migration configuration document
    #[arg(short, long, default_value = "assetsync.json", global = true)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy assets and write manifests (dry run by default)
    Migrate {
        /// Perform the copy; without this flag nothing is changed
        #[arg(long)]
        apply: bool,

        /// Process at most this many entities
        #[arg(long)]
        limit: Option<usize>,

        /// Restrict the run to these entities
        #[arg(long = "entity")]
        entities: Vec<String>,

        /// Override the configured number of concurrent entity pipelines
        #[arg(long)]
        concurrency: Option<usize>,

        /// Print the full run report as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
    /// Show the sync state of one entity's assets
    Drift {
        #[arg(long)]
        entity: String,
    },
}

fn build_filter(entities: Vec<String>, limit: Option<usize>) -> EntityFilter {
    let filter = EntityFilter::only(entities);
    match limit {
        Some(limit) => filter.with_limit(limit),
        None => filter,
    }
}

fn format_summary(run: &MigrationRun) -> String {
    let verb = match run.mode {
        MigrationMode::DryRun => "would copy",
        MigrationMode::Apply => "copied",
    };
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} entities processed, {} {} files ({} bytes), {} skipped",
        run.entities_processed, verb, run.files_copied, run.bytes_copied, run.files_skipped
    );
    if run.cancelled {
        let _ = writeln!(out, "run was cancelled before all entities were processed");
    }
    for warning in &run.warnings {
        let _ = writeln!(out, "warning: {}", warning);
    }
    for error in &run.errors {
        match &error.path {
            Some(path) => {
                let _ = writeln!(
                    out,
                    "error: {} [{:?}] {} ({})",
                    error.entity_id,
                    error.kind,
                    error.message,
                    path.display()
                );
            }
            None => {
                let _ = writeln!(
                    out,
                    "error: {} [{:?}] {}",
                    error.entity_id, error.kind, error.message
                );
            }
        }
    }
    let _ = write!(out, "{} errors", run.errors.len());
    out
}

fn format_drift(report: &SyncReport) -> String {
    report
        .states()
        .map(|(identity, state)| format!("{}\t{}", identity, state))
        .collect::<Vec<_>>()
        .join("\n")
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let mut config = MigrationConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    match args.command {
        Command::Migrate {
            apply,
            limit,
            entities,
            concurrency,
            json,
        } => {
            if let Some(concurrency) = concurrency {
                config.concurrency = concurrency;
            }
            let orchestrator = MigrationOrchestrator::from_config(&config)?;

            // Ctrl-C stops new entity pipelines; running ones stop at the next file
            let token = orchestrator.cancellation_token().clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, stopping at the next file boundary");
                    token.cancel();
                }
            });

            let mode = if apply {
                MigrationMode::Apply
            } else {
                info!("Dry run: pass --apply to copy");
                MigrationMode::DryRun
            };
            let run = orchestrator.run(&build_filter(entities, limit), mode).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&run)?);
            } else {
                println!("{}", format_summary(&run));
            }
            Ok(if run.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Drift { entity } => {
            let orchestrator = MigrationOrchestrator::from_config(&config)?;
            let report = orchestrator.drift_report(&entity).await?;
            println!("{}", format_drift(&report));
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetsync_core::{EntityError, ErrorKind};
    use clap::CommandFactory;

    fn run_with(mode: MigrationMode) -> MigrationRun {
        let mode = serde_json::to_value(mode).unwrap();
        serde_json::from_value(serde_json::json!({
            "runId": "r1",
            "mode": mode,
            "startedAt": "2024-01-01T00:00:00Z",
            "entitiesProcessed": 2,
            "filesCopied": 3,
            "filesSkipped": 1,
            "bytesCopied": 120
        }))
        .unwrap()
    }

    #[test]
    fn test_args_are_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_migrate_defaults_to_dry_run() {
        let args = Args::try_parse_from(["assetsync", "migrate", "--entity", "e1", "--entity", "e2"])
            .unwrap();
        match args.command {
            Command::Migrate {
                apply, entities, ..
            } => {
                assert!(!apply);
                assert_eq!(entities, vec!["e1", "e2"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(args.config, PathBuf::from("assetsync.json"));
    }

    #[test]
    fn test_build_filter() {
        let filter = build_filter(vec![], Some(5));
        assert!(filter.ids.is_empty());
        assert_eq!(filter.limit, Some(5));
    }

    #[test]
    fn test_summary_reports_errors() {
        let mut run = run_with(MigrationMode::DryRun);
        assert!(format_summary(&run).contains("would copy 3 files"));
        assert!(format_summary(&run).ends_with("0 errors"));

        run.errors.push(EntityError {
            entity_id: "e2".into(),
            kind: ErrorKind::PerFile,
            message: "corrupt".into(),
            path: Some(PathBuf::from("/src/e2/b.png")),
        });
        let summary = format_summary(&run);
        assert!(summary.contains("error: e2 [PerFile] corrupt (/src/e2/b.png)"));
        assert!(summary.ends_with("1 errors"));
    }
}
