use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fundsig_core::PatternType;
use fundsig_patterns::{default_library, load_library, CompiledLibrary};
use fundsig_pipeline::{report_markdown, ItemOutcome, Pipeline, PipelineConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fundsig-cli")]
#[command(about = "Funding signal extraction and reconciliation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Process raw items from a JSON-lines file, a JSON item, or a fixture directory.
    Process {
        input: PathBuf,
        /// Re-run items whose content was already processed.
        #[arg(long)]
        force: bool,
    },
    /// Apply pending human validations and publish the next library version.
    Learn,
    /// Validate a rule file and list its rules.
    Rules {
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Summarize recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Run scheduled learning batches until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Process { input, force } => {
            let pipeline = Pipeline::open_from_env().await?;
            let summary = pipeline.run_once(&input, force).await?;
            for outcome in &summary.outcomes {
                match outcome {
                    ItemOutcome::Routed {
                        raw_item_id,
                        status,
                        overall_confidence,
                        reason,
                        ..
                    } => println!("{raw_item_id}: {status} ({overall_confidence:.2}) {reason}"),
                    ItemOutcome::Duplicate {
                        raw_item_id,
                        existing_item_id,
                        ..
                    } => println!("{raw_item_id}: duplicate of {existing_item_id}"),
                    ItemOutcome::Failed { raw_item_id, error } => {
                        println!("{raw_item_id}: failed: {error}")
                    }
                }
            }
            println!(
                "run complete: run_id={} items={} duplicates={} failures={} report={}",
                summary.run_id,
                summary.outcomes.len(),
                summary.duplicates,
                summary.failures,
                summary
                    .report_dir
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            );
        }
        Commands::Learn => {
            let pipeline = Pipeline::open_from_env().await?;
            let run = pipeline.learn().await?;
            for skipped in &run.report.skipped {
                println!("skipped: {skipped}");
            }
            for rule_id in &run.report.deactivated {
                println!("deactivated: {rule_id}");
            }
            match &run.library_path {
                Some(path) => println!(
                    "library v{} published to {} (applied={})",
                    run.report.library.version,
                    path.display(),
                    run.report.applied
                ),
                None => println!("no rule changes (validations consumed={})", run.consumed),
            }
        }
        Commands::Rules { path } => {
            let path = path.or_else(|| PipelineConfig::from_env().rules_path);
            let library = match &path {
                Some(path) => load_library(path)
                    .with_context(|| format!("loading rule file {}", path.display()))?,
                None => default_library().context("parsing embedded rule set")?,
            };
            let compiled = CompiledLibrary::compile(library).context("compiling rule set")?;
            let mut per_type: BTreeMap<PatternType, usize> = BTreeMap::new();
            for rule in &compiled.snapshot().rules {
                *per_type.entry(rule.pattern_type).or_default() += 1;
                println!(
                    "{:<32} {:<20} prior={:.2} applied={} success={:.2}{}",
                    rule.id,
                    rule.pattern_type.as_str(),
                    rule.confidence_prior,
                    rule.times_applied,
                    rule.success_rate,
                    if rule.is_active { "" } else { " inactive" }
                );
            }
            for (pattern_type, count) in per_type {
                println!("{}: {count}", pattern_type.as_str());
            }
            println!(
                "library v{}: {} rules, {} active",
                compiled.version(),
                compiled.snapshot().rules.len(),
                compiled.active_rule_count()
            );
        }
        Commands::Report { runs } => {
            let config = PipelineConfig::from_env();
            println!("{}", report_markdown(runs, &config.data_dir)?);
        }
        Commands::Schedule => {
            let pipeline = Pipeline::open_from_env().await?;
            let Some(sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set FUNDSIG_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().learning_cron, "learning scheduler running");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            let mut sched = sched;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
