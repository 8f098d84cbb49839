use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use curator_config::AppConfig;
use curator_llm::ReflectionRouter;
use curator_memory::ProposalId;
use curator_runtime::Pipeline;

#[derive(Debug, Parser)]
#[command(
    name = "curator",
    version,
    about = "Memory consolidation and triage engine"
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "config/default.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a triage pass over observer output (from a file, or stdin with -).
    Triage {
        /// Input file containing the observer reply; `-` reads stdin.
        #[arg(value_name = "FILE", default_value = "-")]
        input: String,
    },
    /// Run the nightly observation-store maintenance pass.
    Maintain,
    /// Reconcile the review checklist against the pending set.
    Reconcile,
    /// List the pending proposals awaiting review.
    Pending,
    /// Print configuration and storage status.
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config))?;
    let pipeline = Pipeline::new(config.clone());

    match cli.command {
        Commands::Triage { input } => {
            let raw = read_input(&input)?;
            let router = ReflectionRouter::new(&config.llm.ollama_base_url);
            let summary = pipeline.triage_pass(&raw, &router).await?;

            println!("triage complete:");
            for (id, section) in &summary.promoted {
                println!("  promoted    {id} -> {section}");
            }
            for (id, reason) in &summary.rejected {
                println!("  rejected    {id} ({reason})");
            }
            for (discarded, kept) in &summary.merged {
                println!("  merged      {discarded} into {kept}");
            }
            for id in &summary.needs_review {
                println!("  for review  {id}");
            }
            println!("  pending total: {}", summary.pending_total);
        }
        Commands::Maintain => {
            let report = run_maintenance(&pipeline, &config).await?;
            println!(
                "maintenance complete: scanned {}, merged {}, tagged stale {}",
                report.scanned, report.merged, report.tagged_stale
            );
        }
        Commands::Reconcile => {
            let summary = pipeline.reconcile_pass().await?;
            println!(
                "reconciliation complete: promoted {}, rejected {}, expired {}, unchanged {}, discovered {}",
                summary.promoted,
                summary.rejected,
                summary.expired,
                summary.unchanged,
                summary.discovered
            );
            if summary.held_for_remediation > 0 {
                println!(
                    "  {} approved proposal(s) held: their target section is missing",
                    summary.held_for_remediation
                );
            }
        }
        Commands::Pending => {
            let pending = pipeline.pending_store().load().await?;
            if pending.is_empty() {
                println!("no pending proposals");
            } else {
                for proposal in &pending {
                    println!(
                        "{}  [{}]  {} (captured {})",
                        proposal.id,
                        proposal.section.label(),
                        first_line(&proposal.change),
                        proposal.captured_at.format("%Y-%m-%d")
                    );
                }
            }
        }
        Commands::Doctor => {
            println!("curator doctor");
            println!("- config file:        {}", cli.config);
            println!("- canonical document: {}", config.storage.canonical_path);
            println!("- review checklist:   {}", config.storage.checklist_path);
            println!("- pending store:      {}", config.storage.pending_path);
            println!("- daily log dir:      {}", config.storage.daily_log_dir);
            println!("- vector store:       {} ({})", config.vector_store.url, config.vector_store.collection);
            println!("- llm provider:       {} ({})", config.llm.provider, config.active_model());
            let pending = pipeline.pending_store().load().await?;
            println!("- pending proposals:  {}", pending.len());
            let today = chrono::Utc::now().date_naive();
            println!("- next proposal id:   {}", ProposalId::next(today, &pending.iter().map(|p| p.id.clone()).collect::<Vec<_>>()));
        }
    }

    Ok(())
}

fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("reading observer output from stdin")?;
        Ok(buffer)
    } else {
        std::fs::read_to_string(Path::new(input))
            .with_context(|| format!("reading observer output from {input}"))
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

#[cfg(feature = "qdrant")]
async fn run_maintenance(
    pipeline: &Pipeline,
    config: &AppConfig,
) -> Result<curator_memory::MaintenanceReport> {
    use std::time::Duration;

    use curator_memory::store::qdrant::QdrantVectorStore;

    let store = QdrantVectorStore::connect(
        &config.vector_store.url,
        &config.vector_store.collection,
        Duration::from_secs(config.vector_store.timeout_secs),
    )?;
    Ok(pipeline.maintenance_pass(&store).await?)
}

#[cfg(not(feature = "qdrant"))]
async fn run_maintenance(
    _pipeline: &Pipeline,
    _config: &AppConfig,
) -> Result<curator_memory::MaintenanceReport> {
    anyhow::bail!("this build has no vector store backend; rebuild with --features qdrant")
}
