use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dupemark_match::{DetectConfig, DetectPipeline};
use dupemark_storage::{ListingRepository, MemoryRepository, PgRepository};
use tracing::warn;

#[derive(Debug, Parser)]
#[command(name = "dupemark")]
#[command(about = "Marketplace listing duplicate detector")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load enabled sources' captured bundles into the listing store.
    Ingest,
    /// Run one duplicate-detection pass over the stored listings.
    Detect,
    /// Ingest, then detect, in one process.
    Run,
    /// Print the duplicate groups derived from the persisted pairs.
    Groups,
    /// Write the similarity graph projection as JSON.
    Export {
        #[arg(long, default_value = "similarity_graph.json")]
        out: PathBuf,
    },
    /// Create the crawled_items / similar_items tables if missing.
    Migrate,
}

async fn open_repository(config: &DetectConfig) -> Result<Arc<dyn ListingRepository>> {
    match &config.database_url {
        Some(url) => {
            let repo = PgRepository::connect(url)
                .await
                .context("connecting to DATABASE_URL")?;
            Ok(Arc::new(repo))
        }
        None => {
            warn!("DATABASE_URL not set; using an in-memory store (state lives for this process only)");
            Ok(Arc::new(MemoryRepository::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = DetectConfig::from_env();

    match cli.command.unwrap_or(Commands::Detect) {
        Commands::Ingest => {
            let repo = open_repository(&config).await?;
            let pipeline = DetectPipeline::new(config, repo)?;
            let summary = pipeline.ingest_once().await?;
            println!(
                "ingest complete: run_id={} sources={} listings={}",
                summary.run_id, summary.sources, summary.listings_ingested
            );
        }
        Commands::Detect => {
            let repo = open_repository(&config).await?;
            let pipeline = DetectPipeline::new(config, repo)?;
            let summary = pipeline.detect_once().await?;
            println!(
                "detect complete: run_id={} listings={} pairs={} candidates={} persisted={} reports={}",
                summary.run_id,
                summary.listings,
                summary.pairs_compared,
                summary.candidates,
                summary.persisted_pairs,
                summary.reports_dir
            );
        }
        Commands::Run => {
            let repo = open_repository(&config).await?;
            let pipeline = DetectPipeline::new(config, repo)?;
            let ingest = pipeline.ingest_once().await?;
            let detect = pipeline.detect_once().await?;
            println!(
                "run complete: ingested={} listings={} candidates={} persisted={}",
                ingest.listings_ingested, detect.listings, detect.candidates, detect.persisted_pairs
            );
        }
        Commands::Groups => {
            let repo = open_repository(&config).await?;
            let pipeline = DetectPipeline::new(config, repo)?;
            let groups = pipeline.groups().await?;
            println!("{}", serde_json::to_string_pretty(&groups)?);
        }
        Commands::Export { out } => {
            let repo = open_repository(&config).await?;
            let pipeline = DetectPipeline::new(config, repo)?;
            let graph = pipeline.export_graph().await?;
            let json = serde_json::to_vec_pretty(&graph)?;
            std::fs::write(&out, json)
                .with_context(|| format!("writing {}", out.display()))?;
            println!(
                "export complete: {} nodes, {} edges -> {}",
                graph.nodes.len(),
                graph.edges.len(),
                out.display()
            );
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set for migrate")?;
            let repo = PgRepository::connect(url)
                .await
                .context("connecting to DATABASE_URL")?;
            repo.ensure_schema().await.context("creating tables")?;
            println!("migrate complete: crawled_items and similar_items are ready");
        }
    }

    Ok(())
}
