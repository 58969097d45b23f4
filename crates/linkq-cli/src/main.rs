use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use linkq_core::SearchQuery;
use linkq_storage::PgCatalog;
use linkq_sync::{AppConfig, Runtime};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "linkq")]
#[command(about = "Guest-post marketplace catalog: import, enrich, search")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API and enrichment workers.
    Serve,
    /// Apply PostgreSQL migrations (requires DATABASE_URL).
    Migrate,
    /// Import a CSV file, wait for enrichment to settle, then exit.
    Import { path: PathBuf },
    /// Search the catalog and print JSON results.
    Search {
        keyword: String,
        #[arg(long)]
        min_dr: Option<i64>,
        #[arg(long)]
        max_dr: Option<i64>,
        #[arg(long)]
        min_traffic: Option<i64>,
        #[arg(long)]
        max_price: Option<f64>,
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let runtime = Runtime::from_config(config).await?;
            linkq_web::serve(runtime).await?;
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            PgCatalog::connect(url).await?.migrate().await?;
            info!("migrations applied");
        }
        Commands::Import { path } => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let filename = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());

            let runtime = Runtime::from_config(config).await?;
            let receipt = runtime
                .pipeline
                .import(&filename, &bytes)
                .await
                .map_err(|err| anyhow::anyhow!("import failed ({}): {err}", err.tag()))?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);

            runtime.scheduler.wait_idle().await;
            if let Some(record) = runtime.tracker.get(receipt.import_id).await {
                info!(
                    import_id = %record.id,
                    status = ?record.status,
                    enriched = record.enriched,
                    failed = record.failed,
                    "enrichment settled"
                );
            }
            runtime.shutdown().await?;
        }
        Commands::Search {
            keyword,
            min_dr,
            max_dr,
            min_traffic,
            max_price,
            limit,
        } => {
            let runtime = Runtime::from_config(config).await?;
            let query = SearchQuery {
                keyword,
                min_dr,
                max_dr,
                min_traffic,
                max_price,
                limit,
            };
            let results = runtime
                .search
                .search(&query)
                .await
                .map_err(|err| anyhow::anyhow!("search failed ({}): {err}", err.tag()))?;
            println!("{}", serde_json::to_string_pretty(&results)?);
            runtime.shutdown().await?;
        }
    }

    Ok(())
}
