use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use shopfeed_adapters::ShopCrawlSource;
use shopfeed_core::CategoryPolicy;
use shopfeed_sync::{prune_catalog, run_ingest_once, IngestPipeline, RunConfig, RunSummary};
use tracing::debug;

#[derive(Debug, Parser)]
#[command(name = "shopfeed")]
#[command(about = "Turn a store export into a product catalog with local images")]
struct Cli {
    #[command(flatten)]
    paths: PathArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Overrides for the `SHOPFEED_*` environment settings.
#[derive(Debug, Args)]
struct PathArgs {
    #[arg(long, global = true)]
    export: Option<PathBuf>,
    #[arg(long, global = true)]
    public_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,
    #[arg(long, global = true)]
    workers: Option<usize>,
    #[arg(long, global = true)]
    http_timeout_secs: Option<u64>,
    #[arg(long, global = true)]
    category_policy: Option<CategoryPolicy>,
    #[arg(long, global = true)]
    category_rules: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Read the export, cache images and write the catalog.
    Ingest,
    /// Build the catalog from a live shop's listing pages instead of an export.
    Crawl {
        /// Page URL containing `{page}`, e.g. `https://shop.example.com/shop/page/{page}/`.
        #[arg(long)]
        base_url: String,
        #[arg(long, default_value_t = 1)]
        pages: u32,
        #[arg(long, default_value_t = 500)]
        delay_ms: u64,
    },
    /// Remove catalog records whose image is missing from the image store.
    Prune,
    /// Print the category the keyword table assigns to a title.
    Classify { title: String },
}

impl PathArgs {
    fn apply(self, mut config: RunConfig) -> RunConfig {
        if let Some(path) = self.export {
            config.export_path = path;
        }
        if let Some(path) = self.public_dir {
            config.public_dir = path;
        }
        if let Some(path) = self.catalog {
            config.catalog_path = path;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(secs) = self.http_timeout_secs {
            config.http_timeout_secs = secs;
        }
        if let Some(policy) = self.category_policy {
            config.category_policy = policy;
        }
        if let Some(path) = self.category_rules {
            config.category_rules_path = Some(path);
        }
        config
    }
}

fn print_summary(summary: &RunSummary) {
    println!(
        "ingest complete: run_id={} source={} products={} skipped={} fetched={} cached={} placeholder={} rewrites={} catalog={} sha256={}",
        summary.run_id,
        summary.source,
        summary.parsed_products,
        summary.skipped_entries,
        summary.images_fetched,
        summary.images_cached,
        summary.images_placeholder,
        summary.verified_rewrites,
        summary.catalog_path,
        summary.catalog_sha256
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,reqwest=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.paths.apply(RunConfig::from_env());
    debug!(?config, "resolved run configuration");

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let summary = run_ingest_once(config).await?;
            print_summary(&summary);
        }
        Commands::Crawl {
            base_url,
            pages,
            delay_ms,
        } => {
            let source = ShopCrawlSource::new(base_url, pages, Duration::from_millis(delay_ms));
            let summary = IngestPipeline::new(config)?
                .with_source(Box::new(source))
                .run_once()
                .await?;
            print_summary(&summary);
        }
        Commands::Prune => {
            let summary = prune_catalog(&config.catalog_path, &config.image_store()).await?;
            println!(
                "prune complete: before={} removed={} after={}",
                summary.before, summary.removed, summary.after
            );
        }
        Commands::Classify { title } => {
            let rules = config.category_rules()?;
            println!("{}", rules.classify(&title));
        }
    }

    Ok(())
}
