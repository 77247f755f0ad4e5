use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use apk_endpoints::config::{RunRequest, DATASET_INDEX_URL, DEFAULT_MAX_VERSIONS, DOWNLOAD_BASE_URL};
use apk_endpoints::dataset::{self, DatasetIndex};
use apk_endpoints::extract::EndpointExtractor;
use apk_endpoints::fetch::HttpFetcher;
use apk_endpoints::pipeline::{self, Orchestrator, RunError};

#[derive(Parser)]
#[command(name = "apk-endpoints")]
#[command(about = "Chronological survey of network endpoints embedded in Android app releases")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve and print the release selection without downloading anything
    Plan {
        #[command(flatten)]
        query: QueryArgs,
    },

    /// Execute a full run: fetch, extract, aggregate, render, package
    Run {
        #[command(flatten)]
        query: QueryArgs,

        /// AndroZoo API key
        #[arg(long, env = "ANDROZOO_API_KEY", hide_env_values = true)]
        api_key: String,

        /// Directory that receives one run-{id} directory per invocation
        #[arg(long, default_value = "runs")]
        output: PathBuf,

        /// Directory for downloaded artifacts, shared across runs
        #[arg(long, default_value = "apk-cache")]
        cache_dir: PathBuf,

        /// Reuse per-artifact extraction sidecars from earlier runs
        #[arg(long)]
        reuse_extractions: bool,

        /// Skip SHA-256 verification of downloaded artifacts
        #[arg(long)]
        skip_checksum: bool,
    },
}

#[derive(Args)]
struct QueryArgs {
    /// Package names to survey, comma separated
    #[arg(long, value_delimiter = ',', required = true)]
    packages: Vec<String>,

    /// Start of the window, YYYY-MM-DD, inclusive
    #[arg(long)]
    start_date: String,

    /// End of the window, YYYY-MM-DD, inclusive
    #[arg(long)]
    end_date: String,

    /// Cap on releases per package, sampled evenly; 0 keeps every release
    #[arg(long, default_value_t = DEFAULT_MAX_VERSIONS)]
    max_versions: usize,

    /// Local path of the release index CSV, downloaded when missing
    #[arg(long, default_value = "latest_with-added-date.csv")]
    dataset: PathBuf,
}

impl QueryArgs {
    fn to_request(&self, api_key: String, reuse_extractions: bool, verify_checksums: bool) -> RunRequest {
        RunRequest {
            api_key,
            packages: self.packages.clone(),
            start_date: self.start_date.clone(),
            end_date: self.end_date.clone(),
            max_versions: self.max_versions,
            reuse_extractions,
            verify_checksums,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    match cli.command {
        Commands::Plan { query } => plan_command(&query).await,
        Commands::Run {
            query,
            api_key,
            output,
            cache_dir,
            reuse_extractions,
            skip_checksum,
        } => {
            run_command(
                &query,
                api_key,
                &output,
                &cache_dir,
                reuse_extractions,
                skip_checksum,
            )
            .await
        }
    }
}

async fn plan_command(query: &QueryArgs) -> Result<()> {
    let index = load_index(&query.dataset).await?;
    // No API key is needed to look at the index.
    let request = query.to_request(String::new(), false, true);
    let plan = pipeline::plan(&index, &request)?;

    for package in &plan.packages {
        println!("{}: {} release(s)", package.package_id, package.releases.len());
        for release in &package.releases {
            println!(
                "  {}  vercode={}  added={}",
                release.sha256,
                release.version_code,
                release.date_added.date()
            );
        }
    }
    Ok(())
}

async fn run_command(
    query: &QueryArgs,
    api_key: String,
    output: &Path,
    cache_dir: &Path,
    reuse_extractions: bool,
    skip_checksum: bool,
) -> Result<()> {
    let index = load_index(&query.dataset).await?;
    let request = query.to_request(api_key, reuse_extractions, !skip_checksum);

    let client = reqwest::Client::new();
    let fetcher = HttpFetcher::new(
        client,
        DOWNLOAD_BASE_URL,
        request.api_key.clone(),
        cache_dir,
        request.verify_checksums,
    );
    let extractor = EndpointExtractor::new(request.reuse_extractions);
    let orchestrator = Orchestrator::new(&index, fetcher, extractor);

    let report = orchestrator
        .execute(&request, output)
        .await
        .context("run did not complete")?;

    println!("run {} finished", report.run_id);
    for package in &report.packages {
        println!(
            "  {}: {} release(s), {} endpoint(s)",
            package.package_id, package.releases_used, package.endpoints
        );
    }
    for skipped in &report.skipped {
        println!("  {} skipped: {}", skipped.package_id, skipped.reason);
    }
    if let Some(archive) = &report.archive {
        println!("archive: {}", archive.display());
    }
    Ok(())
}

/// Bootstrap the dataset index if it is not on disk yet, then load it.
///
/// Index failures are fatal for the whole run, so both steps surface as
/// [`RunError::Index`] rather than per-package skips.
async fn load_index(path: &Path) -> Result<DatasetIndex, RunError> {
    let client = reqwest::Client::new();
    dataset::ensure_local_copy(&client, DATASET_INDEX_URL, path).await?;
    let index = DatasetIndex::load(path)?;
    Ok(index)
}
