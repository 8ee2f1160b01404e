//! Pipeline CLI: create jobs, run workers, monitor, health-check.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pipeline_core::health::{self, ComponentHealth};
use pipeline_core::search::PlaceSearch;
use pipeline_core::{
    run_workers, BatchExecutor, HealthReport, JobError, JobParams, JobService, MockSearch,
    PostgresStore, RetryingSearch, SerperSearch, Settings,
};
use serper_client::SerperClient;

// Exit codes per the CLI contract.
const EXIT_VALIDATION: u8 = 2;
const EXIT_BUDGET: u8 = 3;

#[derive(Parser)]
#[command(name = "pipeline")]
#[command(about = "Queue-backed Serper places scraping pipeline")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a scraping job and enqueue its queries
    CreateJob {
        /// Search keyword (e.g. "bars", "restaurants")
        #[arg(long)]
        keyword: String,

        /// Two-letter state code (e.g. "AZ", "CA")
        #[arg(long)]
        state: String,

        /// Pages to scrape per zip code
        #[arg(long)]
        pages: Option<i64>,

        /// Queries to process per batch
        #[arg(long)]
        batch_size: Option<i64>,

        /// Concurrent API calls per batch
        #[arg(long)]
        concurrency: Option<i64>,

        /// Simulate with the mock API; spends no credits
        #[arg(long)]
        dry_run: bool,
    },

    /// Process batches for all running jobs until complete
    ProcessBatches,

    /// Poll a job's rollup and per-status counts until it finishes
    MonitorJob {
        job_id: String,

        /// Polling interval in seconds
        #[arg(long, default_value_t = 5)]
        interval: u64,
    },

    /// Check component reachability
    HealthCheck {
        /// Output the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    match run(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::CreateJob {
            keyword,
            state,
            pages,
            batch_size,
            concurrency,
            dry_run,
        } => create_job(keyword, state, pages, batch_size, concurrency, dry_run).await,
        Commands::ProcessBatches => process_batches().await,
        Commands::MonitorJob { job_id, interval } => monitor_job(&job_id, interval).await,
        Commands::HealthCheck { json } => health_check(json).await,
    }
}

async fn connect_store(settings: &Settings) -> Result<Arc<PostgresStore>> {
    let store = PostgresStore::connect(&settings.database_url, settings.merge_chunk_size)
        .await
        .context("failed to connect to the store")?;
    Ok(Arc::new(store))
}

/// Live and mock searchers. With `USE_MOCK_API=true` both are the mock;
/// dry-run jobs always route to the mock regardless.
fn build_searchers(
    settings: &Settings,
) -> Result<(Arc<dyn PlaceSearch>, Arc<dyn PlaceSearch>)> {
    let mock: Arc<dyn PlaceSearch> = Arc::new(MockSearch::new());
    if settings.use_mock_api {
        return Ok((mock.clone(), mock));
    }

    let client = SerperClient::new(settings.serper_api_key.clone(), settings.serper_timeout())
        .context("failed to build the Serper client")?;
    let live: Arc<dyn PlaceSearch> = Arc::new(RetryingSearch::new(
        SerperSearch::new(client),
        settings.max_retries_per_query,
        settings.retry_delay(),
    ));
    Ok((live, mock))
}

async fn create_job(
    keyword: String,
    state: String,
    pages: Option<i64>,
    batch_size: Option<i64>,
    concurrency: Option<i64>,
    dry_run: bool,
) -> Result<ExitCode> {
    let settings = Settings::from_env()?;

    let params = match JobParams::new(
        keyword,
        state,
        pages.unwrap_or(settings.default_pages),
        batch_size.unwrap_or(settings.default_batch_size),
        concurrency.unwrap_or(settings.default_concurrency),
        dry_run,
    ) {
        Ok(params) => params,
        Err(e) => {
            eprintln!("Error: {e}");
            return Ok(ExitCode::from(EXIT_VALIDATION));
        }
    };

    let store = connect_store(&settings).await?;
    let service = JobService::new(store, &settings);

    match service.create_job(params).await {
        Ok(created) => {
            println!("{}", created.job_id);
            eprintln!(
                "Created job {}: {} zips x pages = {} queries ({} enqueued)",
                created.job_id, created.total_zips, created.total_queries,
                created.queries_enqueued
            );
            eprintln!("Monitor with: pipeline monitor-job {}", created.job_id);
            Ok(ExitCode::SUCCESS)
        }
        Err(e @ JobError::Validation { .. }) => {
            eprintln!("Error: {e}");
            Ok(ExitCode::from(EXIT_VALIDATION))
        }
        Err(e @ JobError::BudgetExceeded { .. }) => {
            eprintln!("Error: {e}");
            Ok(ExitCode::from(EXIT_BUDGET))
        }
        Err(e) => Err(e.into()),
    }
}

async fn process_batches() -> Result<ExitCode> {
    let settings = Settings::from_env()?;
    let store = connect_store(&settings).await?;
    let (live, mock) = build_searchers(&settings)?;
    let executor = Arc::new(BatchExecutor::new(
        store.clone(),
        live,
        mock,
        settings.early_exit_threshold,
    ));

    // Graceful shutdown: finish the current batches, then exit.
    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received; finishing current batches");
            cancel_on_signal.cancel();
        }
    });

    let summary = run_workers(store, executor, &settings, cancel).await?;

    println!(
        "Processed {} batches / {} queries; stored {} places; completed {} job(s)",
        summary.batches_processed,
        summary.queries_processed,
        summary.places_stored,
        summary.jobs_completed.len()
    );
    Ok(ExitCode::SUCCESS)
}

async fn monitor_job(job_id: &str, interval: u64) -> Result<ExitCode> {
    let settings = Settings::from_env()?;
    let store = connect_store(&settings).await?;
    let service = JobService::new(store, &settings);

    loop {
        let (job, counts) = match service.job_overview(job_id).await {
            Ok(overview) => overview,
            Err(e @ JobError::NotFound { .. }) => {
                eprintln!("Error: {e}");
                return Ok(ExitCode::FAILURE);
            }
            Err(e) => return Err(e.into()),
        };

        println!("============================================================");
        println!(
            "Job {} [{}]  keyword={} state={}",
            job.job_id,
            job.status.as_str(),
            job.keyword,
            job.state
        );
        println!(
            "Queries: {}/{} succeeded, {} failed, {} skipped",
            job.totals.successes, job.totals.queries, job.totals.failures, job.totals.skipped
        );
        println!(
            "In flight: {} queued, {} processing",
            counts.queued, counts.processing
        );
        println!(
            "Places: {}  Credits: {}",
            job.totals.places, job.totals.credits
        );

        if job.status == pipeline_core::JobStatus::Done {
            println!("Job complete.");
            return Ok(ExitCode::SUCCESS);
        }

        tokio::time::sleep(Duration::from_secs(interval.max(1))).await;
    }
}

async fn health_check(json: bool) -> Result<ExitCode> {
    // Best-effort settings: a missing DATABASE_URL should show up in the
    // report, not crash the check.
    let settings = Settings::from_env().unwrap_or_default();
    let configuration = health::check_configuration(&settings);

    let (database, ingestion) = if settings.database_url.is_empty() {
        (
            ComponentHealth::unhealthy("DATABASE_URL not set"),
            ComponentHealth::warning("not checked: store unreachable"),
        )
    } else {
        match PostgresStore::connect(&settings.database_url, settings.merge_chunk_size).await {
            Ok(store) => (
                health::check_database(&store).await,
                health::check_ingestion(&store).await,
            ),
            Err(e) => (
                ComponentHealth::unhealthy(format!("store connection failed: {e}")),
                ComponentHealth::warning("not checked: store unreachable"),
            ),
        }
    };

    let report = HealthReport::assemble(configuration, database, ingestion);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("SYSTEM HEALTH: {:?}", report.status);
        for (name, component) in [
            ("configuration", &report.configuration),
            ("database", &report.database),
            ("ingestion", &report.ingestion),
        ] {
            println!("  {:<14} {:?}: {}", name, component.status, component.message);
        }
    }

    Ok(if report.is_healthy() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
