//! Queue-backed Serper places scraping pipeline.
//!
//! A job is a (keyword, state, page depth) request. Creation expands it into
//! one query per (zip, page) and persists the queue; worker processes then
//! claim disjoint batches, fan out to the search API with bounded
//! concurrency, and upsert results idempotently, so the whole run survives
//! retries and restarts with at-most-once effects.
//!
//! # Example
//!
//! ```rust,ignore
//! use pipeline_core::{
//!     BatchExecutor, Coordinator, JobParams, JobService, MemoryStore, MockSearch, Settings,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let settings = Settings::default();
//! let store = Arc::new(MemoryStore::new().with_zips("AZ", &["85001", "85002"]));
//!
//! let jobs = JobService::new(store.clone(), &settings);
//! let params = JobParams::new("bars", "AZ", 3, 100, 20, false)?;
//! let created = jobs.create_job(params).await?;
//!
//! let search = Arc::new(MockSearch::new());
//! let executor = Arc::new(BatchExecutor::new(
//!     store.clone(),
//!     search.clone(),
//!     search,
//!     settings.early_exit_threshold,
//! ));
//! Coordinator::new(store, executor, &settings)
//!     .run(CancellationToken::new())
//!     .await?;
//! ```

pub mod budget;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod expand;
pub mod health;
pub mod jobs;
pub mod models;
pub mod search;
pub mod store;

// Re-export main types
pub use budget::{BudgetGuard, BudgetState, BudgetStatus, JobEstimate};
pub use config::Settings;
pub use coordinator::{run_workers, Coordinator, RunSummary};
pub use error::{JobError, PipelineError, SearchError, StorageError};
pub use executor::{BatchExecutor, BatchOutcome};
pub use health::{system_health, ComponentHealth, HealthReport, HealthState};
pub use jobs::{CreatedJob, JobService};
pub use models::{
    JobParams, JobRecord, JobStatus, JobTotals, PlaceRecord, QueryRecord, QueryStatus,
    StatusCounts,
};
pub use search::{MockSearch, PlaceSearch, RetryingSearch, SerperSearch};
pub use store::{MemoryStore, PostgresStore, Store};
