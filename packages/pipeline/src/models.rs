//! Typed rows and value types shared across the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use crate::error::JobError;

/// Source tag stamped on every ingested place row.
pub const PLACE_SOURCE: &str = "serper_places";
pub const PLACE_SOURCE_VERSION: &str = "v1";

// Validation limits for job parameters.
const MAX_PAGES: i64 = 10;
const MAX_BATCH_SIZE: i64 = 500;
const MAX_CONCURRENCY: i64 = 100;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Running,
    Done,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "query_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    #[default]
    Queued,
    Processing,
    Success,
    Failed,
    Skipped,
}

impl QueryStatus {
    /// Terminal rows are never re-claimed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueryStatus::Success | QueryStatus::Failed | QueryStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Queued => "queued",
            QueryStatus::Processing => "processing",
            QueryStatus::Success => "success",
            QueryStatus::Failed => "failed",
            QueryStatus::Skipped => "skipped",
        }
    }
}

// ============================================================================
// Job
// ============================================================================

/// Input parameters for creating a scraping job, validated on construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobParams {
    pub keyword: String,
    pub state: String,
    pub pages: i64,
    pub batch_size: i64,
    pub concurrency: i64,
    pub dry_run: bool,
}

impl JobParams {
    /// Validate and normalize parameters; the state code is uppercased.
    pub fn new(
        keyword: impl Into<String>,
        state: impl Into<String>,
        pages: i64,
        batch_size: i64,
        concurrency: i64,
        dry_run: bool,
    ) -> Result<Self, JobError> {
        let keyword = keyword.into().trim().to_string();
        let state = state.into().trim().to_uppercase();

        if keyword.is_empty() {
            return Err(JobError::Validation {
                message: "keyword must not be empty".into(),
            });
        }
        if state.len() != 2 || !state.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(JobError::Validation {
                message: format!("state must be a two-letter code (got '{state}')"),
            });
        }
        if !(1..=MAX_PAGES).contains(&pages) {
            return Err(JobError::Validation {
                message: format!("pages must be 1-{MAX_PAGES} (got {pages})"),
            });
        }
        if !(1..=MAX_BATCH_SIZE).contains(&batch_size) {
            return Err(JobError::Validation {
                message: format!("batch_size must be 1-{MAX_BATCH_SIZE} (got {batch_size})"),
            });
        }
        if !(1..=MAX_CONCURRENCY).contains(&concurrency) {
            return Err(JobError::Validation {
                message: format!("concurrency must be 1-{MAX_CONCURRENCY} (got {concurrency})"),
            });
        }

        Ok(Self {
            keyword,
            state,
            pages,
            batch_size,
            concurrency,
            dry_run,
        })
    }
}

/// Rollup totals recomputed from the authoritative query and place tables.
///
/// `skipped` is its own bucket: at completion
/// `successes + failures + skipped = queries`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct JobTotals {
    pub zips: i64,
    pub queries: i64,
    pub successes: i64,
    pub failures: i64,
    pub skipped: i64,
    pub places: i64,
    pub credits: i64,
}

/// A row in the jobs table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobRecord {
    pub job_id: String,
    pub keyword: String,
    pub state: String,
    pub pages: i64,
    pub batch_size: i64,
    pub concurrency: i64,
    #[builder(default = false)]
    pub dry_run: bool,
    #[builder(default)]
    pub status: JobStatus,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Some(Utc::now()), setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub finished_at: Option<DateTime<Utc>>,
    #[sqlx(flatten)]
    #[builder(default)]
    pub totals: JobTotals,
}

impl JobRecord {
    /// A fresh running job from validated parameters.
    pub fn from_params(job_id: impl Into<String>, params: &JobParams) -> Self {
        Self::builder()
            .job_id(job_id)
            .keyword(params.keyword.clone())
            .state(params.state.clone())
            .pages(params.pages)
            .batch_size(params.batch_size)
            .concurrency(params.concurrency)
            .dry_run(params.dry_run)
            .build()
    }
}

// ============================================================================
// Query
// ============================================================================

/// A query row to enqueue; `(job_id, zip, page)` is the queue key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewQuery {
    pub zip: String,
    pub page: i64,
    pub q: String,
}

/// A query claimed by this worker, attributed by claim id.
#[derive(Debug, Clone, FromRow)]
pub struct ClaimedQuery {
    pub zip: String,
    pub page: i64,
    pub q: String,
    pub claim_id: String,
}

/// Full query row, as read back for monitoring and tests.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QueryRecord {
    pub job_id: String,
    pub zip: String,
    pub page: i64,
    pub q: String,
    pub status: QueryStatus,
    pub claim_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub api_status: Option<i64>,
    pub results_count: Option<i64>,
    pub credits: Option<i64>,
    pub error: Option<String>,
    pub ran_at: Option<DateTime<Utc>>,
}

/// Writeback for one processed query. The store stamps `ran_at`.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub zip: String,
    pub page: i64,
    pub status: QueryStatus,
    pub api_status: Option<i64>,
    pub results_count: Option<i64>,
    pub credits: Option<i64>,
    pub error: Option<String>,
}

/// Queued/processing counts driving the completion predicate.
#[derive(Debug, Clone, Copy, Default, FromRow)]
pub struct PendingCounts {
    pub queued: i64,
    pub processing: i64,
}

impl PendingCounts {
    /// A job is complete when nothing is queued or in flight.
    pub fn is_drained(&self) -> bool {
        self.queued == 0 && self.processing == 0
    }
}

/// Per-status counts for monitoring output.
#[derive(Debug, Clone, Copy, Default, Serialize, FromRow)]
pub struct StatusCounts {
    pub queued: i64,
    pub processing: i64,
    pub success: i64,
    pub failed: i64,
    pub skipped: i64,
}

// ============================================================================
// Place
// ============================================================================

/// A row in the places table; `(job_id, place_uid)` is the upsert key.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlaceRecord {
    pub ingest_id: String,
    pub job_id: String,
    pub source: String,
    pub source_version: String,
    pub ingest_ts: DateTime<Utc>,
    pub keyword: String,
    pub state: String,
    pub zip: String,
    pub page: i64,
    pub place_uid: String,
    /// Parsed payload; NULL when the record text failed to parse.
    pub payload: Option<Value>,
    /// Exact response text for this record; never NULL.
    pub payload_raw: String,
    pub api_status: Option<i64>,
    pub api_ms: Option<i64>,
    pub results_count: Option<i64>,
    pub credits: Option<i64>,
    pub error: Option<String>,
}

impl PlaceRecord {
    /// Build a place row with the standard ingest envelope.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: impl Into<String>,
        keyword: impl Into<String>,
        state: impl Into<String>,
        zip: impl Into<String>,
        page: i64,
        place_uid: impl Into<String>,
        payload: Option<Value>,
        payload_raw: impl Into<String>,
    ) -> Self {
        let job_id = job_id.into();
        let place_uid = place_uid.into();
        let ingest_ts = Utc::now();

        Self {
            ingest_id: format!("{}-{}-{}", job_id, place_uid, ingest_ts.timestamp()),
            job_id,
            source: PLACE_SOURCE.to_string(),
            source_version: PLACE_SOURCE_VERSION.to_string(),
            ingest_ts,
            keyword: keyword.into(),
            state: state.into(),
            zip: zip.into(),
            page,
            place_uid,
            payload,
            payload_raw: payload_raw.into(),
            api_status: None,
            api_ms: None,
            results_count: None,
            credits: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_params() -> JobParams {
        JobParams::new("bars", "az", 3, 100, 20, false).unwrap()
    }

    #[test]
    fn params_uppercase_state() {
        assert_eq!(valid_params().state, "AZ");
    }

    #[test]
    fn empty_keyword_is_rejected() {
        let err = JobParams::new("  ", "AZ", 3, 100, 20, false).unwrap_err();
        assert!(matches!(err, JobError::Validation { .. }));
    }

    #[test]
    fn three_letter_state_is_rejected() {
        assert!(JobParams::new("bars", "ARZ", 3, 100, 20, false).is_err());
    }

    #[test]
    fn numeric_state_is_rejected() {
        assert!(JobParams::new("bars", "85", 3, 100, 20, false).is_err());
    }

    #[test]
    fn pages_out_of_range_is_rejected() {
        assert!(JobParams::new("bars", "AZ", 0, 100, 20, false).is_err());
        assert!(JobParams::new("bars", "AZ", 11, 100, 20, false).is_err());
    }

    #[test]
    fn batch_size_out_of_range_is_rejected() {
        assert!(JobParams::new("bars", "AZ", 3, 0, 20, false).is_err());
        assert!(JobParams::new("bars", "AZ", 3, 501, 20, false).is_err());
    }

    #[test]
    fn concurrency_out_of_range_is_rejected() {
        assert!(JobParams::new("bars", "AZ", 3, 100, 0, false).is_err());
        assert!(JobParams::new("bars", "AZ", 3, 100, 101, false).is_err());
    }

    #[test]
    fn fresh_job_is_running_with_zeroed_totals() {
        let job = JobRecord::from_params("job-1", &valid_params());
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.totals, JobTotals::default());
        assert!(job.started_at.is_some());
        assert!(job.finished_at.is_none());
    }

    #[test]
    fn terminal_statuses() {
        assert!(QueryStatus::Success.is_terminal());
        assert!(QueryStatus::Failed.is_terminal());
        assert!(QueryStatus::Skipped.is_terminal());
        assert!(!QueryStatus::Queued.is_terminal());
        assert!(!QueryStatus::Processing.is_terminal());
    }

    #[test]
    fn place_record_carries_ingest_envelope() {
        let place = PlaceRecord::new(
            "job-1",
            "bars",
            "AZ",
            "85001",
            1,
            "ChIJabc",
            None,
            "{\"placeId\":\"ChIJabc\"}",
        );
        assert_eq!(place.source, PLACE_SOURCE);
        assert_eq!(place.source_version, PLACE_SOURCE_VERSION);
        assert!(place.ingest_id.starts_with("job-1-ChIJabc-"));
        assert!(place.payload.is_none());
        assert!(!place.payload_raw.is_empty());
    }
}
