//! Typed errors for the pipeline core.
//!
//! Uses `thiserror` for library errors (not `anyhow`) so callers can match
//! on failure classes; the CLI binary wraps these in `anyhow` at the edge.

use thiserror::Error;

/// Errors from the durable store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Transient store failure; the operation may be retried.
    #[error("storage unavailable: {0}")]
    Unavailable(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The store reported a state that violates a pipeline invariant.
    #[error("storage invariant violated: {message}")]
    Invariant { message: String },
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        StorageError::Unavailable(Box::new(e))
    }
}

/// Errors from the search layer, classified for retry decisions.
#[derive(Debug, Error)]
pub enum SearchError {
    /// Transient failure (timeout, transport, 5xx, 429); worth retrying.
    #[error("transient search failure: {message}")]
    Transient {
        api_status: Option<u16>,
        message: String,
    },

    /// Permanent failure (other 4xx, malformed body); retrying cannot help.
    #[error("permanent search failure: {message}")]
    Permanent {
        api_status: Option<u16>,
        message: String,
    },
}

impl SearchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SearchError::Transient { .. })
    }

    pub fn api_status(&self) -> Option<u16> {
        match self {
            SearchError::Transient { api_status, .. }
            | SearchError::Permanent { api_status, .. } => *api_status,
        }
    }
}

impl From<serper_client::SerperError> for SearchError {
    fn from(e: serper_client::SerperError) -> Self {
        let api_status = e.api_status();
        if e.is_retryable() {
            SearchError::Transient {
                api_status,
                message: e.to_string(),
            }
        } else {
            SearchError::Permanent {
                api_status,
                message: e.to_string(),
            }
        }
    }
}

/// Errors surfaced to the caller at job creation.
#[derive(Debug, Error)]
pub enum JobError {
    /// Bad job parameters; nothing was persisted.
    #[error("invalid job parameters: {message}")]
    Validation { message: String },

    /// The job's worst-case cost does not fit today's remaining budget.
    #[error(
        "daily budget exceeded: estimated cost ${estimated_cost_usd:.2}, \
         remaining budget ${remaining_budget_usd:.2} of ${daily_budget_usd:.2}"
    )]
    BudgetExceeded {
        estimated_cost_usd: f64,
        remaining_budget_usd: f64,
        daily_budget_usd: f64,
    },

    /// Referenced job does not exist.
    #[error("job not found: {job_id}")]
    NotFound { job_id: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Top-level pipeline errors.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("search error: {0}")]
    Search(#[from] SearchError),

    #[error("job error: {0}")]
    Job(#[from] JobError),

    /// The batch was abandoned before any query was marked done; its claim
    /// has been released and the queries will be retried.
    #[error("batch aborted for job {job_id}: {message}")]
    BatchAbort { job_id: String, message: String },

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
pub type StorageResult<T> = std::result::Result<T, StorageError>;
pub type SearchResult<T> = std::result::Result<T, SearchError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serper_client::SerperError;

    #[test]
    fn retryable_wire_errors_map_to_transient() {
        let err: SearchError = SerperError::Api {
            status: 503,
            message: "unavailable".into(),
        }
        .into();
        assert!(err.is_transient());
        assert_eq!(err.api_status(), Some(503));
    }

    #[test]
    fn permanent_wire_errors_map_to_permanent() {
        let err: SearchError = SerperError::Api {
            status: 403,
            message: "forbidden".into(),
        }
        .into();
        assert!(!err.is_transient());
    }

    #[test]
    fn budget_error_names_both_figures() {
        let err = JobError::BudgetExceeded {
            estimated_cost_usd: 2.0,
            remaining_budget_usd: 0.75,
            daily_budget_usd: 1.0,
        };
        let text = err.to_string();
        assert!(text.contains("2.00"));
        assert!(text.contains("0.75"));
    }
}
