//! Job lifecycle: validated creation, expansion + enqueue, status reads.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::budget::BudgetGuard;
use crate::config::Settings;
use crate::error::JobError;
use crate::expand::expand_queries;
use crate::models::{JobParams, JobRecord, StatusCounts};
use crate::store::Store;

/// Summary returned to the caller after a successful create.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedJob {
    pub job_id: String,
    pub keyword: String,
    pub state: String,
    pub total_zips: usize,
    pub total_queries: i64,
    pub queries_enqueued: u64,
}

pub struct JobService<S> {
    store: Arc<S>,
    budget: BudgetGuard<S>,
    use_mock_api: bool,
}

impl<S: Store> JobService<S> {
    pub fn new(store: Arc<S>, settings: &Settings) -> Self {
        Self {
            budget: BudgetGuard::new(store.clone(), settings),
            store,
            use_mock_api: settings.use_mock_api,
        }
    }

    /// Create a job: validate, gate on budget, persist the job row, expand
    /// and enqueue every (zip, page) query.
    ///
    /// The enqueue is idempotent on `(job_id, zip, page)`, so a crashed
    /// creator retrying the same job id cannot duplicate rows.
    pub async fn create_job(&self, params: JobParams) -> Result<CreatedJob, JobError> {
        let zips = self.store.zips_for_state(&params.state).await?;
        if zips.is_empty() {
            return Err(JobError::Validation {
                message: format!("no zip codes found for state {}", params.state),
            });
        }

        let total_queries = zips.len() as i64 * params.pages;

        // Mock and dry-run jobs spend no credits; the gate only guards live
        // spend.
        if !params.dry_run && !self.use_mock_api {
            let estimate = self.budget.validate(total_queries).await?;
            tracing::info!(
                estimated_cost_usd = estimate.estimated_cost_usd,
                estimated_credits = estimate.estimated_credits,
                "budget check passed"
            );
        }

        let job_id = Uuid::new_v4().to_string();
        let job = JobRecord::from_params(&job_id, &params);
        self.store.insert_job(&job).await?;

        let queries = expand_queries(&params.keyword, &zips, params.pages);
        let queries_enqueued = self.store.enqueue(&job_id, &queries).await?;

        tracing::info!(
            %job_id,
            keyword = %params.keyword,
            state = %params.state,
            total_zips = zips.len(),
            total_queries,
            queries_enqueued,
            "job created"
        );

        Ok(CreatedJob {
            job_id,
            keyword: params.keyword,
            state: params.state,
            total_zips: zips.len(),
            total_queries,
            queries_enqueued,
        })
    }

    pub async fn get_job(&self, job_id: &str) -> Result<JobRecord, JobError> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound {
                job_id: job_id.to_string(),
            })
    }

    /// Job row plus live per-status counts, for monitoring.
    pub async fn job_overview(
        &self,
        job_id: &str,
    ) -> Result<(JobRecord, StatusCounts), JobError> {
        let job = self.get_job(job_id).await?;
        let counts = self.store.status_counts(job_id).await?;
        Ok((job, counts))
    }
}
