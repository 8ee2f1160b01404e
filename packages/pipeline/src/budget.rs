//! Cost accounting and the daily budget gate.
//!
//! The gate runs at job creation only; execution never aborts a job on cost.
//! Spend is attributed to the UTC day a job was created on, from the jobs
//! rollup credits.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::Settings;
use crate::error::{JobError, StorageResult};
use crate::store::JobStore;

/// Worst-case cost of a prospective job (pre-early-exit: one credit per
/// query).
#[derive(Debug, Clone, Copy, Serialize)]
pub struct JobEstimate {
    pub num_queries: i64,
    pub estimated_credits: i64,
    pub estimated_cost_usd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetState {
    Ok,
    Warning,
    Exceeded,
}

/// Today's spend measured against the configured ceiling.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetStatus {
    pub state: BudgetState,
    pub spent_today_usd: f64,
    pub budget_used_pct: f64,
    pub remaining_budget_usd: f64,
    pub daily_budget_usd: f64,
}

pub struct BudgetGuard<S> {
    store: Arc<S>,
    daily_budget_usd: f64,
    cost_per_credit: f64,
    soft_pct: f64,
    hard_pct: f64,
}

impl<S: JobStore> BudgetGuard<S> {
    pub fn new(store: Arc<S>, settings: &Settings) -> Self {
        Self {
            store,
            daily_budget_usd: settings.daily_budget_usd,
            cost_per_credit: settings.cost_per_credit,
            soft_pct: settings.budget_soft_pct,
            hard_pct: settings.budget_hard_pct,
        }
    }

    /// Each query consumes one credit in the worst case.
    pub fn estimate(&self, num_queries: i64) -> JobEstimate {
        JobEstimate {
            num_queries,
            estimated_credits: num_queries,
            estimated_cost_usd: num_queries as f64 * self.cost_per_credit,
        }
    }

    /// Credits spent by jobs created on the current UTC day.
    pub async fn spent_today_usd(&self) -> StorageResult<f64> {
        let start = start_of_utc_day(Utc::now());
        let end = start + Duration::days(1);
        let credits = self.store.credits_spent_between(start, end).await?;
        Ok(credits as f64 * self.cost_per_credit)
    }

    pub async fn status(&self) -> StorageResult<BudgetStatus> {
        let spent = self.spent_today_usd().await?;
        Ok(self.status_for_spend(spent, 0.0))
    }

    /// Gate a prospective job. Hard-threshold breaches fail with both the
    /// estimate and the remaining budget; soft-threshold crossings only log.
    pub async fn validate(&self, num_queries: i64) -> Result<JobEstimate, JobError> {
        let estimate = self.estimate(num_queries);
        let spent = self.spent_today_usd().await?;
        let status = self.status_for_spend(spent, estimate.estimated_cost_usd);

        match status.state {
            BudgetState::Exceeded => Err(JobError::BudgetExceeded {
                estimated_cost_usd: estimate.estimated_cost_usd,
                remaining_budget_usd: status.remaining_budget_usd,
                daily_budget_usd: self.daily_budget_usd,
            }),
            BudgetState::Warning => {
                tracing::warn!(
                    spent_today_usd = spent,
                    estimated_cost_usd = estimate.estimated_cost_usd,
                    budget_used_pct = status.budget_used_pct,
                    daily_budget_usd = self.daily_budget_usd,
                    "job approaches the daily budget"
                );
                Ok(estimate)
            }
            BudgetState::Ok => Ok(estimate),
        }
    }

    fn status_for_spend(&self, spent_usd: f64, projected_usd: f64) -> BudgetStatus {
        let projected = spent_usd + projected_usd;
        let used_pct = if self.daily_budget_usd > 0.0 {
            projected / self.daily_budget_usd * 100.0
        } else {
            100.0
        };
        let state = if used_pct > self.hard_pct {
            BudgetState::Exceeded
        } else if used_pct >= self.soft_pct {
            BudgetState::Warning
        } else {
            BudgetState::Ok
        };
        BudgetStatus {
            state,
            spent_today_usd: spent_usd,
            budget_used_pct: used_pct,
            remaining_budget_usd: self.daily_budget_usd - spent_usd,
            daily_budget_usd: self.daily_budget_usd,
        }
    }
}

fn start_of_utc_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobParams, JobRecord};
    use crate::store::MemoryStore;

    async fn guard_with(spent_credits: i64, settings: Settings) -> BudgetGuard<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        if spent_credits > 0 {
            let params = JobParams::new("bars", "AZ", 1, 100, 20, false).unwrap();
            let mut job = JobRecord::from_params("seed-job", &params);
            job.totals.credits = spent_credits;
            store.insert_job(&job).await.unwrap();
        }
        BudgetGuard::new(store, &settings)
    }

    fn settings(daily: f64, cost: f64, soft: f64, hard: f64) -> Settings {
        Settings {
            daily_budget_usd: daily,
            cost_per_credit: cost,
            budget_soft_pct: soft,
            budget_hard_pct: hard,
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn estimate_is_one_credit_per_query() {
        let guard = guard_with(0, settings(50.0, 0.01, 80.0, 100.0)).await;
        let est = guard.estimate(200);
        assert_eq!(est.estimated_credits, 200);
        assert!((est.estimated_cost_usd - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn job_within_budget_passes() {
        let guard = guard_with(0, settings(50.0, 0.01, 80.0, 100.0)).await;
        assert!(guard.validate(100).await.is_ok());
    }

    #[tokio::test]
    async fn job_over_hard_threshold_is_blocked() {
        // 200 queries at $0.01 = $2.00 against a $1 budget.
        let guard = guard_with(0, settings(1.0, 0.01, 80.0, 100.0)).await;
        let err = guard.validate(200).await.unwrap_err();
        match err {
            JobError::BudgetExceeded {
                estimated_cost_usd,
                remaining_budget_usd,
                daily_budget_usd,
            } => {
                assert!((estimated_cost_usd - 2.0).abs() < f64::EPSILON);
                assert!(remaining_budget_usd < 1.0 + f64::EPSILON);
                assert!((daily_budget_usd - 1.0).abs() < f64::EPSILON);
            }
            other => panic!("expected BudgetExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn prior_spend_counts_against_the_ceiling() {
        // 40 credits spent at $1 each = $40 of a $50 budget; $20 more breaches.
        let guard = guard_with(40, settings(50.0, 1.0, 80.0, 100.0)).await;
        assert!(guard.validate(20).await.is_err());
        assert!(guard.validate(5).await.is_ok());
    }

    #[tokio::test]
    async fn soft_threshold_warns_but_allows() {
        // 85% projected usage with soft at 80, hard at 100.
        let guard = guard_with(0, settings(100.0, 1.0, 80.0, 100.0)).await;
        assert!(guard.validate(85).await.is_ok());
    }

    #[tokio::test]
    async fn exactly_at_hard_threshold_is_allowed() {
        let guard = guard_with(0, settings(1.0, 0.5, 80.0, 200.0)).await;
        // $1.00 exactly fills but does not exceed the $2 hard ceiling.
        assert!(guard.validate(4).await.is_ok());
    }
}
