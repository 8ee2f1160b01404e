//! Storage adapter seams.
//!
//! The rest of the pipeline talks to the durable store through these traits
//! and typed rows; SQL exists only inside the backends. `PostgresStore` is
//! the production backend, `MemoryStore` the in-process test double with the
//! same claim/upsert semantics.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StorageResult;
use crate::models::{
    ClaimedQuery, JobRecord, JobTotals, NewQuery, PendingCounts, PlaceRecord, QueryOutcome,
    StatusCounts,
};

/// Job rows: creation, lookup, lifecycle, rollup.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &JobRecord) -> StorageResult<()>;

    async fn get_job(&self, job_id: &str) -> StorageResult<Option<JobRecord>>;

    /// All jobs with status `running`, oldest first.
    async fn running_jobs(&self) -> StorageResult<Vec<JobRecord>>;

    /// Idempotent: sets `done` and stamps `finished_at` once.
    async fn mark_job_done(&self, job_id: &str) -> StorageResult<()>;

    /// Recompute rollup totals from the query and place tables.
    async fn refresh_job_totals(&self, job_id: &str) -> StorageResult<JobTotals>;

    /// Sum of rollup credits over jobs created in `[start, end)`.
    async fn credits_spent_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<i64>;
}

/// The queue protocol: atomic claim, idempotent enqueue, guarded writeback.
#[async_trait]
pub trait QueryQueue: Send + Sync {
    /// Insert-if-absent on `(job_id, zip, page)`; existing rows are left
    /// untouched. Returns the number of newly inserted rows.
    async fn enqueue(&self, job_id: &str, queries: &[NewQuery]) -> StorageResult<u64>;

    /// Atomically flip up to `batch_size` queued rows (lowest `(zip, page)`
    /// first) to `processing` under a fresh claim id and return them.
    /// Concurrent claimers receive disjoint sets.
    async fn claim_batch(
        &self,
        job_id: &str,
        batch_size: i64,
    ) -> StorageResult<Vec<ClaimedQuery>>;

    /// Write terminal outcomes for rows of this claim. Only rows still in
    /// `processing` under `claim_id` are touched, so repeats are no-ops.
    async fn mark_results(
        &self,
        job_id: &str,
        claim_id: &str,
        outcomes: &[QueryOutcome],
    ) -> StorageResult<u64>;

    /// Early exit: transition still-queued pages ≥ 2 of the given zips to
    /// `skipped` with `error = "early_exit"`.
    async fn skip_remaining_pages(&self, job_id: &str, zips: &[String]) -> StorageResult<u64>;

    /// Roll an aborted batch straight back to `queued`.
    async fn release_claim(&self, claim_id: &str) -> StorageResult<u64>;

    /// Return `processing` rows claimed longer than `older_than` ago to
    /// `queued` (crash recovery).
    async fn reap_stuck(&self, older_than: Duration) -> StorageResult<u64>;

    async fn pending_counts(&self, job_id: &str) -> StorageResult<PendingCounts>;

    async fn status_counts(&self, job_id: &str) -> StorageResult<StatusCounts>;
}

/// Place rows: idempotent upsert keyed on `(job_id, place_uid)`.
#[async_trait]
pub trait PlaceStore: Send + Sync {
    /// Insert places, skipping `(job_id, place_uid)` pairs already present.
    /// Returns the number of newly inserted rows.
    async fn store_places(&self, places: &[PlaceRecord]) -> StorageResult<u64>;

    async fn count_places(&self, job_id: &str) -> StorageResult<i64>;

    /// Share of place rows since `since` whose payload parsed; `None` when
    /// there are no rows in the window.
    async fn parse_success_ratio(&self, since: DateTime<Utc>) -> StorageResult<Option<f64>>;
}

/// Read-only reference data: ordered zips per state. Not owned by this
/// system.
#[async_trait]
pub trait ZipReference: Send + Sync {
    async fn zips_for_state(&self, state: &str) -> StorageResult<Vec<String>>;
}

/// Connectivity probe for health checks.
#[async_trait]
pub trait StoreHealth: Send + Sync {
    async fn ping(&self) -> StorageResult<()>;
}

/// The full storage capability set a worker needs.
pub trait Store:
    JobStore + QueryQueue + PlaceStore + ZipReference + StoreHealth + 'static
{
}

impl<T: JobStore + QueryQueue + PlaceStore + ZipReference + StoreHealth + 'static> Store for T {}

/// A claim id unique to one dequeue call: wall clock plus random suffix.
pub(crate) fn new_claim_id() -> String {
    let entropy = Uuid::new_v4().simple().to_string();
    format!("claim-{}-{}", Utc::now().timestamp(), &entropy[..9])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn claim_ids_are_unique_and_prefixed() {
        let ids: HashSet<String> = (0..1000).map(|_| new_claim_id()).collect();
        assert_eq!(ids.len(), 1000);
        assert!(ids.iter().all(|id| id.starts_with("claim-")));
    }
}
