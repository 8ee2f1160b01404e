//! In-memory storage backend.
//!
//! Implements the same claim/upsert semantics as the Postgres backend behind
//! one mutex, so integration tests can exercise the full pipeline without a
//! database. Also carries optional failure injection for crash-path tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{StorageError, StorageResult};
use crate::models::{
    ClaimedQuery, JobRecord, JobStatus, JobTotals, NewQuery, PendingCounts, PlaceRecord,
    QueryOutcome, QueryRecord, QueryStatus, StatusCounts,
};

use super::{
    new_claim_id, JobStore, PlaceStore, QueryQueue, StoreHealth, ZipReference,
};

#[derive(Default)]
struct Inner {
    jobs: BTreeMap<String, JobRecord>,
    /// Keyed by (job_id, zip, page); BTreeMap keeps claim order deterministic.
    queries: BTreeMap<(String, String, i64), QueryRecord>,
    /// Keyed by (job_id, place_uid).
    places: BTreeMap<(String, String), PlaceRecord>,
    zips: BTreeMap<String, Vec<String>>,
    fail_store_places: u32,
    fail_mark_results: u32,
}

/// Mutex-guarded store double. Claims are atomic because every operation
/// holds the single lock for its whole duration.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed reference zips for a state (builder pattern).
    pub fn with_zips(self, state: &str, zips: &[&str]) -> Self {
        self.set_zips(state, zips);
        self
    }

    pub fn set_zips(&self, state: &str, zips: &[&str]) {
        let mut inner = self.inner.lock().unwrap();
        inner.zips.insert(
            state.to_uppercase(),
            zips.iter().map(|z| z.to_string()).collect(),
        );
    }

    /// Make the next `n` `store_places` calls fail (crash simulation).
    pub fn fail_next_store_places(&self, n: u32) {
        self.inner.lock().unwrap().fail_store_places = n;
    }

    /// Make the next `n` `mark_results` calls fail (crash simulation).
    pub fn fail_next_mark_results(&self, n: u32) {
        self.inner.lock().unwrap().fail_mark_results = n;
    }

    /// Snapshot of a job's query rows, in `(zip, page)` order.
    pub fn query_rows(&self, job_id: &str) -> Vec<QueryRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .queries
            .values()
            .filter(|q| q.job_id == job_id)
            .cloned()
            .collect()
    }

    /// Snapshot of a job's place rows.
    pub fn place_rows(&self, job_id: &str) -> Vec<PlaceRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .places
            .values()
            .filter(|p| p.job_id == job_id)
            .cloned()
            .collect()
    }

    fn unavailable(message: &str) -> StorageError {
        StorageError::Unavailable(message.to_string().into())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, job: &JobRecord) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.jobs.contains_key(&job.job_id) {
            return Err(StorageError::Invariant {
                message: format!("duplicate job_id {}", job.job_id),
            });
        }
        inner.jobs.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> StorageResult<Option<JobRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.jobs.get(job_id).cloned())
    }

    async fn running_jobs(&self) -> StorageResult<Vec<JobRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut jobs: Vec<JobRecord> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn mark_job_done(&self, job_id: &str) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(job_id) {
            job.status = JobStatus::Done;
            if job.finished_at.is_none() {
                job.finished_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn refresh_job_totals(&self, job_id: &str) -> StorageResult<JobTotals> {
        let mut inner = self.inner.lock().unwrap();

        let mut totals = JobTotals::default();
        let mut zips = std::collections::BTreeSet::new();
        for q in inner.queries.values().filter(|q| q.job_id == job_id) {
            zips.insert(q.zip.clone());
            totals.queries += 1;
            match q.status {
                QueryStatus::Success => totals.successes += 1,
                QueryStatus::Failed => totals.failures += 1,
                QueryStatus::Skipped => totals.skipped += 1,
                QueryStatus::Queued | QueryStatus::Processing => {}
            }
            if q.status != QueryStatus::Queued {
                totals.credits += q.credits.unwrap_or(0);
            }
        }
        totals.zips = zips.len() as i64;
        totals.places = inner
            .places
            .values()
            .filter(|p| p.job_id == job_id)
            .count() as i64;

        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| Self::unavailable("job not found"))?;
        job.totals = totals;

        Ok(totals)
    }

    async fn credits_spent_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.created_at >= start && j.created_at < end)
            .map(|j| j.totals.credits)
            .sum())
    }
}

#[async_trait]
impl QueryQueue for MemoryStore {
    async fn enqueue(&self, job_id: &str, queries: &[NewQuery]) -> StorageResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let mut inserted = 0;
        for q in queries {
            let key = (job_id.to_string(), q.zip.clone(), q.page);
            if inner.queries.contains_key(&key) {
                continue;
            }
            inner.queries.insert(
                key,
                QueryRecord {
                    job_id: job_id.to_string(),
                    zip: q.zip.clone(),
                    page: q.page,
                    q: q.q.clone(),
                    status: QueryStatus::Queued,
                    claim_id: None,
                    claimed_at: None,
                    api_status: None,
                    results_count: None,
                    credits: None,
                    error: None,
                    ran_at: None,
                },
            );
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn claim_batch(
        &self,
        job_id: &str,
        batch_size: i64,
    ) -> StorageResult<Vec<ClaimedQuery>> {
        let mut inner = self.inner.lock().unwrap();
        let claim_id = new_claim_id();
        let now = Utc::now();

        let keys: Vec<(String, String, i64)> = inner
            .queries
            .values()
            .filter(|q| q.job_id == job_id && q.status == QueryStatus::Queued)
            .take(batch_size.max(0) as usize)
            .map(|q| (q.job_id.clone(), q.zip.clone(), q.page))
            .collect();

        let mut claimed = Vec::with_capacity(keys.len());
        for key in keys {
            let row = inner.queries.get_mut(&key).expect("key just collected");
            row.status = QueryStatus::Processing;
            row.claim_id = Some(claim_id.clone());
            row.claimed_at = Some(now);
            claimed.push(ClaimedQuery {
                zip: row.zip.clone(),
                page: row.page,
                q: row.q.clone(),
                claim_id: claim_id.clone(),
            });
        }

        Ok(claimed)
    }

    async fn mark_results(
        &self,
        job_id: &str,
        claim_id: &str,
        outcomes: &[QueryOutcome],
    ) -> StorageResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_mark_results > 0 {
            inner.fail_mark_results -= 1;
            return Err(Self::unavailable("injected mark_results failure"));
        }

        let now = Utc::now();
        let mut updated = 0;
        for outcome in outcomes {
            let key = (job_id.to_string(), outcome.zip.clone(), outcome.page);
            let Some(row) = inner.queries.get_mut(&key) else {
                continue;
            };
            if row.status != QueryStatus::Processing || row.claim_id.as_deref() != Some(claim_id)
            {
                continue;
            }
            row.status = outcome.status;
            row.api_status = outcome.api_status;
            row.results_count = outcome.results_count;
            row.credits = outcome.credits;
            row.error = outcome.error.clone();
            row.ran_at = Some(now);
            row.claim_id = None;
            updated += 1;
        }
        Ok(updated)
    }

    async fn skip_remaining_pages(&self, job_id: &str, zips: &[String]) -> StorageResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let mut skipped = 0;
        for row in inner.queries.values_mut() {
            if row.job_id == job_id
                && row.page >= 2
                && row.status == QueryStatus::Queued
                && zips.contains(&row.zip)
            {
                row.status = QueryStatus::Skipped;
                row.error = Some("early_exit".to_string());
                row.ran_at = Some(now);
                skipped += 1;
            }
        }
        Ok(skipped)
    }

    async fn release_claim(&self, claim_id: &str) -> StorageResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let mut released = 0;
        for row in inner.queries.values_mut() {
            if row.status == QueryStatus::Processing && row.claim_id.as_deref() == Some(claim_id)
            {
                row.status = QueryStatus::Queued;
                row.claim_id = None;
                row.claimed_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn reap_stuck(&self, older_than: Duration) -> StorageResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));
        let mut reaped = 0;
        for row in inner.queries.values_mut() {
            if row.status == QueryStatus::Processing
                && row.claimed_at.map(|t| t < cutoff).unwrap_or(false)
            {
                row.status = QueryStatus::Queued;
                row.claim_id = None;
                row.claimed_at = None;
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    async fn pending_counts(&self, job_id: &str) -> StorageResult<PendingCounts> {
        let inner = self.inner.lock().unwrap();
        let mut counts = PendingCounts::default();
        for q in inner.queries.values().filter(|q| q.job_id == job_id) {
            match q.status {
                QueryStatus::Queued => counts.queued += 1,
                QueryStatus::Processing => counts.processing += 1,
                _ => {}
            }
        }
        Ok(counts)
    }

    async fn status_counts(&self, job_id: &str) -> StorageResult<StatusCounts> {
        let inner = self.inner.lock().unwrap();
        let mut counts = StatusCounts::default();
        for q in inner.queries.values().filter(|q| q.job_id == job_id) {
            match q.status {
                QueryStatus::Queued => counts.queued += 1,
                QueryStatus::Processing => counts.processing += 1,
                QueryStatus::Success => counts.success += 1,
                QueryStatus::Failed => counts.failed += 1,
                QueryStatus::Skipped => counts.skipped += 1,
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl PlaceStore for MemoryStore {
    async fn store_places(&self, places: &[PlaceRecord]) -> StorageResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_store_places > 0 {
            inner.fail_store_places -= 1;
            return Err(Self::unavailable("injected store_places failure"));
        }

        let mut inserted = 0;
        for place in places {
            let key = (place.job_id.clone(), place.place_uid.clone());
            if inner.places.contains_key(&key) {
                continue;
            }
            inner.places.insert(key, place.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn count_places(&self, job_id: &str) -> StorageResult<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .places
            .values()
            .filter(|p| p.job_id == job_id)
            .count() as i64)
    }

    async fn parse_success_ratio(&self, since: DateTime<Utc>) -> StorageResult<Option<f64>> {
        let inner = self.inner.lock().unwrap();
        let mut total = 0u64;
        let mut parsed = 0u64;
        for place in inner.places.values().filter(|p| p.ingest_ts >= since) {
            total += 1;
            if place.payload.is_some() {
                parsed += 1;
            }
        }
        if total == 0 {
            Ok(None)
        } else {
            Ok(Some(parsed as f64 / total as f64))
        }
    }
}

#[async_trait]
impl ZipReference for MemoryStore {
    async fn zips_for_state(&self, state: &str) -> StorageResult<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .zips
            .get(&state.to_uppercase())
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl StoreHealth for MemoryStore {
    async fn ping(&self) -> StorageResult<()> {
        Ok(())
    }
}
