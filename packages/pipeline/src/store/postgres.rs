//! PostgreSQL storage backend.
//!
//! Every SQL string in the pipeline lives here. Batched statements bind
//! per-column arrays and join through `UNNEST`; large batches are chunked to
//! stay under parameter limits. Atomicity of the claim relies on the single
//! conditional `UPDATE`: the database serializes concurrent claimers, and
//! `FOR UPDATE SKIP LOCKED` keeps them from queueing on each other's rows.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::error::StorageResult;
use crate::models::{
    ClaimedQuery, JobRecord, JobTotals, NewQuery, PendingCounts, PlaceRecord, QueryOutcome,
    StatusCounts,
};

use super::{
    new_claim_id, JobStore, PlaceStore, QueryQueue, StoreHealth, ZipReference,
};

const JOB_COLUMNS: &str = "job_id, keyword, state, pages, batch_size, concurrency, dry_run, \
     status, created_at, started_at, finished_at, \
     zips, queries, successes, failures, skipped, places, credits";

pub struct PostgresStore {
    pool: PgPool,
    /// Rows per batched statement; caps bound-parameter volume.
    chunk_size: usize,
}

impl PostgresStore {
    /// Connect, run migrations, and return a ready store.
    pub async fn connect(database_url: &str, chunk_size: usize) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| crate::error::StorageError::Unavailable(Box::new(e)))?;

        Ok(Self::from_pool(pool, chunk_size))
    }

    /// Wrap an existing pool (migrations are the caller's problem).
    pub fn from_pool(pool: PgPool, chunk_size: usize) -> Self {
        Self {
            pool,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn enqueue_chunk(&self, job_id: &str, chunk: &[NewQuery]) -> StorageResult<u64> {
        let zips: Vec<&str> = chunk.iter().map(|q| q.zip.as_str()).collect();
        let pages: Vec<i64> = chunk.iter().map(|q| q.page).collect();
        let texts: Vec<&str> = chunk.iter().map(|q| q.q.as_str()).collect();

        let inserted = sqlx::query(
            r#"
            INSERT INTO queries (job_id, zip, page, q, status)
            SELECT $1, u.zip, u.page, u.q, 'queued'::query_status
            FROM UNNEST($2::text[], $3::bigint[], $4::text[]) AS u(zip, page, q)
            ON CONFLICT (job_id, zip, page) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(&zips)
        .bind(&pages)
        .bind(&texts)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(inserted)
    }

    async fn mark_results_chunk(
        &self,
        job_id: &str,
        claim_id: &str,
        chunk: &[QueryOutcome],
    ) -> StorageResult<u64> {
        let zips: Vec<&str> = chunk.iter().map(|o| o.zip.as_str()).collect();
        let pages: Vec<i64> = chunk.iter().map(|o| o.page).collect();
        let statuses: Vec<&str> = chunk.iter().map(|o| o.status.as_str()).collect();
        let api_statuses: Vec<Option<i64>> = chunk.iter().map(|o| o.api_status).collect();
        let results_counts: Vec<Option<i64>> = chunk.iter().map(|o| o.results_count).collect();
        let credits: Vec<Option<i64>> = chunk.iter().map(|o| o.credits).collect();
        let errors: Vec<Option<&str>> = chunk.iter().map(|o| o.error.as_deref()).collect();

        let updated = sqlx::query(
            r#"
            UPDATE queries AS t
            SET status = (u.status)::query_status,
                api_status = u.api_status,
                results_count = u.results_count,
                credits = u.credits,
                error = u.error,
                ran_at = NOW(),
                claim_id = NULL
            FROM UNNEST(
                $3::text[], $4::bigint[], $5::text[], $6::bigint[],
                $7::bigint[], $8::bigint[], $9::text[]
            ) AS u(zip, page, status, api_status, results_count, credits, error)
            WHERE t.job_id = $1
              AND t.claim_id = $2
              AND t.status = 'processing'
              AND t.zip = u.zip
              AND t.page = u.page
            "#,
        )
        .bind(job_id)
        .bind(claim_id)
        .bind(&zips)
        .bind(&pages)
        .bind(&statuses)
        .bind(&api_statuses)
        .bind(&results_counts)
        .bind(&credits)
        .bind(&errors)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated)
    }

    async fn store_places_chunk(&self, chunk: &[PlaceRecord]) -> StorageResult<u64> {
        let ingest_ids: Vec<&str> = chunk.iter().map(|p| p.ingest_id.as_str()).collect();
        let job_ids: Vec<&str> = chunk.iter().map(|p| p.job_id.as_str()).collect();
        let sources: Vec<&str> = chunk.iter().map(|p| p.source.as_str()).collect();
        let source_versions: Vec<&str> = chunk.iter().map(|p| p.source_version.as_str()).collect();
        let ingest_ts: Vec<DateTime<Utc>> = chunk.iter().map(|p| p.ingest_ts).collect();
        let keywords: Vec<&str> = chunk.iter().map(|p| p.keyword.as_str()).collect();
        let states: Vec<&str> = chunk.iter().map(|p| p.state.as_str()).collect();
        let zips: Vec<&str> = chunk.iter().map(|p| p.zip.as_str()).collect();
        let pages: Vec<i64> = chunk.iter().map(|p| p.page).collect();
        let place_uids: Vec<&str> = chunk.iter().map(|p| p.place_uid.as_str()).collect();
        let payloads: Vec<Option<Value>> = chunk.iter().map(|p| p.payload.clone()).collect();
        let payload_raws: Vec<&str> = chunk.iter().map(|p| p.payload_raw.as_str()).collect();
        let api_statuses: Vec<Option<i64>> = chunk.iter().map(|p| p.api_status).collect();
        let api_ms: Vec<Option<i64>> = chunk.iter().map(|p| p.api_ms).collect();
        let results_counts: Vec<Option<i64>> = chunk.iter().map(|p| p.results_count).collect();
        let credits: Vec<Option<i64>> = chunk.iter().map(|p| p.credits).collect();
        let errors: Vec<Option<&str>> = chunk.iter().map(|p| p.error.as_deref()).collect();

        let inserted = sqlx::query(
            r#"
            INSERT INTO places (
                ingest_id, job_id, source, source_version, ingest_ts,
                keyword, state, zip, page, place_uid,
                payload, payload_raw, api_status, api_ms, results_count, credits, error
            )
            SELECT * FROM UNNEST(
                $1::text[], $2::text[], $3::text[], $4::text[], $5::timestamptz[],
                $6::text[], $7::text[], $8::text[], $9::bigint[], $10::text[],
                $11::jsonb[], $12::text[], $13::bigint[], $14::bigint[],
                $15::bigint[], $16::bigint[], $17::text[]
            )
            ON CONFLICT (job_id, place_uid) DO NOTHING
            "#,
        )
        .bind(&ingest_ids)
        .bind(&job_ids)
        .bind(&sources)
        .bind(&source_versions)
        .bind(&ingest_ts)
        .bind(&keywords)
        .bind(&states)
        .bind(&zips)
        .bind(&pages)
        .bind(&place_uids)
        .bind(&payloads)
        .bind(&payload_raws)
        .bind(&api_statuses)
        .bind(&api_ms)
        .bind(&results_counts)
        .bind(&credits)
        .bind(&errors)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(inserted)
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn insert_job(&self, job: &JobRecord) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, keyword, state, pages, batch_size, concurrency, dry_run,
                status, created_at, started_at, finished_at,
                zips, queries, successes, failures, skipped, places, credits
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 0, 0, 0, 0, 0, 0, 0)
            "#,
        )
        .bind(&job.job_id)
        .bind(&job.keyword)
        .bind(&job.state)
        .bind(job.pages)
        .bind(job.batch_size)
        .bind(job.concurrency)
        .bind(job.dry_run)
        .bind(job.status)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> StorageResult<Option<JobRecord>> {
        let job = sqlx::query_as::<_, JobRecord>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn running_jobs(&self) -> StorageResult<Vec<JobRecord>> {
        let jobs = sqlx::query_as::<_, JobRecord>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'running' ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn mark_job_done(&self, job_id: &str) -> StorageResult<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'done',
                finished_at = COALESCE(finished_at, NOW())
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn refresh_job_totals(&self, job_id: &str) -> StorageResult<JobTotals> {
        let totals = sqlx::query_as::<_, JobTotals>(
            r#"
            UPDATE jobs
            SET zips = agg.zips,
                queries = agg.queries,
                successes = agg.successes,
                failures = agg.failures,
                skipped = agg.skipped,
                credits = agg.credits,
                places = (SELECT COUNT(*) FROM places WHERE job_id = $1)
            FROM (
                SELECT
                    COUNT(DISTINCT zip) AS zips,
                    COUNT(*) AS queries,
                    COUNT(*) FILTER (WHERE status = 'success') AS successes,
                    COUNT(*) FILTER (WHERE status = 'failed') AS failures,
                    COUNT(*) FILTER (WHERE status = 'skipped') AS skipped,
                    COALESCE(SUM(credits) FILTER (WHERE status <> 'queued'), 0)::BIGINT AS credits
                FROM queries
                WHERE job_id = $1
            ) AS agg
            WHERE jobs.job_id = $1
            RETURNING jobs.zips, jobs.queries, jobs.successes, jobs.failures,
                      jobs.skipped, jobs.places, jobs.credits
            "#,
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(totals)
    }

    async fn credits_spent_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<i64> {
        let credits = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COALESCE(SUM(credits), 0)::BIGINT
            FROM jobs
            WHERE created_at >= $1 AND created_at < $2
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        Ok(credits)
    }
}

#[async_trait]
impl QueryQueue for PostgresStore {
    async fn enqueue(&self, job_id: &str, queries: &[NewQuery]) -> StorageResult<u64> {
        let mut inserted = 0;
        for chunk in queries.chunks(self.chunk_size) {
            inserted += self.enqueue_chunk(job_id, chunk).await?;
        }
        Ok(inserted)
    }

    async fn claim_batch(
        &self,
        job_id: &str,
        batch_size: i64,
    ) -> StorageResult<Vec<ClaimedQuery>> {
        let claim_id = new_claim_id();

        let claimed = sqlx::query_as::<_, ClaimedQuery>(
            r#"
            WITH next_queries AS (
                SELECT zip, page
                FROM queries
                WHERE job_id = $1 AND status = 'queued'
                ORDER BY zip, page
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queries AS t
            SET status = 'processing',
                claim_id = $3,
                claimed_at = NOW()
            FROM next_queries AS n
            WHERE t.job_id = $1
              AND t.zip = n.zip
              AND t.page = n.page
              AND t.status = 'queued'
            RETURNING t.zip, t.page, t.q, t.claim_id
            "#,
        )
        .bind(job_id)
        .bind(batch_size)
        .bind(&claim_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(claimed)
    }

    async fn mark_results(
        &self,
        job_id: &str,
        claim_id: &str,
        outcomes: &[QueryOutcome],
    ) -> StorageResult<u64> {
        let mut updated = 0;
        for chunk in outcomes.chunks(self.chunk_size) {
            updated += self.mark_results_chunk(job_id, claim_id, chunk).await?;
        }
        Ok(updated)
    }

    async fn skip_remaining_pages(&self, job_id: &str, zips: &[String]) -> StorageResult<u64> {
        let mut skipped = 0;
        for chunk in zips.chunks(self.chunk_size) {
            skipped += sqlx::query(
                r#"
                UPDATE queries
                SET status = 'skipped',
                    error = 'early_exit',
                    ran_at = NOW()
                WHERE job_id = $1
                  AND zip = ANY($2)
                  AND page >= 2
                  AND status = 'queued'
                "#,
            )
            .bind(job_id)
            .bind(chunk)
            .execute(&self.pool)
            .await?
            .rows_affected();
        }
        Ok(skipped)
    }

    async fn release_claim(&self, claim_id: &str) -> StorageResult<u64> {
        let released = sqlx::query(
            r#"
            UPDATE queries
            SET status = 'queued',
                claim_id = NULL,
                claimed_at = NULL
            WHERE claim_id = $1 AND status = 'processing'
            "#,
        )
        .bind(claim_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(released)
    }

    async fn reap_stuck(&self, older_than: Duration) -> StorageResult<u64> {
        let reaped = sqlx::query(
            r#"
            UPDATE queries
            SET status = 'queued',
                claim_id = NULL,
                claimed_at = NULL
            WHERE status = 'processing'
              AND claimed_at < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(reaped)
    }

    async fn pending_counts(&self, job_id: &str) -> StorageResult<PendingCounts> {
        let counts = sqlx::query_as::<_, PendingCounts>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'queued') AS queued,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing
            FROM queries
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(counts)
    }

    async fn status_counts(&self, job_id: &str) -> StorageResult<StatusCounts> {
        let counts = sqlx::query_as::<_, StatusCounts>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'queued') AS queued,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'success') AS success,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'skipped') AS skipped
            FROM queries
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(counts)
    }
}

#[async_trait]
impl PlaceStore for PostgresStore {
    async fn store_places(&self, places: &[PlaceRecord]) -> StorageResult<u64> {
        let mut inserted = 0;
        for chunk in places.chunks(self.chunk_size) {
            inserted += self.store_places_chunk(chunk).await?;
        }
        Ok(inserted)
    }

    async fn count_places(&self, job_id: &str) -> StorageResult<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM places WHERE job_id = $1")
                .bind(job_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    async fn parse_success_ratio(&self, since: DateTime<Utc>) -> StorageResult<Option<f64>> {
        let (total, parsed) = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT COUNT(*), COUNT(payload)
            FROM places
            WHERE ingest_ts >= $1
            "#,
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        if total == 0 {
            Ok(None)
        } else {
            Ok(Some(parsed as f64 / total as f64))
        }
    }
}

#[async_trait]
impl ZipReference for PostgresStore {
    async fn zips_for_state(&self, state: &str) -> StorageResult<Vec<String>> {
        let zips = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT zip
            FROM geo_zips
            WHERE state = $1
            ORDER BY zip
            "#,
        )
        .bind(state.to_uppercase())
        .fetch_all(&self.pool)
        .await?;

        Ok(zips)
    }
}

#[async_trait]
impl StoreHealth for PostgresStore {
    async fn ping(&self) -> StorageResult<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}
