//! Batch execution: claim, parallel fan-out, idempotent persistence.
//!
//! Two orderings here are load-bearing:
//!
//! - Page-1 queries run before deeper pages of the same batch, so a sparse
//!   page 1 can cancel its sibling pages before they spend credits. Deeper
//!   pages still queued in later batches are skipped through the queue.
//! - Places are persisted BEFORE their queries are marked `success`. After a
//!   crash between the two writes, re-processing the still-`processing`
//!   queries re-upserts the same `(job_id, place_uid)` rows, which the store
//!   ignores. The reverse order could lose places.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::{PipelineError, Result, SearchError};
use crate::models::{ClaimedQuery, JobRecord, PlaceRecord, QueryOutcome, QueryStatus};
use crate::search::{PlaceSearch, SearchPage};
use crate::store::Store;

/// Marker recorded on rows cancelled by the early-exit optimization.
const EARLY_EXIT_MARKER: &str = "early_exit";

/// What one `process_batch` call did.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOutcome {
    /// Queries claimed and driven to a terminal status.
    pub processed: usize,
    /// Place rows newly inserted (upsert skips are not counted).
    pub places_stored: u64,
    /// Credits consumed by this batch's calls.
    pub credits: i64,
}

pub struct BatchExecutor<S> {
    store: Arc<S>,
    live: Arc<dyn PlaceSearch>,
    mock: Arc<dyn PlaceSearch>,
    early_exit_threshold: i64,
}

impl<S: Store> BatchExecutor<S> {
    pub fn new(
        store: Arc<S>,
        live: Arc<dyn PlaceSearch>,
        mock: Arc<dyn PlaceSearch>,
        early_exit_threshold: i64,
    ) -> Self {
        Self {
            store,
            live,
            mock,
            early_exit_threshold,
        }
    }

    /// Claim one batch for the job and drive it to terminal statuses.
    ///
    /// Per-query search failures are recorded as `failed` rows and never
    /// abort the batch. A persistence failure releases the claim and aborts;
    /// nothing was marked by then, so the queries retry cleanly.
    pub async fn process_batch(&self, job: &JobRecord) -> Result<BatchOutcome> {
        let batch = self.store.claim_batch(&job.job_id, job.batch_size).await?;
        if batch.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let claim_id = batch[0].claim_id.clone();
        tracing::info!(
            job_id = %job.job_id,
            %claim_id,
            batch = batch.len(),
            concurrency = job.concurrency,
            "processing batch"
        );

        let searcher = if job.dry_run {
            self.mock.clone()
        } else {
            self.live.clone()
        };

        // Page-1 queries first: their result counts decide whether deeper
        // pages of the same zip are worth calling at all.
        let (page_one, deeper): (Vec<_>, Vec<_>) =
            batch.iter().cloned().partition(|q| q.page == 1);

        let mut collected = Collected::default();
        let mut early_exit_zips: HashSet<String> = HashSet::new();

        let page_one_results = self.fan_out(&searcher, job.concurrency, page_one).await;
        self.collect(
            job,
            &claim_id,
            page_one_results,
            &mut collected,
            Some(&mut early_exit_zips),
        )
        .await?;

        // Sparse zips: cancel their deeper pages without spending credits.
        let mut to_search = Vec::with_capacity(deeper.len());
        for query in deeper {
            if early_exit_zips.contains(&query.zip) {
                collected.outcomes.push(QueryOutcome {
                    zip: query.zip,
                    page: query.page,
                    status: QueryStatus::Skipped,
                    api_status: None,
                    results_count: None,
                    credits: None,
                    error: Some(EARLY_EXIT_MARKER.to_string()),
                });
            } else {
                to_search.push(query);
            }
        }

        let deeper_results = self.fan_out(&searcher, job.concurrency, to_search).await;
        self.collect(job, &claim_id, deeper_results, &mut collected, None)
            .await?;

        // Places first (see module docs), then statuses, then queue-level
        // skips for pages not claimed by this batch.
        let places_stored = match self.store.store_places(&collected.places).await {
            Ok(n) => n,
            Err(e) => {
                self.abort(&job.job_id, &claim_id, "places upsert failed")
                    .await;
                return Err(PipelineError::BatchAbort {
                    job_id: job.job_id.clone(),
                    message: format!("places upsert failed: {e}"),
                });
            }
        };

        if let Err(e) = self
            .store
            .mark_results(&job.job_id, &claim_id, &collected.outcomes)
            .await
        {
            self.abort(&job.job_id, &claim_id, "status writeback failed")
                .await;
            return Err(PipelineError::BatchAbort {
                job_id: job.job_id.clone(),
                message: format!("status writeback failed: {e}"),
            });
        }

        if !early_exit_zips.is_empty() {
            let zips: Vec<String> = early_exit_zips.into_iter().collect();
            match self.store.skip_remaining_pages(&job.job_id, &zips).await {
                Ok(skipped) if skipped > 0 => {
                    tracing::info!(
                        job_id = %job.job_id,
                        zips = zips.len(),
                        skipped,
                        "early exit: skipped still-queued pages of sparse zips"
                    );
                }
                Ok(_) => {}
                // Purely an optimization; the pages just run normally later.
                Err(e) => {
                    tracing::warn!(job_id = %job.job_id, error = %e, "early-exit skip failed")
                }
            }
        }

        if let Err(e) = self.store.refresh_job_totals(&job.job_id).await {
            tracing::warn!(job_id = %job.job_id, error = %e, "rollup refresh failed");
        }

        Ok(BatchOutcome {
            processed: batch.len(),
            places_stored,
            credits: collected.credits,
        })
    }

    /// Run one search task per query, capped by the job's concurrency.
    async fn fan_out(
        &self,
        searcher: &Arc<dyn PlaceSearch>,
        concurrency: i64,
        queries: Vec<ClaimedQuery>,
    ) -> Vec<
        std::result::Result<
            (ClaimedQuery, std::result::Result<SearchPage, SearchError>),
            tokio::task::JoinError,
        >,
    > {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1) as usize));

        let mut handles = Vec::with_capacity(queries.len());
        for query in queries {
            let searcher = searcher.clone();
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore is never closed");
                let result = searcher.search(&query.q, query.page).await;
                (query, result)
            }));
        }

        futures::future::join_all(handles).await
    }

    /// Fold fan-out results into outcomes and place rows. When
    /// `early_exit_zips` is given (the page-1 pass), sparse results are
    /// recorded there.
    async fn collect(
        &self,
        job: &JobRecord,
        claim_id: &str,
        results: Vec<
            std::result::Result<
                (ClaimedQuery, std::result::Result<SearchPage, SearchError>),
                tokio::task::JoinError,
            >,
        >,
        collected: &mut Collected,
        mut early_exit_zips: Option<&mut HashSet<String>>,
    ) -> Result<()> {
        for item in results {
            let (query, result) = match item {
                Ok(pair) => pair,
                Err(join_err) => {
                    // A panicked search task poisons the whole batch; put the
                    // claim back and let the queries retry.
                    self.abort(&job.job_id, claim_id, "search task panicked")
                        .await;
                    return Err(PipelineError::TaskJoin(join_err));
                }
            };

            match result {
                Ok(page) => {
                    collected.credits += page.credits;
                    if let Some(zips) = early_exit_zips.as_deref_mut() {
                        if page.results_count < self.early_exit_threshold {
                            zips.insert(query.zip.clone());
                        }
                    }
                    self.collect_places(job, &query, &page, &mut collected.places);
                    collected.outcomes.push(QueryOutcome {
                        zip: query.zip,
                        page: query.page,
                        status: QueryStatus::Success,
                        api_status: Some(page.api_status),
                        results_count: Some(page.results_count),
                        credits: Some(page.credits),
                        error: None,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = %job.job_id,
                        zip = %query.zip,
                        page = query.page,
                        error = %e,
                        "query failed"
                    );
                    collected.outcomes.push(QueryOutcome {
                        zip: query.zip,
                        page: query.page,
                        status: QueryStatus::Failed,
                        api_status: e.api_status().map(i64::from),
                        results_count: None,
                        credits: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        Ok(())
    }

    fn collect_places(
        &self,
        job: &JobRecord,
        query: &ClaimedQuery,
        page: &SearchPage,
        places: &mut Vec<PlaceRecord>,
    ) {
        for found in &page.places {
            let mut place = PlaceRecord::new(
                &job.job_id,
                &job.keyword,
                &job.state,
                &query.zip,
                query.page,
                &found.place_uid,
                found.payload.clone(),
                &found.payload_raw,
            );
            place.api_status = Some(page.api_status);
            place.api_ms = Some(page.api_ms);
            place.results_count = Some(page.results_count);
            place.credits = Some(page.credits);
            places.push(place);
        }
    }

    /// Roll the claim back so the queries retry promptly; if the release
    /// itself fails, the stuck-claim reaper recovers them later.
    async fn abort(&self, job_id: &str, claim_id: &str, reason: &str) {
        match self.store.release_claim(claim_id).await {
            Ok(released) => {
                tracing::warn!(
                    job_id,
                    %claim_id,
                    released,
                    reason,
                    "batch aborted; claim released"
                )
            }
            Err(e) => {
                tracing::error!(
                    job_id,
                    %claim_id,
                    reason,
                    error = %e,
                    "batch aborted and claim release failed; reaper will recover"
                );
            }
        }
    }
}

#[derive(Default)]
struct Collected {
    outcomes: Vec<QueryOutcome>,
    places: Vec<PlaceRecord>,
    credits: i64,
}
