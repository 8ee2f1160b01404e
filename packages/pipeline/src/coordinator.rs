//! The worker loop: claim batches for every running job until none remain.
//!
//! Multiple workers (in this process or others) run the same loop against
//! the shared store; the claim protocol keeps their batches disjoint. Each
//! iteration also sweeps stuck claims so abandoned batches resurface.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{PipelineError, Result};
use crate::executor::BatchExecutor;
use crate::store::Store;

/// Tally of one worker run (or several, merged).
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub batches_processed: u64,
    pub queries_processed: u64,
    pub places_stored: u64,
    pub jobs_completed: Vec<String>,
}

impl RunSummary {
    fn merge(&mut self, other: RunSummary) {
        self.batches_processed += other.batches_processed;
        self.queries_processed += other.queries_processed;
        self.places_stored += other.places_stored;
        self.jobs_completed.extend(other.jobs_completed);
    }
}

pub struct Coordinator<S> {
    store: Arc<S>,
    executor: Arc<BatchExecutor<S>>,
    worker_id: String,
    loop_delay: Duration,
    idle_poll: Duration,
    reclaim_after: Duration,
}

impl<S: Store> Coordinator<S> {
    pub fn new(store: Arc<S>, executor: Arc<BatchExecutor<S>>, settings: &Settings) -> Self {
        Self {
            store,
            executor,
            worker_id: format!("worker-{}", Uuid::new_v4()),
            loop_delay: settings.loop_delay(),
            idle_poll: settings.idle_poll(),
            reclaim_after: settings.reclaim_after(),
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Process batches for all running jobs until none remain, then return.
    ///
    /// Cancellation is graceful at the batch boundary: an in-flight batch
    /// finishes and writes back before the loop exits.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunSummary> {
        tracing::info!(worker_id = %self.worker_id, "worker starting");
        let mut summary = RunSummary::default();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.reap_stuck_claims().await;

            let running = match self.store.running_jobs().await {
                Ok(jobs) => jobs,
                Err(e) => {
                    tracing::warn!(
                        worker_id = %self.worker_id,
                        error = %e,
                        "could not list running jobs; retrying"
                    );
                    if self.pause(&cancel, self.idle_poll).await {
                        break;
                    }
                    continue;
                }
            };

            if running.is_empty() {
                tracing::info!(worker_id = %self.worker_id, "no running jobs; worker exiting");
                break;
            }

            // One batch per job per iteration keeps multi-job runs fair.
            let mut processed_any = false;
            for job in &running {
                if cancel.is_cancelled() {
                    break;
                }

                match self.executor.process_batch(job).await {
                    Ok(outcome) if outcome.processed > 0 => {
                        processed_any = true;
                        summary.batches_processed += 1;
                        summary.queries_processed += outcome.processed as u64;
                        summary.places_stored += outcome.places_stored;
                        tracing::info!(
                            worker_id = %self.worker_id,
                            job_id = %job.job_id,
                            queries = outcome.processed,
                            places = outcome.places_stored,
                            credits = outcome.credits,
                            "batch complete"
                        );
                    }
                    Ok(_) => {
                        if self.try_finish_job(&job.job_id).await {
                            summary.jobs_completed.push(job.job_id.clone());
                        }
                    }
                    Err(PipelineError::BatchAbort { job_id, message }) => {
                        tracing::warn!(
                            worker_id = %self.worker_id,
                            job_id = %job_id,
                            message = %message,
                            "batch aborted; queries will be retried"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            worker_id = %self.worker_id,
                            job_id = %job.job_id,
                            error = %e,
                            "batch failed; continuing"
                        );
                    }
                }
            }

            let delay = if processed_any {
                self.loop_delay
            } else {
                // Jobs exist but yielded no claims (another worker holds
                // them); poll less aggressively.
                self.idle_poll
            };
            if self.pause(&cancel, delay).await {
                break;
            }
        }

        tracing::info!(
            worker_id = %self.worker_id,
            batches = summary.batches_processed,
            queries = summary.queries_processed,
            completed = summary.jobs_completed.len(),
            "worker stopped"
        );
        Ok(summary)
    }

    /// Mark the job done iff nothing is queued or in flight. Another
    /// worker's in-progress batch keeps the job running.
    async fn try_finish_job(&self, job_id: &str) -> bool {
        let counts = match self.store.pending_counts(job_id).await {
            Ok(counts) => counts,
            Err(e) => {
                tracing::warn!(job_id, error = %e, "completion check failed");
                return false;
            }
        };
        if !counts.is_drained() {
            return false;
        }

        if let Err(e) = self.store.refresh_job_totals(job_id).await {
            tracing::warn!(job_id, error = %e, "final rollup refresh failed");
        }
        match self.store.mark_job_done(job_id).await {
            Ok(()) => {
                tracing::info!(job_id, "job complete");
                true
            }
            Err(e) => {
                tracing::warn!(job_id, error = %e, "could not mark job done; will retry");
                false
            }
        }
    }

    async fn reap_stuck_claims(&self) {
        match self.store.reap_stuck(self.reclaim_after).await {
            Ok(0) => {}
            Ok(reaped) => {
                tracing::warn!(
                    worker_id = %self.worker_id,
                    reaped,
                    "returned stuck claims to the queue"
                );
            }
            Err(e) => {
                tracing::warn!(worker_id = %self.worker_id, error = %e, "stuck-claim sweep failed")
            }
        }
    }

    /// Sleep unless cancelled; returns true when cancellation fired.
    async fn pause(&self, cancel: &CancellationToken, delay: Duration) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }
}

/// Run `processor_max_workers` coordinator loops concurrently and merge
/// their summaries.
pub async fn run_workers<S: Store>(
    store: Arc<S>,
    executor: Arc<BatchExecutor<S>>,
    settings: &Settings,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let worker_count = settings.processor_max_workers.max(1);
    let mut handles = Vec::with_capacity(worker_count);
    for i in 0..worker_count {
        let coordinator = Coordinator::new(store.clone(), executor.clone(), settings)
            .with_worker_id(format!("worker-{i}-{}", Uuid::new_v4()));
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move { coordinator.run(cancel).await }));
    }

    let mut summary = RunSummary::default();
    for joined in futures::future::join_all(handles).await {
        summary.merge(joined??);
    }
    Ok(summary)
}
