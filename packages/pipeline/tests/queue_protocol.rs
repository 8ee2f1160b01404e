//! Queue-protocol properties: disjoint claims, idempotent enqueue, guarded
//! writeback, terminal-state monotonicity, stuck-claim recovery.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use pipeline_core::expand::expand_queries;
use pipeline_core::models::{QueryOutcome, QueryStatus};
use pipeline_core::store::{JobStore, MemoryStore, PlaceStore, QueryQueue};
use pipeline_core::{JobParams, JobRecord};

fn zips(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("85{:03}", i)).collect()
}

async fn seeded_store(job_id: &str, zip_count: usize, pages: i64) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let params = JobParams::new("bars", "AZ", pages, 100, 20, false).unwrap();
    store
        .insert_job(&JobRecord::from_params(job_id, &params))
        .await
        .unwrap();
    let queries = expand_queries("bars", &zips(zip_count), pages);
    store.enqueue(job_id, &queries).await.unwrap();
    store
}

fn success(zip: &str, page: i64) -> QueryOutcome {
    QueryOutcome {
        zip: zip.to_string(),
        page,
        status: QueryStatus::Success,
        api_status: Some(200),
        results_count: Some(5),
        credits: Some(1),
        error: None,
    }
}

#[tokio::test]
async fn concurrent_claims_are_disjoint() {
    let store = seeded_store("job-1", 100, 4).await; // 400 queries
    let batch_size = 17;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            loop {
                let batch = store.claim_batch("job-1", batch_size).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                mine.extend(batch.into_iter().map(|c| (c.zip, c.page)));
            }
            mine
        }));
    }

    let mut union: HashSet<(String, i64)> = HashSet::new();
    let mut total = 0usize;
    for handle in handles {
        let mine = handle.await.unwrap();
        total += mine.len();
        union.extend(mine);
    }

    // No row appears in two claims, and together the claims cover the queue.
    assert_eq!(total, union.len());
    assert_eq!(union.len(), 400);
}

#[tokio::test]
async fn enqueue_twice_changes_nothing() {
    let store = seeded_store("job-1", 10, 3).await;

    let queries = expand_queries("bars", &zips(10), 3);
    let inserted_again = store.enqueue("job-1", &queries).await.unwrap();

    assert_eq!(inserted_again, 0);
    assert_eq!(store.query_rows("job-1").len(), 30);
}

#[tokio::test]
async fn claim_sets_processing_with_claim_attribution() {
    let store = seeded_store("job-1", 2, 1).await;

    let batch = store.claim_batch("job-1", 10).await.unwrap();
    assert_eq!(batch.len(), 2);

    for row in store.query_rows("job-1") {
        // claim_id non-null implies processing, set together atomically.
        assert_eq!(row.status, QueryStatus::Processing);
        assert_eq!(row.claim_id.as_deref(), Some(batch[0].claim_id.as_str()));
        assert!(row.claimed_at.is_some());
    }
}

#[tokio::test]
async fn mark_results_is_idempotent_and_claim_guarded() {
    let store = seeded_store("job-1", 1, 1).await;
    let batch = store.claim_batch("job-1", 1).await.unwrap();
    let claim_id = batch[0].claim_id.clone();

    let outcomes = vec![success("85000", 1)];
    assert_eq!(
        store.mark_results("job-1", &claim_id, &outcomes).await.unwrap(),
        1
    );
    // Same writeback again: the row left `processing`, so nothing matches.
    assert_eq!(
        store.mark_results("job-1", &claim_id, &outcomes).await.unwrap(),
        0
    );

    let row = &store.query_rows("job-1")[0];
    assert_eq!(row.status, QueryStatus::Success);
    assert_eq!(row.claim_id, None);
}

#[tokio::test]
async fn terminal_rows_are_never_reclaimed() {
    let store = seeded_store("job-1", 1, 3).await;

    // Drive (85000, 1) to success.
    let batch = store.claim_batch("job-1", 1).await.unwrap();
    store
        .mark_results("job-1", &batch[0].claim_id, &[success("85000", 1)])
        .await
        .unwrap();

    // Neither the reaper nor further claims may touch the terminal row.
    store.reap_stuck(Duration::ZERO).await.unwrap();
    let next = store.claim_batch("job-1", 10).await.unwrap();
    let next_keys: Vec<(String, i64)> = next.iter().map(|c| (c.zip.clone(), c.page)).collect();
    assert!(!next_keys.contains(&("85000".to_string(), 1)));

    let row = store
        .query_rows("job-1")
        .into_iter()
        .find(|r| r.page == 1)
        .unwrap();
    assert_eq!(row.status, QueryStatus::Success);
}

#[tokio::test]
async fn early_exit_touches_only_queued_rows() {
    let store = seeded_store("job-1", 1, 3).await;

    // Page 2 is already terminal; page 3 is still queued.
    let batch = store.claim_batch("job-1", 2).await.unwrap(); // pages 1 and 2
    store
        .mark_results(
            "job-1",
            &batch[0].claim_id,
            &[success("85000", 1), success("85000", 2)],
        )
        .await
        .unwrap();

    let skipped = store
        .skip_remaining_pages("job-1", &["85000".to_string()])
        .await
        .unwrap();
    assert_eq!(skipped, 1);

    let rows = store.query_rows("job-1");
    assert_eq!(rows[0].status, QueryStatus::Success); // page 1
    assert_eq!(rows[1].status, QueryStatus::Success); // page 2: untouched
    assert_eq!(rows[2].status, QueryStatus::Skipped); // page 3
    assert_eq!(rows[2].error.as_deref(), Some("early_exit"));
}

#[tokio::test]
async fn released_claim_is_reclaimable() {
    let store = seeded_store("job-1", 3, 1).await;

    let batch = store.claim_batch("job-1", 3).await.unwrap();
    assert_eq!(store.release_claim(&batch[0].claim_id).await.unwrap(), 3);

    let reclaimed = store.claim_batch("job-1", 3).await.unwrap();
    assert_eq!(reclaimed.len(), 3);
    assert_ne!(reclaimed[0].claim_id, batch[0].claim_id);
}

#[tokio::test]
async fn reaper_recovers_abandoned_claims() {
    let store = seeded_store("job-1", 2, 1).await;

    // A worker claims and then vanishes.
    store.claim_batch("job-1", 2).await.unwrap();

    // Within the window nothing is reaped; with a zero window both rows are.
    assert_eq!(
        store.reap_stuck(Duration::from_secs(3600)).await.unwrap(),
        0
    );
    assert_eq!(store.reap_stuck(Duration::ZERO).await.unwrap(), 2);

    let counts = store.pending_counts("job-1").await.unwrap();
    assert_eq!(counts.queued, 2);
    assert_eq!(counts.processing, 0);
}

#[tokio::test]
async fn rollup_counts_every_bucket() {
    let store = seeded_store("job-1", 2, 2).await; // 4 queries

    let batch = store.claim_batch("job-1", 2).await.unwrap(); // 85000 p1+p2
    let claim = batch[0].claim_id.clone();
    let mut failure = success("85000", 2);
    failure.status = QueryStatus::Failed;
    failure.error = Some("boom".into());
    failure.credits = Some(0);
    store
        .mark_results("job-1", &claim, &[success("85000", 1), failure])
        .await
        .unwrap();
    store
        .skip_remaining_pages("job-1", &["85001".to_string()])
        .await
        .unwrap();

    let totals = store.refresh_job_totals("job-1").await.unwrap();
    assert_eq!(totals.zips, 2);
    assert_eq!(totals.queries, 4);
    assert_eq!(totals.successes, 1);
    assert_eq!(totals.failures, 1);
    assert_eq!(totals.skipped, 1);
    assert_eq!(totals.credits, 1);
    assert_eq!(totals.places, store.count_places("job-1").await.unwrap());
}
