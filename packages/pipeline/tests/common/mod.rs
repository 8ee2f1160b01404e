//! Shared helpers for the integration suites: fast settings, canned search
//! backends, and a one-call job setup.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use pipeline_core::error::{SearchError, SearchResult};
use pipeline_core::search::{FoundPlace, MockSearch, PlaceSearch, SearchPage};
use pipeline_core::{
    BatchExecutor, CreatedJob, JobParams, JobService, MemoryStore, Settings,
};

/// Defaults with zeroed pacing so worker loops spin as fast as the store.
pub fn fast_settings() -> Settings {
    Settings {
        processor_loop_delay_seconds: 0,
        idle_poll_interval: 0,
        ..Settings::default()
    }
}

pub async fn create_job(
    store: &Arc<MemoryStore>,
    settings: &Settings,
    keyword: &str,
    state: &str,
    pages: i64,
    batch_size: i64,
    concurrency: i64,
) -> CreatedJob {
    let service = JobService::new(store.clone(), settings);
    let params = JobParams::new(keyword, state, pages, batch_size, concurrency, false).unwrap();
    service.create_job(params).await.unwrap()
}

pub fn executor_with(
    store: &Arc<MemoryStore>,
    search: Arc<dyn PlaceSearch>,
    early_exit_threshold: i64,
) -> Arc<BatchExecutor<MemoryStore>> {
    Arc::new(BatchExecutor::new(
        store.clone(),
        search.clone(),
        search,
        early_exit_threshold,
    ))
}

fn empty_page() -> SearchPage {
    SearchPage {
        places: vec![],
        results_count: 0,
        credits: 1,
        api_status: 200,
        api_ms: 1,
    }
}

/// Fails the first `failures` calls with a 429, then behaves like the inner
/// mock.
pub struct FlakySearch {
    inner: MockSearch,
    remaining_failures: AtomicU32,
    calls: AtomicU32,
}

impl FlakySearch {
    pub fn new(failures: u32, inner: MockSearch) -> Self {
        Self {
            inner,
            remaining_failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlaceSearch for FlakySearch {
    async fn search(&self, q: &str, page: i64) -> SearchResult<SearchPage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SearchError::Transient {
                api_status: Some(429),
                message: "rate limited".into(),
            });
        }
        self.inner.search(q, page).await
    }
}

/// Always fails permanently (a 404-class error).
pub struct FailingSearch;

#[async_trait]
impl PlaceSearch for FailingSearch {
    async fn search(&self, _q: &str, _page: i64) -> SearchResult<SearchPage> {
        Err(SearchError::Permanent {
            api_status: Some(404),
            message: "gone for good".into(),
        })
    }
}

/// Returns one result per call whose payload failed to parse: `payload` is
/// absent, only the raw text survives.
pub struct RawOnlySearch {
    pub raw: String,
}

#[async_trait]
impl PlaceSearch for RawOnlySearch {
    async fn search(&self, q: &str, page: i64) -> SearchResult<SearchPage> {
        let zip = q.split_whitespace().next().unwrap_or("00000");
        let mut result = empty_page();
        result.results_count = 1;
        result.places.push(FoundPlace {
            place_uid: format!("raw-{zip}-p{page}"),
            payload: None,
            payload_raw: self.raw.clone(),
        });
        Ok(result)
    }
}
