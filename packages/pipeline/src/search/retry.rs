//! Retrying decorator over any search backend.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::SearchResult;

use super::{PlaceSearch, SearchPage};

/// Wraps a search backend with bounded retries and exponential backoff.
///
/// Only transient failures (timeout, transport, 5xx, 429) are retried;
/// permanent failures surface immediately. Delay doubles per attempt:
/// `base, 2×base, 4×base, …`.
pub struct RetryingSearch<S: PlaceSearch> {
    inner: S,
    max_attempts: u32,
    base_delay: Duration,
}

impl<S: PlaceSearch> RetryingSearch<S> {
    pub fn new(inner: S, max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }
}

#[async_trait]
impl<S: PlaceSearch> PlaceSearch for RetryingSearch<S> {
    async fn search(&self, q: &str, page: i64) -> SearchResult<SearchPage> {
        let mut attempt = 0u32;
        loop {
            match self.inner.search(q, page).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.base_delay * 2u32.saturating_pow(attempt);
                    tracing::warn!(
                        q,
                        page,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient search failure; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SearchError;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with the scripted errors, then succeeds with an empty page.
    struct Scripted {
        failures: Vec<SearchError>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(failures: Vec<SearchError>) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PlaceSearch for Scripted {
        async fn search(&self, _q: &str, _page: i64) -> SearchResult<SearchPage> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            if call < self.failures.len() {
                let e = &self.failures[call];
                return Err(match e {
                    SearchError::Transient {
                        api_status,
                        message,
                    } => SearchError::Transient {
                        api_status: *api_status,
                        message: message.clone(),
                    },
                    SearchError::Permanent {
                        api_status,
                        message,
                    } => SearchError::Permanent {
                        api_status: *api_status,
                        message: message.clone(),
                    },
                });
            }
            Ok(SearchPage {
                places: vec![],
                results_count: 0,
                credits: 1,
                api_status: 200,
                api_ms: 1,
            })
        }
    }

    fn throttled() -> SearchError {
        SearchError::Transient {
            api_status: Some(429),
            message: "rate limited".into(),
        }
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let scripted = Scripted::new(vec![throttled(), throttled()]);
        let search = RetryingSearch::new(scripted, 3, Duration::from_millis(1));

        let page = search.search("85001 bars", 1).await.unwrap();
        assert_eq!(page.api_status, 200);
        assert_eq!(search.inner.calls(), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts_on_persistent_transients() {
        let scripted = Scripted::new(vec![throttled(), throttled(), throttled(), throttled()]);
        let search = RetryingSearch::new(scripted, 3, Duration::from_millis(1));

        let err = search.search("85001 bars", 1).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(search.inner.calls(), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let scripted = Scripted::new(vec![SearchError::Permanent {
            api_status: Some(404),
            message: "no such endpoint".into(),
        }]);
        let search = RetryingSearch::new(scripted, 3, Duration::from_millis(1));

        let err = search.search("85001 bars", 1).await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(search.inner.calls(), 1);
    }
}
