//! Mock search for offline runs and dry-run jobs.
//!
//! Returns synthetic places matching the Serper response structure without
//! spending credits. Result counts are deterministic per (zip, page) so
//! repeated runs, including the early-exit path, behave reproducibly.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;

use crate::error::SearchResult;

use super::{FoundPlace, PlaceSearch, SearchPage};

enum Counts {
    /// Derived from a hash of (zip, page): anything from empty to a full
    /// page, exercising both the normal and early-exit paths.
    Derived,
    /// Exact counts for page 1 and for later pages.
    Fixed { page1: usize, later: usize },
}

pub struct MockSearch {
    counts: Counts,
    simulate_latency: bool,
}

impl MockSearch {
    pub fn new() -> Self {
        Self {
            counts: Counts::Derived,
            simulate_latency: true,
        }
    }

    /// Exact result counts, no simulated latency. For tests.
    pub fn fixed(page1: usize, later: usize) -> Self {
        Self {
            counts: Counts::Fixed { page1, later },
            simulate_latency: false,
        }
    }

    fn results_for(&self, zip: &str, page: i64) -> usize {
        match self.counts {
            Counts::Derived => {
                let mut hasher = DefaultHasher::new();
                (zip, page).hash(&mut hasher);
                (hasher.finish() % 11) as usize
            }
            Counts::Fixed { page1, later } => {
                if page == 1 {
                    page1
                } else {
                    later
                }
            }
        }
    }
}

impl Default for MockSearch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlaceSearch for MockSearch {
    async fn search(&self, q: &str, page: i64) -> SearchResult<SearchPage> {
        if self.simulate_latency {
            let millis = rand::thread_rng().gen_range(5..25);
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }

        let zip = q.split_whitespace().next().unwrap_or("00000");
        let count = self.results_for(zip, page);

        let mut places = Vec::with_capacity(count);
        for i in 0..count {
            let position = i + 1;
            let payload = json!({
                "position": position,
                "title": format!("Mock Business {position} in {zip}"),
                "placeId": format!("mock-{zip}-p{page}-{i:02}"),
                "address": format!("{position}00 Main St, {zip}"),
                "rating": 4.2,
                "category": "Mock",
            });
            let payload_raw = payload.to_string();
            places.push(FoundPlace {
                place_uid: format!("mock-{zip}-p{page}-{i:02}"),
                payload: Some(payload),
                payload_raw,
            });
        }

        Ok(SearchPage {
            places,
            results_count: count as i64,
            credits: 1,
            api_status: 200,
            api_ms: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_counts_are_exact() {
        let mock = MockSearch::fixed(5, 0);
        let page1 = mock.search("85001 bars", 1).await.unwrap();
        let page2 = mock.search("85001 bars", 2).await.unwrap();
        assert_eq!(page1.results_count, 5);
        assert_eq!(page1.places.len(), 5);
        assert_eq!(page2.results_count, 0);
    }

    #[tokio::test]
    async fn repeat_calls_return_identical_uids() {
        let mock = MockSearch::fixed(3, 0);
        let a = mock.search("85001 bars", 1).await.unwrap();
        let b = mock.search("85001 bars", 1).await.unwrap();
        let uids_a: Vec<_> = a.places.iter().map(|p| p.place_uid.clone()).collect();
        let uids_b: Vec<_> = b.places.iter().map(|p| p.place_uid.clone()).collect();
        assert_eq!(uids_a, uids_b);
    }

    #[tokio::test]
    async fn uids_differ_across_pages() {
        let mock = MockSearch::fixed(2, 2);
        let page1 = mock.search("85001 bars", 1).await.unwrap();
        let page2 = mock.search("85001 bars", 2).await.unwrap();
        assert_ne!(page1.places[0].place_uid, page2.places[0].place_uid);
    }

    #[tokio::test]
    async fn every_call_costs_one_credit() {
        let mock = MockSearch::fixed(0, 0);
        let page = mock.search("85001 bars", 1).await.unwrap();
        assert_eq!(page.credits, 1);
        assert_eq!(page.api_status, 200);
    }
}
