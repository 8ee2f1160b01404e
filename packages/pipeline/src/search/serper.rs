//! Live Serper-backed search.

use async_trait::async_trait;
use serper_client::{place_uid, SerperClient};

use crate::error::SearchResult;

use super::{FoundPlace, PlaceSearch, SearchPage};

/// Search adapter over the Serper wire client.
///
/// Single attempt per call; wrap in [`super::RetryingSearch`] for the retry
/// policy.
pub struct SerperSearch {
    client: SerperClient,
}

impl SerperSearch {
    pub fn new(client: SerperClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PlaceSearch for SerperSearch {
    async fn search(&self, q: &str, page: i64) -> SearchResult<SearchPage> {
        let wire = self.client.places(q, page).await?;

        let results_count = wire.response.places.len() as i64;
        let mut places = Vec::with_capacity(wire.response.places.len());
        for record in wire.response.places {
            let Some(uid) = place_uid(&record) else {
                tracing::warn!(
                    q,
                    page,
                    title = record.get("title").and_then(|t| t.as_str()),
                    "place record missing both placeId and cid; dropping"
                );
                continue;
            };
            let payload_raw = record.to_string();
            places.push(FoundPlace {
                place_uid: uid,
                payload: Some(record),
                payload_raw,
            });
        }

        Ok(SearchPage {
            places,
            results_count,
            credits: wire.response.credits,
            api_status: wire.api_status as i64,
            api_ms: wire.elapsed_ms,
        })
    }
}
