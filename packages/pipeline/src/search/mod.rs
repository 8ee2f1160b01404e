//! Search seam above the wire client.
//!
//! `PlaceSearch` is the trait the executor fans out over; implementations are
//! the live Serper adapter, a deterministic mock, and a retrying decorator
//! that can wrap either.

mod mock;
mod retry;
mod serper;

pub use mock::MockSearch;
pub use retry::RetryingSearch;
pub use serper::SerperSearch;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::SearchResult;

/// One search result with a stable identifier.
///
/// `payload` is the parsed record (absent when the record text failed to
/// parse); `payload_raw` is the exact text and is always present.
#[derive(Debug, Clone)]
pub struct FoundPlace {
    pub place_uid: String,
    pub payload: Option<Value>,
    pub payload_raw: String,
}

/// One completed search call.
#[derive(Debug, Clone)]
pub struct SearchPage {
    /// Results carrying a usable uid; records without one are dropped.
    pub places: Vec<FoundPlace>,
    /// Raw result count as reported by the API (drives early exit).
    pub results_count: i64,
    pub credits: i64,
    pub api_status: i64,
    pub api_ms: i64,
}

/// A place search backend.
#[async_trait]
pub trait PlaceSearch: Send + Sync {
    async fn search(&self, q: &str, page: i64) -> SearchResult<SearchPage>;
}
