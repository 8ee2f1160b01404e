//! Pure Serper REST API client.
//!
//! A minimal client for the Serper Places endpoint. One method, one request,
//! no policy: retries and backoff belong to the caller.
//!
//! # Example
//!
//! ```rust,ignore
//! use serper_client::SerperClient;
//! use std::time::Duration;
//!
//! let client = SerperClient::new("your-api-key".into(), Duration::from_secs(30))?;
//!
//! let page = client.places("85001 bars", 1).await?;
//! println!("{} places, {} credits", page.response.places.len(), page.response.credits);
//! ```

pub mod error;
pub mod types;

pub use error::{Result, SerperError};
pub use types::{place_uid, PlacesPage, PlacesRequest, PlacesResponse};

use std::time::{Duration, Instant};

const BASE_URL: &str = "https://google.serper.dev";

/// Results requested per page; Serper bills one credit per call regardless.
const RESULTS_PER_PAGE: i64 = 10;

pub struct SerperClient {
    client: reqwest::Client,
    api_key: String,
    timeout: Duration,
}

impl SerperClient {
    /// Create a client with a per-request wall-clock timeout.
    pub fn new(api_key: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(SerperError::Transport)?;

        Ok(Self {
            client,
            api_key,
            timeout,
        })
    }

    /// Fetch one page of place results for a query.
    ///
    /// Returns the parsed body together with the HTTP status and elapsed
    /// milliseconds, so callers can record both even when they discard the
    /// places themselves.
    pub async fn places(&self, q: &str, page: i64) -> Result<PlacesPage> {
        let request = PlacesRequest {
            q: q.to_string(),
            page,
            num: RESULTS_PER_PAGE,
        };

        let started = Instant::now();
        let resp = self
            .client
            .post(format!("{}/places", BASE_URL))
            .header("X-API-KEY", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SerperError::Timeout {
                        seconds: self.timeout.as_secs(),
                    }
                } else {
                    SerperError::Transport(e)
                }
            })?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| {
            if e.is_timeout() {
                SerperError::Timeout {
                    seconds: self.timeout.as_secs(),
                }
            } else {
                SerperError::Transport(e)
            }
        })?;
        let elapsed_ms = started.elapsed().as_millis() as i64;

        if !status.is_success() {
            return Err(SerperError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let response: PlacesResponse =
            serde_json::from_str(&body).map_err(|e| SerperError::InvalidBody {
                status: status.as_u16(),
                message: e.to_string(),
            })?;

        tracing::debug!(
            q,
            page,
            results = response.places.len(),
            credits = response.credits,
            elapsed_ms,
            "Serper places call complete"
        );

        Ok(PlacesPage {
            response,
            api_status: status.as_u16(),
            elapsed_ms,
        })
    }
}
