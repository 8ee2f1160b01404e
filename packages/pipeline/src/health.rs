//! Component health checks for the CLI and operators.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::Settings;
use crate::store::{PlaceStore, StoreHealth};

/// Payload parse ratio below this (over 24 h) is flagged as a warning.
const PARSE_WARN_RATIO: f64 = 0.995;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Warning,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: HealthState,
    pub message: String,
}

impl ComponentHealth {
    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthState::Healthy,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            status: HealthState::Warning,
            message: message.into(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthState::Unhealthy,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub timestamp: DateTime<Utc>,
    pub configuration: ComponentHealth,
    pub database: ComponentHealth,
    pub ingestion: ComponentHealth,
}

impl HealthReport {
    /// Warnings (e.g. a soft parse-ratio dip) do not fail the check; only
    /// unreachable components do.
    pub fn is_healthy(&self) -> bool {
        self.configuration.status != HealthState::Unhealthy
            && self.database.status != HealthState::Unhealthy
    }
}

impl HealthReport {
    /// Combine component results; the overall state is the worst of them,
    /// with ingestion capped at `Warning`.
    pub fn assemble(
        configuration: ComponentHealth,
        database: ComponentHealth,
        ingestion: ComponentHealth,
    ) -> Self {
        let overall = if configuration.status == HealthState::Unhealthy
            || database.status == HealthState::Unhealthy
        {
            HealthState::Unhealthy
        } else if ingestion.status != HealthState::Healthy {
            HealthState::Warning
        } else {
            HealthState::Healthy
        };

        Self {
            status: overall,
            timestamp: Utc::now(),
            configuration,
            database,
            ingestion,
        }
    }
}

/// Probe configuration, store connectivity, and the 24 h parse ratio.
pub async fn system_health<S>(store: &S, settings: &Settings) -> HealthReport
where
    S: StoreHealth + PlaceStore,
{
    HealthReport::assemble(
        check_configuration(settings),
        check_database(store).await,
        check_ingestion(store).await,
    )
}

pub fn check_configuration(settings: &Settings) -> ComponentHealth {
    let issues = settings.configuration_issues();
    if issues.is_empty() {
        ComponentHealth::healthy(format!(
            "all required configuration present (use_mock_api={})",
            settings.use_mock_api
        ))
    } else {
        ComponentHealth::unhealthy(issues.join("; "))
    }
}

pub async fn check_database<S: StoreHealth>(store: &S) -> ComponentHealth {
    match store.ping().await {
        Ok(()) => ComponentHealth::healthy("store connection successful"),
        Err(e) => ComponentHealth::unhealthy(format!("store connection failed: {e}")),
    }
}

pub async fn check_ingestion<S: PlaceStore>(store: &S) -> ComponentHealth {
    let since = Utc::now() - Duration::hours(24);
    match store.parse_success_ratio(since).await {
        Ok(None) => ComponentHealth::healthy("no places ingested in the last 24h"),
        Ok(Some(ratio)) if ratio >= PARSE_WARN_RATIO => {
            ComponentHealth::healthy(format!("payload parse ratio {:.4} over 24h", ratio))
        }
        Ok(Some(ratio)) => ComponentHealth::warning(format!(
            "payload parse ratio {:.4} over 24h (threshold {PARSE_WARN_RATIO})",
            ratio
        )),
        Err(e) => ComponentHealth::unhealthy(format!("parse ratio query failed: {e}")),
    }
}
