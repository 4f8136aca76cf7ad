//! Typed facade over the document store.
//!
//! Validates inputs, converts between domain types and the stored JSON
//! shape, and delegates all atomicity to the gateway. No business logic
//! lives here and no retries beyond the gateway's single script re-register.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use folio_core::{Holdings, MetricResult, PortfolioDocument, Ticker};

use crate::{DocumentStore, StateError, StateResult};

/// Seed values for documents created on first activity.
#[derive(Clone, Debug)]
pub struct SessionDefaults {
    pub holdings: Holdings,
    pub total_value: f64,
}

/// Domain-level persistence operations, shared across the process.
#[derive(Clone)]
pub struct PortfolioRepository {
    store: Arc<dyn DocumentStore>,
    defaults: SessionDefaults,
}

impl PortfolioRepository {
    pub fn new(store: Arc<dyn DocumentStore>, defaults: SessionDefaults) -> Self {
        Self { store, defaults }
    }

    /// Create the session document if absent and return the stored state.
    pub async fn ensure(&self, session_id: &str) -> StateResult<PortfolioDocument> {
        validate_session_id(session_id)?;
        let initial = PortfolioDocument::new(
            session_id,
            self.defaults.holdings.clone(),
            self.defaults.total_value,
        );
        let initial_json = to_json(&initial)?;
        let raw = self.store.ensure(session_id, &initial_json).await?;
        parse_document(&raw)
    }

    /// Read the current state, refreshing the key's TTL.
    pub async fn read(&self, session_id: &str) -> StateResult<PortfolioDocument> {
        validate_session_id(session_id)?;
        let raw = self.store.read(session_id).await?;
        parse_document(&raw)
    }

    /// Mark an analysis as started and return the snapshot all metric
    /// kernels of the run will share.
    pub async fn begin_analysis(
        &self,
        session_id: &str,
        ticker: &Ticker,
        started_at: DateTime<Utc>,
    ) -> StateResult<PortfolioDocument> {
        validate_session_id(session_id)?;
        validate_timestamp(started_at)?;
        let raw = self
            .store
            .begin_analysis(session_id, ticker.as_str(), &rfc3339(started_at))
            .await?;
        parse_document(&raw)
    }

    /// Append one completed metric result.
    pub async fn append_result(
        &self,
        session_id: &str,
        result: &MetricResult,
        last_activity: DateTime<Utc>,
    ) -> StateResult<PortfolioDocument> {
        validate_session_id(session_id)?;
        validate_timestamp(last_activity)?;
        if !result.value.is_finite() {
            return Err(StateError::InvalidInput(format!(
                "metric value must be finite, got {}",
                result.value
            )));
        }
        let result_json = to_json(result)?;
        let raw = self
            .store
            .append_result(session_id, &result_json, &rfc3339(last_activity))
            .await?;
        parse_document(&raw)
    }

    /// Recompute `total_value` from holdings and the supplied prices.
    pub async fn apply_market_update(
        &self,
        session_id: &str,
        prices: &HashMap<Ticker, f64>,
    ) -> StateResult<PortfolioDocument> {
        validate_session_id(session_id)?;
        for (ticker, price) in prices {
            if !price.is_finite() || *price < 0.0 {
                return Err(StateError::InvalidInput(format!(
                    "price for {ticker} must be a non-negative finite number, got {price}"
                )));
            }
        }
        let prices_json = to_json(prices)?;
        let raw = self
            .store
            .apply_market_update(session_id, &prices_json, &rfc3339(Utc::now()))
            .await?;
        parse_document(&raw)
    }

    /// Snapshot of the ids of all live sessions.
    pub async fn list_sessions(&self) -> StateResult<Vec<String>> {
        self.store.list_sessions().await
    }
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn validate_session_id(session_id: &str) -> StateResult<()> {
    if folio_core::is_valid_session_id(session_id) {
        Ok(())
    } else {
        Err(StateError::InvalidInput(format!(
            "invalid session id: '{session_id}'"
        )))
    }
}

// 2000-01-01T00:00:00Z, in seconds.
const EARLIEST_TIMESTAMP_SECS: i64 = 946_684_800;

fn validate_timestamp(ts: DateTime<Utc>) -> StateResult<()> {
    let upper = Utc::now() + chrono::Duration::hours(1);
    if ts.timestamp() < EARLIEST_TIMESTAMP_SECS || ts > upper {
        return Err(StateError::InvalidInput(format!(
            "timestamp out of bounds: {ts}"
        )));
    }
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> StateResult<String> {
    serde_json::to_string(value).map_err(|err| StateError::Serialization(err.to_string()))
}

fn parse_document(raw: &str) -> StateResult<PortfolioDocument> {
    serde_json::from_str(raw).map_err(|err| StateError::Serialization(err.to_string()))
}
