//! Fundamental data types shared across the folio workspace.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub mod wire;

pub use wire::{ClientRequest, ServerMessage};

/// Alias for share counts held in a portfolio.
pub type Shares = u64;

/// Mapping from ticker to number of shares held.
pub type Holdings = HashMap<Ticker, Shares>;

/// Maximum length of a ticker symbol, first character included.
pub const TICKER_MAX_LEN: usize = 10;

/// Error returned when parsing an invalid ticker symbol.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid ticker: '{0}'")]
pub struct TickerParseError(String);

/// Validated ticker symbol: `[A-Z][A-Z0-9.]{0,9}`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticker(String);

impl Ticker {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_valid(raw: &str) -> bool {
        let mut chars = raw.chars();
        let Some(first) = chars.next() else {
            return false;
        };
        if raw.len() > TICKER_MAX_LEN || !first.is_ascii_uppercase() {
            return false;
        }
        chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '.')
    }
}

impl FromStr for Ticker {
    type Err = TickerParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if Self::is_valid(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(TickerParseError(s.to_string()))
        }
    }
}

impl fmt::Display for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Ticker {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for Ticker {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Ticker {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// The five portfolio metrics the analysis engine can compute.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    PortfolioRisk,
    Concentration,
    Correlation,
    Momentum,
    AllocationScore,
}

impl Metric {
    /// Every metric, in the order the engine launches them.
    pub const ALL: [Metric; 5] = [
        Metric::PortfolioRisk,
        Metric::Concentration,
        Metric::Correlation,
        Metric::Momentum,
        Metric::AllocationScore,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Metric::PortfolioRisk => "portfolio_risk",
            Metric::Concentration => "concentration",
            Metric::Correlation => "correlation",
            Metric::Momentum => "momentum",
            Metric::AllocationScore => "allocation_score",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = MetricParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "portfolio_risk" => Ok(Metric::PortfolioRisk),
            "concentration" => Ok(Metric::Concentration),
            "correlation" => Ok(Metric::Correlation),
            "momentum" => Ok(Metric::Momentum),
            "allocation_score" => Ok(Metric::AllocationScore),
            other => Err(MetricParseError(other.to_string())),
        }
    }
}

/// Error returned when parsing an unknown metric name.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown metric: '{0}'")]
pub struct MetricParseError(String);

/// Marker describing the analysis currently running on a session.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CurrentAnalysis {
    pub ticker: Ticker,
    pub started_at: DateTime<Utc>,
}

/// One completed metric computation, as persisted in the session document.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MetricResult {
    pub ticker: Ticker,
    pub metric: Metric,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// The per-session document stored under `portfolio:{session_id}`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PortfolioDocument {
    pub session_id: String,
    pub holdings: Holdings,
    pub total_value: f64,
    pub current_analysis: Option<CurrentAnalysis>,
    pub analysis_results: Vec<MetricResult>,
    pub last_activity: DateTime<Utc>,
}

impl PortfolioDocument {
    /// Build a fresh document with no analysis history.
    #[must_use]
    pub fn new(session_id: impl Into<String>, holdings: Holdings, total_value: f64) -> Self {
        Self {
            session_id: session_id.into(),
            holdings,
            total_value,
            current_analysis: None,
            analysis_results: Vec::new(),
            last_activity: Utc::now(),
        }
    }

    /// Fraction of the portfolio held in `ticker`, by share count.
    ///
    /// Absent tickers and empty portfolios both weigh zero.
    #[must_use]
    pub fn holding_weight(&self, ticker: &Ticker) -> f64 {
        let total: Shares = self.holdings.values().sum();
        if total == 0 {
            return 0.0;
        }
        let held = self.holdings.get(ticker).copied().unwrap_or(0);
        held as f64 / total as f64
    }
}

/// Check that a client-supplied session id is usable as a store key suffix.
///
/// Ids are opaque; the only constraints are non-emptiness, a sane length, and
/// characters that cannot corrupt the `portfolio:{id}` key pattern.
#[must_use]
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_with_defaults() -> PortfolioDocument {
        let holdings: Holdings = [("AAPL", 100), ("GOOGL", 50), ("MSFT", 75)]
            .into_iter()
            .map(|(t, n)| (t.parse().unwrap(), n))
            .collect();
        PortfolioDocument::new("test", holdings, 125_000.0)
    }

    #[test]
    fn ticker_accepts_valid_symbols() {
        for raw in ["A", "AAPL", "BRK.B", "X2", "ABCDEFGHIJ"] {
            assert!(raw.parse::<Ticker>().is_ok(), "{raw} should parse");
        }
    }

    #[test]
    fn ticker_rejects_invalid_shapes() {
        for raw in ["", "aapl", "1APL", ".APL", "ABCDEFGHIJK", "AA PL", "AA-PL"] {
            assert!(raw.parse::<Ticker>().is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn metric_names_round_trip() {
        for metric in Metric::ALL {
            assert_eq!(metric.as_str().parse::<Metric>().unwrap(), metric);
        }
    }

    #[test]
    fn holding_weight_known_ticker() {
        let doc = doc_with_defaults();
        let weight = doc.holding_weight(&"AAPL".parse().unwrap());
        assert!((weight - 100.0 / 225.0).abs() < 1e-12);
    }

    #[test]
    fn holding_weight_unknown_ticker() {
        let doc = doc_with_defaults();
        assert_eq!(doc.holding_weight(&"TSLA".parse().unwrap()), 0.0);
    }

    #[test]
    fn holding_weight_empty_holdings() {
        let doc = PortfolioDocument::new("empty", Holdings::new(), 0.0);
        assert_eq!(doc.holding_weight(&"AAPL".parse().unwrap()), 0.0);
    }

    #[test]
    fn document_round_trips_through_json() {
        let mut doc = doc_with_defaults();
        doc.current_analysis = Some(CurrentAnalysis {
            ticker: "AAPL".parse().unwrap(),
            started_at: Utc::now(),
        });
        doc.analysis_results.push(MetricResult {
            ticker: "AAPL".parse().unwrap(),
            metric: Metric::Momentum,
            value: -0.25,
            timestamp: Utc::now(),
        });
        let raw = serde_json::to_string(&doc).unwrap();
        let back: PortfolioDocument = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn session_id_validation() {
        assert!(is_valid_session_id("s-1700000000-9f3a"));
        assert!(is_valid_session_id("abc_123.x"));
        assert!(!is_valid_session_id(""));
        assert!(!is_valid_session_id("has space"));
        assert!(!is_valid_session_id("colon:bad"));
        assert!(!is_valid_session_id(&"x".repeat(65)));
    }
}
