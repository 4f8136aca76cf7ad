//! Messages exchanged with clients over the session channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Metric, MetricResult, Ticker};

/// Inbound client message, dispatched on the `action` tag.
///
/// Unknown actions and malformed payloads fail deserialization; callers turn
/// that failure into a protocol error frame and keep the connection open.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientRequest {
    Analyze { ticker: String },
}

/// Outbound server message, tagged on `type`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AnalysisResult {
        ticker: Ticker,
        metric: Metric,
        value: f64,
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    /// Build the outbound frame for one persisted metric result.
    #[must_use]
    pub fn result(result: &MetricResult) -> Self {
        ServerMessage::AnalysisResult {
            ticker: result.ticker.clone(),
            metric: result.metric,
            value: result.value,
            timestamp: result.timestamp,
        }
    }

    /// Build an error frame with the given human-readable message.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analyze_request_parses() {
        let parsed: ClientRequest =
            serde_json::from_str(r#"{"action":"analyze","ticker":"AAPL"}"#).unwrap();
        assert_eq!(
            parsed,
            ClientRequest::Analyze {
                ticker: "AAPL".into()
            }
        );
    }

    #[test]
    fn unknown_action_is_rejected() {
        assert!(serde_json::from_str::<ClientRequest>(r#"{"action":"nope"}"#).is_err());
    }

    #[test]
    fn missing_ticker_is_rejected() {
        assert!(serde_json::from_str::<ClientRequest>(r#"{"action":"analyze"}"#).is_err());
    }

    #[test]
    fn result_frame_shape_matches_protocol() {
        let frame = ServerMessage::AnalysisResult {
            ticker: "AAPL".parse().unwrap(),
            metric: Metric::PortfolioRisk,
            value: 0.1234,
            timestamp: "2024-05-01T12:00:00Z".parse().unwrap(),
        };
        let value: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "analysis_result");
        assert_eq!(value["ticker"], "AAPL");
        assert_eq!(value["metric"], "portfolio_risk");
        assert_eq!(value["value"], 0.1234);
        assert!(value["timestamp"].as_str().unwrap().starts_with("2024-05-01T12:00:00"));
    }

    #[test]
    fn error_frame_shape_matches_protocol() {
        let value = serde_json::to_value(ServerMessage::error("bad request")).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["message"], "bad request");
    }

    #[test]
    fn frames_round_trip() {
        let frame = ServerMessage::error("oops");
        let raw = serde_json::to_string(&frame).unwrap();
        assert_eq!(serde_json::from_str::<ServerMessage>(&raw).unwrap(), frame);
    }
}
