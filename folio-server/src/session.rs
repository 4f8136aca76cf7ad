//! Per-session controller: inbound dispatch and cancel-on-switch.

use chrono::Utc;
use folio_analysis::{AnalysisEngine, CancelToken, RunOutcome};
use folio_core::{ClientRequest, ServerMessage, Ticker};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Generate a fresh server-side session id: `s-{unix_seconds}-{4 hex}`.
#[must_use]
pub fn generate_session_id() -> String {
    let tag: u16 = rand::random();
    format!("s-{}-{tag:04x}", Utc::now().timestamp())
}

struct RunHandle {
    ticker: Ticker,
    cancel: CancelToken,
    task: JoinHandle<RunOutcome>,
}

/// Owns the outbound emitter and the at-most-one in-flight analysis run of
/// a single client session.
pub struct SessionController {
    session_id: String,
    engine: AnalysisEngine,
    outbound: mpsc::Sender<ServerMessage>,
    current: Option<RunHandle>,
}

impl SessionController {
    pub fn new(
        session_id: impl Into<String>,
        engine: AnalysisEngine,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            engine,
            outbound,
            current: None,
        }
    }

    /// Dispatch one raw inbound text frame. Protocol errors are answered
    /// with an error frame and the session stays usable.
    pub async fn handle_text(&mut self, raw: &str) {
        let request = match serde_json::from_str::<ClientRequest>(raw) {
            Ok(request) => request,
            Err(err) => {
                warn!(
                    target: "folio.session",
                    session_id = self.session_id, error = %err,
                    "rejecting malformed message"
                );
                self.emit_error(format!("invalid message: {err}")).await;
                return;
            }
        };
        match request {
            ClientRequest::Analyze { ticker } => self.handle_analyze(&ticker).await,
        }
    }

    async fn handle_analyze(&mut self, raw_ticker: &str) {
        let ticker: Ticker = match raw_ticker.trim().to_uppercase().parse() {
            Ok(ticker) => ticker,
            Err(err) => {
                self.emit_error(err.to_string()).await;
                return;
            }
        };
        info!(
            target: "folio.session",
            session_id = self.session_id, %ticker,
            "analyze requested"
        );

        // Cancel-on-switch, applied uniformly: a repeated ticker also
        // restarts from a fresh snapshot.
        self.settle_current().await;

        let cancel = CancelToken::new();
        let task = {
            let engine = self.engine.clone();
            let session_id = self.session_id.clone();
            let ticker = ticker.clone();
            let outbound = self.outbound.clone();
            let cancel = cancel.clone();
            let run_seed: u64 = rand::random();
            tokio::spawn(async move {
                engine
                    .run(&session_id, ticker, outbound, cancel, run_seed)
                    .await
            })
        };
        self.current = Some(RunHandle {
            ticker,
            cancel,
            task,
        });
    }

    /// Cancel the in-flight run (if any) and wait until it has settled:
    /// the run task has returned and nothing further can reach the emitter.
    pub async fn settle_current(&mut self) {
        let Some(run) = self.current.take() else {
            return;
        };
        run.cancel.trigger();
        match run.task.await {
            Ok(outcome) => debug!(
                target: "folio.session",
                session_id = self.session_id,
                ticker = %run.ticker,
                ?outcome,
                "previous run settled"
            ),
            Err(err) => error!(
                target: "folio.session",
                session_id = self.session_id, error = %err,
                "analysis task failed to join"
            ),
        }
    }

    /// Teardown on disconnect or idle timeout.
    pub async fn shutdown(&mut self) {
        self.settle_current().await;
    }

    async fn emit_error(&self, message: String) {
        let _ = self.outbound.send(ServerMessage::error(message)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use folio_analysis::AnalysisPlan;
    use folio_core::{Holdings, Metric};
    use folio_state::{MemoryStore, PortfolioRepository, SessionDefaults};

    use super::*;

    fn controller() -> (SessionController, mpsc::Receiver<ServerMessage>) {
        let store = MemoryStore::new(Duration::from_secs(60));
        let repo = PortfolioRepository::new(
            Arc::new(store),
            SessionDefaults {
                holdings: Holdings::new(),
                total_value: 0.0,
            },
        );
        let engine = AnalysisEngine::new(
            repo,
            AnalysisPlan {
                metrics: Metric::ALL.to_vec(),
                delay_range: [0.0, 0.01],
            },
        );
        let (tx, rx) = mpsc::channel(16);
        (SessionController::new("s-1-aaaa", engine, tx), rx)
    }

    #[tokio::test]
    async fn malformed_json_yields_error_frame() {
        let (mut controller, mut rx) = controller();
        controller.handle_text("not json").await;
        assert!(matches!(rx.recv().await, Some(ServerMessage::Error { .. })));
    }

    #[tokio::test]
    async fn unknown_action_yields_error_frame() {
        let (mut controller, mut rx) = controller();
        controller.handle_text(r#"{"action":"nope"}"#).await;
        assert!(matches!(rx.recv().await, Some(ServerMessage::Error { .. })));
    }

    #[tokio::test]
    async fn invalid_ticker_yields_error_frame() {
        let (mut controller, mut rx) = controller();
        controller
            .handle_text(r#"{"action":"analyze","ticker":"not a ticker!"}"#)
            .await;
        assert!(matches!(rx.recv().await, Some(ServerMessage::Error { .. })));
    }

    #[test]
    fn generated_ids_match_the_documented_form() {
        let id = generate_session_id();
        assert!(folio_core::is_valid_session_id(&id));
        let mut parts = id.splitn(3, '-');
        assert_eq!(parts.next(), Some("s"));
        let seconds: i64 = parts.next().unwrap().parse().unwrap();
        assert!(seconds > 1_500_000_000);
        let tag = parts.next().unwrap();
        assert_eq!(tag.len(), 4);
        assert!(tag.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
