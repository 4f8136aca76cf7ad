//! One analysis run: parallel kernels over a single snapshot.

use std::panic::AssertUnwindSafe;

use chrono::Utc;
use folio_core::{Metric, MetricResult, ServerMessage, Ticker};
use folio_state::PortfolioRepository;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{metrics, CancelToken};

/// Which metrics a run computes and how long each kernel simulates working.
#[derive(Clone, Debug)]
pub struct AnalysisPlan {
    pub metrics: Vec<Metric>,
    pub delay_range: [f64; 2],
}

/// How a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every metric was persisted and emitted.
    Completed,
    /// The run was cancelled (switch, teardown, or vanished session); it
    /// emitted nothing after the signal.
    Cancelled,
    /// A state error aborted the run; an error frame was emitted.
    Failed,
}

enum KernelReport {
    Value(Metric, f64),
    Panicked(Metric),
}

/// Launches metric kernels in parallel and streams results in completion
/// order, persisting each one before it is emitted.
#[derive(Clone)]
pub struct AnalysisEngine {
    repo: PortfolioRepository,
    plan: AnalysisPlan,
}

impl AnalysisEngine {
    pub fn new(repo: PortfolioRepository, plan: AnalysisPlan) -> Self {
        Self { repo, plan }
    }

    /// Execute one run for `(session, ticker)`.
    ///
    /// Marks the analysis as started (taking the snapshot every kernel
    /// shares), then persists and emits each result as its kernel finishes.
    /// Cancellation is observed between every step and inside each kernel's
    /// delay; a cancelled run emits nothing further and never surfaces an
    /// error.
    pub async fn run(
        &self,
        session_id: &str,
        ticker: Ticker,
        outbound: mpsc::Sender<ServerMessage>,
        cancel: CancelToken,
        run_seed: u64,
    ) -> RunOutcome {
        let snapshot = match self.repo.begin_analysis(session_id, &ticker, Utc::now()).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(
                    target: "folio.analysis",
                    session_id, %ticker, error = %err,
                    "failed to start analysis"
                );
                let _ = outbound
                    .send(ServerMessage::error(format!("analysis failed to start: {err}")))
                    .await;
                return RunOutcome::Failed;
            }
        };
        info!(
            target: "folio.analysis",
            session_id, %ticker,
            metrics = self.plan.metrics.len(),
            "analysis started"
        );

        let (tx, mut rx) = mpsc::channel(self.plan.metrics.len().max(1));
        for (index, metric) in self.plan.metrics.iter().copied().enumerate() {
            let tx = tx.clone();
            let cancel = cancel.clone();
            let snapshot = snapshot.clone();
            let ticker = ticker.clone();
            let delay_range = self.plan.delay_range;
            let seed = metrics::kernel_seed(run_seed, index);
            tokio::spawn(async move {
                let computed =
                    AssertUnwindSafe(metrics::compute(metric, &ticker, &snapshot, delay_range, seed, &cancel))
                        .catch_unwind()
                        .await;
                let report = match computed {
                    Ok(Some(value)) => KernelReport::Value(metric, value),
                    // Cancelled mid-delay: exit without writing anything.
                    Ok(None) => return,
                    Err(_) => KernelReport::Panicked(metric),
                };
                let _ = tx.send(report).await;
            });
        }
        drop(tx);

        let mut outcome = RunOutcome::Completed;
        loop {
            let report = tokio::select! {
                () = cancel.cancelled() => {
                    outcome = RunOutcome::Cancelled;
                    break;
                }
                report = rx.recv() => match report {
                    Some(report) => report,
                    None => break,
                },
            };
            match report {
                KernelReport::Value(metric, value) => {
                    if cancel.triggered() {
                        outcome = RunOutcome::Cancelled;
                        break;
                    }
                    let now = Utc::now();
                    let result = MetricResult {
                        ticker: ticker.clone(),
                        metric,
                        value,
                        timestamp: now,
                    };
                    match self.repo.append_result(session_id, &result, now).await {
                        Ok(_) => {
                            debug!(
                                target: "folio.analysis",
                                session_id, %ticker, %metric, value,
                                "result persisted"
                            );
                            if outbound.send(ServerMessage::result(&result)).await.is_err() {
                                // Connection gone; wind down quietly.
                                outcome = RunOutcome::Cancelled;
                                break;
                            }
                        }
                        Err(err) if err.is_not_found() => {
                            // Session vanished under the run: drop the
                            // result silently and stop.
                            debug!(
                                target: "folio.analysis",
                                session_id, %metric,
                                "session gone, dropping late result"
                            );
                            outcome = RunOutcome::Cancelled;
                            break;
                        }
                        Err(err) => {
                            error!(
                                target: "folio.analysis",
                                session_id, %metric, error = %err,
                                "failed to persist result"
                            );
                            let _ = outbound
                                .send(ServerMessage::error(format!("analysis aborted: {err}")))
                                .await;
                            outcome = RunOutcome::Failed;
                            break;
                        }
                    }
                }
                KernelReport::Panicked(metric) => {
                    error!(
                        target: "folio.analysis",
                        session_id, %metric,
                        "metric kernel panicked"
                    );
                    let _ = outbound
                        .send(ServerMessage::error(format!("metric {metric} failed")))
                        .await;
                }
            }
        }

        // Release any kernels still sleeping so the run settles promptly.
        cancel.trigger();
        if outcome == RunOutcome::Completed {
            info!(target: "folio.analysis", session_id, %ticker, "analysis complete");
        }
        outcome
    }
}
