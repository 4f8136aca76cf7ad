//! Background market updater and the simulated price walk feeding it.

use std::collections::HashMap;
use std::time::Duration;

use folio_core::Ticker;
use folio_state::{PortfolioRepository, StateResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::CancelToken;

/// Per-ticker uniform random walk. Each draw steps the previous price by up
/// to `volatility` in either direction; first draws start from the
/// configured base price (or the default for unknown tickers).
pub struct PriceWalk {
    base: HashMap<Ticker, f64>,
    default_price: f64,
    volatility: f64,
    last: HashMap<Ticker, f64>,
    rng: StdRng,
}

impl PriceWalk {
    #[must_use]
    pub fn new(base: HashMap<Ticker, f64>, default_price: f64, volatility: f64, seed: u64) -> Self {
        Self {
            base,
            default_price,
            volatility,
            last: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Draw the next price for each ticker, remembering it for the next tick.
    pub fn next_prices<'a>(
        &mut self,
        tickers: impl IntoIterator<Item = &'a Ticker>,
    ) -> HashMap<Ticker, f64> {
        let mut prices = HashMap::new();
        for ticker in tickers {
            let start = self.base.get(ticker).copied().unwrap_or(self.default_price);
            let previous = *self.last.entry(ticker.clone()).or_insert(start);
            let step = if self.volatility > 0.0 {
                previous * self.rng.gen_range(-self.volatility..=self.volatility)
            } else {
                0.0
            };
            let next = round2((previous + step).max(0.01));
            self.last.insert(ticker.clone(), next);
            prices.insert(ticker.clone(), next);
        }
        prices
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Single process-wide task recomputing `total_value` for every live
/// session on a fixed period.
pub struct MarketUpdater {
    repo: PortfolioRepository,
    walk: PriceWalk,
    interval: Duration,
}

impl MarketUpdater {
    pub fn new(repo: PortfolioRepository, walk: PriceWalk, interval: Duration) -> Self {
        Self {
            repo,
            walk,
            interval,
        }
    }

    /// Run until cancelled. Per-session failures are logged and skipped; the
    /// loop always makes its next tick.
    pub async fn run(mut self, cancel: CancelToken) {
        info!(
            target: "folio.market",
            interval_secs = self.interval.as_secs_f64(),
            "market updater started"
        );
        loop {
            if !cancel.sleep(self.interval).await {
                break;
            }
            self.tick().await;
        }
        info!(target: "folio.market", "market updater stopped");
    }

    /// One pass over every live session.
    pub async fn tick(&mut self) {
        let sessions = match self.repo.list_sessions().await {
            Ok(sessions) => sessions,
            Err(err) => {
                warn!(target: "folio.market", error = %err, "failed to list sessions");
                return;
            }
        };
        for session_id in sessions {
            if let Err(err) = self.update_session(&session_id).await {
                if err.is_not_found() {
                    // Deleted between enumeration and update; fine.
                    debug!(target: "folio.market", session_id, "session vanished, skipping");
                } else {
                    warn!(
                        target: "folio.market",
                        session_id, error = %err,
                        "market update failed, skipping session"
                    );
                }
            }
        }
    }

    async fn update_session(&mut self, session_id: &str) -> StateResult<()> {
        let doc = self.repo.read(session_id).await?;
        if doc.holdings.is_empty() {
            return Ok(());
        }
        let prices = self.walk.next_prices(doc.holdings.keys());
        let updated = self.repo.apply_market_update(session_id, &prices).await?;
        debug!(
            target: "folio.market",
            session_id,
            total_value = updated.total_value,
            "market values updated"
        );
        Ok(())
    }
}
