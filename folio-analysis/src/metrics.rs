//! Simulated metric kernels.
//!
//! Each kernel is a pure function of the snapshot it is handed plus a seeded
//! random source, preceded by a cancellable artificial delay. The same
//! `(snapshot, ticker, seed)` always yields the same value.

use std::time::Duration;

use folio_core::{Metric, PortfolioDocument, Ticker};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::CancelToken;

// Portfolios at or above this total get full risk weighting.
const RISK_VALUE_SCALE: f64 = 250_000.0;

/// Derive the RNG seed for one kernel of a run.
#[must_use]
pub fn kernel_seed(run_seed: u64, index: usize) -> u64 {
    run_seed.wrapping_add((index as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// Run one metric kernel: sleep the simulated duration, then produce the
/// value. Returns `None` when cancelled mid-delay; nothing is written in
/// that case.
pub async fn compute(
    metric: Metric,
    ticker: &Ticker,
    snapshot: &PortfolioDocument,
    delay_range: [f64; 2],
    seed: u64,
    cancel: &CancelToken,
) -> Option<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let delay = Duration::from_secs_f64(rng.gen_range(delay_range[0]..=delay_range[1]));
    if !cancel.sleep(delay).await {
        return None;
    }
    Some(value(metric, ticker, snapshot, &mut rng))
}

/// The simulated formula behind each metric.
#[must_use]
pub fn value(
    metric: Metric,
    ticker: &Ticker,
    snapshot: &PortfolioDocument,
    rng: &mut StdRng,
) -> f64 {
    let weight = snapshot.holding_weight(ticker);
    let raw = match metric {
        Metric::PortfolioRisk => {
            let value_factor = (snapshot.total_value / RISK_VALUE_SCALE).clamp(0.0, 1.0);
            weight * rng.gen_range(0.1..0.5) * (0.5 + 0.5 * value_factor)
        }
        Metric::Concentration => weight.clamp(0.0, 1.0),
        Metric::Correlation => rng.gen_range(-0.3..0.9),
        Metric::Momentum => rng.gen_range(-1.0..1.0) * weight,
        Metric::AllocationScore => {
            let ideal = 1.0 / snapshot.holdings.len().max(1) as f64;
            ideal - weight
        }
    };
    round4(raw)
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use folio_core::Holdings;

    use super::*;

    fn snapshot() -> PortfolioDocument {
        let holdings: Holdings = [("AAPL", 100), ("GOOGL", 50), ("MSFT", 75)]
            .into_iter()
            .map(|(t, n)| (t.parse().unwrap(), n))
            .collect();
        PortfolioDocument::new("test", holdings, 125_000.0)
    }

    #[test]
    fn values_are_deterministic_for_a_seed() {
        let snap = snapshot();
        let ticker: Ticker = "AAPL".parse().unwrap();
        for metric in Metric::ALL {
            let a = value(metric, &ticker, &snap, &mut StdRng::seed_from_u64(7));
            let b = value(metric, &ticker, &snap, &mut StdRng::seed_from_u64(7));
            assert_eq!(a, b, "{metric} must be deterministic");
        }
    }

    #[test]
    fn concentration_equals_holding_weight() {
        let snap = snapshot();
        let ticker: Ticker = "AAPL".parse().unwrap();
        let got = value(
            Metric::Concentration,
            &ticker,
            &snap,
            &mut StdRng::seed_from_u64(0),
        );
        assert!((got - 0.4444).abs() < 1e-9);
    }

    #[test]
    fn allocation_score_direction() {
        let snap = snapshot();
        let mut rng = StdRng::seed_from_u64(0);
        // GOOGL is underweight (50/225 < 1/3), AAPL overweight (100/225 > 1/3).
        let googl = value(Metric::AllocationScore, &"GOOGL".parse().unwrap(), &snap, &mut rng);
        let aapl = value(Metric::AllocationScore, &"AAPL".parse().unwrap(), &snap, &mut rng);
        assert!(googl > 0.0);
        assert!(aapl < 0.0);
    }

    #[test]
    fn values_stay_in_their_documented_ranges() {
        let snap = snapshot();
        let ticker: Ticker = "AAPL".parse().unwrap();
        let weight = snap.holding_weight(&ticker);
        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            let risk = value(Metric::PortfolioRisk, &ticker, &snap, &mut rng);
            assert!((0.0..=0.5).contains(&risk), "risk out of range: {risk}");

            let corr = value(Metric::Correlation, &ticker, &snap, &mut rng);
            assert!((-1.0..=1.0).contains(&corr));

            let momentum = value(Metric::Momentum, &ticker, &snap, &mut rng);
            assert!(momentum.abs() <= weight + 1e-4);
        }
    }

    #[test]
    fn empty_holdings_produce_finite_values() {
        let snap = PortfolioDocument::new("empty", Holdings::new(), 0.0);
        let ticker: Ticker = "AAPL".parse().unwrap();
        for metric in Metric::ALL {
            let got = value(metric, &ticker, &snap, &mut StdRng::seed_from_u64(3));
            assert!(got.is_finite(), "{metric} must not divide by zero");
        }
    }

    #[test]
    fn absent_ticker_still_produces_values() {
        let snap = snapshot();
        let ticker: Ticker = "TSLA".parse().unwrap();
        for metric in Metric::ALL {
            let got = value(metric, &ticker, &snap, &mut StdRng::seed_from_u64(3));
            assert!(got.is_finite());
        }
    }

    #[tokio::test]
    async fn kernel_observes_cancellation_during_delay() {
        let cancel = CancelToken::new();
        cancel.trigger();
        let snap = snapshot();
        let got = compute(
            Metric::Momentum,
            &"AAPL".parse().unwrap(),
            &snap,
            [10.0, 10.0],
            42,
            &cancel,
        )
        .await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn kernel_produces_value_after_delay() {
        let cancel = CancelToken::new();
        let snap = snapshot();
        let got = compute(
            Metric::Concentration,
            &"AAPL".parse().unwrap(),
            &snap,
            [0.0, 0.0],
            42,
            &cancel,
        )
        .await;
        assert!((got.unwrap() - 0.4444).abs() < 1e-9);
    }
}
