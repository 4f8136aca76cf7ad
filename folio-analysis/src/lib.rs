//! Parallel metric computation and the background market updater.
//!
//! An [`AnalysisEngine`] run launches every configured metric kernel against
//! one immutable snapshot of the session document, persists each result
//! before streaming it, and can be cancelled as a unit through a
//! [`CancelToken`]. The [`MarketUpdater`] periodically recomputes portfolio
//! totals from a simulated price walk, independently of any running
//! analysis.

pub mod cancel;
pub mod engine;
pub mod market;
pub mod metrics;

pub use cancel::CancelToken;
pub use engine::{AnalysisEngine, AnalysisPlan, RunOutcome};
pub use market::{MarketUpdater, PriceWalk};
