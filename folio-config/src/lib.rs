//! Layered configuration loading utilities.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use config::{Config, Environment, File};
use folio_core::{Metric, Ticker};
use serde::Deserialize;

mod deserializer;

/// Root application configuration deserialized from layered sources.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Optional plain-HTTP health listener; disabled when absent.
    #[serde(default)]
    pub health_addr: Option<String>,
    #[serde(default = "default_store_url")]
    pub store_url: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub market: MarketConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(
        default = "default_holdings",
        with = "deserializer::uppercase_key"
    )]
    pub default_holdings: HashMap<String, u64>,
    #[serde(default = "default_initial_total_value")]
    pub initial_total_value: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    #[serde(default = "default_metrics")]
    pub metrics: Vec<Metric>,
    /// `[min, max]` seconds of simulated work per metric kernel.
    #[serde(default = "default_delay_range")]
    pub delay_range: [f64; 2],
}

#[derive(Debug, Deserialize, Clone)]
pub struct MarketConfig {
    #[serde(default = "default_market_interval_secs")]
    pub interval_secs: f64,
    #[serde(
        default = "default_base_prices",
        with = "deserializer::uppercase_key"
    )]
    pub base_prices: HashMap<String, f64>,
    #[serde(default = "default_price")]
    pub default_price: f64,
    /// Half-width of the uniform random walk step, as a fraction of price.
    #[serde(default = "default_volatility")]
    pub volatility: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            default_holdings: default_holdings(),
            initial_total_value: default_initial_total_value(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            metrics: default_metrics(),
            delay_range: default_delay_range(),
        }
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_market_interval_secs(),
            base_prices: default_base_prices(),
            default_price: default_price(),
            volatility: default_volatility(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            health_addr: None,
            store_url: default_store_url(),
            log_level: default_log_level(),
            session: SessionConfig::default(),
            analysis: AnalysisConfig::default(),
            market: MarketConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration layering an optional file and `FOLIO_`-prefixed
    /// environment variables (e.g. `FOLIO_SESSION__TTL_SECS=3600`) over the
    /// built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        } else {
            builder = builder.add_source(File::with_name("folio").required(false));
        }
        let settings = builder
            .add_source(Environment::with_prefix("FOLIO").separator("__"))
            .build()
            .context("failed to assemble configuration sources")?;
        let config: AppConfig = settings
            .try_deserialize()
            .context("failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot be run.
    pub fn validate(&self) -> Result<()> {
        let [min, max] = self.analysis.delay_range;
        ensure!(
            min >= 0.0 && min <= max,
            "analysis.delay_range must be ordered and non-negative, got [{min}, {max}]"
        );
        ensure!(
            !self.analysis.metrics.is_empty(),
            "analysis.metrics must name at least one metric"
        );
        ensure!(
            self.market.interval_secs > 0.0,
            "market.interval_secs must be positive"
        );
        ensure!(
            (0.0..1.0).contains(&self.market.volatility),
            "market.volatility must be in [0, 1)"
        );
        ensure!(self.session.ttl_secs > 0, "session.ttl_secs must be positive");
        Ok(())
    }

    /// Default holdings keyed by validated ticker; invalid keys are dropped.
    #[must_use]
    pub fn default_holdings(&self) -> folio_core::Holdings {
        typed_keys(&self.session.default_holdings)
    }

    /// Base prices keyed by validated ticker; invalid keys are dropped.
    #[must_use]
    pub fn base_prices(&self) -> HashMap<Ticker, f64> {
        typed_keys(&self.market.base_prices)
    }
}

fn typed_keys<V: Copy>(raw: &HashMap<String, V>) -> HashMap<Ticker, V> {
    raw.iter()
        .filter_map(|(k, v)| k.parse::<Ticker>().ok().map(|t| (t, *v)))
        .collect()
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_session_ttl_secs() -> u64 {
    86_400
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_holdings() -> HashMap<String, u64> {
    [("AAPL", 100), ("GOOGL", 50), ("MSFT", 75)]
        .into_iter()
        .map(|(t, n)| (t.to_string(), n))
        .collect()
}

fn default_initial_total_value() -> f64 {
    125_000.0
}

fn default_metrics() -> Vec<Metric> {
    Metric::ALL.to_vec()
}

fn default_delay_range() -> [f64; 2] {
    [2.0, 5.0]
}

fn default_market_interval_secs() -> f64 {
    30.0
}

fn default_base_prices() -> HashMap<String, f64> {
    [
        ("AAPL", 185.0),
        ("GOOGL", 140.0),
        ("MSFT", 375.0),
        ("AMZN", 155.0),
        ("TSLA", 200.0),
        ("META", 390.0),
        ("NVDA", 650.0),
    ]
    .into_iter()
    .map(|(t, p)| (t.to_string(), p))
    .collect()
}

fn default_price() -> f64 {
    100.0
}

fn default_volatility() -> f64 {
    0.02
}
