//! Process bootstrap and lifecycle.
//!
//! Everything long-running starts here: the store connection, the market
//! updater, the health listener, and the accept loop. There are no
//! import-time side effects; teardown cancels the updater and waits for the
//! accept loop before returning.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use folio_analysis::{AnalysisEngine, AnalysisPlan, CancelToken, MarketUpdater, PriceWalk};
use folio_config::AppConfig;
use folio_state::{DocumentStore, PortfolioRepository, RedisStore, SessionDefaults};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

use crate::registry::SessionRegistry;
use crate::telemetry::spawn_health_server;
use crate::ws::{serve, ServerContext};

/// Handle to a server spawned in the background.
pub struct RunningServer {
    pub local_addr: SocketAddr,
    pub health_addr: Option<SocketAddr>,
    pub registry: SessionRegistry,
    shutdown: CancelToken,
    accept: JoinHandle<()>,
    updater: JoinHandle<()>,
    health: Option<JoinHandle<()>>,
}

impl RunningServer {
    /// Stop accepting connections, close the live ones, stop the market
    /// updater, and wait for the long-running tasks to wind down.
    pub async fn shutdown(self) {
        self.shutdown.trigger();
        self.registry.close_all();
        let _ = self.accept.await;
        let _ = self.updater.await;
        if let Some(health) = self.health {
            health.abort();
        }
    }
}

/// Bind the listener and start every long-running task against the given
/// store backend.
pub async fn spawn(config: &AppConfig, store: Arc<dyn DocumentStore>) -> Result<RunningServer> {
    let repo = PortfolioRepository::new(
        store,
        SessionDefaults {
            holdings: config.default_holdings(),
            total_value: config.session.initial_total_value,
        },
    );
    let engine = AnalysisEngine::new(
        repo.clone(),
        AnalysisPlan {
            metrics: config.analysis.metrics.clone(),
            delay_range: config.analysis.delay_range,
        },
    );
    let registry = SessionRegistry::new();
    let shutdown = CancelToken::new();

    let walk = PriceWalk::new(
        config.base_prices(),
        config.market.default_price,
        config.market.volatility,
        rand::random(),
    );
    let updater = MarketUpdater::new(
        repo.clone(),
        walk,
        Duration::from_secs_f64(config.market.interval_secs),
    );
    let updater_handle = tokio::spawn(updater.run(shutdown.clone()));

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let local_addr = listener.local_addr()?;
    info!(target: "folio.server", %local_addr, "listening for sessions");

    let (health_addr, health) = match &config.health_addr {
        Some(addr) => {
            let addr: SocketAddr = addr
                .parse()
                .with_context(|| format!("invalid health_addr '{addr}'"))?;
            let (bound, handle) = spawn_health_server(addr)?;
            (Some(bound), Some(handle))
        }
        None => (None, None),
    };

    let ctx = Arc::new(ServerContext {
        repo,
        engine,
        registry: registry.clone(),
        idle_timeout: Duration::from_secs(config.session.idle_timeout_secs),
    });
    let accept = tokio::spawn(serve(listener, ctx, shutdown.clone()));

    Ok(RunningServer {
        local_addr,
        health_addr,
        registry,
        shutdown,
        accept,
        updater: updater_handle,
        health,
    })
}

/// Production entrypoint: connect the store, serve until ctrl-c.
///
/// An unreachable store or failed script registration aborts the process
/// here, before any connection is accepted.
pub async fn run(config: AppConfig) -> Result<()> {
    let store = RedisStore::connect(&config.store_url, config.session.ttl_secs)
        .await
        .context("document store bootstrap failed")?;
    let server = spawn(&config, Arc::new(store)).await?;
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!(target: "folio.server", "shutdown signal received");
    server.shutdown().await;
    Ok(())
}
