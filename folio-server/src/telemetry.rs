//! Tracing setup and the plain-HTTP health listener.

use std::convert::Infallible;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use hyper::body::Body;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Request, Response, StatusCode};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let stdout_layer = fmt::layer().with_target(true).with_filter(filter);
    tracing_subscriber::registry().with(stdout_layer).try_init()?;
    Ok(())
}

/// Launch a lightweight HTTP server answering `GET /health`. Returns the
/// bound address so callers may pass port 0.
pub fn spawn_health_server(
    addr: SocketAddr,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let make_svc = make_service_fn(|_| async {
        Ok::<_, Infallible>(service_fn(|req: Request<Body>| async move {
            let response = if req.uri().path() == "/health" {
                Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "application/json")
                    .body(Body::from(r#"{"status":"ok"}"#))
            } else {
                Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::empty())
            };
            Ok::<_, Infallible>(response.expect("static response"))
        }))
    });

    let server = hyper::Server::try_bind(&addr)
        .with_context(|| format!("failed to bind health listener on {addr}"))?
        .serve(make_svc);
    let local_addr = server.local_addr();
    info!(%local_addr, "health listener started");
    let handle = tokio::spawn(async move {
        if let Err(err) = server.await {
            error!(error = %err, "health server terminated");
        }
    });
    Ok((local_addr, handle))
}
