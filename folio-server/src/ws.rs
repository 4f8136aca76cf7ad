//! WebSocket front end: accept loop and per-connection session plumbing.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use folio_analysis::{AnalysisEngine, CancelToken};
use folio_core::ServerMessage;
use folio_state::PortfolioRepository;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::registry::SessionRegistry;
use crate::session::{generate_session_id, SessionController};

/// Everything a connection needs, shared across the accept loop.
pub struct ServerContext {
    pub repo: PortfolioRepository,
    pub engine: AnalysisEngine,
    pub registry: SessionRegistry,
    pub idle_timeout: Duration,
}

/// Accept connections until `shutdown` fires.
pub async fn serve(listener: TcpListener, ctx: Arc<ServerContext>, shutdown: CancelToken) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(ctx, stream).await {
                            warn!(
                                target: "folio.session",
                                %peer, error = %err,
                                "connection ended with error"
                            );
                        }
                    });
                }
                Err(err) => {
                    warn!(target: "folio.session", error = %err, "failed to accept connection");
                }
            }
        }
    }
    info!(target: "folio.session", "accept loop stopped");
}

async fn handle_connection(ctx: Arc<ServerContext>, stream: TcpStream) -> Result<()> {
    let captured_path = Arc::new(StdMutex::new(String::new()));
    let path_clone = captured_path.clone();
    let ws_stream = accept_hdr_async(stream, move |req: &Request, resp: Response| {
        if let Ok(mut path) = path_clone.lock() {
            *path = req.uri().path().to_string();
        }
        Ok(resp)
    })
    .await?;
    let path = captured_path
        .lock()
        .map(|guard| guard.clone())
        .unwrap_or_else(|_| "/".to_string());
    let rest = match path.strip_prefix("/ws") {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => {
            warn!(target: "folio.session", path, "received websocket connection for unknown path");
            return Ok(());
        }
    };
    let session_id = match rest.trim_matches('/') {
        candidate if folio_core::is_valid_session_id(candidate) => candidate.to_string(),
        _ => {
            let id = generate_session_id();
            debug!(target: "folio.session", path, id, "no usable session id in path, generated one");
            id
        }
    };

    // The session document must exist before any command is accepted.
    ctx.repo.ensure(&session_id).await?;
    info!(target: "folio.session", session_id, "client connected");

    let (mut sink, mut source) = ws_stream.split();

    // Single writer for the socket.
    let (msg_tx, mut msg_rx) = mpsc::channel::<Message>(64);
    let writer = tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Typed frames funnel through the single writer.
    let (frame_tx, mut frame_rx) = mpsc::channel::<ServerMessage>(64);
    let frame_writer = {
        let msg_tx = msg_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                match serde_json::to_string(&frame) {
                    Ok(text) => {
                        if msg_tx.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(target: "folio.session", error = %err, "failed to encode frame");
                    }
                }
            }
        })
    };

    let (handle, displaced) = ctx.registry.register(&session_id);
    if let Some(previous) = displaced {
        // A reconnect for the same session takes over; the old connection
        // is asked to close so the session keeps a single emitter.
        warn!(target: "folio.session", session_id, "displacing previous connection");
        previous.close.trigger();
    }

    let mut controller =
        SessionController::new(session_id.clone(), ctx.engine.clone(), frame_tx.clone());

    loop {
        let next = tokio::select! {
            () = handle.close.cancelled() => {
                debug!(target: "folio.session", session_id, "connection closed by registry");
                break;
            }
            next = tokio::time::timeout(ctx.idle_timeout, source.next()) => next,
        };
        let msg = match next {
            Err(_) => {
                info!(target: "folio.session", session_id, "idle timeout, closing");
                break;
            }
            Ok(None) => break,
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(err))) => {
                debug!(target: "folio.session", session_id, error = %err, "socket error");
                break;
            }
        };
        match msg {
            Message::Text(text) => controller.handle_text(&text).await,
            Message::Binary(_) => {
                let _ = frame_tx
                    .send(ServerMessage::error("binary frames are not supported"))
                    .await;
            }
            Message::Ping(payload) => {
                let _ = msg_tx.send(Message::Pong(payload)).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Teardown: settle the in-flight run before releasing the emitter, so
    // nothing can be written after this point.
    controller.shutdown().await;
    ctx.registry.deregister(&session_id, &handle);
    info!(target: "folio.session", session_id, "client disconnected");

    drop(controller);
    drop(frame_tx);
    drop(msg_tx);
    let _ = frame_writer.await;
    let _ = writer.await;
    Ok(())
}
