use std::{borrow::Cow, net::SocketAddr};

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::session::{
    run_session, ClientTransport, CloseReason, ErrorKind, Outbound, SessionContext,
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

pub const WS_PATH: &str = "/ws/msr_data/";
/// Header carrying the identity authenticated by the fronting proxy.
pub const IDENTITY_HEADER: &str = "x-remote-user";

#[derive(Clone)]
struct AppState {
    ctx: SessionContext,
    shutdown: CancellationToken,
}

pub fn router(ctx: SessionContext, shutdown: CancellationToken) -> Router {
    Router::new()
        .route(WS_PATH, get(ws_handler))
        .route("/health", get(health))
        .with_state(AppState { ctx, shutdown })
}

/// Serves until `shutdown` fires. Open sessions see the same token and close
/// with a normal close frame.
pub async fn serve(addr: SocketAddr, ctx: SessionContext, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    serve_on(listener, ctx, shutdown).await
}

pub async fn serve_on(
    listener: TcpListener,
    ctx: SessionContext,
    shutdown: CancellationToken,
) -> Result<()> {
    let local = listener.local_addr().context("listener has no local address")?;
    log_info!("WebSocket server listening on ws://{local}{WS_PATH}");

    let app = router(ctx, shutdown.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("WebSocket server failed")
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let link = state.ctx.engine.link.snapshot();
    Json(json!({
        "status": "ok",
        "connected": link.connected,
        "demo_mode": link.is_demo(),
        "subscribers": state.ctx.engine.hub.subscriber_count(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let identity = headers
        .get(IDENTITY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    ws.on_upgrade(move |socket| async move {
        let transport = WsTransport { socket };
        if let Err(err) = run_session(transport, identity, state.ctx, state.shutdown).await {
            log_debug!("WebSocket session ended: {err:#}");
        }
    })
}

struct WsTransport {
    socket: WebSocket,
}

/// Binary frames are accepted only when they carry UTF-8 text.
fn binary_text(bytes: Vec<u8>) -> Result<String, Outbound> {
    String::from_utf8(bytes).map_err(|err| {
        Outbound::error(
            ErrorKind::Malformed,
            format!("binary frame is not valid UTF-8: {err}"),
        )
    })
}

#[async_trait]
impl ClientTransport for WsTransport {
    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.socket.recv().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match binary_text(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(reply) => {
                        log_warn!("Rejected non-UTF-8 binary frame");
                        if let Err(err) = self.send(&reply).await {
                            return Some(Err(err));
                        }
                    }
                },
                Ok(Message::Close(_)) => return None,
                // Ping replies are handled by axum.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Err(err) => return Some(Err(err.into())),
            }
        }
    }

    async fn send(&mut self, message: &Outbound) -> Result<()> {
        let text = serde_json::to_string(message).context("Failed to encode message")?;
        self.socket
            .send(Message::Text(text))
            .await
            .context("Failed to send message")
    }

    async fn close(&mut self, reason: CloseReason) -> Result<()> {
        let frame = CloseFrame {
            code: reason.code(),
            reason: Cow::Borrowed(reason.reason()),
        };
        self.socket
            .send(Message::Close(Some(frame)))
            .await
            .context("Failed to send close frame")
    }
}
