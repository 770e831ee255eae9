//! Axum gateway: the telephony webhook and the media-stream WebSocket.
//!
//! ## Protocol Overview
//!
//! 1. **Incoming call**: the telephony provider POSTs `/incoming`; we answer
//!    with TwiML that connects the call to `wss://{host}/connection`.
//! 2. **Media stream**: the provider opens `/connection`; each socket is one
//!    call, served by a [`FrameTransport`] and a [`TurnCoordinator`].
//! 3. **Hang-up**: a `stop` frame or socket close ends the coordinator, which
//!    cancels every stage of that call.

use crate::config::Config;
use crate::coordinator::{Backends, TurnCoordinator};
use crate::transport::FrameTransport;
use anyhow::Result;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use futures_util::{future, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use uuid::Uuid;

/// Maximum webhook body size (64KB).
pub const MAX_BODY_SIZE: usize = 65_536;

/// Shared state for all gateway handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub backends: Backends,
}

/// Routes for the webhook, the media stream, and a health probe.
pub fn router(state: GatewayState) -> Router {
    let timeout = Duration::from_secs(state.config.gateway.request_timeout_secs.max(1));
    Router::new()
        .route("/health", get(handle_health))
        .route("/incoming", post(handle_incoming))
        .route("/connection", get(handle_connection))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout))
}

/// Bind the configured address and serve until the listener fails.
pub async fn run_gateway(config: Config, backends: Backends) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.gateway.host, config.gateway.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Gateway listening");

    let app = router(GatewayState {
        config: Arc::new(config),
        backends,
    });
    axum::serve(listener, app).await?;
    Ok(())
}

// ── Handlers ───────────────────────────────────────────────────────

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /incoming: TwiML pointing the call at our media-stream endpoint.
async fn handle_incoming(State(state): State<GatewayState>, headers: HeaderMap) -> impl IntoResponse {
    let host = state
        .config
        .gateway
        .public_host
        .clone()
        .or_else(|| {
            headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        });
    let Some(host) = host else {
        tracing::warn!("Incoming call without Host header or public_host");
        return (StatusCode::BAD_REQUEST, "missing host").into_response();
    };

    tracing::info!(host = %host, "Incoming call");
    (
        [(header::CONTENT_TYPE, "text/xml")],
        stream_twiml(&host),
    )
        .into_response()
}

/// GET /connection: one media-stream WebSocket per call.
async fn handle_connection(
    State(state): State<GatewayState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_call(socket, state))
}

/// Drive one call until the coordinator finishes.
async fn serve_call(socket: WebSocket, state: GatewayState) {
    let connection_id = Uuid::new_v4().to_string();
    tracing::info!(connection_id = %connection_id, "Media stream connected");

    let (sender, receiver) = socket.split();
    let inbound = receiver
        .take_while(|msg| future::ready(matches!(msg, Ok(m) if !matches!(m, Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(text.to_string()),
                _ => None,
            })
        });
    let outbound =
        sender.with(|frame: String| future::ready(Ok::<_, axum::Error>(Message::Text(frame.into()))));

    let cancel = CancellationToken::new();
    let (events, transport) =
        FrameTransport::start(connection_id.clone(), inbound, outbound, cancel.clone());
    TurnCoordinator::new(state.config, state.backends, transport, cancel)
        .run(events)
        .await;

    tracing::info!(connection_id = %connection_id, "Media stream closed");
}

fn stream_twiml(host: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><Response><Connect><Stream url="wss://{}/connection"/></Connect></Response>"#,
        escape_xml_attr(host)
    )
}

fn escape_xml_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
