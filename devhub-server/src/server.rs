//! HTTP routes: WebSocket upgrade, health, stats and metrics.

use crate::state::AppContext;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use devhub_core::realtime::{ClientSession, Frame};
use futures::{future, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::warn;

pub fn router(context: Arc<AppContext>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(context)
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(default)]
    pub user_id: String,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(context): State<Arc<AppContext>>,
) -> Response {
    if params.user_id.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "user_id is required").into_response();
    }
    let max_message_size = context.config.client.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| serve_socket(socket, context, params.user_id))
}

async fn serve_socket(socket: WebSocket, context: Arc<AppContext>, user_id: String) {
    let opened = ClientSession::open(&context.hub, user_id, context.config.client.clone()).await;
    let (session, queue) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            warn!(error = %e, "Rejecting WebSocket connection");
            return;
        }
    };

    let (sink, stream) = socket.split();
    let sink = sink.with(|frame: Frame| future::ready(Ok::<_, axum::Error>(into_message(frame))));
    let stream = stream.map(|message| message.map(into_frame));

    // Session errors are logged by the session itself
    let _ = session.run(queue, sink, stream).await;
}

fn into_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Ping(payload) => Message::Ping(payload),
        Frame::Pong(payload) => Message::Pong(payload),
        Frame::Close => Message::Close(None),
    }
}

fn into_frame(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text),
        Message::Binary(bytes) => Frame::Text(String::from_utf8_lossy(&bytes).into_owned()),
        Message::Ping(payload) => Frame::Ping(payload),
        Message::Pong(payload) => Frame::Pong(payload),
        Message::Close(_) => Frame::Close,
    }
}

async fn health_handler(State(context): State<Arc<AppContext>>) -> Response {
    let report = context.resilience.health().report().await;
    let status = if report.status.is_available() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

async fn stats_handler(State(context): State<Arc<AppContext>>) -> Response {
    let connected_clients = match context.hub.connected_clients().await {
        Ok(count) => Some(count),
        Err(e) => {
            warn!(error = %e, "Event hub unavailable for stats");
            None
        }
    };

    Json(json!({
        "connected_clients": connected_clients,
        "hub": context.hub.stats(),
        "pools": context.pools.all_stats(),
        "resilience": context.resilience.stats(),
    }))
    .into_response()
}

async fn metrics_handler(State(context): State<Arc<AppContext>>) -> Response {
    match &context.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics are disabled").into_response(),
    }
}
