use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::channel::mpsc::{unbounded, UnboundedReceiver};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use nutbot_relay_types::extension::NotificationParams;

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::handler::cmd::ClientQueue;
use crate::handler::{Admission, Hub, Outbound, PRODUCT, PROTOCOL_VERSION};
use crate::relay::Relay;

#[derive(Debug, Clone)]
struct AppState {
    relay: Relay,
    local_addr: SocketAddr,
    /// Interval of websocket level pings to control clients
    client_ping: Duration,
}

impl AppState {
    /// The url control clients should connect to, as seen from the caller
    fn cdp_url(&self, headers: &HeaderMap) -> String {
        let host = headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| self.local_addr.to_string());
        format!("ws://{}/cdp", host)
    }
}

/// The relay's HTTP and websocket surface, running in the background.
#[derive(Debug)]
pub struct RelayServer {
    local_addr: SocketAddr,
    relay: Relay,
    hub: JoinHandle<()>,
    server: JoinHandle<()>,
}

impl RelayServer {
    /// Binds the listener, then spawns the hub and the server onto the
    /// current tokio runtime.
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr()).await?;
        let local_addr = listener.local_addr()?;

        let (relay, hub) = Relay::new(config.clone());
        let hub = tokio::spawn(drive(hub));

        let app = router(AppState {
            relay: relay.clone(),
            local_addr,
            client_ping: config.keepalive_interval,
        });
        let server = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                tracing::error!(%err, "relay server failed");
            }
        });
        tracing::info!(%local_addr, "relay listening");

        Ok(Self {
            local_addr,
            relay,
            hub,
            server,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Resolves when the server stops.
    pub async fn wait(&mut self) {
        let _ = (&mut self.server).await;
    }

    pub fn shutdown(self) {
        self.server.abort();
        self.hub.abort();
    }
}

/// Polls the hub until every handle is gone
async fn drive(mut hub: Hub) {
    while let Some(event) = hub.next().await {
        tracing::debug!(?event, "hub");
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/json/version", get(json_version))
        .route("/json", get(json_list))
        .route("/json/list", get(json_list))
        .route("/extension/status", get(extension_status))
        .route("/notify", post(notify))
        .route("/extension", get(extension_upgrade))
        .route("/cdp", get(cdp_upgrade))
        .route("/cdp/:client_id", get(cdp_upgrade_with_id))
        .with_state(state)
}

fn hub_unavailable(err: RelayError) -> Response {
    tracing::error!(%err, "hub unavailable");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

async fn health() -> &'static str {
    "OK"
}

async fn json_version(State(state): State<AppState>, headers: HeaderMap) -> Response {
    Json(json!({
        "Browser": PRODUCT,
        "Protocol-Version": PROTOCOL_VERSION,
        "webSocketDebuggerUrl": state.cdp_url(&headers),
    }))
    .into_response()
}

async fn json_list(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let snapshot = match state.relay.snapshot().await {
        Ok(snapshot) => snapshot,
        Err(err) => return hub_unavailable(err),
    };
    let url = state.cdp_url(&headers);
    let list: Vec<_> = snapshot
        .targets
        .iter()
        .filter(|info| info.is_page())
        .map(|info| {
            json!({
                "id": info.target_id,
                "type": info.r#type,
                "title": info.title,
                "url": info.url,
                "webSocketDebuggerUrl": url,
            })
        })
        .collect();
    Json(list).into_response()
}

async fn extension_status(State(state): State<AppState>) -> Response {
    match state.relay.status().await {
        Ok(status) => Json(status).into_response(),
        Err(err) => hub_unavailable(err),
    }
}

async fn notify(State(state): State<AppState>, body: Bytes) -> Response {
    let params: NotificationParams = match serde_json::from_slice(&body) {
        Ok(params) => params,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "error": err.to_string() })),
            )
                .into_response()
        }
    };
    match state.relay.notify(params).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(RelayError::NotConnected) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "success": false, "error": RelayError::NotConnected.to_string() })),
        )
            .into_response(),
        Err(err) => hub_unavailable(err),
    }
}

async fn extension_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| extension_connection(socket, state.relay))
}

async fn cdp_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| client_connection(socket, state, None))
}

async fn cdp_upgrade_with_id(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| client_connection(socket, state, Some(client_id)))
}

async fn extension_connection(socket: WebSocket, relay: Relay) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = unbounded();
    let writer = tokio::spawn(write_outbound(sink, rx, None));

    let conn = match relay.connect_extension(tx).await {
        Ok(Admission::Accepted(conn)) => conn,
        Ok(Admission::Rejected) => {
            // the hub queued the close frame and dropped its sender
            let _ = writer.await;
            return;
        }
        Err(err) => {
            tracing::error!(%err, "failed to register extension connection");
            writer.abort();
            return;
        }
    };

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => {
                if relay.extension_frame(conn, text).await.is_err() {
                    break;
                }
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(%err, "extension websocket error");
                break;
            }
        }
    }

    let _ = relay.extension_closed(conn).await;
    let _ = writer.await;
}

async fn client_connection(socket: WebSocket, state: AppState, client_id: Option<String>) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = unbounded();
    let writer = tokio::spawn(write_outbound(sink, rx, Some(state.client_ping)));
    let relay = state.relay;

    let client_id = match relay.connect_client(client_id, tx.clone()).await {
        Ok(client_id) => client_id,
        Err(err) => {
            tracing::debug!(%err, "control client rejected");
            drop(tx);
            let _ = writer.await;
            return;
        }
    };

    let (frames_tx, frames_rx) = unbounded();
    let queue = ClientQueue::new(relay.clone(), client_id.clone(), tx, frames_rx);
    let drain = tokio::spawn(async move {
        let client_id = queue.client_id().to_string();
        if let Err(err) = queue.run().await {
            tracing::debug!(client = %client_id, %err, "client queue stopped");
        }
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => {
                if frames_tx.unbounded_send(text).is_err() {
                    break;
                }
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(client = %client_id, %err, "client websocket error");
                break;
            }
        }
    }

    drop(frames_tx);
    drain.abort();
    let _ = relay.client_closed(client_id).await;
}

/// Writes everything the hub queued for a connection, optionally pinging
/// the peer on an interval.
async fn write_outbound(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut rx: UnboundedReceiver<Outbound>,
    ping: Option<Duration>,
) {
    let period = ping.unwrap_or(Duration::from_secs(3600));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            msg = rx.next() => match msg {
                Some(Outbound::Text(text)) => {
                    if sink.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let _ = sink
                        .send(WsMessage::Close(Some(CloseFrame { code, reason })))
                        .await;
                    break;
                }
                None => break,
            },
            _ = ticker.tick(), if ping.is_some() => {
                if sink.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}
