/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Local signaling channel relay.
//!
//! Accepts one master and any number of viewers per channel over websockets
//! and forwards envelopes between them the way the hosted service does. Also
//! serves the two control-plane calls a session makes before connecting.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use kvsig_protocol::{decode, Envelope};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind: SocketAddr,
    /// Websocket URL handed out by `getSignalingChannelEndpoint`. Derived from
    /// the request's Host header when unset.
    pub public_ws: Option<String>,
}

impl RelayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind = std::env::var("KVSIG_RELAY_BIND").unwrap_or_else(|_| "127.0.0.1:8788".to_string());
        let bind: SocketAddr = bind
            .parse()
            .map_err(|e| anyhow::anyhow!("KVSIG_RELAY_BIND invalid ({bind}): {e}"))?;
        let public_ws = std::env::var("KVSIG_RELAY_PUBLIC_WS")
            .ok()
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .filter(|v| !v.is_empty());
        Ok(Self { bind, public_ws })
    }
}

struct Conn {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct Channel {
    master: Option<Conn>,
    viewers: HashMap<String, Conn>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Member {
    Master,
    Viewer(String),
}

#[derive(Clone)]
pub struct AppState {
    cfg: Arc<RelayConfig>,
    channels: Arc<RwLock<HashMap<String, Channel>>>,
    next_id: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(cfg: RelayConfig) -> Self {
        Self {
            cfg: Arc::new(cfg),
            channels: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Whether a master is attached, and the ids of attached viewers.
    pub async fn members(&self, channel_arn: &str) -> (bool, Vec<String>) {
        let channels = self.channels.read().await;
        let Some(ch) = channels.get(channel_arn) else {
            return (false, Vec::new());
        };
        let mut viewers: Vec<String> = ch.viewers.keys().cloned().collect();
        viewers.sort();
        (ch.master.is_some(), viewers)
    }

    async fn attach(&self, channel_arn: &str, member: &Member, tx: mpsc::UnboundedSender<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut channels = self.channels.write().await;
        let ch = channels.entry(channel_arn.to_string()).or_default();
        let conn = Conn { id, tx };
        let replaced = match member {
            Member::Master => ch.master.replace(conn).is_some(),
            Member::Viewer(v) => ch.viewers.insert(v.clone(), conn).is_some(),
        };
        if replaced {
            info!(channel=%channel_arn, ?member, "replaced existing connection");
        }
        id
    }

    async fn detach(&self, channel_arn: &str, member: &Member, id: u64) {
        let mut channels = self.channels.write().await;
        let Some(ch) = channels.get_mut(channel_arn) else { return };
        match member {
            Member::Master => {
                if ch.master.as_ref().is_some_and(|c| c.id == id) {
                    ch.master = None;
                }
            }
            Member::Viewer(v) => {
                if ch.viewers.get(v).is_some_and(|c| c.id == id) {
                    ch.viewers.remove(v);
                }
            }
        }
        if ch.master.is_none() && ch.viewers.is_empty() {
            channels.remove(channel_arn);
        }
    }

    async fn forward(&self, channel_arn: &str, from: &Member, text: &str) {
        let channels = self.channels.read().await;
        let Some(ch) = channels.get(channel_arn) else { return };
        let reply = |env: Envelope| {
            let own = match from {
                Member::Master => ch.master.as_ref(),
                Member::Viewer(v) => ch.viewers.get(v),
            };
            if let Some(c) = own {
                let _ = c.tx.send(env.encode());
            }
        };

        let env = match decode(text) {
            Ok(env) => env,
            Err(e) => {
                warn!(channel=%channel_arn, ?from, "undecodable message: {e}");
                reply(Envelope::status_response(None, "InvalidArgumentException", e.to_string()));
                return;
            }
        };
        let correlation_id = env.correlation_id.clone();

        match from {
            Member::Viewer(viewer) => match ch.master.as_ref() {
                Some(master) => {
                    debug!(channel=%channel_arn, %viewer, kind=%env.kind, "viewer -> master");
                    let _ = master.tx.send(env.into_inbound(Some(viewer.clone())).encode());
                }
                None => reply(Envelope::status_response(
                    correlation_id,
                    "ResourceNotFoundException",
                    "no master connected to this channel",
                )),
            },
            Member::Master => {
                let target = match env.recipient_client_id.as_deref() {
                    Some(id) => ch.viewers.get(id).map(|c| (id.to_string(), c)),
                    None if ch.viewers.len() == 1 => ch.viewers.iter().next().map(|(id, c)| (id.clone(), c)),
                    None => None,
                };
                match target {
                    Some((viewer, conn)) => {
                        debug!(channel=%channel_arn, %viewer, kind=%env.kind, "master -> viewer");
                        let _ = conn.tx.send(env.into_inbound(None).encode());
                    }
                    None => {
                        let wanted = env.recipient_client_id.clone().unwrap_or_else(|| "<none>".to_string());
                        reply(Envelope::status_response(
                            correlation_id,
                            "InvalidArgumentException",
                            format!("recipient {wanted} is not connected"),
                        ))
                    }
                }
            }
        }
    }

    fn public_ws(&self, headers: &HeaderMap) -> String {
        if let Some(ws) = self.cfg.public_ws.clone() {
            return ws;
        }
        let host = headers
            .get("host")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| self.cfg.bind.to_string());
        format!("ws://{host}")
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(signaling_ws))
        .route("/getSignalingChannelEndpoint", post(get_signaling_channel_endpoint))
        .route("/v1/get-ice-server-config", post(get_ice_server_config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    #[serde(rename = "X-Amz-ChannelARN")]
    channel_arn: String,
    #[serde(rename = "X-Amz-ClientId")]
    client_id: Option<String>,
}

async fn signaling_ws(State(state): State<AppState>, Query(q): Query<ConnectQuery>, ws: WebSocketUpgrade) -> Response {
    let member = match q.client_id.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
        Some(id) => Member::Viewer(id),
        None => Member::Master,
    };
    ws.on_upgrade(move |socket| handle_socket(state, q.channel_arn, member, socket))
}

async fn handle_socket(state: AppState, channel_arn: String, member: Member, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let id = state.attach(&channel_arn, &member, tx).await;
    info!(channel=%channel_arn, ?member, "connected");

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
        // Replaced by a newer connection.
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    while let Some(Ok(msg)) = ws_rx.next().await {
        match msg {
            Message::Text(text) => {
                if !text.trim().is_empty() {
                    state.forward(&channel_arn, &member, &text).await;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.detach(&channel_arn, &member, id).await;
    writer.abort();
    info!(channel=%channel_arn, ?member, "disconnected");
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetEndpointBody {
    #[serde(rename = "ChannelARN")]
    channel_arn: String,
}

async fn get_signaling_channel_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<GetEndpointBody>,
) -> Json<serde_json::Value> {
    let ws = state.public_ws(&headers);
    let https = ws.replacen("ws", "http", 1);
    debug!(channel=%body.channel_arn, %ws, "endpoint lookup");
    Json(json!({
        "ResourceEndpointList": [
            {"Protocol": "WSS", "ResourceEndpoint": ws},
            {"Protocol": "HTTPS", "ResourceEndpoint": https},
        ]
    }))
}

async fn get_ice_server_config() -> Json<serde_json::Value> {
    Json(json!({ "IceServerList": [] }))
}

pub struct RelayHandle {
    pub addr: SocketAddr,
    pub state: AppState,
    pub task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn http_base(&self) -> String {
        format!("http://{}", self.addr)
    }
}

/// Binds an ephemeral port on localhost and serves in the background.
pub async fn spawn_local() -> anyhow::Result<RelayHandle> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = AppState::new(RelayConfig { bind: addr, public_ws: Some(format!("ws://{addr}")) });
    let app = router(state.clone());
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("relay server stopped: {e}");
        }
    });
    Ok(RelayHandle { addr, state, task })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvsig_protocol::{encode, encode_payload, MessageKind, PayloadEncoding, SessionDescription};

    fn state() -> AppState {
        AppState::new(RelayConfig { bind: "127.0.0.1:0".parse().unwrap(), public_ws: None })
    }

    fn offer() -> String {
        encode(
            MessageKind::SdpOffer,
            None,
            &encode_payload(&SessionDescription::offer("v=0"), PayloadEncoding::Plain),
        )
    }

    #[tokio::test]
    async fn viewer_message_reaches_master_with_sender() {
        let s = state();
        let (mtx, mut mrx) = mpsc::unbounded_channel();
        let (vtx, _vrx) = mpsc::unbounded_channel();
        s.attach("arn", &Member::Master, mtx).await;
        s.attach("arn", &Member::Viewer("v1".into()), vtx).await;

        s.forward("arn", &Member::Viewer("v1".into()), &offer()).await;
        let env = decode(&mrx.try_recv().unwrap()).unwrap();
        assert_eq!(env.kind, MessageKind::SdpOffer);
        assert_eq!(env.sender_client_id.as_deref(), Some("v1"));
        assert!(env.encode().contains("\"messageType\""));
    }

    #[tokio::test]
    async fn master_message_routed_by_recipient() {
        let s = state();
        let (mtx, _mrx) = mpsc::unbounded_channel();
        let (v1tx, mut v1rx) = mpsc::unbounded_channel();
        let (v2tx, mut v2rx) = mpsc::unbounded_channel();
        s.attach("arn", &Member::Master, mtx).await;
        s.attach("arn", &Member::Viewer("v1".into()), v1tx).await;
        s.attach("arn", &Member::Viewer("v2".into()), v2tx).await;

        let answer = encode(
            MessageKind::SdpAnswer,
            Some("v2"),
            &encode_payload(&SessionDescription::answer("a"), PayloadEncoding::Plain),
        );
        s.forward("arn", &Member::Master, &answer).await;
        assert!(v1rx.try_recv().is_err());
        let env = decode(&v2rx.try_recv().unwrap()).unwrap();
        assert_eq!(env.kind, MessageKind::SdpAnswer);
        assert_eq!(env.sender_client_id, None);
        assert_eq!(env.recipient_client_id, None);
    }

    #[tokio::test]
    async fn unresolvable_recipient_gets_status_response() {
        let s = state();
        let (mtx, mut mrx) = mpsc::unbounded_channel();
        let (v1tx, _v1rx) = mpsc::unbounded_channel();
        let (v2tx, _v2rx) = mpsc::unbounded_channel();
        s.attach("arn", &Member::Master, mtx).await;
        s.attach("arn", &Member::Viewer("v1".into()), v1tx).await;
        s.attach("arn", &Member::Viewer("v2".into()), v2tx).await;

        let answer = encode(
            MessageKind::SdpAnswer,
            None,
            &encode_payload(&SessionDescription::answer("a"), PayloadEncoding::Plain),
        );
        s.forward("arn", &Member::Master, &answer).await;
        let env = decode(&mrx.try_recv().unwrap()).unwrap();
        assert_eq!(env.kind, MessageKind::StatusResponse);
    }

    #[tokio::test]
    async fn viewer_without_master_gets_status_response() {
        let s = state();
        let (vtx, mut vrx) = mpsc::unbounded_channel();
        s.attach("arn", &Member::Viewer("v1".into()), vtx).await;
        s.forward("arn", &Member::Viewer("v1".into()), &offer()).await;
        let env = decode(&vrx.try_recv().unwrap()).unwrap();
        assert_eq!(env.kind, MessageKind::StatusResponse);
        assert!(env.status.unwrap().description.unwrap().contains("no master"));
    }

    #[tokio::test]
    async fn newer_master_replaces_older() {
        let s = state();
        let (old_tx, mut old_rx) = mpsc::unbounded_channel();
        let (new_tx, _new_rx) = mpsc::unbounded_channel();
        let old_id = s.attach("arn", &Member::Master, old_tx).await;
        s.attach("arn", &Member::Master, new_tx).await;
        // Sender side of the old connection is gone.
        assert!(old_rx.recv().await.is_none());
        s.detach("arn", &Member::Master, old_id).await;
        assert_eq!(s.members("arn").await, (true, Vec::new()));
    }
}
