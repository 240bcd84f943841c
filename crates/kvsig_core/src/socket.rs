/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{SignalingError, SignalingResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketFrame {
    Text(String),
    Closed { code: Option<u16>, reason: String },
    Error(String),
}

/// A connected signaling socket. Dropping `outgoing` closes it; `incoming`
/// ends after a `Closed` or `Error` frame.
pub struct SignalingSocket {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<SocketFrame>,
}

#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn open(&self, url: &Url) -> SignalingResult<SignalingSocket>;
}

pub struct WsConnector {
    ping_interval: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self { ping_interval: Duration::from_secs(5) }
    }
}

impl WsConnector {
    pub fn with_ping_interval(ping_interval: Duration) -> Self {
        Self { ping_interval }
    }
}

#[async_trait]
impl SocketConnector for WsConnector {
    async fn open(&self, url: &Url) -> SignalingResult<SignalingSocket> {
        // The presigned query carries credentials.
        info!(host=?url.host_str(), path=%url.path(), "connecting signaling socket");
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| SignalingError::Socket(e.to_string()))?;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(ws, out_rx, in_tx, self.ping_interval));
        Ok(SignalingSocket { outgoing: out_tx, incoming: in_rx })
    }
}

async fn pump<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    incoming: mpsc::UnboundedSender<SocketFrame>,
    ping_interval: Duration,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut ping = tokio::time::interval(ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await;

    let last = loop {
        tokio::select! {
            _ = ping.tick() => {
                if let Err(e) = ws_tx.send(tungstenite::Message::Ping(Vec::new())).await {
                    break SocketFrame::Error(e.to_string());
                }
            }
            out = outgoing.recv() => {
                let Some(text) = out else {
                    let _ = ws_tx.send(tungstenite::Message::Close(None)).await;
                    debug!("signaling socket closed locally");
                    return;
                };
                if let Err(e) = ws_tx.send(tungstenite::Message::Text(text)).await {
                    break SocketFrame::Error(e.to_string());
                }
            }
            msg = ws_rx.next() => {
                let msg = match msg {
                    None => break SocketFrame::Closed { code: None, reason: String::new() },
                    Some(Err(e)) => break SocketFrame::Error(e.to_string()),
                    Some(Ok(m)) => m,
                };
                match msg {
                    tungstenite::Message::Text(t) => {
                        if incoming.send(SocketFrame::Text(t)).is_err() {
                            return;
                        }
                    }
                    tungstenite::Message::Ping(p) => {
                        let _ = ws_tx.send(tungstenite::Message::Pong(p)).await;
                    }
                    tungstenite::Message::Close(frame) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                            .unwrap_or((None, String::new()));
                        break SocketFrame::Closed { code, reason };
                    }
                    _ => {}
                }
            }
        }
    };
    if let SocketFrame::Error(e) = &last {
        warn!(error=%e, "signaling socket failed");
    }
    let _ = incoming.send(last);
}
