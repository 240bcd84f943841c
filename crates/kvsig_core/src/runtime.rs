/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};
use url::Url;

use crate::config::SessionConfig;
use crate::control_plane::{default_stun, IceServerSource, KinesisControlPlane};
use crate::session::{Collaborators, Session, SessionEvent};
use crate::sigv4::SigV4Presigner;
use crate::socket::WsConnector;
use crate::webrtc_transport::WebrtcTransportFactory;

const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .try_init()
        .ok();
}

/// Control plane, SigV4 presigner, websocket connector and webrtc transports.
pub async fn real_collaborators(cfg: &SessionConfig) -> Result<Collaborators> {
    let timeout = Duration::from_secs(cfg.http_timeout_secs.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS));
    let mut control = KinesisControlPlane::new(cfg.credentials.clone(), timeout).context("http client")?;
    if let Some(base) = cfg.control_plane_url.as_deref() {
        let url = Url::parse(base).with_context(|| format!("invalid control_plane_url: {base}"))?;
        control = control.with_endpoint_override(url);
    }

    let ice_servers = match control
        .ice_servers(&cfg.region, &cfg.channel_arn, cfg.role, cfg.client_id.as_deref())
        .await
    {
        Ok(v) => v,
        Err(e) => {
            warn!("ice server config unavailable, using STUN only: {e}");
            vec![default_stun(&cfg.region)]
        }
    };
    info!(count = ice_servers.len(), "ice servers configured");

    Ok(Collaborators {
        resolver: Arc::new(control),
        signer: Arc::new(SigV4Presigner::default()),
        connector: Arc::new(WsConnector::default()),
        transports: Arc::new(WebrtcTransportFactory::new(ice_servers)),
    })
}

/// Runs one session until the relay closes it or `shutdown` flips to true.
pub async fn run_session(cfg: SessionConfig, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let collaborators = real_collaborators(&cfg).await?;
    let (session, mut events) = Session::new(&cfg, collaborators).context("build session")?;
    session.connect().await.context("connect signaling channel")?;

    let mut closing = false;
    loop {
        tokio::select! {
            res = shutdown.changed(), if !closing => {
                if res.is_err() || *shutdown.borrow() {
                    info!("shutdown requested");
                    closing = true;
                    session.close().await;
                }
            }
            ev = events.recv() => {
                let Some(ev) = ev else { break };
                match ev {
                    SessionEvent::Open => info!("signaling open"),
                    SessionEvent::Close { code, reason } => {
                        info!(?code, %reason, "signaling closed");
                        break;
                    }
                    SessionEvent::Error(e) => {
                        error!("signaling error: {e}");
                        break;
                    }
                    SessionEvent::DecodeError(e) => warn!("undecodable message: {e}"),
                    SessionEvent::ProtocolError { peer, error } => warn!(?peer, "protocol error: {error}"),
                    SessionEvent::StatusResponse { correlation_id, status } => {
                        warn!(?correlation_id, ?status, "relay reported an error")
                    }
                    SessionEvent::Dropped { error } => warn!("message dropped: {error}"),
                    SessionEvent::PeerState { peer, state } => info!(%peer, ?state, "peer state"),
                    SessionEvent::RemoteTrack { peer, kind, track_id, .. } => {
                        info!(%peer, %kind, %track_id, "receiving remote track")
                    }
                }
            }
        }
    }
    Ok(())
}
