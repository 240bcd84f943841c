/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Media transport seam. Negotiation drives one transport per peer; the
//! transport reports local candidates, remote tracks and connection state
//! back through [`PeerEvents`].

use async_trait::async_trait;
use kvsig_protocol::{IceCandidate, SdpType, SessionDescription};
use tokio::sync::mpsc;

use crate::error::SignalingResult;
use crate::peer::PeerKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack {
        kind: String,
        track_id: String,
        stream_id: String,
    },
    Connected,
    Failed(String),
}

/// Tags every event with the peer it belongs to.
#[derive(Clone)]
pub struct PeerEvents {
    peer: PeerKey,
    tx: mpsc::UnboundedSender<(PeerKey, TransportEvent)>,
}

impl PeerEvents {
    pub fn new(peer: PeerKey, tx: mpsc::UnboundedSender<(PeerKey, TransportEvent)>) -> Self {
        Self { peer, tx }
    }

    pub fn peer(&self) -> &PeerKey {
        &self.peer
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send((self.peer.clone(), event));
    }
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn create_local_description(&self, kind: SdpType) -> SignalingResult<SessionDescription>;

    async fn apply_local_description(&self, description: &SessionDescription) -> SignalingResult<()>;

    async fn apply_remote_description(&self, description: &SessionDescription) -> SignalingResult<()>;

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> SignalingResult<()>;

    async fn close(&self);
}

#[async_trait]
pub trait MediaTransportFactory: Send + Sync {
    async fn create(&self, events: PeerEvents) -> SignalingResult<Box<dyn MediaTransport>>;
}
