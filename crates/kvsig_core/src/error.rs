/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use kvsig_protocol::DecodeError;

use crate::peer::PeerKey;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SignalingError {
    #[error("endpoint unavailable: {0}")]
    EndpointUnavailable(String),
    #[error("session already connected")]
    AlreadyConnected,
    #[error("session was torn down; construct a new one to reconnect")]
    SessionClosed,
    #[error("signaling socket not connected")]
    NotConnected,
    #[error("viewer role requires a client id")]
    MissingClientId,
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("protocol violation for peer {peer}: {reason}")]
    ProtocolViolation { peer: PeerKey, reason: String },
    #[error("media transport: {0}")]
    Transport(String),
    #[error("request signing: {0}")]
    Signing(String),
    #[error("control plane: {0}")]
    ControlPlane(String),
    #[error("socket: {0}")]
    Socket(String),
}

impl SignalingError {
    pub fn violation(peer: &PeerKey, reason: impl Into<String>) -> Self {
        SignalingError::ProtocolViolation {
            peer: peer.clone(),
            reason: reason.into(),
        }
    }

    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, SignalingError::ProtocolViolation { .. })
    }
}

pub type SignalingResult<T> = std::result::Result<T, SignalingError>;
