/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Master/viewer routing policy, chosen once when a session is built.

use std::fmt;

use kvsig_protocol::MessageKind;
use serde::{Deserialize, Serialize};

use crate::error::{SignalingError, SignalingResult};
use crate::peer::PeerKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    #[default]
    Master,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Master => "MASTER",
            Role::Viewer => "VIEWER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MASTER" => Some(Role::Master),
            "VIEWER" => Some(Role::Viewer),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleStrategy {
    Master,
    Viewer { client_id: String },
}

impl RoleStrategy {
    /// A master never announces a client id, so one given for it is ignored.
    pub fn new(role: Role, client_id: Option<&str>) -> SignalingResult<Self> {
        match role {
            Role::Master => Ok(RoleStrategy::Master),
            Role::Viewer => {
                let id = client_id
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or(SignalingError::MissingClientId)?;
                Ok(RoleStrategy::Viewer { client_id: id.to_string() })
            }
        }
    }

    pub fn role(&self) -> Role {
        match self {
            RoleStrategy::Master => Role::Master,
            RoleStrategy::Viewer { .. } => Role::Viewer,
        }
    }

    pub fn client_id(&self) -> Option<&str> {
        match self {
            RoleStrategy::Master => None,
            RoleStrategy::Viewer { client_id } => Some(client_id),
        }
    }

    pub fn is_multi_peer(&self) -> bool {
        matches!(self, RoleStrategy::Master)
    }

    pub fn requires_sender_id(&self) -> bool {
        matches!(self, RoleStrategy::Master)
    }

    pub fn initiates_offer(&self) -> bool {
        matches!(self, RoleStrategy::Viewer { .. })
    }

    /// Whether this role may receive `kind` at all.
    pub fn accepts(&self, kind: MessageKind) -> bool {
        match (self, kind) {
            (RoleStrategy::Master, MessageKind::SdpAnswer) => false,
            (RoleStrategy::Viewer { .. }, MessageKind::SdpOffer) => false,
            _ => true,
        }
    }

    /// Which negotiation an inbound envelope belongs to.
    pub fn inbound_peer(&self, kind: MessageKind, sender: Option<&str>) -> SignalingResult<PeerKey> {
        if !self.requires_sender_id() {
            return Ok(PeerKey::Implicit);
        }
        sender
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PeerKey::identified)
            .ok_or_else(|| SignalingError::violation(&PeerKey::Implicit, format!("{kind} without senderClientId")))
    }

    pub fn recipient_for<'a>(&self, peer: &'a PeerKey) -> Option<&'a str> {
        match self {
            RoleStrategy::Master => peer.client_id(),
            RoleStrategy::Viewer { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewer_requires_client_id() {
        assert!(matches!(
            RoleStrategy::new(Role::Viewer, None),
            Err(SignalingError::MissingClientId)
        ));
        assert!(matches!(
            RoleStrategy::new(Role::Viewer, Some("  ")),
            Err(SignalingError::MissingClientId)
        ));
        let v = RoleStrategy::new(Role::Viewer, Some("v1")).unwrap();
        assert_eq!(v.client_id(), Some("v1"));
        assert!(v.initiates_offer());
        assert!(!v.is_multi_peer());
    }

    #[test]
    fn master_ignores_client_id() {
        let m = RoleStrategy::new(Role::Master, Some("ignored")).unwrap();
        assert_eq!(m, RoleStrategy::Master);
        assert_eq!(m.client_id(), None);
        assert!(m.requires_sender_id());
    }

    #[test]
    fn inbound_routing() {
        let m = RoleStrategy::Master;
        assert_eq!(
            m.inbound_peer(MessageKind::SdpOffer, Some("v1")).unwrap(),
            PeerKey::identified("v1")
        );
        assert!(m.inbound_peer(MessageKind::IceCandidate, None).unwrap_err().is_protocol_violation());
        assert!(!m.accepts(MessageKind::SdpAnswer));

        let v = RoleStrategy::new(Role::Viewer, Some("v1")).unwrap();
        assert_eq!(v.inbound_peer(MessageKind::SdpAnswer, None).unwrap(), PeerKey::Implicit);
        assert!(!v.accepts(MessageKind::SdpOffer));
    }

    #[test]
    fn recipients() {
        let key = PeerKey::identified("v9");
        assert_eq!(RoleStrategy::Master.recipient_for(&key), Some("v9"));
        let v = RoleStrategy::new(Role::Viewer, Some("v1")).unwrap();
        assert_eq!(v.recipient_for(&PeerKey::Implicit), None);
    }

    #[test]
    fn role_parses_case_insensitively() {
        assert_eq!(Role::parse("viewer"), Some(Role::Viewer));
        assert_eq!(Role::parse("MASTER"), Some(Role::Master));
        assert_eq!(Role::parse("admin"), None);
        assert_eq!(serde_json::to_string(&Role::Viewer).unwrap(), "\"VIEWER\"");
    }
}
