/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Wire envelopes exchanged with the signaling channel relay.
//!
//! Outbound envelopes carry `action`, inbound ones carry `messageType`; both
//! carry the kind-specific JSON (a session description or an ICE candidate)
//! as a string in `messagePayload`.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "SDP_OFFER")]
    SdpOffer,
    #[serde(rename = "SDP_ANSWER")]
    SdpAnswer,
    #[serde(rename = "ICE_CANDIDATE")]
    IceCandidate,
    #[serde(rename = "STATUS_RESPONSE")]
    StatusResponse,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::SdpOffer => "SDP_OFFER",
            MessageKind::SdpAnswer => "SDP_ANSWER",
            MessageKind::IceCandidate => "ICE_CANDIDATE",
            MessageKind::StatusResponse => "STATUS_RESPONSE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "SDP_OFFER" => Some(MessageKind::SdpOffer),
            "SDP_ANSWER" => Some(MessageKind::SdpAnswer),
            "ICE_CANDIDATE" => Some(MessageKind::IceCandidate),
            "STATUS_RESPONSE" => Some(MessageKind::StatusResponse),
            _ => None,
        }
    }

    fn carries_description(&self) -> bool {
        matches!(self, MessageKind::SdpOffer | MessageKind::SdpAnswer)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Browser-shaped `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Answer, sdp: sdp.into() }
    }
}

/// Browser-shaped `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Relay-level error report attached to `STATUS_RESPONSE` messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl StatusReport {
    fn is_empty(&self) -> bool {
        self.correlation_id.is_none()
            && self.error_type.is_none()
            && self.status_code.is_none()
            && self.description.is_none()
    }
}

/// Typed view of `messagePayload`, validated at decode time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Description(SessionDescription),
    Candidate(IceCandidate),
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    /// `messagePayload` is the JSON text itself.
    #[default]
    Plain,
    /// `messagePayload` is base64 of the JSON text (hosted relay format).
    Base64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("envelope is not a JSON object")]
    NotAnObject,
    #[error("envelope has neither action nor messageType")]
    MissingKind,
    #[error("unknown message kind: {0}")]
    UnknownKind(String),
    #[error("{0} requires messagePayload")]
    MissingPayload(MessageKind),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: MessageKind, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireShape {
    Action,
    MessageType,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    recipient_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sender_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message_payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status_response: Option<StatusReport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: MessageKind,
    pub sender_client_id: Option<String>,
    pub recipient_client_id: Option<String>,
    /// Raw `messagePayload`, kept verbatim so re-encoding is lossless.
    pub message_payload: Option<String>,
    pub payload: Payload,
    pub correlation_id: Option<String>,
    pub status: Option<StatusReport>,
    shape: WireShape,
    nested_status: bool,
}

impl Envelope {
    /// Envelope as this side would send it (`action` shape).
    pub fn outbound(kind: MessageKind, recipient: Option<&str>, message_payload: &str) -> Result<Self, DecodeError> {
        let payload = validate_payload(kind, Some(message_payload))?;
        Ok(Self {
            kind,
            sender_client_id: None,
            recipient_client_id: recipient.map(str::to_string),
            message_payload: Some(message_payload.to_string()),
            payload,
            correlation_id: None,
            status: None,
            shape: WireShape::Action,
            nested_status: false,
        })
    }

    /// Relay-generated error report for a sender whose message could not be delivered.
    pub fn status_response(correlation_id: Option<String>, error_type: &str, description: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::StatusResponse,
            sender_client_id: None,
            recipient_client_id: None,
            message_payload: None,
            payload: Payload::Empty,
            correlation_id,
            status: Some(StatusReport {
                correlation_id: None,
                error_type: Some(error_type.to_string()),
                status_code: Some("400".to_string()),
                description: Some(description.into()),
            }),
            shape: WireShape::MessageType,
            nested_status: false,
        }
    }

    /// Rewrites an outbound envelope the way the relay delivers it: `messageType`
    /// instead of `action`, the sender stamped, the recipient stripped.
    pub fn into_inbound(mut self, sender: Option<String>) -> Self {
        self.shape = WireShape::MessageType;
        self.sender_client_id = sender;
        self.recipient_client_id = None;
        self
    }

    pub fn description(&self) -> Option<&SessionDescription> {
        match &self.payload {
            Payload::Description(d) => Some(d),
            _ => None,
        }
    }

    pub fn candidate(&self) -> Option<&IceCandidate> {
        match &self.payload {
            Payload::Candidate(c) => Some(c),
            _ => None,
        }
    }

    pub fn encode(&self) -> String {
        let kind = Some(self.kind.as_str().to_string());
        let (action, message_type) = match self.shape {
            WireShape::Action => (kind, None),
            WireShape::MessageType => (None, kind),
        };
        let status = self.status.clone().unwrap_or_default();
        let mut wire = WireEnvelope {
            action,
            message_type,
            recipient_client_id: self.recipient_client_id.clone(),
            sender_client_id: self.sender_client_id.clone(),
            message_payload: self.message_payload.clone(),
            correlation_id: self.correlation_id.clone(),
            ..Default::default()
        };
        if self.nested_status {
            wire.status_response = self.status.clone();
        } else {
            wire.error_type = status.error_type;
            wire.status_code = status.status_code;
            wire.description = status.description;
        }
        serde_json::to_string(&wire).unwrap_or_default()
    }
}

/// Serializes an outbound envelope. Never fails for typed input.
pub fn encode(kind: MessageKind, recipient: Option<&str>, message_payload: &str) -> String {
    let wire = WireEnvelope {
        action: Some(kind.as_str().to_string()),
        recipient_client_id: recipient.map(str::to_string),
        message_payload: Some(message_payload.to_string()),
        ..Default::default()
    };
    serde_json::to_string(&wire).unwrap_or_default()
}

/// Renders a description or candidate as a `messagePayload` string.
pub fn encode_payload<T: Serialize>(value: &T, encoding: PayloadEncoding) -> String {
    let json = serde_json::to_string(value).unwrap_or_default();
    match encoding {
        PayloadEncoding::Plain => json,
        PayloadEncoding::Base64 => B64.encode(json.as_bytes()),
    }
}

pub fn decode(raw: &str) -> Result<Envelope, DecodeError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(DecodeError::NotAnObject);
    }
    let wire: WireEnvelope =
        serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let (kind_str, shape) = match (&wire.action, &wire.message_type) {
        (Some(a), _) => (a.as_str(), WireShape::Action),
        (None, Some(t)) => (t.as_str(), WireShape::MessageType),
        (None, None) => return Err(DecodeError::MissingKind),
    };
    let kind = MessageKind::parse(kind_str).ok_or_else(|| DecodeError::UnknownKind(kind_str.to_string()))?;

    let payload = match kind {
        MessageKind::StatusResponse => Payload::Empty,
        _ => validate_payload(kind, wire.message_payload.as_deref())?,
    };

    let nested_status = wire.status_response.is_some();
    let status = match wire.status_response {
        Some(nested) => Some(nested),
        None => {
            let flat = StatusReport {
                correlation_id: None,
                error_type: wire.error_type,
                status_code: wire.status_code,
                description: wire.description,
            };
            (!flat.is_empty()).then_some(flat)
        }
    };

    Ok(Envelope {
        kind,
        sender_client_id: wire.sender_client_id,
        recipient_client_id: wire.recipient_client_id,
        message_payload: wire.message_payload,
        payload,
        correlation_id: wire.correlation_id,
        status,
        shape,
        nested_status,
    })
}

fn validate_payload(kind: MessageKind, raw: Option<&str>) -> Result<Payload, DecodeError> {
    if kind == MessageKind::StatusResponse {
        return Ok(Payload::Empty);
    }
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(DecodeError::MissingPayload(kind))?;
    let json = payload_json(raw).map_err(|reason| DecodeError::InvalidPayload { kind, reason })?;
    if kind.carries_description() {
        let d: SessionDescription = serde_json::from_value(json)
            .map_err(|e| DecodeError::InvalidPayload { kind, reason: e.to_string() })?;
        Ok(Payload::Description(d))
    } else {
        let c: IceCandidate = serde_json::from_value(json)
            .map_err(|e| DecodeError::InvalidPayload { kind, reason: e.to_string() })?;
        Ok(Payload::Candidate(c))
    }
}

// Plain JSON first, then base64-wrapped JSON.
fn payload_json(raw: &str) -> Result<serde_json::Value, String> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(v) => Ok(v),
        Err(plain_err) => {
            let bytes = B64.decode(raw.as_bytes()).map_err(|_| format!("not JSON: {plain_err}"))?;
            serde_json::from_slice(&bytes).map_err(|e| format!("base64 payload is not JSON: {e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer_payload() -> String {
        encode_payload(&SessionDescription::offer("v=0\r\n"), PayloadEncoding::Plain)
    }

    #[test]
    fn decode_inbound_offer() {
        let raw = serde_json::json!({
            "messageType": "SDP_OFFER",
            "senderClientId": "v1",
            "messagePayload": offer_payload(),
        })
        .to_string();
        let env = decode(&raw).unwrap();
        assert_eq!(env.kind, MessageKind::SdpOffer);
        assert_eq!(env.sender_client_id.as_deref(), Some("v1"));
        assert_eq!(env.description().unwrap().sdp, "v=0\r\n");
        assert_eq!(env.description().unwrap().sdp_type, SdpType::Offer);
    }

    #[test]
    fn decode_encode_reproduces_fields() {
        let payload = encode_payload(&IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 9 typ host"), PayloadEncoding::Plain);
        let raw = encode(MessageKind::IceCandidate, Some("v7"), &payload);
        let env = decode(&raw).unwrap();
        assert_eq!(env.kind, MessageKind::IceCandidate);
        assert_eq!(env.recipient_client_id.as_deref(), Some("v7"));
        assert_eq!(env.message_payload.as_deref(), Some(payload.as_str()));
        assert_eq!(env.encode(), raw);
    }

    #[test]
    fn inbound_shape_survives_reencoding() {
        let raw = serde_json::json!({
            "messageType": "SDP_ANSWER",
            "senderClientId": "master",
            "messagePayload": encode_payload(&SessionDescription::answer("v=0"), PayloadEncoding::Plain),
        });
        let env = decode(&raw.to_string()).unwrap();
        let back: serde_json::Value = serde_json::from_str(&env.encode()).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn base64_payload_is_accepted() {
        let payload = encode_payload(&SessionDescription::offer("v=0"), PayloadEncoding::Base64);
        assert!(serde_json::from_str::<serde_json::Value>(&payload).is_err());
        let raw = encode(MessageKind::SdpOffer, None, &payload);
        let env = decode(&raw).unwrap();
        assert_eq!(env.description().unwrap().sdp, "v=0");
        assert_eq!(env.encode(), raw);
    }

    #[test]
    fn malformed_and_unknown_inputs_are_typed() {
        assert!(matches!(decode("{not json"), Err(DecodeError::Malformed(_))));
        assert_eq!(decode("[1,2]"), Err(DecodeError::NotAnObject));
        assert_eq!(decode(r#"{"messagePayload":"{}"}"#), Err(DecodeError::MissingKind));
        assert_eq!(
            decode(r#"{"action":"GO_AWAY"}"#),
            Err(DecodeError::UnknownKind("GO_AWAY".to_string()))
        );
        assert_eq!(
            decode(r#"{"action":"SDP_OFFER"}"#),
            Err(DecodeError::MissingPayload(MessageKind::SdpOffer))
        );
        assert!(matches!(
            decode(r#"{"action":"ICE_CANDIDATE","messagePayload":"%%%"}"#),
            Err(DecodeError::InvalidPayload { kind: MessageKind::IceCandidate, .. })
        ));
        // Valid JSON but not a description.
        assert!(matches!(
            decode(r#"{"action":"SDP_ANSWER","messagePayload":"{\"foo\":1}"}"#),
            Err(DecodeError::InvalidPayload { kind: MessageKind::SdpAnswer, .. })
        ));
    }

    #[test]
    fn status_response_flat_and_nested() {
        let flat = r#"{"messageType":"STATUS_RESPONSE","correlationId":"c1","errorType":"InvalidArgumentException","description":"bad"}"#;
        let env = decode(flat).unwrap();
        assert_eq!(env.kind, MessageKind::StatusResponse);
        assert_eq!(env.correlation_id.as_deref(), Some("c1"));
        let status = env.status.as_ref().unwrap();
        assert_eq!(status.error_type.as_deref(), Some("InvalidArgumentException"));
        assert_eq!(status.description.as_deref(), Some("bad"));
        assert_eq!(env.payload, Payload::Empty);

        let nested = r#"{"messageType":"STATUS_RESPONSE","statusResponse":{"correlationId":"c2","statusCode":"400","errorType":"X"}}"#;
        let env = decode(nested).unwrap();
        assert_eq!(env.status.as_ref().unwrap().status_code.as_deref(), Some("400"));
        assert_eq!(env.status.as_ref().unwrap().correlation_id.as_deref(), Some("c2"));
        let back: serde_json::Value = serde_json::from_str(&env.encode()).unwrap();
        assert_eq!(back, serde_json::from_str::<serde_json::Value>(nested).unwrap());
    }

    #[test]
    fn relay_rewrites_to_inbound_shape() {
        let payload = encode_payload(&SessionDescription::offer("v=0"), PayloadEncoding::Plain);
        let raw = encode(MessageKind::SdpOffer, Some("master"), &payload);
        let inbound = decode(&raw).unwrap().into_inbound(Some("v1".to_string()));
        let v: serde_json::Value = serde_json::from_str(&inbound.encode()).unwrap();
        assert_eq!(
            v,
            serde_json::json!({"messageType": "SDP_OFFER", "senderClientId": "v1", "messagePayload": payload})
        );

        let status = Envelope::status_response(Some("c9".to_string()), "InvalidArgumentException", "no viewer");
        let back = decode(&status.encode()).unwrap();
        assert_eq!(back.kind, MessageKind::StatusResponse);
        assert_eq!(back.correlation_id.as_deref(), Some("c9"));
        assert_eq!(back.status.unwrap().description.as_deref(), Some("no viewer"));
    }

    #[test]
    fn candidate_json_matches_browser_shape() {
        let c = IceCandidate {
            candidate: "candidate:0".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let v: serde_json::Value = serde_json::from_str(&encode_payload(&c, PayloadEncoding::Plain)).unwrap();
        assert_eq!(v, serde_json::json!({"candidate": "candidate:0", "sdpMid": "0", "sdpMLineIndex": 0}));
    }
}
