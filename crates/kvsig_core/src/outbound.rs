/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Mutex;

use kvsig_protocol::{encode, encode_payload, IceCandidate, MessageKind, PayloadEncoding, SessionDescription};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{SignalingError, SignalingResult};

/// Writes offers, answers and candidates to the live socket. Nothing is
/// queued while detached.
pub struct OutboundDispatch {
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    encoding: PayloadEncoding,
}

impl OutboundDispatch {
    pub fn new(encoding: PayloadEncoding) -> Self {
        Self { tx: Mutex::new(None), encoding }
    }

    pub fn attach(&self, tx: mpsc::UnboundedSender<String>) {
        if let Ok(mut slot) = self.tx.lock() {
            *slot = Some(tx);
        }
    }

    pub fn detach(&self) {
        if let Ok(mut slot) = self.tx.lock() {
            slot.take();
        }
    }

    pub fn is_open(&self) -> bool {
        self.tx
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }

    pub fn send_offer(&self, description: &SessionDescription) -> SignalingResult<()> {
        let payload = encode_payload(description, self.encoding);
        self.write(MessageKind::SdpOffer, None, &payload)
    }

    pub fn send_answer(&self, recipient: Option<&str>, description: &SessionDescription) -> SignalingResult<()> {
        let payload = encode_payload(description, self.encoding);
        self.write(MessageKind::SdpAnswer, recipient, &payload)
    }

    pub fn send_candidate(&self, recipient: Option<&str>, candidate: &IceCandidate) -> SignalingResult<()> {
        let payload = encode_payload(candidate, self.encoding);
        self.write(MessageKind::IceCandidate, recipient, &payload)
    }

    fn write(&self, kind: MessageKind, recipient: Option<&str>, payload: &str) -> SignalingResult<()> {
        let slot = self.tx.lock().map_err(|_| SignalingError::NotConnected)?;
        let tx = slot.as_ref().ok_or(SignalingError::NotConnected)?;
        tx.send(encode(kind, recipient, payload))
            .map_err(|_| SignalingError::NotConnected)?;
        debug!(kind=%kind, recipient=?recipient, "signaling message sent");
        Ok(())
    }
}
