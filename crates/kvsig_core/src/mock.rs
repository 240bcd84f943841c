/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! In-memory collaborators for tests and local simulation.
//!
//! `MockTransportFactory` records every media-transport call per peer;
//! `MockConnector` hands out a socket whose far end is driven by the test.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kvsig_protocol::{IceCandidate, SdpType, SessionDescription};
use tokio::sync::mpsc;
use url::Url;

use crate::error::{SignalingError, SignalingResult};
use crate::media::{MediaTransport, MediaTransportFactory, PeerEvents, TransportEvent};
use crate::peer::PeerKey;
use crate::socket::{SignalingSocket, SocketConnector, SocketFrame};

// ============================================================================
// Mock media transport
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CreateLocal(SdpType),
    ApplyLocal(SessionDescription),
    ApplyRemote(SessionDescription),
    AddCandidate(IceCandidate),
    Close,
}

/// Shared view of one mock transport.
#[derive(Clone)]
pub struct MockTransportHandle {
    calls: Arc<Mutex<Vec<MockCall>>>,
    events: PeerEvents,
}

impl MockTransportHandle {
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn close_count(&self) -> usize {
        self.calls().iter().filter(|c| **c == MockCall::Close).count()
    }

    /// Injects a transport event as if the media stack raised it.
    pub fn emit(&self, event: TransportEvent) {
        self.events.emit(event);
    }
}

struct MockTransport {
    handle: MockTransportHandle,
    seq: Arc<AtomicU32>,
    local_candidates: Vec<IceCandidate>,
    rejected: Vec<IceCandidate>,
}

impl MockTransport {
    fn record(&self, call: MockCall) {
        if let Ok(mut calls) = self.handle.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl MediaTransport for MockTransport {
    async fn create_local_description(&self, kind: SdpType) -> SignalingResult<SessionDescription> {
        self.record(MockCall::CreateLocal(kind));
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        let peer = self.handle.events.peer();
        let sdp = format!("v=0\r\ns=mock-{kind:?}-{peer}-{n}\r\n").to_ascii_lowercase();
        Ok(SessionDescription { sdp_type: kind, sdp })
    }

    async fn apply_local_description(&self, description: &SessionDescription) -> SignalingResult<()> {
        self.record(MockCall::ApplyLocal(description.clone()));
        for c in &self.local_candidates {
            self.handle.emit(TransportEvent::LocalCandidate(c.clone()));
        }
        Ok(())
    }

    async fn apply_remote_description(&self, description: &SessionDescription) -> SignalingResult<()> {
        self.record(MockCall::ApplyRemote(description.clone()));
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> SignalingResult<()> {
        if self.rejected.contains(candidate) {
            return Err(SignalingError::Transport(format!("unparseable candidate {}", candidate.candidate)));
        }
        self.record(MockCall::AddCandidate(candidate.clone()));
        Ok(())
    }

    async fn close(&self) {
        self.record(MockCall::Close);
    }
}

#[derive(Default)]
pub struct MockTransportFactory {
    transports: Mutex<HashMap<PeerKey, MockTransportHandle>>,
    created: Mutex<Vec<PeerKey>>,
    local_candidates: Vec<IceCandidate>,
    rejected: Vec<IceCandidate>,
    seq: Arc<AtomicU32>,
}

impl MockTransportFactory {
    /// Every transport emits these as local candidates once its local
    /// description is applied.
    pub fn with_local_candidates(candidates: Vec<IceCandidate>) -> Self {
        Self { local_candidates: candidates, ..Default::default() }
    }

    /// Every transport refuses these remote candidates; they are not recorded.
    pub fn rejecting_candidates(mut self, candidates: Vec<IceCandidate>) -> Self {
        self.rejected = candidates;
        self
    }

    /// Most recent transport created for `key`.
    pub fn transport(&self, key: &PeerKey) -> Option<MockTransportHandle> {
        self.transports.lock().ok()?.get(key).cloned()
    }

    /// Peers a transport was created for, in creation order.
    pub fn created(&self) -> Vec<PeerKey> {
        self.created.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl MediaTransportFactory for MockTransportFactory {
    async fn create(&self, events: PeerEvents) -> SignalingResult<Box<dyn MediaTransport>> {
        let key = events.peer().clone();
        let handle = MockTransportHandle { calls: Arc::new(Mutex::new(Vec::new())), events };
        if let Ok(mut t) = self.transports.lock() {
            t.insert(key.clone(), handle.clone());
        }
        if let Ok(mut c) = self.created.lock() {
            c.push(key);
        }
        Ok(Box::new(MockTransport {
            handle,
            seq: self.seq.clone(),
            local_candidates: self.local_candidates.clone(),
            rejected: self.rejected.clone(),
        }))
    }
}

// ============================================================================
// Mock signaling socket
// ============================================================================

/// The relay side of a mock socket.
pub struct MockSocketHandle {
    sent: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<SocketFrame>,
}

impl MockSocketHandle {
    pub fn push_text(&self, text: impl Into<String>) {
        let _ = self.inbound.send(SocketFrame::Text(text.into()));
    }

    pub fn push_close(&self, code: Option<u16>, reason: &str) {
        let _ = self.inbound.send(SocketFrame::Closed { code, reason: reason.to_string() });
    }

    pub fn push_error(&self, error: &str) {
        let _ = self.inbound.send(SocketFrame::Error(error.to_string()));
    }

    /// Next frame written by the session; `None` once the session dropped its end.
    pub async fn next_sent(&mut self) -> Option<String> {
        self.sent.recv().await
    }

    /// Everything written so far without waiting.
    pub fn drain_sent(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(s) = self.sent.try_recv() {
            out.push(s);
        }
        out
    }
}

#[derive(Default)]
pub struct MockConnector {
    handle: Mutex<Option<MockSocketHandle>>,
    opened: Mutex<Vec<Url>>,
    fail: Mutex<Option<String>>,
}

impl MockConnector {
    /// Makes the next `open` fail with a socket error.
    pub fn fail_next(&self, reason: &str) {
        if let Ok(mut f) = self.fail.lock() {
            *f = Some(reason.to_string());
        }
    }

    pub fn take_handle(&self) -> Option<MockSocketHandle> {
        self.handle.lock().ok()?.take()
    }

    pub fn opened_urls(&self) -> Vec<Url> {
        self.opened.lock().map(|o| o.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SocketConnector for MockConnector {
    async fn open(&self, url: &Url) -> SignalingResult<SignalingSocket> {
        if let Some(reason) = self.fail.lock().ok().and_then(|mut f| f.take()) {
            return Err(SignalingError::Socket(reason));
        }
        if let Ok(mut o) = self.opened.lock() {
            o.push(url.clone());
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        if let Ok(mut h) = self.handle.lock() {
            *h = Some(MockSocketHandle { sent: out_rx, inbound: in_tx });
        }
        Ok(SignalingSocket { outgoing: out_tx, incoming: in_rx })
    }
}
