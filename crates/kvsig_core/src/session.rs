/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Session router: owns the signaling socket and the peer registry, turns
//! inbound envelopes into negotiation steps and reports everything else as
//! [`SessionEvent`]s.

use std::sync::{Arc, Mutex};

use kvsig_protocol::{decode, DecodeError, Envelope, MessageKind, Payload, StatusReport};
use tokio::sync::{mpsc, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::control_plane::EndpointResolver;
use crate::error::{SignalingError, SignalingResult};
use crate::media::{MediaTransportFactory, PeerEvents, TransportEvent};
use crate::outbound::OutboundDispatch;
use crate::peer::{NegotiationState, PeerKey, PeerNegotiation};
use crate::registry::{PeerMap, PeerRegistry};
use crate::role::RoleStrategy;
use crate::sigv4::{Credentials, SocketUrlParams, SocketUrlSigner};
use crate::socket::{SignalingSocket, SocketConnector, SocketFrame};

#[derive(Clone)]
pub struct Collaborators {
    pub resolver: Arc<dyn EndpointResolver>,
    pub signer: Arc<dyn SocketUrlSigner>,
    pub connector: Arc<dyn SocketConnector>,
    pub transports: Arc<dyn MediaTransportFactory>,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Open,
    Close { code: Option<u16>, reason: String },
    Error(String),
    /// A frame that could not be decoded. The session keeps going.
    DecodeError(DecodeError),
    /// An envelope that could not be applied. `peer` is set when one
    /// negotiation was affected.
    ProtocolError { peer: Option<PeerKey>, error: SignalingError },
    StatusResponse { correlation_id: Option<String>, status: StatusReport },
    /// A frame that arrived after the session was closed.
    Dropped { error: SignalingError },
    PeerState { peer: PeerKey, state: NegotiationState },
    RemoteTrack { peer: PeerKey, kind: String, track_id: String, stream_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    Open,
    Closed,
}

type TransportRx = mpsc::UnboundedReceiver<(PeerKey, TransportEvent)>;

struct Inner {
    region: String,
    channel_arn: String,
    credentials: Credentials,
    auto_offer: bool,
    role: RoleStrategy,
    collaborators: Collaborators,
    registry: PeerRegistry,
    outbound: OutboundDispatch,
    phase: Mutex<Phase>,
    events: mpsc::UnboundedSender<SessionEvent>,
    transport_tx: mpsc::UnboundedSender<(PeerKey, TransportEvent)>,
    transport_rx: Mutex<Option<TransportRx>>,
}

pub struct Session {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Fails with `MissingClientId` for a viewer without a client id.
    pub fn new(
        config: &SessionConfig,
        collaborators: Collaborators,
    ) -> SignalingResult<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        let role = RoleStrategy::new(config.role, config.client_id.as_deref())?;
        let (events, events_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let inner = Inner {
            region: config.region.clone(),
            channel_arn: config.channel_arn.clone(),
            credentials: config.credentials.clone(),
            auto_offer: config.auto_offer,
            role,
            collaborators,
            registry: PeerRegistry::default(),
            outbound: OutboundDispatch::new(config.payload_encoding),
            phase: Mutex::new(Phase::Idle),
            events,
            transport_tx,
            transport_rx: Mutex::new(Some(transport_rx)),
        };
        let session = Session { inner: Arc::new(inner), task: Mutex::new(None) };
        Ok((session, events_rx))
    }

    pub fn role(&self) -> &RoleStrategy {
        &self.inner.role
    }

    pub fn phase(&self) -> Phase {
        self.inner.phase()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.phase() == Phase::Open && self.inner.outbound.is_open()
    }

    /// Resolves the endpoint, signs and opens the socket, and starts the
    /// dispatch loop. A viewer with `auto_offer` sends its offer before this
    /// returns.
    pub async fn connect(&self) -> SignalingResult<()> {
        let inner = &self.inner;
        inner.begin_connect()?;
        let socket = match inner.open_socket().await {
            Ok(s) => s,
            Err(e) => {
                inner.set_phase_if(Phase::Connecting, Phase::Idle);
                warn!(error=%e, "connect failed");
                return Err(e);
            }
        };
        if !inner.set_phase_if(Phase::Connecting, Phase::Open) {
            // Closed while connecting; dropping the socket closes it.
            return Err(SignalingError::SessionClosed);
        }

        let SignalingSocket { outgoing, incoming } = socket;
        inner.outbound.attach(outgoing);
        let transport_rx = inner
            .transport_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .ok_or(SignalingError::AlreadyConnected)?;
        let task = tokio::spawn(dispatch_loop(inner.clone(), incoming, transport_rx));
        if let Ok(mut slot) = self.task.lock() {
            *slot = Some(task);
        }
        info!(role=%inner.role.role(), channel=%inner.channel_arn, "signaling session open");
        inner.emit(SessionEvent::Open);

        if inner.auto_offer && inner.role.initiates_offer() {
            if let Err(e) = self.produce_offer().await {
                warn!(error=%e, "initial offer failed");
                inner.emit(SessionEvent::ProtocolError { peer: Some(PeerKey::Implicit), error: e });
            }
        }
        Ok(())
    }

    /// Viewer only: creates the singleton negotiation if needed, produces an
    /// offer and sends it.
    pub async fn produce_offer(&self) -> SignalingResult<()> {
        let inner = &self.inner;
        if inner.phase() != Phase::Open {
            return Err(SignalingError::NotConnected);
        }
        if !inner.role.initiates_offer() {
            return Err(SignalingError::violation(&PeerKey::Implicit, "master does not initiate offers"));
        }
        let key = PeerKey::Implicit;
        let mut peers = inner.registry.lock().await;
        let peer = inner.ensure_peer(&mut peers, &key).await?;
        let offer = peer.produce_offer().await?;
        let state = peer.state();
        inner.outbound.send_offer(&offer)?;
        drop(peers);
        inner.emit_state(&key, state);
        Ok(())
    }

    /// Closes every negotiation and the socket. Idempotent; the session
    /// cannot be reconnected afterwards.
    pub async fn close(&self) {
        self.inner
            .teardown(SessionEvent::Close { code: None, reason: "closed locally".to_string() })
            .await;
    }

    pub async fn peer_state(&self, key: &PeerKey) -> Option<NegotiationState> {
        self.inner.registry.state(key).await
    }

    pub async fn peer_states(&self) -> Vec<(PeerKey, NegotiationState)> {
        self.inner.registry.states().await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

async fn dispatch_loop(inner: Arc<Inner>, mut incoming: mpsc::UnboundedReceiver<SocketFrame>, mut transport_rx: TransportRx) {
    loop {
        tokio::select! {
            frame = incoming.recv() => match frame {
                Some(SocketFrame::Text(text)) => inner.handle_text(&text).await,
                Some(SocketFrame::Closed { code, reason }) => {
                    inner.teardown(SessionEvent::Close { code, reason }).await;
                }
                Some(SocketFrame::Error(e)) => inner.teardown(SessionEvent::Error(e)).await,
                None => {
                    inner
                        .teardown(SessionEvent::Close { code: None, reason: "socket ended".to_string() })
                        .await;
                    break;
                }
            },
            Some((peer, event)) = transport_rx.recv() => inner.handle_transport_event(peer, event).await,
        }
    }
    debug!("dispatch loop finished");
}

impl Inner {
    fn phase(&self) -> Phase {
        self.phase.lock().map(|p| *p).unwrap_or(Phase::Closed)
    }

    fn begin_connect(&self) -> SignalingResult<()> {
        let mut phase = self.phase.lock().map_err(|_| SignalingError::SessionClosed)?;
        match *phase {
            Phase::Idle => {
                *phase = Phase::Connecting;
                Ok(())
            }
            Phase::Connecting | Phase::Open => Err(SignalingError::AlreadyConnected),
            Phase::Closed => Err(SignalingError::SessionClosed),
        }
    }

    fn set_phase_if(&self, from: Phase, to: Phase) -> bool {
        match self.phase.lock() {
            Ok(mut phase) if *phase == from => {
                *phase = to;
                true
            }
            _ => false,
        }
    }

    async fn open_socket(&self) -> SignalingResult<SignalingSocket> {
        let c = &self.collaborators;
        let role = self.role.role();
        let endpoints = c
            .resolver
            .resolve_endpoints(&self.region, &self.channel_arn, role)
            .await
            .map_err(|e| match e {
                SignalingError::EndpointUnavailable(_) => e,
                other => SignalingError::EndpointUnavailable(format!("{role} endpoint lookup failed: {other}")),
            })?;
        let wss = endpoints
            .wss
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| SignalingError::EndpointUnavailable(format!("no WSS endpoint for {role}")))?;
        let params = SocketUrlParams {
            channel_arn: self.channel_arn.clone(),
            client_id: self.role.client_id().map(str::to_string),
        };
        let url = c
            .signer
            .build_signed_socket_url(&self.region, &self.credentials, &wss, &params)
            .await?;
        c.connector.open(&url).await
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn emit_state(&self, peer: &PeerKey, state: NegotiationState) {
        self.emit(SessionEvent::PeerState { peer: peer.clone(), state });
    }

    fn report(&self, peer: Option<PeerKey>, error: SignalingError) {
        warn!(peer=?peer, error=%error, "inbound message rejected");
        self.emit(SessionEvent::ProtocolError { peer, error });
    }

    /// Like `report`, but a closed session turns the failure into `Dropped`.
    fn reject(&self, peer: Option<PeerKey>, error: SignalingError) {
        if matches!(error, SignalingError::NotConnected) {
            warn!(peer=?peer, "message dropped, session not connected");
            self.emit(SessionEvent::Dropped { error });
        } else {
            self.report(peer, error);
        }
    }

    async fn ensure_peer<'a>(
        &self,
        peers: &'a mut MutexGuard<'_, PeerMap>,
        key: &PeerKey,
    ) -> SignalingResult<&'a mut PeerNegotiation> {
        // Checked under the lock so nothing is admitted after teardown drained the map.
        if self.registry.is_closed() {
            return Err(SignalingError::NotConnected);
        }
        if !peers.contains_key(key) {
            if !self.role.is_multi_peer() && !peers.is_empty() {
                return Err(SignalingError::violation(key, "single-peer role already has a negotiation"));
            }
            let events = PeerEvents::new(key.clone(), self.transport_tx.clone());
            let transport = self.collaborators.transports.create(events).await?;
            debug!(peer=%key, "negotiation created");
            peers.insert(key.clone(), PeerNegotiation::new(key.clone(), transport));
        }
        peers
            .get_mut(key)
            .ok_or_else(|| SignalingError::violation(key, "peer vanished from registry"))
    }

    async fn handle_text(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        if self.phase() != Phase::Open {
            warn!("frame after close dropped");
            self.emit(SessionEvent::Dropped { error: SignalingError::NotConnected });
            return;
        }
        let env = match decode(text) {
            Ok(env) => env,
            Err(e) => {
                warn!(error=%e, "undecodable frame");
                self.emit(SessionEvent::DecodeError(e));
                return;
            }
        };
        debug!(kind=%env.kind, sender=?env.sender_client_id, "inbound envelope");
        self.route(env).await;
    }

    async fn route(&self, env: Envelope) {
        if env.kind == MessageKind::StatusResponse {
            let status = env.status.unwrap_or_default();
            warn!(correlation_id=?env.correlation_id, error_type=?status.error_type, "relay status response");
            self.emit(SessionEvent::StatusResponse { correlation_id: env.correlation_id, status });
            return;
        }
        if !self.role.accepts(env.kind) {
            let reason = format!("{} cannot receive {}", self.role.role(), env.kind);
            self.report(None, SignalingError::violation(&PeerKey::Implicit, reason));
            return;
        }
        let key = match self.role.inbound_peer(env.kind, env.sender_client_id.as_deref()) {
            Ok(k) => k,
            Err(e) => {
                self.report(None, e);
                return;
            }
        };
        match env.payload {
            Payload::Description(d) if env.kind == MessageKind::SdpOffer => self.on_offer(key, d).await,
            Payload::Description(d) => self.on_answer(key, d).await,
            Payload::Candidate(c) => self.on_candidate(key, c).await,
            Payload::Empty => {}
        }
    }

    async fn on_offer(&self, key: PeerKey, offer: kvsig_protocol::SessionDescription) {
        let mut peers = self.registry.lock().await;
        let peer = match self.ensure_peer(&mut peers, &key).await {
            Ok(p) => p,
            Err(e) => return self.reject(Some(key), e),
        };
        let result = async {
            peer.apply_remote_offer(offer).await?;
            peer.produce_answer().await
        }
        .await;
        for e in peer.take_rejected_candidates() {
            self.report(Some(key.clone()), e);
        }
        match result {
            Ok(answer) => {
                let state = peer.state();
                let sent = self.outbound.send_answer(self.role.recipient_for(&key), &answer);
                drop(peers);
                self.emit_state(&key, state);
                if let Err(e) = sent {
                    warn!(peer=%key, error=%e, "answer not sent");
                    self.reject(Some(key), e);
                }
            }
            Err(e) => self.fail_peer(&mut peers, key, e).await,
        }
    }

    async fn on_answer(&self, key: PeerKey, answer: kvsig_protocol::SessionDescription) {
        let mut peers = self.registry.lock().await;
        let result = match peers.get_mut(&key) {
            Some(peer) => match peer.apply_remote_answer(answer).await {
                Ok(()) => Ok((peer.state(), peer.take_rejected_candidates())),
                Err(e) => Err(e),
            },
            None if self.registry.is_closed() => Err(SignalingError::NotConnected),
            None => Err(SignalingError::violation(&key, "answer without a pending offer")),
        };
        match result {
            Ok((state, rejected)) => {
                drop(peers);
                self.emit_state(&key, state);
                for e in rejected {
                    self.report(Some(key.clone()), e);
                }
            }
            Err(e) => self.fail_peer(&mut peers, key, e).await,
        }
    }

    async fn on_candidate(&self, key: PeerKey, candidate: kvsig_protocol::IceCandidate) {
        let mut peers = self.registry.lock().await;
        let peer = match self.ensure_peer(&mut peers, &key).await {
            Ok(p) => p,
            Err(e) => return self.reject(Some(key), e),
        };
        if let Err(e) = peer.add_remote_candidate(candidate).await {
            self.fail_peer(&mut peers, key, e).await;
        }
    }

    /// Violations close and forget only the offending peer; other failures
    /// are reported and the peer is kept.
    async fn fail_peer(&self, peers: &mut MutexGuard<'_, PeerMap>, key: PeerKey, error: SignalingError) {
        if error.is_protocol_violation() {
            if let Some(mut peer) = peers.remove(&key) {
                peer.close().await;
                self.emit_state(&key, NegotiationState::Closed);
            }
        }
        self.reject(Some(key), error);
    }

    async fn handle_transport_event(&self, key: PeerKey, event: TransportEvent) {
        if self.phase() != Phase::Open {
            return;
        }
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let peers = self.registry.lock().await;
                if !peers.contains_key(&key) {
                    debug!(peer=%key, "local candidate for a closed peer");
                    return;
                }
                if let Err(e) = self.outbound.send_candidate(self.role.recipient_for(&key), &candidate) {
                    warn!(peer=%key, error=%e, "local candidate not sent");
                }
            }
            TransportEvent::RemoteTrack { kind, track_id, stream_id } => {
                self.emit(SessionEvent::RemoteTrack { peer: key, kind, track_id, stream_id });
            }
            TransportEvent::Connected => {
                let mut peers = self.registry.lock().await;
                let Some(peer) = peers.get_mut(&key) else { return };
                match peer.mark_established() {
                    Ok(()) => {
                        drop(peers);
                        info!(peer=%key, "peer established");
                        self.emit_state(&key, NegotiationState::Established);
                    }
                    Err(e) => warn!(peer=%key, error=%e, "unexpected connection-up"),
                }
            }
            TransportEvent::Failed(reason) => {
                let removed = self.registry.remove(&key).await;
                if let Some(mut peer) = removed {
                    warn!(peer=%key, reason=%reason, "media connection failed; closing peer");
                    peer.close().await;
                    self.emit_state(&key, NegotiationState::Closed);
                }
            }
        }
    }

    async fn teardown(&self, event: SessionEvent) {
        {
            let Ok(mut phase) = self.phase.lock() else { return };
            if *phase == Phase::Closed {
                return;
            }
            *phase = Phase::Closed;
        }
        self.outbound.detach();
        for key in self.registry.close_all().await {
            self.emit_state(&key, NegotiationState::Closed);
        }
        match &event {
            SessionEvent::Error(e) => warn!(error=%e, "signaling session failed"),
            _ => info!("signaling session closed"),
        }
        self.emit(event);
    }
}
