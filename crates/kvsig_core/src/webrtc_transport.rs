/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use kvsig_protocol::{IceCandidate, SdpType, SessionDescription};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

use crate::control_plane::IceServer;
use crate::error::{SignalingError, SignalingResult};
use crate::media::{MediaTransport, MediaTransportFactory, PeerEvents, TransportEvent};

fn transport_err(e: impl std::fmt::Display) -> SignalingError {
    SignalingError::Transport(e.to_string())
}

pub struct WebrtcTransportFactory {
    ice_servers: Vec<IceServer>,
}

impl WebrtcTransportFactory {
    pub fn new(ice_servers: Vec<IceServer>) -> Self {
        Self { ice_servers }
    }

    fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect()
    }

    async fn new_peer_connection(&self) -> SignalingResult<Arc<RTCPeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(transport_err)?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(transport_err)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let pc = api
            .new_peer_connection(RTCConfiguration {
                ice_servers: self.rtc_ice_servers(),
                ..Default::default()
            })
            .await
            .map_err(transport_err)?;
        Ok(Arc::new(pc))
    }
}

#[async_trait]
impl MediaTransportFactory for WebrtcTransportFactory {
    async fn create(&self, events: PeerEvents) -> SignalingResult<Box<dyn MediaTransport>> {
        let pc = self.new_peer_connection().await?;

        {
            let events = events.clone();
            pc.on_ice_candidate(Box::new(move |cand| {
                let events = events.clone();
                Box::pin(async move {
                    let Some(cand) = cand else { return };
                    match cand.to_json() {
                        Ok(init) => events.emit(TransportEvent::LocalCandidate(from_rtc_candidate(init))),
                        Err(e) => warn!(peer=%events.peer(), "local candidate not serializable: {e}"),
                    }
                })
            }));
        }

        {
            let events = events.clone();
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let events = events.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => "audio",
                        RTPCodecType::Video => "video",
                        _ => "unknown",
                    };
                    info!(peer=%events.peer(), kind, "remote track");
                    events.emit(TransportEvent::RemoteTrack {
                        kind: kind.to_string(),
                        track_id: track.id(),
                        stream_id: track.stream_id(),
                    });
                })
            }));
        }

        {
            let events = events.clone();
            pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
                let events = events.clone();
                Box::pin(async move {
                    debug!(peer=%events.peer(), state=%st, "peer connection state");
                    match st {
                        RTCPeerConnectionState::Connected => events.emit(TransportEvent::Connected),
                        RTCPeerConnectionState::Failed => events.emit(TransportEvent::Failed(st.to_string())),
                        _ => {}
                    }
                })
            }));
        }

        Ok(Box::new(WebrtcTransport { pc, transceivers_added: AtomicBool::new(false) }))
    }
}

pub struct WebrtcTransport {
    pc: Arc<RTCPeerConnection>,
    transceivers_added: AtomicBool,
}

impl WebrtcTransport {
    // Offering side receives audio and video.
    async fn ensure_receive_transceivers(&self) -> SignalingResult<()> {
        if self.transceivers_added.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            self.pc
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(transport_err)?;
        }
        Ok(())
    }
}

#[async_trait]
impl MediaTransport for WebrtcTransport {
    async fn create_local_description(&self, kind: SdpType) -> SignalingResult<SessionDescription> {
        let desc = match kind {
            SdpType::Offer => {
                self.ensure_receive_transceivers().await?;
                self.pc.create_offer(None).await.map_err(transport_err)?
            }
            SdpType::Answer => self.pc.create_answer(None).await.map_err(transport_err)?,
            other => return Err(SignalingError::Transport(format!("cannot create a {other:?} description"))),
        };
        from_rtc_description(&desc)
    }

    async fn apply_local_description(&self, description: &SessionDescription) -> SignalingResult<()> {
        let desc = to_rtc_description(description)?;
        self.pc.set_local_description(desc).await.map_err(transport_err)
    }

    async fn apply_remote_description(&self, description: &SessionDescription) -> SignalingResult<()> {
        let desc = to_rtc_description(description)?;
        self.pc.set_remote_description(desc).await.map_err(transport_err)
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> SignalingResult<()> {
        self.pc
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .map_err(transport_err)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("peer connection close failed: {e}");
        }
    }
}

fn to_rtc_description(d: &SessionDescription) -> SignalingResult<RTCSessionDescription> {
    match d.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(d.sdp.clone()).map_err(transport_err),
        SdpType::Answer => RTCSessionDescription::answer(d.sdp.clone()).map_err(transport_err),
        SdpType::Pranswer => RTCSessionDescription::pranswer(d.sdp.clone()).map_err(transport_err),
        SdpType::Rollback => Err(SignalingError::Transport("rollback descriptions are not supported".into())),
    }
}

fn from_rtc_description(d: &RTCSessionDescription) -> SignalingResult<SessionDescription> {
    let sdp_type = match d.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => return Err(SignalingError::Transport("unspecified sdp type".into())),
    };
    Ok(SessionDescription { sdp_type, sdp: d.sdp.clone() })
}

fn to_rtc_candidate(c: &IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: c.candidate.clone(),
        sdp_mid: c.sdp_mid.clone(),
        sdp_mline_index: c.sdp_mline_index,
        username_fragment: c.username_fragment.clone(),
    }
}

fn from_rtc_candidate(c: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: c.candidate,
        sdp_mid: c.sdp_mid,
        sdp_mline_index: c.sdp_mline_index,
        username_fragment: c.username_fragment,
    }
}
