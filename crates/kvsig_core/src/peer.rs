/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Per-peer offer/answer negotiation.
//!
//! Viewer path: `Idle -> OfferSent -> AnswerReceived -> Established`.
//! Master path (one machine per viewer): `Idle -> OfferReceived -> AnswerSent -> Established`.
//! `Closed` is reachable from every state and is terminal.
//!
//! Remote candidates that arrive before the remote description are queued in
//! arrival order and flushed to the transport as soon as the description is
//! applied.

use std::collections::VecDeque;
use std::fmt;

use kvsig_protocol::{IceCandidate, SdpType, SessionDescription};
use tracing::{debug, warn};

use crate::error::{SignalingError, SignalingResult};
use crate::media::MediaTransport;

/// Identity of the remote party. A viewer's single counterpart (the master)
/// never announces an id, so it is `Implicit`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PeerKey {
    Identified(String),
    Implicit,
}

impl PeerKey {
    pub fn identified(id: impl Into<String>) -> Self {
        PeerKey::Identified(id.into())
    }

    pub fn client_id(&self) -> Option<&str> {
        match self {
            PeerKey::Identified(id) => Some(id),
            PeerKey::Implicit => None,
        }
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerKey::Identified(id) => f.write_str(id),
            PeerKey::Implicit => f.write_str("<implicit>"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    Established,
    Closed,
}

impl NegotiationState {
    pub fn remote_description_applied(&self) -> bool {
        matches!(
            self,
            NegotiationState::OfferReceived
                | NegotiationState::AnswerSent
                | NegotiationState::AnswerReceived
                | NegotiationState::Established
        )
    }

    pub fn is_closed(&self) -> bool {
        *self == NegotiationState::Closed
    }
}

pub struct PeerNegotiation {
    key: PeerKey,
    state: NegotiationState,
    transport: Box<dyn MediaTransport>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    pending_candidates: VecDeque<IceCandidate>,
    rejected_candidates: Vec<SignalingError>,
}

impl PeerNegotiation {
    pub fn new(key: PeerKey, transport: Box<dyn MediaTransport>) -> Self {
        Self {
            key,
            state: NegotiationState::Idle,
            transport,
            local_description: None,
            remote_description: None,
            pending_candidates: VecDeque::new(),
            rejected_candidates: Vec::new(),
        }
    }

    pub fn key(&self) -> &PeerKey {
        &self.key
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Errors from buffered candidates the transport refused while they
    /// were flushed. Drained on each call.
    pub fn take_rejected_candidates(&mut self) -> Vec<SignalingError> {
        std::mem::take(&mut self.rejected_candidates)
    }

    pub async fn apply_remote_offer(&mut self, offer: SessionDescription) -> SignalingResult<()> {
        self.require("apply remote offer", &[NegotiationState::Idle])?;
        if offer.sdp_type != SdpType::Offer {
            return Err(SignalingError::violation(
                &self.key,
                format!("expected an offer description, got {:?}", offer.sdp_type),
            ));
        }
        self.transport.apply_remote_description(&offer).await?;
        self.remote_description = Some(offer);
        self.transition(NegotiationState::OfferReceived);
        self.flush_candidates().await;
        Ok(())
    }

    pub async fn produce_answer(&mut self) -> SignalingResult<SessionDescription> {
        self.require("produce answer", &[NegotiationState::OfferReceived])?;
        let answer = self.transport.create_local_description(SdpType::Answer).await?;
        self.transport.apply_local_description(&answer).await?;
        self.local_description = Some(answer.clone());
        self.transition(NegotiationState::AnswerSent);
        Ok(answer)
    }

    pub async fn produce_offer(&mut self) -> SignalingResult<SessionDescription> {
        self.require("produce offer", &[NegotiationState::Idle])?;
        let offer = self.transport.create_local_description(SdpType::Offer).await?;
        self.transport.apply_local_description(&offer).await?;
        self.local_description = Some(offer.clone());
        self.transition(NegotiationState::OfferSent);
        Ok(offer)
    }

    pub async fn apply_remote_answer(&mut self, answer: SessionDescription) -> SignalingResult<()> {
        self.require("apply remote answer", &[NegotiationState::OfferSent])?;
        if answer.sdp_type != SdpType::Answer {
            return Err(SignalingError::violation(
                &self.key,
                format!("expected an answer description, got {:?}", answer.sdp_type),
            ));
        }
        self.transport.apply_remote_description(&answer).await?;
        self.remote_description = Some(answer);
        self.transition(NegotiationState::AnswerReceived);
        self.flush_candidates().await;
        Ok(())
    }

    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> SignalingResult<()> {
        if self.state.is_closed() {
            return Err(self.invalid("add remote candidate"));
        }
        if self.state.remote_description_applied() {
            return self.transport.add_remote_candidate(&candidate).await;
        }
        self.pending_candidates.push_back(candidate);
        debug!(peer=%self.key, buffered=self.pending_candidates.len(), "candidate buffered until remote description");
        Ok(())
    }

    /// Called when the media transport reports the connection is up.
    pub fn mark_established(&mut self) -> SignalingResult<()> {
        if self.state == NegotiationState::Established {
            return Ok(());
        }
        self.require(
            "mark established",
            &[NegotiationState::AnswerSent, NegotiationState::AnswerReceived],
        )?;
        self.transition(NegotiationState::Established);
        Ok(())
    }

    pub async fn close(&mut self) {
        if self.state.is_closed() {
            return;
        }
        self.transition(NegotiationState::Closed);
        if !self.pending_candidates.is_empty() {
            warn!(peer=%self.key, dropped=self.pending_candidates.len(), "closing with unapplied candidates");
            self.pending_candidates.clear();
        }
        self.transport.close().await;
    }

    // A refused candidate does not stop the ones queued behind it.
    async fn flush_candidates(&mut self) {
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(e) = self.transport.add_remote_candidate(&candidate).await {
                warn!(peer=%self.key, error=%e, candidate=%candidate.candidate, "buffered candidate rejected");
                self.rejected_candidates.push(e);
            }
        }
    }

    fn require(&self, op: &str, allowed: &[NegotiationState]) -> SignalingResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(self.invalid(op))
        }
    }

    fn invalid(&self, op: &str) -> SignalingError {
        SignalingError::violation(&self.key, format!("cannot {op} in state {:?}", self.state))
    }

    fn transition(&mut self, next: NegotiationState) {
        debug!(peer=%self.key, from=?self.state, to=?next, "negotiation transition");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaTransportFactory, PeerEvents};
    use crate::mock::{MockCall, MockTransportFactory};
    use tokio::sync::mpsc;

    async fn peer(factory: &MockTransportFactory, key: PeerKey) -> PeerNegotiation {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = factory.create(PeerEvents::new(key.clone(), tx)).await.unwrap();
        PeerNegotiation::new(key, transport)
    }

    fn cand(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"))
    }

    #[tokio::test]
    async fn master_path_reaches_answer_sent() {
        let factory = MockTransportFactory::default();
        let key = PeerKey::identified("v1");
        let mut p = peer(&factory, key.clone()).await;

        p.apply_remote_offer(SessionDescription::offer("remote-offer")).await.unwrap();
        assert_eq!(p.state(), NegotiationState::OfferReceived);
        let answer = p.produce_answer().await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        assert_eq!(p.state(), NegotiationState::AnswerSent);
        p.mark_established().unwrap();
        assert_eq!(p.state(), NegotiationState::Established);

        let rec = factory.transport(&key).unwrap();
        assert_eq!(
            rec.calls(),
            vec![
                MockCall::ApplyRemote(SessionDescription::offer("remote-offer")),
                MockCall::CreateLocal(SdpType::Answer),
                MockCall::ApplyLocal(answer),
            ]
        );
    }

    #[tokio::test]
    async fn viewer_path_reaches_answer_received() {
        let factory = MockTransportFactory::default();
        let mut p = peer(&factory, PeerKey::Implicit).await;
        let offer = p.produce_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert_eq!(p.state(), NegotiationState::OfferSent);
        p.apply_remote_answer(SessionDescription::answer("remote-answer")).await.unwrap();
        assert_eq!(p.state(), NegotiationState::AnswerReceived);
        assert_eq!(p.remote_description().unwrap().sdp, "remote-answer");
    }

    #[tokio::test]
    async fn second_offer_is_a_violation_and_leaves_state() {
        let factory = MockTransportFactory::default();
        let mut p = peer(&factory, PeerKey::Implicit).await;
        let first = p.produce_offer().await.unwrap();
        let err = p.produce_offer().await.unwrap_err();
        assert!(err.is_protocol_violation());
        assert_eq!(p.state(), NegotiationState::OfferSent);
        assert_eq!(p.local_description(), Some(&first));
    }

    #[tokio::test]
    async fn invalid_transitions_are_violations() {
        let factory = MockTransportFactory::default();
        let mut p = peer(&factory, PeerKey::identified("v1")).await;
        assert!(p.produce_answer().await.unwrap_err().is_protocol_violation());
        assert!(p
            .apply_remote_answer(SessionDescription::answer("x"))
            .await
            .unwrap_err()
            .is_protocol_violation());
        assert!(p.mark_established().unwrap_err().is_protocol_violation());
        // Wrong description type for the operation.
        assert!(p
            .apply_remote_offer(SessionDescription::answer("x"))
            .await
            .unwrap_err()
            .is_protocol_violation());
        assert_eq!(p.state(), NegotiationState::Idle);
    }

    #[tokio::test]
    async fn candidates_buffer_then_flush_in_order() {
        let factory = MockTransportFactory::default();
        let key = PeerKey::identified("v1");
        let mut p = peer(&factory, key.clone()).await;
        for n in 1..=3 {
            p.add_remote_candidate(cand(n)).await.unwrap();
        }
        assert_eq!(p.pending_candidates(), 3);
        let rec = factory.transport(&key).unwrap();
        assert!(rec.applied_candidates().is_empty());

        p.apply_remote_offer(SessionDescription::offer("o")).await.unwrap();
        assert_eq!(p.pending_candidates(), 0);
        p.add_remote_candidate(cand(4)).await.unwrap();
        assert_eq!(rec.applied_candidates(), vec![cand(1), cand(2), cand(3), cand(4)]);
    }

    #[tokio::test]
    async fn buffering_matches_direct_application() {
        let factory = MockTransportFactory::default();
        let early = PeerKey::identified("early");
        let late = PeerKey::identified("late");

        let mut a = peer(&factory, early.clone()).await;
        for n in 1..=3 {
            a.add_remote_candidate(cand(n)).await.unwrap();
        }
        a.apply_remote_offer(SessionDescription::offer("o")).await.unwrap();

        let mut b = peer(&factory, late.clone()).await;
        b.apply_remote_offer(SessionDescription::offer("o")).await.unwrap();
        for n in 1..=3 {
            b.add_remote_candidate(cand(n)).await.unwrap();
        }

        assert_eq!(
            factory.transport(&early).unwrap().calls(),
            factory.transport(&late).unwrap().calls()
        );
    }

    #[tokio::test]
    async fn offer_sent_still_buffers_candidates() {
        let factory = MockTransportFactory::default();
        let mut p = peer(&factory, PeerKey::Implicit).await;
        p.produce_offer().await.unwrap();
        p.add_remote_candidate(cand(1)).await.unwrap();
        assert_eq!(p.pending_candidates(), 1);
        p.apply_remote_answer(SessionDescription::answer("a")).await.unwrap();
        assert_eq!(
            factory.transport(&PeerKey::Implicit).unwrap().applied_candidates(),
            vec![cand(1)]
        );
    }

    #[tokio::test]
    async fn rejected_buffered_candidate_does_not_stall_the_rest() {
        let factory = MockTransportFactory::default().rejecting_candidates(vec![cand(1)]);
        let key = PeerKey::identified("v1");
        let mut p = peer(&factory, key.clone()).await;
        for n in 1..=3 {
            p.add_remote_candidate(cand(n)).await.unwrap();
        }

        p.apply_remote_offer(SessionDescription::offer("o")).await.unwrap();
        assert_eq!(p.state(), NegotiationState::OfferReceived);
        assert_eq!(p.pending_candidates(), 0);
        let rec = factory.transport(&key).unwrap();
        assert_eq!(rec.applied_candidates(), vec![cand(2), cand(3)]);
        let rejected = p.take_rejected_candidates();
        assert_eq!(rejected.len(), 1);
        assert!(matches!(rejected[0], SignalingError::Transport(_)));
        assert!(p.take_rejected_candidates().is_empty());

        p.produce_answer().await.unwrap();
        p.add_remote_candidate(cand(4)).await.unwrap();
        assert_eq!(rec.applied_candidates(), vec![cand(2), cand(3), cand(4)]);
    }

    #[tokio::test]
    async fn close_is_terminal_and_idempotent() {
        let factory = MockTransportFactory::default();
        let key = PeerKey::identified("v1");
        let mut p = peer(&factory, key.clone()).await;
        p.add_remote_candidate(cand(1)).await.unwrap();
        p.close().await;
        p.close().await;
        assert_eq!(p.state(), NegotiationState::Closed);
        assert_eq!(p.pending_candidates(), 0);
        assert!(p.add_remote_candidate(cand(2)).await.unwrap_err().is_protocol_violation());
        assert!(p
            .apply_remote_offer(SessionDescription::offer("o"))
            .await
            .unwrap_err()
            .is_protocol_violation());
        assert_eq!(factory.transport(&key).unwrap().close_count(), 1);
    }
}
