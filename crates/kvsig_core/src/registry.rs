/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, MutexGuard};

use crate::peer::{NegotiationState, PeerKey, PeerNegotiation};

pub type PeerMap = HashMap<PeerKey, PeerNegotiation>;

/// Every live negotiation of a session, keyed by remote identity.
///
/// Once `close_all` has run the registry stays closed: callers holding the
/// lock must check `is_closed` before inserting.
#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<PeerMap>,
    closed: AtomicBool,
}

impl PeerRegistry {
    pub async fn lock(&self) -> MutexGuard<'_, PeerMap> {
        self.peers.lock().await
    }

    pub async fn state(&self, key: &PeerKey) -> Option<NegotiationState> {
        self.peers.lock().await.get(key).map(|p| p.state())
    }

    pub async fn states(&self) -> Vec<(PeerKey, NegotiationState)> {
        let peers = self.peers.lock().await;
        let mut out: Vec<_> = peers.iter().map(|(k, p)| (k.clone(), p.state())).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn remove(&self, key: &PeerKey) -> Option<PeerNegotiation> {
        self.peers.lock().await.remove(key)
    }

    /// Closes and drops every peer. Returns the keys that were live.
    pub async fn close_all(&self) -> Vec<PeerKey> {
        let drained: Vec<PeerNegotiation> = {
            let mut peers = self.peers.lock().await;
            self.closed.store(true, Ordering::SeqCst);
            peers.drain().map(|(_, p)| p).collect()
        };
        let mut keys = Vec::with_capacity(drained.len());
        for mut peer in drained {
            peer.close().await;
            keys.push(peer.key().clone());
        }
        keys.sort();
        keys
    }
}
