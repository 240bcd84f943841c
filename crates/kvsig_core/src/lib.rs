/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod config;
pub mod control_plane;
pub mod error;
pub mod media;
pub mod mock;
pub mod outbound;
pub mod peer;
pub mod registry;
pub mod role;
pub mod runtime;
pub mod session;
pub mod sigv4;
pub mod socket;
pub mod webrtc_transport;

pub use config::SessionConfig;
pub use error::{SignalingError, SignalingResult};
pub use peer::{NegotiationState, PeerKey};
pub use role::{Role, RoleStrategy};
pub use session::{Collaborators, Session, SessionEvent};
