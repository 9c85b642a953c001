//
// Copyright 2026 Peerline Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! # Peerline -- peer-to-peer calling for conversations
//!
//! A 1:1 audio/video call engine for a social-networking application.
//! Two users who share a conversation establish a direct media
//! connection; session setup is brokered through a relayed, durable
//! signaling log with dual-path (push + poll) delivery, because the
//! participants cannot reach each other directly.
//!
//! The embedding application provides the seams: a [`core::platform::CallPlatform`]
//! (permissions, notifications, analytics, media engine) and a
//! [`core::store::SignalStore`] (the durable signaling log). The crate
//! provides the state machine, transport, timeout policy, and the
//! negotiation adapter that tolerates out-of-order delivery.

pub mod common;

pub mod error;

/// Core, platform independent functionality.
pub mod core {
    pub mod call_mutex;
    pub mod controller;
    pub mod platform;
    pub mod session;
    pub mod session_fsm;
    pub mod signaling;
    pub mod store;
    pub mod timeout;
    pub mod transport;
}

/// The media-negotiation seam.
pub mod webrtc;

/// Simulation implementations for testing.
#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use crate::{
    common::{
        ApplicationEvent, CallConfig, CallDirection, CallMediaType, CallState, ConversationId,
        SessionId, Severity, UserId,
    },
    core::controller::CallSessionController,
};
