//
// Copyright 2026 Peerline Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The seam to the native media-negotiation primitive, and the adapter
//! that makes it tolerant of out-of-order signaling delivery.

pub mod media;
pub mod peer_connection;

pub use media::MediaStream;
pub use peer_connection::{
    ConnectionObservation, ConnectionState, ConnectionStats, MediaEngine, NegotiationAdapter,
    PeerConnection, SdpType, SessionDescription,
};
