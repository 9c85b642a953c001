//
// Copyright 2026 Peerline Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Common error codes.

use thiserror::Error;

use crate::common::{CallMediaType, CallState, SessionId};

/// Platform independent error conditions.
#[derive(Error, Debug)]
pub enum CallError {
    // Project wide common error codes
    #[error("Mutex poisoned: {0}")]
    MutexPoisoned(String),
    #[error("Expecting non-none option value in: {0}, var: {1}")]
    OptionValueNotSet(String, String),
    #[error("Invalid call configuration: {0}")]
    InvalidConfig(String),

    // Controller error codes
    #[error("Active call already in progress, session: {0}")]
    CallAlreadyInProgress(SessionId),
    #[error("No active call found")]
    NoActiveCall,
    #[error("Operation {0} invalid in call state {1}")]
    InvalidStateForOperation(&'static str, CallState),
    #[error("Controller is closed")]
    ControllerClosed,
    #[error("{0} permission denied")]
    PermissionDenied(CallMediaType),

    // Signaling error codes
    #[error("Unable to append signaling message to the store")]
    SignalingAppendFailure,
    #[error("Unable to decode signaling payload for type {0}")]
    SignalingPayloadDecode(String),

    // Media negotiation error codes
    #[error("Unable to create offer")]
    CreateOffer,
    #[error("Unable to create answer")]
    CreateAnswer,
    #[error("Unable to apply remote description, session: {0}")]
    SetRemoteDescription(SessionId),
    #[error("Unable to apply remote ICE candidate, session: {0}")]
    AddIceCandidate(SessionId),
    #[error("Unable to open local media stream")]
    OpenLocalStream,
    #[error("Unable to create peer connection")]
    CreatePeerConnection,
}
