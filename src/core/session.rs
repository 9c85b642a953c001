//
// Copyright 2026 Peerline Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Per-call session bookkeeping.

use std::fmt;

use crate::{
    common::{CallDirection, CallMediaType, CallState, SessionId},
    core::signaling::IceCandidate,
    webrtc::{MediaEngine, MediaStream, NegotiationAdapter, SessionDescription},
};

/// The in-memory state of one call attempt, owned exclusively by one
/// controller's state machine. Created on `start_call` or on an incoming
/// offer, dropped when the ended session settles back to idle.
pub struct CallSession<E: MediaEngine> {
    pub session_id: SessionId,
    pub direction: CallDirection,
    pub call_type: CallMediaType,
    pub state: CallState,

    /// Local capture stream; exclusively owned until the call ends.
    pub local_stream: Option<E::Stream>,
    /// Remote stream; set at most once, by the adapter's observation.
    pub remote_stream: Option<E::Stream>,
    /// The negotiation adapter; absent on the callee side until answer.
    pub adapter: Option<NegotiationAdapter<E::Connection>>,

    /// Callee: the remote offer, held until the user answers.
    pub pending_remote_offer: Option<SessionDescription>,
    /// Callee: candidates that arrived while still ringing, before any
    /// adapter exists to queue them.
    pub ringing_candidates: Vec<IceCandidate>,

    /// True once we have emitted any signaling for this session; only
    /// then is a call-end owed to the remote side.
    pub signaled: bool,
    /// True once the remote side sent call-end; suppresses the echo.
    pub remote_ended: bool,
}

impl<E: MediaEngine> CallSession<E> {
    pub fn outgoing(session_id: SessionId, call_type: CallMediaType) -> Self {
        Self::new(session_id, CallDirection::Outgoing, call_type, CallState::Initiating)
    }

    pub fn incoming(
        session_id: SessionId,
        call_type: CallMediaType,
        offer: SessionDescription,
    ) -> Self {
        let mut session = Self::new(
            session_id,
            CallDirection::Incoming,
            call_type,
            CallState::Ringing,
        );
        session.pending_remote_offer = Some(offer);
        session
    }

    fn new(
        session_id: SessionId,
        direction: CallDirection,
        call_type: CallMediaType,
        state: CallState,
    ) -> Self {
        Self {
            session_id,
            direction,
            call_type,
            state,
            local_stream: None,
            remote_stream: None,
            adapter: None,
            pending_remote_offer: None,
            ringing_candidates: Vec::new(),
            signaled: false,
            remote_ended: false,
        }
    }

    /// Stops local tracks, releases the remote stream, and closes the
    /// adapter connection. Runs on every exit path and tolerates being
    /// called more than once.
    pub fn stop_media(&mut self) {
        if let Some(stream) = self.local_stream.take() {
            stream.stop();
        }
        self.remote_stream = None;
        if let Some(mut adapter) = self.adapter.take() {
            adapter.close();
        }
        self.pending_remote_offer = None;
        self.ringing_candidates.clear();
    }
}

impl<E: MediaEngine> fmt::Display for CallSession<E> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "CallSession(session: {}, direction: {}, type: {}, state: {})",
            self.session_id, self.direction, self.call_type, self.state
        )
    }
}
