//
// Copyright 2026 Peerline Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Common types used throughout the library.

use std::{fmt, time::Duration};

use crate::error::CallError;

/// Common Result type, using `anyhow::Error` for Error.
pub type Result<T> = anyhow::Result<T>;

/// Identifies a user of the application.
pub type UserId = String;

/// Identifies the conversation the two participants share.
pub type ConversationId = String;

/// Unique call session identification number.
///
/// Generated by the initiator at call start, immutable for the lifetime
/// of the session and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId {
    id: u64,
}

impl SessionId {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn random() -> Self {
        Self::new(rand::random())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:x}", self.id)
    }
}

impl From<u64> for SessionId {
    fn from(item: u64) -> Self {
        SessionId::new(item)
    }
}

/// Tracks the state of a call session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallState {
    /// No call in progress.
    Idle,

    /// Outgoing only: offer sent, waiting for the remote answer.
    Initiating,

    /// Incoming only: offer received, waiting for the local user to
    /// answer or decline.
    Ringing,

    /// Descriptions exchanged, media route being established.
    Connecting,

    /// The call is established.
    Connected,

    /// The call just finished; transitions to Idle after a short
    /// settle delay so observers get a distinguishable hung-up signal.
    Ended,
}

impl CallState {
    pub fn is_idle(self) -> bool {
        self == CallState::Idle
    }

    /// True while signaling or media for the session is still live.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            CallState::Initiating
                | CallState::Ringing
                | CallState::Connecting
                | CallState::Connected
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The direction of the call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The media type of the call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CallMediaType {
    /// Audio-only (voice) call.
    Audio,
    /// Audio + video call.
    Video,
}

impl CallMediaType {
    pub fn has_video(self) -> bool {
        self == CallMediaType::Video
    }
}

impl fmt::Display for CallMediaType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Status notifications delivered to registered application observers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ApplicationEvent {
    /// An incoming call was received and is now ringing locally.
    IncomingRinging,

    /// The remote answer was applied; the media route is connecting.
    Connecting,

    /// The call is established.
    Connected,

    /// The remote media stream arrived.
    RemoteStreamAdded,

    /// The call ended because of a local hangup.
    EndedLocalHangup,

    /// The call ended because of a remote hangup.
    EndedRemoteHangup,

    /// The call ended because the local user declined it.
    EndedDeclined,

    /// Outgoing only: the remote side never answered.
    EndedNoAnswer,

    /// Incoming only: the local user never answered.
    EndedMissed,

    /// The call ended because a signaling message couldn't be sent.
    EndedSignalingFailure,

    /// The call ended because applying remote negotiation data failed.
    EndedNegotiationFailure,

    /// The call ended because the media connection was lost.
    EndedConnectionFailure,

    /// The call ended because of an internal error condition.
    EndedInternalFailure,
}

impl ApplicationEvent {
    /// True for the terminal `Ended*` events.
    pub fn is_ended(self) -> bool {
        !matches!(
            self,
            ApplicationEvent::IncomingRinging
                | ApplicationEvent::Connecting
                | ApplicationEvent::Connected
                | ApplicationEvent::RemoteStreamAdded
        )
    }
}

impl fmt::Display for ApplicationEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Severity attached to user-facing notifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Tunable policy knobs for a call session.
///
/// The absolute timeout values are heuristics, not protocol; the one hard
/// requirement is that the incoming timeout stays strictly shorter than
/// the outgoing timeout, so an unanswered callee resolves first and its
/// call-end reaches the caller before the caller's own timer fires.
#[derive(Clone, Debug)]
pub struct CallConfig {
    /// Caller: time to wait for an answer before giving up.
    pub outgoing_timeout: Duration,
    /// Callee: time to ring before auto-declining.
    pub incoming_timeout: Duration,
    /// Background poll period for the signaling transport.
    pub poll_interval: Duration,
    /// How far back a poll looks; older messages are considered lost.
    pub poll_window: Duration,
    /// How long a session stays in Ended before returning to Idle.
    pub ended_settle_delay: Duration,
    /// Reflection/relay servers handed to the peer connection.
    pub ice_servers: Vec<String>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            outgoing_timeout: Duration::from_secs(45),
            incoming_timeout: Duration::from_secs(40),
            poll_interval: Duration::from_secs(1),
            poll_window: Duration::from_secs(30),
            ended_settle_delay: Duration::from_secs(1),
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
        }
    }
}

impl CallConfig {
    pub fn validate(&self) -> Result<()> {
        if self.incoming_timeout >= self.outgoing_timeout {
            return Err(CallError::InvalidConfig(
                "incoming_timeout must be strictly less than outgoing_timeout".to_string(),
            )
            .into());
        }
        if self.poll_interval.is_zero() || self.poll_window.is_zero() {
            return Err(
                CallError::InvalidConfig("poll intervals must be non-zero".to_string()).into(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        CallConfig::default().validate().unwrap();
    }

    #[test]
    fn incoming_timeout_must_be_shorter() {
        let config = CallConfig {
            incoming_timeout: Duration::from_secs(45),
            outgoing_timeout: Duration::from_secs(45),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn session_id_display_is_hex() {
        assert_eq!(format!("{}", SessionId::new(0xdead)), "0xdead");
    }
}
