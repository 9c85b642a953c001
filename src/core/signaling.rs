//
// Copyright 2026 Peerline Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The messages we exchange over the relayed signaling channel to
//! establish a call, and the durable envelope they travel in.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    common::{CallMediaType, ConversationId, Result, SessionId, UserId},
    error::CallError,
};

/// An enum representing the different types of signaling messages that
/// can be sent and received.
#[derive(Clone, PartialEq)]
pub enum Message {
    Offer(Offer),
    Answer(Answer),
    Ice(IceCandidate),
    CallEnd,
}

impl Message {
    pub fn typ(&self) -> MessageType {
        match self {
            Self::Offer(_) => MessageType::Offer,
            Self::Answer(_) => MessageType::Answer,
            Self::Ice(_) => MessageType::Ice,
            Self::CallEnd => MessageType::CallEnd,
        }
    }

    /// Serializes the negotiation data into the opaque payload column.
    pub fn to_payload(&self) -> Result<serde_json::Value> {
        let payload = match self {
            Self::Offer(offer) => serde_json::to_value(offer)?,
            Self::Answer(answer) => serde_json::to_value(answer)?,
            Self::Ice(candidate) => serde_json::to_value(candidate)?,
            Self::CallEnd => serde_json::Value::Null,
        };
        Ok(payload)
    }

    /// Recovers a message from the type column plus the opaque payload.
    pub fn from_payload(typ: MessageType, payload: &serde_json::Value) -> Result<Self> {
        let decode = |payload: &serde_json::Value| -> std::result::Result<Message, serde_json::Error> {
            Ok(match typ {
                MessageType::Offer => Message::Offer(serde_json::from_value(payload.clone())?),
                MessageType::Answer => Message::Answer(serde_json::from_value(payload.clone())?),
                MessageType::Ice => Message::Ice(serde_json::from_value(payload.clone())?),
                MessageType::CallEnd => Message::CallEnd,
            })
        };
        decode(payload).map_err(|_| CallError::SignalingPayloadDecode(typ.to_string()).into())
    }
}

// The session descriptions stay out of the logs; only the shape of the
// message is interesting for diagnosis.
impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let display = match self {
            Self::Offer(offer) => format!("Offer({}, ...)", offer.call_media_type),
            Self::Answer(_) => "Answer(...)".to_string(),
            Self::Ice(_) => "Ice(...)".to_string(),
            Self::CallEnd => "CallEnd".to_string(),
        };
        write!(f, "({})", display)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// It's convenient to be able to know the type of a message without
/// having an entire message, so we have the related MessageType enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    Offer,
    Answer,
    Ice,
    CallEnd,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Ice => "ice-candidate",
            Self::CallEnd => "call-end",
        };
        write!(f, "{}", name)
    }
}

/// The caller sends this to the callee to initiate the call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub call_media_type: CallMediaType,
    pub sdp: String,
}

/// The callee sends this in response to an offer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub sdp: String,
}

/// A connectivity path description; both sides trickle these while the
/// media route is established.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u32>,
}

/// A signaling message as the controller hands it to the transport,
/// before the store assigns an id and timestamp.
#[derive(Clone, Debug)]
pub struct OutboundSignal {
    pub receiver_id: UserId,
    pub session_id: SessionId,
    pub call_type: CallMediaType,
    pub message: Message,
}

/// One row of the append-only signaling log.
///
/// Immutable once written; `id` is assigned at write time and is the
/// basis for receiver-side deduplication.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub id: Uuid,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub session_id: SessionId,
    pub typ: MessageType,
    pub call_type: CallMediaType,
    pub payload: serde_json::Value,
    pub created_at: Instant,
}

impl Envelope {
    /// Decodes the typed message carried in the opaque payload.
    pub fn message(&self) -> Result<Message> {
        Message::from_payload(self.typ, &self.payload)
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Envelope(id: {}, session: {}, type: {}, {} -> {})",
            self.id, self.session_id, self.typ, self.sender_id, self.receiver_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_payload_round_trip() {
        let message = Message::Offer(Offer {
            call_media_type: CallMediaType::Video,
            sdp: "v=0 fake-sdp".to_string(),
        });
        let payload = message.to_payload().unwrap();
        let decoded = Message::from_payload(MessageType::Offer, &payload).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn call_end_has_null_payload() {
        let payload = Message::CallEnd.to_payload().unwrap();
        assert!(payload.is_null());
        assert_eq!(
            Message::from_payload(MessageType::CallEnd, &payload).unwrap(),
            Message::CallEnd
        );
    }

    #[test]
    fn mismatched_payload_is_rejected() {
        let payload = Message::CallEnd.to_payload().unwrap();
        assert!(Message::from_payload(MessageType::Answer, &payload).is_err());
    }

    #[test]
    fn message_display_redacts_sdp() {
        let message = Message::Offer(Offer {
            call_media_type: CallMediaType::Audio,
            sdp: "super-secret-ice-pwd".to_string(),
        });
        let display = format!("{}", message);
        assert!(!display.contains("secret"));
    }
}
