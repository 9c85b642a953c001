//
// Copyright 2026 Peerline Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The durable signaling log contract.

use async_trait::async_trait;
use tokio::{sync::mpsc, time::Instant};
use uuid::Uuid;

use crate::{
    common::{ConversationId, Result, UserId},
    core::signaling::{Envelope, OutboundSignal},
};

/// Append-only log of signaling envelopes, queryable by conversation and
/// receiver. The core never updates or deletes rows.
#[async_trait]
pub trait SignalStore: Send + Sync + 'static {
    /// Durably appends an envelope; the store assigns the id and the
    /// write timestamp. Returns the assigned id.
    async fn append(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        signal: OutboundSignal,
    ) -> Result<Uuid>;

    /// Establishes the push path: every envelope written for
    /// `(conversation_id, receiver_id)` after this call is delivered to
    /// the returned channel as it lands. Delivery is best-effort; the
    /// poll path covers losses. Fails if the push channel cannot be
    /// established at all.
    fn subscribe(
        &self,
        conversation_id: &ConversationId,
        receiver_id: &UserId,
    ) -> Result<mpsc::UnboundedReceiver<Envelope>>;

    /// The poll path: envelopes for `(conversation_id, receiver_id)`
    /// with `created_at >= since`, ascending by write time.
    async fn query_recent(
        &self,
        conversation_id: &ConversationId,
        receiver_id: &UserId,
        since: Instant,
    ) -> Result<Vec<Envelope>>;
}
