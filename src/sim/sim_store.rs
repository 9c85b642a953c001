//
// Copyright 2026 Peerline Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! In-memory simulation of the durable signaling log, with scriptable
//! push-path behavior.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::{sync::mpsc, time::Instant};
use uuid::Uuid;

use crate::{
    common::{ConversationId, Result, UserId},
    core::{
        signaling::{Envelope, OutboundSignal},
        store::SignalStore,
    },
    error::CallError,
};

/// How the push path behaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushMode {
    /// Pushes are delivered as rows land.
    Healthy,
    /// The subscription itself cannot be established.
    SubscribeFails,
    /// The subscription works but silently delivers nothing; only the
    /// poll path sees the rows.
    Lossy,
}

type SubscriberKey = (ConversationId, UserId);

pub struct SimSignalStore {
    push_mode: Mutex<PushMode>,
    rows: Mutex<Vec<Envelope>>,
    subscribers: Mutex<HashMap<SubscriberKey, Vec<mpsc::UnboundedSender<Envelope>>>>,
    fail_append: AtomicBool,
    append_count: AtomicUsize,
}

impl SimSignalStore {
    pub fn new(push_mode: PushMode) -> Self {
        Self {
            push_mode: Mutex::new(push_mode),
            rows: Mutex::new(Vec::new()),
            subscribers: Mutex::new(HashMap::new()),
            fail_append: AtomicBool::new(false),
            append_count: AtomicUsize::new(0),
        }
    }

    pub fn set_push_mode(&self, mode: PushMode) {
        *self.push_mode.lock().expect("sim store lock") = mode;
    }

    pub fn set_fail_append(&self, fail: bool) {
        self.fail_append.store(fail, Ordering::SeqCst);
    }

    /// Number of rows ever appended.
    pub fn append_count(&self) -> usize {
        self.append_count.load(Ordering::SeqCst)
    }

    /// Rows currently in the log, for inspection.
    pub fn rows(&self) -> Vec<Envelope> {
        self.rows.lock().expect("sim store lock").clone()
    }
}

#[async_trait]
impl SignalStore for SimSignalStore {
    async fn append(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        signal: OutboundSignal,
    ) -> Result<Uuid> {
        if self.fail_append.load(Ordering::SeqCst) {
            return Err(CallError::SignalingAppendFailure.into());
        }

        let envelope = Envelope {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.clone(),
            sender_id: sender_id.clone(),
            receiver_id: signal.receiver_id.clone(),
            session_id: signal.session_id,
            typ: signal.message.typ(),
            call_type: signal.call_type,
            payload: signal.message.to_payload()?,
            created_at: Instant::now(),
        };
        let id = envelope.id;

        self.rows
            .lock()
            .expect("sim store lock")
            .push(envelope.clone());
        self.append_count.fetch_add(1, Ordering::SeqCst);

        let push_healthy =
            *self.push_mode.lock().expect("sim store lock") == PushMode::Healthy;
        if push_healthy {
            let key = (conversation_id.clone(), signal.receiver_id);
            if let Some(channels) = self.subscribers.lock().expect("sim store lock").get(&key) {
                for channel in channels {
                    let _ = channel.send(envelope.clone());
                }
            }
        }
        Ok(id)
    }

    fn subscribe(
        &self,
        conversation_id: &ConversationId,
        receiver_id: &UserId,
    ) -> Result<mpsc::UnboundedReceiver<Envelope>> {
        if *self.push_mode.lock().expect("sim store lock") == PushMode::SubscribeFails {
            return Err(anyhow!("push channel unavailable"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("sim store lock")
            .entry((conversation_id.clone(), receiver_id.clone()))
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn query_recent(
        &self,
        conversation_id: &ConversationId,
        receiver_id: &UserId,
        since: Instant,
    ) -> Result<Vec<Envelope>> {
        let rows = self.rows.lock().expect("sim store lock");
        Ok(rows
            .iter()
            .filter(|envelope| {
                envelope.conversation_id == *conversation_id
                    && envelope.receiver_id == *receiver_id
                    && envelope.created_at >= since
            })
            .cloned()
            .collect())
    }
}
