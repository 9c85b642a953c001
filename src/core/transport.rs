//
// Copyright 2026 Peerline Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Signaling transport: dual-path delivery from the durable log to the
//! session state machine.
//!
//! Both paths run at once; polling is redundancy, not a failover mode.
//! The push subscription has no delivery guarantee, so a background poll
//! re-reads the recent window continuously, and a catch-up poll runs
//! immediately on attach to cover envelopes written before the
//! subscription existed. Everything is forwarded as-is; the state
//! machine's processed-id set turns at-least-once delivery into
//! exactly-once processing.

use std::sync::Arc;

use log::{debug, warn};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval, Instant, MissedTickBehavior},
};
use uuid::Uuid;

use crate::{
    common::{CallConfig, ConversationId, Result, UserId},
    core::{
        signaling::{Envelope, OutboundSignal},
        store::SignalStore,
    },
};

pub struct SignalingTransport<S: SignalStore> {
    store: Arc<S>,
    conversation_id: ConversationId,
    local_user: UserId,
    receiver_task: Option<JoinHandle<()>>,
}

impl<S: SignalStore> SignalingTransport<S> {
    /// Attaches to the store for one conversation: subscribes the push
    /// path (degrading silently to poll-only if that fails), then starts
    /// the receive loop feeding `out`.
    pub fn attach(
        store: Arc<S>,
        conversation_id: ConversationId,
        local_user: UserId,
        config: &CallConfig,
        out: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        let push_rx = match store.subscribe(&conversation_id, &local_user) {
            Ok(rx) => Some(rx),
            Err(e) => {
                // Not surfaced to the call flow; the poll path carries
                // the conversation alone.
                warn!(
                    "signaling push subscription failed, polling only: {}",
                    e
                );
                None
            }
        };

        let receiver_task = tokio::spawn(Self::receive_loop(
            store.clone(),
            conversation_id.clone(),
            local_user.clone(),
            config.poll_interval,
            config.poll_window,
            push_rx,
            out,
        ));

        Self {
            store,
            conversation_id,
            local_user,
            receiver_task: Some(receiver_task),
        }
    }

    /// Appends an outbound signal to the durable log.
    pub async fn send(&self, signal: OutboundSignal) -> Result<Uuid> {
        self.store
            .append(&self.conversation_id, &self.local_user, signal)
            .await
    }

    /// Stops the receive loop. Idempotent.
    pub fn detach(&mut self) {
        if let Some(task) = self.receiver_task.take() {
            task.abort();
        }
    }

    async fn receive_loop(
        store: Arc<S>,
        conversation_id: ConversationId,
        local_user: UserId,
        poll_interval: std::time::Duration,
        poll_window: std::time::Duration,
        mut push_rx: Option<mpsc::UnboundedReceiver<Envelope>>,
        out: mpsc::UnboundedSender<Envelope>,
    ) {
        let attached_at = Instant::now();
        // The first tick completes immediately: that is the mandatory
        // catch-up poll.
        let mut poll_tick = interval(poll_interval);
        poll_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                pushed = async {
                    match push_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match pushed {
                        Some(envelope) => {
                            if out.send(envelope).is_err() {
                                return;
                            }
                        }
                        None => {
                            warn!("signaling push channel closed, polling only");
                            push_rx = None;
                        }
                    }
                }
                _ = poll_tick.tick() => {
                    let since = Instant::now()
                        .checked_sub(poll_window)
                        .unwrap_or(attached_at);
                    match store.query_recent(&conversation_id, &local_user, since).await {
                        Ok(envelopes) => {
                            for envelope in envelopes {
                                if out.send(envelope).is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            // Transient; the next tick retries. Losses
                            // beyond the window resolve via timeouts.
                            debug!("signaling poll failed: {}", e);
                        }
                    }
                }
            }
        }
    }
}

impl<S: SignalStore> Drop for SignalingTransport<S> {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        common::{CallMediaType, SessionId},
        core::signaling::Message,
        sim::sim_store::{PushMode, SimSignalStore},
    };

    fn end_signal(receiver: &str) -> OutboundSignal {
        OutboundSignal {
            receiver_id: receiver.to_string(),
            session_id: SessionId::new(7),
            call_type: CallMediaType::Audio,
            message: Message::CallEnd,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn catch_up_poll_covers_pre_attach_writes() {
        let store = Arc::new(SimSignalStore::new(PushMode::Healthy));
        store
            .append(&"conv".to_string(), &"alice".to_string(), end_signal("bob"))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _transport = SignalingTransport::attach(
            store,
            "conv".to_string(),
            "bob".to_string(),
            &CallConfig::default(),
            tx,
        );

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.session_id, SessionId::new(7));
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_failure_degrades_to_polling() {
        let store = Arc::new(SimSignalStore::new(PushMode::SubscribeFails));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = SignalingTransport::attach(
            store.clone(),
            "conv".to_string(),
            "bob".to_string(),
            &CallConfig::default(),
            tx,
        );

        transport.send(end_signal("bob")).await.unwrap();

        // Delivered by the next background poll despite no push path.
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.receiver_id, "bob");
    }
}
