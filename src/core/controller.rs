//
// Copyright 2026 Peerline Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The public call API for one conversation.
//!
//! A controller is constructed fresh per conversation view and torn down
//! with it; it owns its state machine, timers, transport attachment, and
//! observer registry. Shared infrastructure (the platform and the
//! signaling store) is passed in explicitly, never reached through
//! globals.

use std::sync::Arc;

use log::info;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::{
    common::{
        CallConfig, CallMediaType, CallState, ConversationId, Result, SessionId, UserId,
    },
    core::{
        call_mutex::CallMutex,
        platform::{CallPlatform, ObserverCallback, ObserverHandle, Observers},
        session_fsm::{SessionEvent, SessionFsm, SharedState, StreamOf},
        store::SignalStore,
        transport::SignalingTransport,
    },
    error::CallError,
    webrtc::ConnectionStats,
};

pub struct CallSessionController<P: CallPlatform> {
    conversation_id: ConversationId,
    local_user: UserId,
    remote_user: UserId,

    events_tx: mpsc::UnboundedSender<SessionEvent<StreamOf<P>>>,
    fsm_task: Option<JoinHandle<()>>,
    signal_forwarder: Option<JoinHandle<()>>,

    observers: Arc<Observers>,
    shared: Arc<CallMutex<SharedState>>,
}

impl<P: CallPlatform> CallSessionController<P> {
    /// Wires a controller for one conversation: attaches the transport
    /// (push + poll) and spawns the state machine task.
    pub fn new<S: SignalStore>(
        platform: Arc<P>,
        store: Arc<S>,
        conversation_id: ConversationId,
        local_user: UserId,
        remote_user: UserId,
        config: CallConfig,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            "controller: attaching, conversation: {}, local: {}",
            conversation_id, local_user
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(CallMutex::new(SharedState::idle(), "shared call state"));
        let observers = Arc::new(Observers::new());

        let (envelopes_tx, mut envelopes_rx) = mpsc::unbounded_channel();
        let transport = SignalingTransport::attach(
            store,
            conversation_id.clone(),
            local_user.clone(),
            &config,
            envelopes_tx,
        );

        let signal_events = events_tx.clone();
        let signal_forwarder = tokio::spawn(async move {
            while let Some(envelope) = envelopes_rx.recv().await {
                if signal_events.send(SessionEvent::Signal(envelope)).is_err() {
                    break;
                }
            }
        });

        let fsm = SessionFsm::new(
            platform,
            transport,
            conversation_id.clone(),
            remote_user.clone(),
            config,
            events_tx.clone(),
            observers.clone(),
            shared.clone(),
        );
        let fsm_task = tokio::spawn(fsm.run(events_rx));

        Ok(Self {
            conversation_id,
            local_user,
            remote_user,
            events_tx,
            fsm_task: Some(fsm_task),
            signal_forwarder: Some(signal_forwarder),
            observers,
            shared,
        })
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn remote_user(&self) -> &UserId {
        &self.remote_user
    }

    // ------------------------------------------------------------------
    // Call API

    pub fn start_voice_call(&self) -> Result<()> {
        self.start_call(CallMediaType::Audio)
    }

    pub fn start_video_call(&self) -> Result<()> {
        self.start_call(CallMediaType::Video)
    }

    fn start_call(&self, media_type: CallMediaType) -> Result<()> {
        info!("API: start_call(): type: {}", media_type);
        let state = self.state()?;
        if !state.is_idle() {
            let session_id = self.session_id()?.unwrap_or_else(|| SessionId::new(0));
            return Err(CallError::CallAlreadyInProgress(session_id).into());
        }
        self.inject(SessionEvent::StartCall(media_type))
    }

    pub fn answer_call(&self, video: bool) -> Result<()> {
        info!("API: answer_call(): video: {}", video);
        let state = self.state()?;
        if state != CallState::Ringing {
            return Err(CallError::InvalidStateForOperation("answer_call", state).into());
        }
        self.inject(SessionEvent::AnswerCall { video })
    }

    pub fn decline_call(&self) -> Result<()> {
        info!("API: decline_call()");
        let state = self.state()?;
        if state != CallState::Ringing {
            return Err(CallError::InvalidStateForOperation("decline_call", state).into());
        }
        self.inject(SessionEvent::DeclineCall)
    }

    /// Hangs up. Valid in any state; a no-op when already idle.
    pub fn end_call(&self) -> Result<()> {
        info!("API: end_call()");
        self.inject(SessionEvent::EndCall)
    }

    pub fn toggle_audio(&self) -> Result<()> {
        self.inject(SessionEvent::ToggleAudio)
    }

    pub fn toggle_video(&self) -> Result<()> {
        self.inject(SessionEvent::ToggleVideo)
    }

    pub fn switch_camera(&self) -> Result<()> {
        self.inject(SessionEvent::SwitchCamera)
    }

    /// Snapshot of the media connection; `None` outside
    /// connecting/connected.
    pub async fn connection_stats(&self) -> Result<Option<ConnectionStats>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inject(SessionEvent::QueryStats(reply_tx))?;
        Ok(reply_rx.await.unwrap_or(None))
    }

    // ------------------------------------------------------------------
    // State inspection

    pub fn state(&self) -> Result<CallState> {
        Ok(self.shared.lock()?.state)
    }

    pub fn session_id(&self) -> Result<Option<SessionId>> {
        Ok(self.shared.lock()?.session_id)
    }

    pub fn has_local_stream(&self) -> Result<bool> {
        Ok(self.shared.lock()?.has_local_stream)
    }

    pub fn has_remote_stream(&self) -> Result<bool> {
        Ok(self.shared.lock()?.has_remote_stream)
    }

    /// Registers an application-event handler; the returned handle
    /// unregisters it when dropped or explicitly released.
    pub fn register_observer(&self, handler: ObserverCallback) -> ObserverHandle {
        self.observers.register(handler)
    }

    /// Waits until every event injected before this call has been
    /// processed by the state machine.
    pub async fn synchronize(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inject(SessionEvent::Synchronize(reply_tx))?;
        let _ = reply_rx.await;
        Ok(())
    }

    /// Tears the controller down: ends any active call, detaches the
    /// transport, and stops the state machine task.
    pub fn close(&mut self) {
        if let Some(forwarder) = self.signal_forwarder.take() {
            forwarder.abort();
        }
        if self.fsm_task.take().is_some() {
            info!("controller: closing, conversation: {}", self.conversation_id);
            let _ = self.events_tx.send(SessionEvent::Shutdown);
        }
    }

    fn inject(&self, event: SessionEvent<StreamOf<P>>) -> Result<()> {
        self.events_tx
            .send(event)
            .map_err(|_| CallError::ControllerClosed.into())
    }
}

impl<P: CallPlatform> Drop for CallSessionController<P> {
    fn drop(&mut self) {
        self.close();
    }
}
