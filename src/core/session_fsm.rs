//
// Copyright 2026 Peerline Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Call Session Finite State Machine
//!
//! The FSM mediates the application's call API with the signaling
//! transport and the media-negotiation adapter.
//!
//! # Asynchronous Inputs:
//!
//! ## Control events from the application
//!
//! - StartCall
//! - AnswerCall
//! - DeclineCall
//! - EndCall
//! - ToggleAudio / ToggleVideo / SwitchCamera
//!
//! ## Signaling events from the transport
//!
//! - Signal (offer / answer / ice-candidate / call-end envelopes)
//!
//! ## From the media connection
//!
//! - Observation (state changes, remote stream, local candidates)
//!
//! ## From the timers
//!
//! - OutgoingTimeout
//! - IncomingTimeout
//! - EndedSettle
//!
//! Events are processed strictly one at a time: each handler runs to
//! completion (or to its next await) before the next event is taken, so
//! no two handlers for the same session ever execute concurrently.

use std::{
    collections::HashSet,
    fmt,
    sync::Arc,
};

use log::{debug, error, info, warn};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::sleep,
};
use uuid::Uuid;

use crate::{
    common::{
        ApplicationEvent, CallConfig, CallDirection, CallMediaType, CallState, ConversationId,
        Result, SessionId, Severity, UserId,
    },
    core::{
        call_mutex::CallMutex,
        platform::{CallPlatform, Observers},
        session::CallSession,
        signaling::{Answer, Envelope, IceCandidate, Message, Offer, OutboundSignal},
        store::SignalStore,
        transport::SignalingTransport,
    },
    webrtc::{
        ConnectionObservation, ConnectionState, ConnectionStats, MediaEngine, MediaStream,
        NegotiationAdapter, SessionDescription,
    },
};

/// The media stream type a platform's engine produces.
pub type StreamOf<P> = <<P as CallPlatform>::Engine as MediaEngine>::Stream;

/// Sessions the processed-id and dead-session sets may grow to before
/// being reset; anything older than the poll window can never replay.
const DEAD_SESSION_CAP: usize = 64;

/// The different kinds of events driving the state machine.
pub enum SessionEvent<S: MediaStream> {
    // Control events from the application
    /// Start an outgoing call.
    StartCall(CallMediaType),
    /// Accept the ringing incoming call (callee only).
    AnswerCall { video: bool },
    /// Decline the ringing incoming call (callee only).
    DeclineCall,
    /// Hang up; the single, idempotent cancellation entry point.
    EndCall,
    /// Flip the local audio track.
    ToggleAudio,
    /// Flip the local video track.
    ToggleVideo,
    /// Switch the active camera.
    SwitchCamera,
    /// Snapshot the media connection statistics.
    QueryStats(oneshot::Sender<Option<ConnectionStats>>),

    // Signaling events from the transport
    /// An envelope was delivered (at least once) by push or poll.
    Signal(Envelope),

    // Observations from the media connection
    Observation(SessionId, ConnectionObservation<S>),

    // Internally generated events
    /// The caller-side no-answer timer fired.
    OutgoingTimeout(SessionId),
    /// The callee-side auto-decline timer fired.
    IncomingTimeout(SessionId),
    /// The post-call settle delay elapsed; return to idle.
    EndedSettle(SessionId),
    /// Flush the event queue (used by tests).
    Synchronize(oneshot::Sender<()>),
    /// Tear the state machine down.
    Shutdown,
}

impl<S: MediaStream> fmt::Display for SessionEvent<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let display = match self {
            Self::StartCall(media_type) => format!("StartCall({})", media_type),
            Self::AnswerCall { video } => format!("AnswerCall(video: {})", video),
            Self::DeclineCall => "DeclineCall".to_string(),
            Self::EndCall => "EndCall".to_string(),
            Self::ToggleAudio => "ToggleAudio".to_string(),
            Self::ToggleVideo => "ToggleVideo".to_string(),
            Self::SwitchCamera => "SwitchCamera".to_string(),
            Self::QueryStats(_) => "QueryStats".to_string(),
            Self::Signal(envelope) => format!("Signal({})", envelope),
            Self::Observation(id, _) => format!("Observation(session: {})", id),
            Self::OutgoingTimeout(id) => format!("OutgoingTimeout(session: {})", id),
            Self::IncomingTimeout(id) => format!("IncomingTimeout(session: {})", id),
            Self::EndedSettle(id) => format!("EndedSettle(session: {})", id),
            Self::Synchronize(_) => "Synchronize".to_string(),
            Self::Shutdown => "Shutdown".to_string(),
        };
        write!(f, "{}", display)
    }
}

/// Read-only view of the state machine, shared with the controller.
pub struct SharedState {
    pub state: CallState,
    pub session_id: Option<SessionId>,
    pub has_local_stream: bool,
    pub has_remote_stream: bool,
}

impl SharedState {
    pub fn idle() -> Self {
        Self {
            state: CallState::Idle,
            session_id: None,
            has_local_stream: false,
            has_remote_stream: false,
        }
    }
}

/// The state machine proper: owns the session, the timers, the
/// processed-id set, and the transport send path.
pub struct SessionFsm<P: CallPlatform, S: SignalStore> {
    platform: Arc<P>,
    transport: SignalingTransport<S>,
    conversation_id: ConversationId,
    remote_user: UserId,
    config: CallConfig,

    events_tx: mpsc::UnboundedSender<SessionEvent<StreamOf<P>>>,
    timers: super::timeout::CallTimeoutManager<SessionEvent<StreamOf<P>>>,
    observation_forwarder: Option<JoinHandle<()>>,

    session: Option<CallSession<P::Engine>>,
    /// Envelope ids already applied; cleared when the session settles.
    processed: HashSet<Uuid>,
    /// Session ids known to be over; late envelopes for them are dropped.
    dead_sessions: HashSet<SessionId>,

    observers: Arc<Observers>,
    shared: Arc<CallMutex<SharedState>>,
}

impl<P: CallPlatform, S: SignalStore> SessionFsm<P, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        platform: Arc<P>,
        transport: SignalingTransport<S>,
        conversation_id: ConversationId,
        remote_user: UserId,
        config: CallConfig,
        events_tx: mpsc::UnboundedSender<SessionEvent<StreamOf<P>>>,
        observers: Arc<Observers>,
        shared: Arc<CallMutex<SharedState>>,
    ) -> Self {
        let timers = super::timeout::CallTimeoutManager::new(events_tx.clone());
        Self {
            platform,
            transport,
            conversation_id,
            remote_user,
            config,
            events_tx,
            timers,
            observation_forwarder: None,
            session: None,
            processed: HashSet::new(),
            dead_sessions: HashSet::new(),
            observers,
            shared,
        }
    }

    /// Consumes the event stream until shutdown.
    pub async fn run(mut self, mut events_rx: mpsc::UnboundedReceiver<SessionEvent<StreamOf<P>>>) {
        while let Some(event) = events_rx.recv().await {
            if matches!(event, SessionEvent::Shutdown) {
                break;
            }
            self.handle_event(event).await;
        }
        self.shutdown().await;
    }

    async fn handle_event(&mut self, event: SessionEvent<StreamOf<P>>) {
        debug!("fsm: {}", event);
        let result = match event {
            SessionEvent::StartCall(media_type) => self.handle_start_call(media_type).await,
            SessionEvent::AnswerCall { video } => self.handle_answer_call(video).await,
            SessionEvent::DeclineCall => self.handle_decline_call().await,
            SessionEvent::EndCall => self.handle_end_call().await,
            SessionEvent::ToggleAudio => self.handle_toggle_audio(),
            SessionEvent::ToggleVideo => self.handle_toggle_video(),
            SessionEvent::SwitchCamera => self.handle_switch_camera(),
            SessionEvent::QueryStats(reply) => {
                let _ = reply.send(self.stats_snapshot());
                Ok(())
            }
            SessionEvent::Signal(envelope) => self.handle_signal(envelope).await,
            SessionEvent::Observation(session_id, observation) => {
                self.handle_observation(session_id, observation).await
            }
            SessionEvent::OutgoingTimeout(session_id) => {
                self.handle_outgoing_timeout(session_id).await
            }
            SessionEvent::IncomingTimeout(session_id) => {
                self.handle_incoming_timeout(session_id).await
            }
            SessionEvent::EndedSettle(session_id) => self.handle_ended_settle(session_id),
            SessionEvent::Synchronize(reply) => {
                let _ = reply.send(());
                Ok(())
            }
            SessionEvent::Shutdown => Ok(()),
        };

        // Uncaught handler errors are internal failures: convert to a
        // state transition plus a notification, never propagate.
        if let Err(e) = result {
            error!("fsm: handler failed: {}", e);
            let _ = self
                .end_session(ApplicationEvent::EndedInternalFailure, true)
                .await;
        }
    }

    fn state(&self) -> CallState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(CallState::Idle)
    }

    // ------------------------------------------------------------------
    // Control events

    async fn handle_start_call(&mut self, media_type: CallMediaType) -> Result<()> {
        if self.state() != CallState::Idle {
            warn!("start_call(): rejected, state: {}", self.state());
            return Ok(());
        }

        // Suspension point: may block on an OS prompt indefinitely.
        if !self.request_permission(media_type).await {
            self.notify_permission_denied(media_type);
            return Ok(());
        }

        let session_id = SessionId::random();
        info!(
            "start_call(): session: {}, type: {}",
            session_id, media_type
        );

        self.session = Some(CallSession::outgoing(session_id, media_type));
        self.update_shared();
        self.timers.arm_outgoing(
            self.config.outgoing_timeout,
            SessionEvent::OutgoingTimeout(session_id),
        );
        self.platform
            .log_event(&self.conversation_id, "call_started", session_id);

        match self.setup_outgoing_media(session_id, media_type).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("start_call(): offer failed, session: {}: {}", session_id, e);
                self.end_session(ApplicationEvent::EndedSignalingFailure, false)
                    .await
            }
        }
    }

    /// Opens local media, builds the connection, sends the offer.
    async fn setup_outgoing_media(
        &mut self,
        session_id: SessionId,
        media_type: CallMediaType,
    ) -> Result<()> {
        let (stream, mut adapter) = self.create_media(session_id, media_type)?;
        let offer = adapter.create_offer().await?;

        if let Some(session) = self.session.as_mut() {
            session.local_stream = Some(stream);
            session.adapter = Some(adapter);
        }
        self.update_shared();

        self.transport
            .send(OutboundSignal {
                receiver_id: self.remote_user.clone(),
                session_id,
                call_type: media_type,
                message: Message::Offer(Offer {
                    call_media_type: media_type,
                    sdp: offer.sdp,
                }),
            })
            .await?;

        if let Some(session) = self.session.as_mut() {
            session.signaled = true;
        }
        Ok(())
    }

    async fn handle_answer_call(&mut self, video: bool) -> Result<()> {
        let (session_id, call_type) = match self.session.as_ref() {
            Some(session) if session.state == CallState::Ringing => {
                (session.session_id, session.call_type)
            }
            _ => {
                warn!("answer_call(): rejected, state: {}", self.state());
                return Ok(());
            }
        };

        self.timers.clear_incoming();

        let media_type = if video && call_type.has_video() {
            CallMediaType::Video
        } else {
            CallMediaType::Audio
        };

        if !self.request_permission(media_type).await {
            self.notify_permission_denied(media_type);
            // The caller must not be left ringing forever against a
            // callee that can never answer.
            self.send_call_end(session_id, call_type).await;
            return self.end_session(ApplicationEvent::EndedDeclined, false).await;
        }

        info!("answer_call(): session: {}, type: {}", session_id, media_type);

        if let Some(session) = self.session.as_mut() {
            session.state = CallState::Connecting;
        }
        self.update_shared();
        self.observers.dispatch(ApplicationEvent::Connecting);

        match self.setup_incoming_media(session_id, media_type).await {
            Ok(()) => {
                self.platform
                    .log_event(&self.conversation_id, "call_answered", session_id);
                Ok(())
            }
            Err(e) => {
                error!(
                    "answer_call(): negotiation failed, session: {}: {}",
                    session_id, e
                );
                self.end_session(ApplicationEvent::EndedNegotiationFailure, true)
                    .await
            }
        }
    }

    /// Applies the stored remote offer, drains ringing-phase candidates,
    /// sends the answer.
    async fn setup_incoming_media(
        &mut self,
        session_id: SessionId,
        media_type: CallMediaType,
    ) -> Result<()> {
        let (stream, mut adapter) = self.create_media(session_id, media_type)?;

        let (offer, early_candidates, call_type) = match self.session.as_mut() {
            Some(session) => (
                session.pending_remote_offer.take().ok_or_else(|| {
                    crate::error::CallError::OptionValueNotSet(
                        "setup_incoming_media".to_string(),
                        "pending_remote_offer".to_string(),
                    )
                })?,
                std::mem::take(&mut session.ringing_candidates),
                session.call_type,
            ),
            None => return Err(crate::error::CallError::NoActiveCall.into()),
        };

        adapter.set_remote_description(offer).await?;
        for candidate in early_candidates {
            adapter.add_ice_candidate(candidate).await?;
        }
        let answer = adapter.create_answer().await?;

        if let Some(session) = self.session.as_mut() {
            session.local_stream = Some(stream);
            session.adapter = Some(adapter);
        }
        self.update_shared();

        self.transport
            .send(OutboundSignal {
                receiver_id: self.remote_user.clone(),
                session_id,
                call_type,
                message: Message::Answer(Answer { sdp: answer.sdp }),
            })
            .await?;

        if let Some(session) = self.session.as_mut() {
            session.signaled = true;
        }
        Ok(())
    }

    async fn handle_decline_call(&mut self) -> Result<()> {
        let (session_id, call_type) = match self.session.as_ref() {
            Some(session) if session.state == CallState::Ringing => {
                (session.session_id, session.call_type)
            }
            _ => {
                warn!("decline_call(): rejected, state: {}", self.state());
                return Ok(());
            }
        };

        info!("decline_call(): session: {}", session_id);
        self.timers.clear_incoming();
        self.send_call_end(session_id, call_type).await;
        self.end_session(ApplicationEvent::EndedDeclined, false).await
    }

    async fn handle_end_call(&mut self) -> Result<()> {
        match self.session.as_ref() {
            None => Ok(()), // already idle: a no-op, not an error
            Some(session) if session.state == CallState::Ended => Ok(()),
            Some(session) => {
                info!("end_call(): session: {}", session.session_id);
                // An incoming session has a known remote party from the
                // offer alone; their ring must stop even though we never
                // emitted any signaling of our own.
                let send = session.signaled || session.direction == CallDirection::Incoming;
                self.end_session(ApplicationEvent::EndedLocalHangup, send)
                    .await
            }
        }
    }

    fn handle_toggle_audio(&mut self) -> Result<()> {
        if let Some(stream) = self.local_stream() {
            stream.set_audio_enabled(!stream.audio_enabled());
        }
        Ok(())
    }

    fn handle_toggle_video(&mut self) -> Result<()> {
        if let Some(stream) = self.local_stream() {
            stream.set_video_enabled(!stream.video_enabled());
        }
        Ok(())
    }

    fn handle_switch_camera(&mut self) -> Result<()> {
        if let Some(stream) = self.local_stream() {
            if let Err(e) = stream.switch_camera() {
                warn!("switch_camera(): {}", e);
            }
        }
        Ok(())
    }

    fn local_stream(&self) -> Option<&StreamOf<P>> {
        self.session.as_ref().and_then(|s| s.local_stream.as_ref())
    }

    fn stats_snapshot(&self) -> Option<ConnectionStats> {
        let session = self.session.as_ref()?;
        if !matches!(session.state, CallState::Connecting | CallState::Connected) {
            return None;
        }
        session.adapter.as_ref().map(|a| a.stats())
    }

    // ------------------------------------------------------------------
    // Signaling events

    async fn handle_signal(&mut self, envelope: Envelope) -> Result<()> {
        if self.processed.len() > DEAD_SESSION_CAP * 16 {
            self.processed.clear();
        }
        if !self.processed.insert(envelope.id) {
            // Delivered again by the redundant path; already applied.
            return Ok(());
        }

        let message = match envelope.message() {
            Ok(message) => message,
            Err(e) => {
                warn!("dropping undecodable envelope {}: {}", envelope, e);
                return Ok(());
            }
        };

        match message {
            Message::Offer(offer) => self.handle_received_offer(envelope, offer).await,
            Message::Answer(answer) => self.handle_received_answer(envelope, answer).await,
            Message::Ice(candidate) => self.handle_received_ice(envelope, candidate).await,
            Message::CallEnd => self.handle_received_call_end(envelope).await,
        }
    }

    async fn handle_received_offer(&mut self, envelope: Envelope, offer: Offer) -> Result<()> {
        let session_id = envelope.session_id;
        if self.dead_sessions.contains(&session_id) {
            debug!("offer for already-ended session {}, ignoring", session_id);
            return Ok(());
        }

        match self.session.as_ref() {
            Some(active) if active.session_id == session_id => {
                debug!("duplicate offer for active session {}", session_id);
                Ok(())
            }
            Some(active) => {
                // Busy: decline the new attempt without disturbing the
                // active call.
                info!(
                    "busy: declining offer session: {} while active: {}",
                    session_id, active.session_id
                );
                self.remember_dead(session_id);
                self.send_call_end_to(
                    envelope.sender_id.clone(),
                    session_id,
                    envelope.call_type,
                )
                .await;
                self.platform.notify(
                    "Missed call",
                    "You received a call while on another call",
                    Severity::Warning,
                );
                self.platform
                    .log_event(&self.conversation_id, "call_missed_busy", session_id);
                Ok(())
            }
            None => {
                info!(
                    "received_offer(): session: {}, type: {}",
                    session_id, offer.call_media_type
                );
                let media_type = offer.call_media_type;
                self.session = Some(CallSession::incoming(
                    session_id,
                    media_type,
                    SessionDescription::offer(offer.sdp),
                ));
                self.update_shared();
                self.timers.arm_incoming(
                    self.config.incoming_timeout,
                    SessionEvent::IncomingTimeout(session_id),
                );
                self.observers.dispatch(ApplicationEvent::IncomingRinging);
                self.platform
                    .log_event(&self.conversation_id, "call_received", session_id);
                Ok(())
            }
        }
    }

    async fn handle_received_answer(&mut self, envelope: Envelope, answer: Answer) -> Result<()> {
        let session_id = envelope.session_id;
        match self.session.as_ref() {
            Some(session)
                if session.session_id == session_id
                    && session.direction == CallDirection::Outgoing
                    && session.state == CallState::Initiating => {}
            _ => {
                debug!(
                    "stale answer, session: {}, state: {}",
                    session_id,
                    self.state()
                );
                return Ok(());
            }
        }

        info!("received_answer(): session: {}", session_id);
        self.timers.clear_outgoing();
        if let Some(session) = self.session.as_mut() {
            session.state = CallState::Connecting;
        }
        self.update_shared();
        self.observers.dispatch(ApplicationEvent::Connecting);

        let applied = match self.session.as_mut().and_then(|s| s.adapter.as_mut()) {
            Some(adapter) => {
                adapter
                    .set_remote_description(SessionDescription::answer(answer.sdp))
                    .await
            }
            None => Err(crate::error::CallError::OptionValueNotSet(
                "handle_received_answer".to_string(),
                "adapter".to_string(),
            )
            .into()),
        };

        match applied {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(
                    "negotiation failure applying answer, session: {}: {}",
                    session_id, e
                );
                self.end_session(ApplicationEvent::EndedNegotiationFailure, true)
                    .await
            }
        }
    }

    async fn handle_received_ice(
        &mut self,
        envelope: Envelope,
        candidate: IceCandidate,
    ) -> Result<()> {
        let session_id = envelope.session_id;
        let matches_active = self
            .session
            .as_ref()
            .map(|s| s.session_id == session_id && s.state.is_active())
            .unwrap_or(false);
        if !matches_active {
            debug!("stale ice candidate for session {}", session_id);
            return Ok(());
        }

        let applied = match self.session.as_mut() {
            Some(session) => match session.adapter.as_mut() {
                Some(adapter) => adapter.add_ice_candidate(candidate).await,
                None => {
                    // Still ringing: no adapter exists yet. Buffer at the
                    // session so logical order survives the transport.
                    session.ringing_candidates.push(candidate);
                    Ok(())
                }
            },
            None => Ok(()),
        };

        match applied {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(
                    "negotiation failure applying candidate, session: {}: {}",
                    session_id, e
                );
                self.end_session(ApplicationEvent::EndedNegotiationFailure, true)
                    .await
            }
        }
    }

    async fn handle_received_call_end(&mut self, envelope: Envelope) -> Result<()> {
        let session_id = envelope.session_id;
        self.remember_dead(session_id);

        let state = match self.session.as_mut() {
            Some(session) if session.session_id == session_id => {
                session.remote_ended = true;
                session.state
            }
            _ => {
                debug!("call-end for inactive session {}", session_id);
                return Ok(());
            }
        };

        info!("received_call_end(): session: {}, state: {}", session_id, state);
        let event = match state {
            // The caller hung up before we ever answered.
            CallState::Ringing => {
                self.platform
                    .notify("Missed call", "The caller hung up", Severity::Info);
                ApplicationEvent::EndedRemoteHangup
            }
            // Still waiting for an answer that will now never come: the
            // callee declined or auto-declined. The protocol has no
            // separate decline message, so both read as "no answer".
            CallState::Initiating => ApplicationEvent::EndedNoAnswer,
            _ => ApplicationEvent::EndedRemoteHangup,
        };
        self.end_session(event, false).await
    }

    // ------------------------------------------------------------------
    // Connection observations

    async fn handle_observation(
        &mut self,
        session_id: SessionId,
        observation: ConnectionObservation<StreamOf<P>>,
    ) -> Result<()> {
        let matches_active = self
            .session
            .as_ref()
            .map(|s| s.session_id == session_id)
            .unwrap_or(false);
        if !matches_active {
            return Ok(());
        }

        match observation {
            ConnectionObservation::StateChange(state) => {
                self.handle_connection_state(session_id, state).await
            }
            ConnectionObservation::RemoteStream(stream) => {
                if let Some(session) = self.session.as_mut() {
                    if session.remote_stream.is_none() {
                        session.remote_stream = Some(stream);
                        self.update_shared();
                        self.observers.dispatch(ApplicationEvent::RemoteStreamAdded);
                    }
                }
                Ok(())
            }
            ConnectionObservation::LocalCandidate(candidate) => {
                let call_type = match self.session.as_ref() {
                    Some(session) if session.state.is_active() => session.call_type,
                    _ => return Ok(()),
                };
                let sent = self
                    .transport
                    .send(OutboundSignal {
                        receiver_id: self.remote_user.clone(),
                        session_id,
                        call_type,
                        message: Message::Ice(candidate),
                    })
                    .await;
                if let Err(e) = sent {
                    // Delivery failure alone never aborts a call; if the
                    // candidate mattered, a timeout resolves it.
                    warn!("failed to send ice candidate: {}", e);
                }
                Ok(())
            }
        }
    }

    async fn handle_connection_state(
        &mut self,
        session_id: SessionId,
        connection_state: ConnectionState,
    ) -> Result<()> {
        debug!(
            "connection state: {}, session: {}",
            connection_state, session_id
        );
        let state = self.state();
        match connection_state {
            ConnectionState::Connected => {
                if state == CallState::Connecting {
                    info!("call connected, session: {}", session_id);
                    self.timers.clear_outgoing();
                    if let Some(session) = self.session.as_mut() {
                        session.state = CallState::Connected;
                    }
                    self.update_shared();
                    self.observers.dispatch(ApplicationEvent::Connected);
                    self.platform
                        .log_event(&self.conversation_id, "call_connected", session_id);
                }
                Ok(())
            }
            _ if connection_state.is_terminal() => {
                if matches!(state, CallState::Connecting | CallState::Connected) {
                    warn!(
                        "connection lost ({}), session: {}",
                        connection_state, session_id
                    );
                    let send = self.session.as_ref().map(|s| s.signaled).unwrap_or(false);
                    self.end_session(ApplicationEvent::EndedConnectionFailure, send)
                        .await
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Timer events

    async fn handle_outgoing_timeout(&mut self, session_id: SessionId) -> Result<()> {
        match self.session.as_ref() {
            Some(session)
                if session.session_id == session_id
                    && matches!(
                        session.state,
                        CallState::Initiating | CallState::Connecting
                    ) => {}
            _ => return Ok(()), // raced with answer or teardown
        }

        info!("outgoing timeout: no answer, session: {}", session_id);
        let send = self.session.as_ref().map(|s| s.signaled).unwrap_or(false);
        self.end_session(ApplicationEvent::EndedNoAnswer, send).await
    }

    async fn handle_incoming_timeout(&mut self, session_id: SessionId) -> Result<()> {
        let call_type = match self.session.as_ref() {
            Some(session)
                if session.session_id == session_id && session.state == CallState::Ringing =>
            {
                session.call_type
            }
            _ => return Ok(()),
        };

        info!("incoming timeout: auto-declining, session: {}", session_id);
        // Resolving here, before the caller's own (longer) timer fires,
        // is what keeps the two sides' end reasons consistent.
        self.send_call_end(session_id, call_type).await;
        self.platform
            .log_event(&self.conversation_id, "call_missed", session_id);
        self.end_session(ApplicationEvent::EndedMissed, false).await
    }

    fn handle_ended_settle(&mut self, session_id: SessionId) -> Result<()> {
        match self.session.as_ref() {
            Some(session)
                if session.session_id == session_id && session.state == CallState::Ended =>
            {
                debug!("session {} settled, returning to idle", session_id);
                self.session = None;
                self.processed.clear();
                self.update_shared();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Internals

    /// Opens the local stream and builds the peer connection + adapter.
    fn create_media(
        &mut self,
        session_id: SessionId,
        media_type: CallMediaType,
    ) -> Result<(StreamOf<P>, NegotiationAdapter<<P::Engine as MediaEngine>::Connection>)> {
        let engine = self.platform.media_engine();
        let stream = engine.open_local_stream(media_type)?;

        let (observations_tx, mut observations_rx) = mpsc::unbounded_channel();
        let connection = engine.create_peer_connection(&self.config.ice_servers, observations_tx)?;

        if let Some(previous) = self.observation_forwarder.take() {
            previous.abort();
        }
        let events = self.events_tx.clone();
        self.observation_forwarder = Some(tokio::spawn(async move {
            while let Some(observation) = observations_rx.recv().await {
                if events
                    .send(SessionEvent::Observation(session_id, observation))
                    .is_err()
                {
                    break;
                }
            }
        }));

        let mut adapter = NegotiationAdapter::new(connection);
        adapter.add_local_tracks(&stream)?;
        Ok((stream, adapter))
    }

    async fn request_permission(&self, media_type: CallMediaType) -> bool {
        if !self.platform.request_microphone().await {
            return false;
        }
        if media_type.has_video() {
            return self.platform.request_video().await;
        }
        true
    }

    fn notify_permission_denied(&self, media_type: CallMediaType) {
        info!("permission denied, type: {}", media_type);
        let description = if media_type.has_video() {
            "Camera and microphone access are required for video calls"
        } else {
            "Microphone access is required for calls"
        };
        self.platform
            .notify("Permission needed", description, Severity::Error);
    }

    async fn send_call_end(&mut self, session_id: SessionId, call_type: CallMediaType) {
        self.send_call_end_to(self.remote_user.clone(), session_id, call_type)
            .await;
    }

    async fn send_call_end_to(
        &mut self,
        receiver_id: UserId,
        session_id: SessionId,
        call_type: CallMediaType,
    ) {
        let sent = self
            .transport
            .send(OutboundSignal {
                receiver_id,
                session_id,
                call_type,
                message: Message::CallEnd,
            })
            .await;
        if let Err(e) = sent {
            // The remote side's own timeout covers a lost call-end.
            warn!("failed to send call-end for {}: {}", session_id, e);
        }
    }

    fn remember_dead(&mut self, session_id: SessionId) {
        if self.dead_sessions.len() > DEAD_SESSION_CAP {
            self.dead_sessions.clear();
        }
        self.dead_sessions.insert(session_id);
    }

    /// Winds the active session down to Ended and schedules the settle
    /// back to Idle. Tolerates double-invocation.
    async fn end_session(&mut self, event: ApplicationEvent, send_call_end: bool) -> Result<()> {
        let (session_id, call_type, suppress) = match self.session.as_ref() {
            None => return Ok(()),
            Some(session) if session.state == CallState::Ended => return Ok(()),
            Some(session) => (
                session.session_id,
                session.call_type,
                session.remote_ended,
            ),
        };

        info!("end_session(): session: {}, event: {}", session_id, event);
        self.timers.clear_all();
        if let Some(forwarder) = self.observation_forwarder.take() {
            forwarder.abort();
        }

        if send_call_end && !suppress {
            self.send_call_end(session_id, call_type).await;
        }

        if let Some(session) = self.session.as_mut() {
            session.stop_media();
            session.state = CallState::Ended;
        }
        self.remember_dead(session_id);
        self.update_shared();

        self.observers.dispatch(event);
        if let Some((title, description, severity)) = end_notification(event) {
            self.platform.notify(title, description, severity);
        }
        self.platform
            .log_event(&self.conversation_id, "call_ended", session_id);

        let events = self.events_tx.clone();
        let delay = self.config.ended_settle_delay;
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = events.send(SessionEvent::EndedSettle(session_id));
        });
        Ok(())
    }

    fn update_shared(&self) {
        if let Ok(mut shared) = self.shared.lock() {
            match self.session.as_ref() {
                Some(session) => {
                    shared.state = session.state;
                    shared.session_id = Some(session.session_id);
                    shared.has_local_stream = session.local_stream.is_some();
                    shared.has_remote_stream = session.remote_stream.is_some();
                }
                None => *shared = SharedState::idle(),
            }
        }
    }

    async fn shutdown(&mut self) {
        if self.state().is_active() {
            let send = self
                .session
                .as_ref()
                .map(|s| s.signaled || s.direction == CallDirection::Incoming)
                .unwrap_or(false);
            let _ = self
                .end_session(ApplicationEvent::EndedLocalHangup, send)
                .await;
        }
        self.session = None;
        self.update_shared();
        self.timers.clear_all();
        if let Some(forwarder) = self.observation_forwarder.take() {
            forwarder.abort();
        }
        self.transport.detach();
    }
}

/// User-facing toast for a terminal event, when one is warranted.
fn end_notification(event: ApplicationEvent) -> Option<(&'static str, &'static str, Severity)> {
    match event {
        ApplicationEvent::EndedNoAnswer => Some((
            "No answer",
            "The other side didn't pick up",
            Severity::Info,
        )),
        ApplicationEvent::EndedMissed => {
            Some(("Missed call", "You missed a call", Severity::Info))
        }
        ApplicationEvent::EndedSignalingFailure => Some((
            "Call failed",
            "Couldn't reach the other side",
            Severity::Error,
        )),
        ApplicationEvent::EndedNegotiationFailure => {
            Some(("Call failed", "Media negotiation failed", Severity::Error))
        }
        ApplicationEvent::EndedConnectionFailure => {
            Some(("Call dropped", "The connection was lost", Severity::Error))
        }
        ApplicationEvent::EndedInternalFailure => {
            Some(("Call failed", "An internal error occurred", Severity::Error))
        }
        _ => None,
    }
}
