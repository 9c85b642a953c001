//
// Copyright 2026 Peerline Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Simulation of the media engine and the negotiation primitive.
//!
//! Deterministic by construction: a connection reports Connected exactly
//! once, as soon as both descriptions are in place and at least one
//! remote candidate has been applied. Failure injection mirrors the
//! `should_fail` style of scriptable fakes.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    common::{CallMediaType, Result},
    core::signaling::IceCandidate,
    error::CallError,
    webrtc::{
        ConnectionObservation, ConnectionState, ConnectionStats, MediaEngine, MediaStream,
        PeerConnection, SdpType, SessionDescription,
    },
};

// ----------------------------------------------------------------------
// Streams

#[derive(Debug)]
struct StreamInner {
    audio_enabled: bool,
    video_enabled: bool,
    front_camera: bool,
    stopped: bool,
}

/// Simulated media stream; clones share the same underlying tracks.
#[derive(Clone, Debug)]
pub struct SimMediaStream {
    inner: Arc<Mutex<StreamInner>>,
}

impl SimMediaStream {
    fn new(media_type: CallMediaType) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StreamInner {
                audio_enabled: true,
                video_enabled: media_type.has_video(),
                front_camera: true,
                stopped: false,
            })),
        }
    }

    fn remote() -> Self {
        Self::new(CallMediaType::Video)
    }

    pub fn stopped(&self) -> bool {
        self.inner.lock().expect("sim stream lock").stopped
    }

    pub fn front_camera(&self) -> bool {
        self.inner.lock().expect("sim stream lock").front_camera
    }
}

impl MediaStream for SimMediaStream {
    fn audio_enabled(&self) -> bool {
        self.inner.lock().expect("sim stream lock").audio_enabled
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.inner.lock().expect("sim stream lock").audio_enabled = enabled;
    }

    fn video_enabled(&self) -> bool {
        self.inner.lock().expect("sim stream lock").video_enabled
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.inner.lock().expect("sim stream lock").video_enabled = enabled;
    }

    fn switch_camera(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("sim stream lock");
        if inner.stopped {
            return Err(anyhow!("stream already stopped"));
        }
        inner.front_camera = !inner.front_camera;
        Ok(())
    }

    fn stop(&self) {
        let mut inner = self.inner.lock().expect("sim stream lock");
        inner.stopped = true;
        inner.audio_enabled = false;
        inner.video_enabled = false;
    }
}

// ----------------------------------------------------------------------
// Peer connections

#[derive(Default)]
struct ConnectionInner {
    local_description: Option<SdpType>,
    remote_description: Option<SdpType>,
    remote_candidates: usize,
    local_tracks_added: bool,
    connected_emitted: bool,
    closed: bool,
}

/// Scripted failures for connections the engine creates next.
#[derive(Clone, Copy, Default)]
pub struct FailureScript {
    pub fail_create_offer: bool,
    pub fail_create_answer: bool,
    pub fail_set_remote_description: bool,
    pub fail_add_ice_candidate: bool,
}

pub struct SimPeerConnection {
    inner: Arc<Mutex<ConnectionInner>>,
    script: FailureScript,
    events: mpsc::UnboundedSender<ConnectionObservation<SimMediaStream>>,
}

impl SimPeerConnection {
    fn emit(&self, observation: ConnectionObservation<SimMediaStream>) {
        let _ = self.events.send(observation);
    }

    fn trickle_local_candidates(&self) {
        for n in 1..=2 {
            self.emit(ConnectionObservation::LocalCandidate(IceCandidate {
                candidate: format!("sim-candidate-{}", n),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            }));
        }
    }

    fn maybe_connect(&self) {
        let ready = {
            let mut inner = self.inner.lock().expect("sim connection lock");
            let ready = !inner.connected_emitted
                && !inner.closed
                && inner.local_description.is_some()
                && inner.remote_description.is_some()
                && inner.remote_candidates >= 1;
            if ready {
                inner.connected_emitted = true;
            }
            ready
        };
        if ready {
            self.emit(ConnectionObservation::StateChange(
                ConnectionState::Connected,
            ));
            self.emit(ConnectionObservation::RemoteStream(SimMediaStream::remote()));
        }
    }
}

#[async_trait]
impl PeerConnection for SimPeerConnection {
    type Stream = SimMediaStream;

    async fn create_offer(&mut self) -> Result<SessionDescription> {
        if self.script.fail_create_offer {
            return Err(CallError::CreateOffer.into());
        }
        self.inner.lock().expect("sim connection lock").local_description = Some(SdpType::Offer);
        self.trickle_local_candidates();
        Ok(SessionDescription::offer("v=0 sim-offer".to_string()))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription> {
        if self.script.fail_create_answer {
            return Err(CallError::CreateAnswer.into());
        }
        {
            let mut inner = self.inner.lock().expect("sim connection lock");
            if inner.remote_description.is_none() {
                return Err(anyhow!("create_answer before remote offer"));
            }
            inner.local_description = Some(SdpType::Answer);
        }
        self.trickle_local_candidates();
        self.emit(ConnectionObservation::StateChange(
            ConnectionState::Connecting,
        ));
        self.maybe_connect();
        Ok(SessionDescription::answer("v=0 sim-answer".to_string()))
    }

    async fn set_remote_description(&mut self, description: SessionDescription) -> Result<()> {
        if self.script.fail_set_remote_description {
            return Err(anyhow!("sim: set_remote_description failure"));
        }
        let answer_applied = {
            let mut inner = self.inner.lock().expect("sim connection lock");
            inner.remote_description = Some(description.typ);
            description.typ == SdpType::Answer
        };
        if answer_applied {
            // The caller side starts establishing the route now.
            self.emit(ConnectionObservation::StateChange(
                ConnectionState::Connecting,
            ));
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&mut self, _candidate: IceCandidate) -> Result<()> {
        if self.script.fail_add_ice_candidate {
            return Err(anyhow!("sim: add_ice_candidate failure"));
        }
        {
            let mut inner = self.inner.lock().expect("sim connection lock");
            // The primitive rejects candidates ahead of the remote
            // description; the adapter is expected to queue them.
            if inner.remote_description.is_none() {
                return Err(anyhow!("sim: candidate before remote description"));
            }
            inner.remote_candidates += 1;
        }
        self.maybe_connect();
        Ok(())
    }

    fn add_local_tracks(&mut self, _stream: &Self::Stream) -> Result<()> {
        self.inner.lock().expect("sim connection lock").local_tracks_added = true;
        Ok(())
    }

    fn stats(&self) -> ConnectionStats {
        let inner = self.inner.lock().expect("sim connection lock");
        if inner.connected_emitted {
            ConnectionStats {
                rtt: Some(Duration::from_millis(30)),
                bytes_sent: 4200,
                bytes_received: 3700,
            }
        } else {
            ConnectionStats::default()
        }
    }

    fn close(&mut self) {
        self.inner.lock().expect("sim connection lock").closed = true;
    }
}

/// Test-side handle to a connection the engine created; lets a test
/// inject connection-state changes and inspect the connection.
#[derive(Clone)]
pub struct SimConnectionHandle {
    inner: Arc<Mutex<ConnectionInner>>,
    events: mpsc::UnboundedSender<ConnectionObservation<SimMediaStream>>,
}

impl SimConnectionHandle {
    pub fn force_state(&self, state: ConnectionState) {
        let _ = self
            .events
            .send(ConnectionObservation::StateChange(state));
    }

    pub fn closed(&self) -> bool {
        self.inner.lock().expect("sim connection lock").closed
    }

    pub fn local_tracks_added(&self) -> bool {
        self.inner
            .lock()
            .expect("sim connection lock")
            .local_tracks_added
    }

    pub fn remote_candidates(&self) -> usize {
        self.inner
            .lock()
            .expect("sim connection lock")
            .remote_candidates
    }
}

// ----------------------------------------------------------------------
// Engine

pub struct SimMediaEngine {
    script: Mutex<FailureScript>,
    fail_open_stream: AtomicBool,
    streams_opened: AtomicUsize,
    local_streams: Mutex<Vec<SimMediaStream>>,
    connections: Mutex<Vec<SimConnectionHandle>>,
    last_ice_servers: Mutex<Vec<String>>,
}

impl SimMediaEngine {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(FailureScript::default()),
            fail_open_stream: AtomicBool::new(false),
            streams_opened: AtomicUsize::new(0),
            local_streams: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
            last_ice_servers: Mutex::new(Vec::new()),
        }
    }

    /// Applies to connections created after this call.
    pub fn set_failure_script(&self, script: FailureScript) {
        *self.script.lock().expect("sim engine lock") = script;
    }

    pub fn set_fail_open_stream(&self, fail: bool) {
        self.fail_open_stream.store(fail, Ordering::SeqCst);
    }

    pub fn connections_created(&self) -> usize {
        self.connections.lock().expect("sim engine lock").len()
    }

    pub fn connection(&self, index: usize) -> Option<SimConnectionHandle> {
        self.connections
            .lock()
            .expect("sim engine lock")
            .get(index)
            .cloned()
    }

    pub fn streams_opened(&self) -> usize {
        self.streams_opened.load(Ordering::SeqCst)
    }

    pub fn local_stream(&self, index: usize) -> Option<SimMediaStream> {
        self.local_streams
            .lock()
            .expect("sim engine lock")
            .get(index)
            .cloned()
    }

    pub fn last_ice_servers(&self) -> Vec<String> {
        self.last_ice_servers.lock().expect("sim engine lock").clone()
    }
}

impl Default for SimMediaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaEngine for SimMediaEngine {
    type Stream = SimMediaStream;
    type Connection = SimPeerConnection;

    fn open_local_stream(&self, media_type: CallMediaType) -> Result<Self::Stream> {
        if self.fail_open_stream.load(Ordering::SeqCst) {
            return Err(CallError::OpenLocalStream.into());
        }
        let stream = SimMediaStream::new(media_type);
        self.streams_opened.fetch_add(1, Ordering::SeqCst);
        self.local_streams
            .lock()
            .expect("sim engine lock")
            .push(stream.clone());
        Ok(stream)
    }

    fn create_peer_connection(
        &self,
        ice_servers: &[String],
        observations: mpsc::UnboundedSender<ConnectionObservation<Self::Stream>>,
    ) -> Result<Self::Connection> {
        *self.last_ice_servers.lock().expect("sim engine lock") = ice_servers.to_vec();

        let inner = Arc::new(Mutex::new(ConnectionInner::default()));
        let handle = SimConnectionHandle {
            inner: inner.clone(),
            events: observations.clone(),
        };
        self.connections
            .lock()
            .expect("sim engine lock")
            .push(handle);

        Ok(SimPeerConnection {
            inner,
            script: *self.script.lock().expect("sim engine lock"),
            events: observations,
        })
    }
}
