//
// Copyright 2026 Peerline Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Peer connection trait and the negotiation adapter wrapped around it.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use log::debug;
use tokio::sync::mpsc;

use crate::{
    common::{CallMediaType, Result},
    core::signaling::IceCandidate,
    webrtc::media::MediaStream,
};

/// The kind of a session description.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

/// A media session description, one half of the offer/answer exchange.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionDescription {
    pub typ: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: String) -> Self {
        Self {
            typ: SdpType::Offer,
            sdp,
        }
    }

    pub fn answer(sdp: String) -> Self {
        Self {
            typ: SdpType::Answer,
            sdp,
        }
    }
}

/// Connection states reported by the negotiation primitive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// True for states from which the connection never recovers.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A read-only snapshot of the media connection.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectionStats {
    pub rtt: Option<Duration>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Asynchronous observations surfaced by the negotiation primitive.
#[derive(Debug)]
pub enum ConnectionObservation<S> {
    /// The connection state changed.
    StateChange(ConnectionState),
    /// The remote media stream arrived.
    RemoteStream(S),
    /// A local connectivity candidate is ready to be signaled.
    LocalCandidate(IceCandidate),
}

/// The native media-negotiation primitive.
///
/// Implementations surface their asynchronous observations through the
/// channel handed to [`MediaEngine::create_peer_connection`].
/// `Sync` is required because the owning session is borrowed across
/// suspension points on the state machine task.
#[async_trait]
pub trait PeerConnection: Send + Sync + 'static {
    type Stream: MediaStream;

    async fn create_offer(&mut self) -> Result<SessionDescription>;
    async fn create_answer(&mut self) -> Result<SessionDescription>;
    async fn set_remote_description(&mut self, description: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()>;

    /// Attach the local stream's tracks to the connection.
    fn add_local_tracks(&mut self, stream: &Self::Stream) -> Result<()>;

    fn stats(&self) -> ConnectionStats;

    /// Close the connection and release resources. Idempotent.
    fn close(&mut self);
}

/// Factory for media streams and peer connections.
pub trait MediaEngine: Send + Sync + 'static {
    type Stream: MediaStream;
    type Connection: PeerConnection<Stream = Self::Stream>;

    /// Open the local capture stream for the given media type.
    fn open_local_stream(&self, media_type: CallMediaType) -> Result<Self::Stream>;

    /// Construct a peer connection against the configured
    /// reflection/relay servers.
    fn create_peer_connection(
        &self,
        ice_servers: &[String],
        observations: mpsc::UnboundedSender<ConnectionObservation<Self::Stream>>,
    ) -> Result<Self::Connection>;
}

/// Wraps a peer connection with tolerance for out-of-order signaling.
///
/// Under the dual push/poll transport, remote ICE candidates routinely
/// arrive before the remote description. The primitive rejects those, so
/// the adapter buffers them and flushes the buffer, in arrival order,
/// immediately after the remote description is applied.
pub struct NegotiationAdapter<C: PeerConnection> {
    connection: C,
    remote_description_set: bool,
    pending_remote_candidates: Vec<IceCandidate>,
    closed: bool,
}

impl<C: PeerConnection> NegotiationAdapter<C> {
    pub fn new(connection: C) -> Self {
        Self {
            connection,
            remote_description_set: false,
            pending_remote_candidates: Vec::new(),
            closed: false,
        }
    }

    pub async fn create_offer(&mut self) -> Result<SessionDescription> {
        self.connection.create_offer().await
    }

    pub async fn create_answer(&mut self) -> Result<SessionDescription> {
        self.connection.create_answer().await
    }

    /// Applies the remote description, then flushes any candidates that
    /// arrived ahead of it.
    pub async fn set_remote_description(&mut self, description: SessionDescription) -> Result<()> {
        self.connection.set_remote_description(description).await?;
        self.remote_description_set = true;

        let pending = std::mem::take(&mut self.pending_remote_candidates);
        if !pending.is_empty() {
            debug!(
                "negotiation adapter: flushing {} early candidate(s)",
                pending.len()
            );
        }
        for candidate in pending {
            self.connection.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    pub async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        if !self.remote_description_set {
            self.pending_remote_candidates.push(candidate);
            return Ok(());
        }
        self.connection.add_ice_candidate(candidate).await
    }

    pub fn add_local_tracks(&mut self, stream: &C::Stream) -> Result<()> {
        self.connection.add_local_tracks(stream)
    }

    pub fn stats(&self) -> ConnectionStats {
        self.connection.stats()
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.pending_remote_candidates.len()
    }

    /// Close the underlying connection. Safe to call more than once.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.pending_remote_candidates.clear();
            self.connection.close();
        }
    }
}

impl<C: PeerConnection> Drop for NegotiationAdapter<C> {
    fn drop(&mut self) {
        self.close();
    }
}
