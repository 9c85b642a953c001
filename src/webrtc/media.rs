//
// Copyright 2026 Peerline Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Media stream handles.

use std::fmt;

use crate::common::Result;

/// A handle to a local or remote media stream.
///
/// Handles are cheap clones of the same underlying stream; enabling or
/// stopping through any clone affects them all. The local stream of a
/// call is exclusively owned by that session until the call ends.
pub trait MediaStream: Clone + Send + Sync + fmt::Debug + 'static {
    fn audio_enabled(&self) -> bool;
    fn set_audio_enabled(&self, enabled: bool);

    fn video_enabled(&self) -> bool;
    fn set_video_enabled(&self, enabled: bool);

    /// Switch between the available cameras, if any.
    fn switch_camera(&self) -> Result<()>;

    /// Stop all tracks and release the underlying devices. Idempotent.
    fn stop(&self);
}
