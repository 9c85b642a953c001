//
// Copyright 2026 Peerline Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Simulation implementations of the platform, media, and store seams,
//! used by the integration tests.

pub mod sim_media;
pub mod sim_platform;
pub mod sim_store;

pub use sim_media::{SimConnectionHandle, SimMediaEngine, SimMediaStream, SimPeerConnection};
pub use sim_platform::SimPlatform;
pub use sim_store::{PushMode, SimSignalStore};
