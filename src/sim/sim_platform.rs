//
// Copyright 2026 Peerline Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Simulation CallPlatform: scripted permissions, recorded notifications
//! and analytics.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};

use async_trait::async_trait;
use log::info;

use crate::{
    common::{ConversationId, SessionId, Severity},
    core::platform::{AnalyticsSink, CallPlatform, NotificationSink, PermissionGate},
    sim::sim_media::SimMediaEngine,
};

pub struct SimPlatform {
    engine: SimMediaEngine,
    allow_microphone: AtomicBool,
    allow_video: AtomicBool,
    notifications: Mutex<Vec<(String, String, Severity)>>,
    analytics: Mutex<Vec<(ConversationId, String, SessionId)>>,
}

impl SimPlatform {
    pub fn new() -> Self {
        Self {
            engine: SimMediaEngine::new(),
            allow_microphone: AtomicBool::new(true),
            allow_video: AtomicBool::new(true),
            notifications: Mutex::new(Vec::new()),
            analytics: Mutex::new(Vec::new()),
        }
    }

    pub fn engine(&self) -> &SimMediaEngine {
        &self.engine
    }

    pub fn deny_microphone(&self) {
        self.allow_microphone.store(false, Ordering::SeqCst);
    }

    pub fn deny_video(&self) {
        self.allow_video.store(false, Ordering::SeqCst);
    }

    pub fn notifications(&self) -> Vec<(String, String, Severity)> {
        self.notifications.lock().expect("sim platform lock").clone()
    }

    pub fn notification_count_titled(&self, title: &str) -> usize {
        self.notifications
            .lock()
            .expect("sim platform lock")
            .iter()
            .filter(|(t, _, _)| t == title)
            .count()
    }

    pub fn analytics_events(&self) -> Vec<String> {
        self.analytics
            .lock()
            .expect("sim platform lock")
            .iter()
            .map(|(_, event, _)| event.clone())
            .collect()
    }
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PermissionGate for SimPlatform {
    async fn request_microphone(&self) -> bool {
        self.allow_microphone.load(Ordering::SeqCst)
    }

    async fn request_video(&self) -> bool {
        self.allow_video.load(Ordering::SeqCst)
    }
}

impl NotificationSink for SimPlatform {
    fn notify(&self, title: &str, description: &str, severity: Severity) {
        info!("sim notify: [{:?}] {}: {}", severity, title, description);
        self.notifications.lock().expect("sim platform lock").push((
            title.to_string(),
            description.to_string(),
            severity,
        ));
    }
}

impl AnalyticsSink for SimPlatform {
    fn log_event(&self, conversation_id: &ConversationId, event_type: &str, session_id: SessionId) {
        self.analytics.lock().expect("sim platform lock").push((
            conversation_id.clone(),
            event_type.to_string(),
            session_id,
        ));
    }
}

impl CallPlatform for SimPlatform {
    type Engine = SimMediaEngine;

    fn media_engine(&self) -> &Self::Engine {
        &self.engine
    }
}
