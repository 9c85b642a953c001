//
// Copyright 2026 Peerline Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Traits describing what the embedding application must provide for
//! calling, plus the observer registry the controller dispatches
//! application events through.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use log::warn;

use crate::{
    common::{ApplicationEvent, ConversationId, SessionId, Severity},
    core::call_mutex::CallMutex,
    webrtc::MediaEngine,
};

/// Device permission prompts. These may block on a user-facing OS
/// prompt of unbounded duration.
#[async_trait]
pub trait PermissionGate {
    async fn request_microphone(&self) -> bool;
    async fn request_video(&self) -> bool;
}

/// Fire-and-forget user-visible notifications (toasts).
pub trait NotificationSink {
    fn notify(&self, title: &str, description: &str, severity: Severity);
}

/// Optional observational event log; not required for correctness.
pub trait AnalyticsSink {
    fn log_event(&self, _conversation_id: &ConversationId, _event_type: &str, _session_id: SessionId) {}
}

/// Everything the application provides to a call session controller.
pub trait CallPlatform:
    PermissionGate + NotificationSink + AnalyticsSink + Send + Sync + 'static
{
    type Engine: MediaEngine;

    fn media_engine(&self) -> &Self::Engine;
}

/// A registered application-event handler.
pub type ObserverCallback = Box<dyn Fn(ApplicationEvent) + Send + Sync>;

struct ObserverSet {
    next_id: u64,
    // Arcs so dispatch can snapshot the handlers and release the lock
    // before invoking them; a handler may re-enter the registry.
    handlers: HashMap<u64, Arc<dyn Fn(ApplicationEvent) + Send + Sync>>,
}

/// Observer registry owned by one controller instance; never a
/// process-wide registry.
pub struct Observers {
    inner: Arc<CallMutex<ObserverSet>>,
}

impl Observers {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CallMutex::new(
                ObserverSet {
                    next_id: 0,
                    handlers: HashMap::new(),
                },
                "observers",
            )),
        }
    }

    /// Registers a handler; dropping (or explicitly unregistering) the
    /// returned handle removes it.
    pub fn register(&self, handler: ObserverCallback) -> ObserverHandle {
        let id = match self.inner.lock() {
            Ok(mut set) => {
                let id = set.next_id;
                set.next_id += 1;
                set.handlers.insert(id, Arc::from(handler));
                id
            }
            Err(e) => {
                warn!("observer registry unavailable: {}", e);
                u64::MAX
            }
        };
        ObserverHandle {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub fn dispatch(&self, event: ApplicationEvent) {
        let handlers: Vec<_> = match self.inner.lock() {
            Ok(set) => set.handlers.values().cloned().collect(),
            Err(_) => return,
        };
        for handler in handlers {
            handler(event);
        }
    }
}

impl Default for Observers {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`Observers::register`].
pub struct ObserverHandle {
    id: u64,
    registry: Weak<CallMutex<ObserverSet>>,
}

impl ObserverHandle {
    pub fn unregister(self) {
        // Removal happens in Drop.
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut set) = registry.lock() {
                set.handlers.remove(&self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn unregister_stops_dispatch() {
        let observers = Observers::new();
        let count = Arc::new(AtomicUsize::new(0));

        let seen = count.clone();
        let handle = observers.register(Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        observers.dispatch(ApplicationEvent::Connected);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        handle.unregister();
        observers.dispatch(ApplicationEvent::Connected);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_may_unregister_itself_during_dispatch() {
        let observers = Observers::new();
        let slot: Arc<std::sync::Mutex<Option<ObserverHandle>>> =
            Arc::new(std::sync::Mutex::new(None));

        let own_handle = slot.clone();
        let handle = observers.register(Box::new(move |_| {
            // Dropping the handle removes this registration while the
            // dispatch that invoked it is still in flight.
            let _ = own_handle.lock().unwrap().take();
        }));
        *slot.lock().unwrap() = Some(handle);

        observers.dispatch(ApplicationEvent::Connected);
        observers.dispatch(ApplicationEvent::Connected);
        assert!(slot.lock().unwrap().is_none());
    }
}
