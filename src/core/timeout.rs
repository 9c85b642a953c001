//
// Copyright 2026 Peerline Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Call timeout timers.
//!
//! Two independent single-shot timers per session. The incoming timer is
//! configured strictly shorter than the outgoing one so the callee side
//! of an unanswered call resolves first and its call-end signal reaches
//! the caller before the caller's own timer fires; that keeps the two
//! sides from independently inventing different end reasons.

use std::time::Duration;

use tokio::{sync::mpsc, task::JoinHandle, time::sleep};

/// Arms, clears, and replaces the outgoing/incoming timers. Firing
/// injects the prepared event into the session event stream; whether the
/// event still applies is decided by the state machine, which tags every
/// timer event with its session id.
pub struct CallTimeoutManager<Event: Send + 'static> {
    events: mpsc::UnboundedSender<Event>,
    outgoing: Option<JoinHandle<()>>,
    incoming: Option<JoinHandle<()>>,
}

impl<Event: Send + 'static> CallTimeoutManager<Event> {
    pub fn new(events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            events,
            outgoing: None,
            incoming: None,
        }
    }

    /// Arms the outgoing (caller, no-answer) timer, replacing any
    /// previously armed one.
    pub fn arm_outgoing(&mut self, delay: Duration, event: Event) {
        Self::replace(&mut self.outgoing, self.events.clone(), delay, event);
    }

    /// Arms the incoming (callee, auto-decline) timer, replacing any
    /// previously armed one.
    pub fn arm_incoming(&mut self, delay: Duration, event: Event) {
        Self::replace(&mut self.incoming, self.events.clone(), delay, event);
    }

    pub fn clear_outgoing(&mut self) {
        if let Some(timer) = self.outgoing.take() {
            timer.abort();
        }
    }

    pub fn clear_incoming(&mut self) {
        if let Some(timer) = self.incoming.take() {
            timer.abort();
        }
    }

    pub fn clear_all(&mut self) {
        self.clear_outgoing();
        self.clear_incoming();
    }

    fn replace(
        slot: &mut Option<JoinHandle<()>>,
        events: mpsc::UnboundedSender<Event>,
        delay: Duration,
        event: Event,
    ) {
        if let Some(timer) = slot.take() {
            timer.abort();
        }
        *slot = Some(tokio::spawn(async move {
            sleep(delay).await;
            // The receiver being gone just means the session wound down.
            let _ = events.send(event);
        }));
    }
}

impl<Event: Send + 'static> Drop for CallTimeoutManager<Event> {
    fn drop(&mut self) {
        self.clear_all();
    }
}
