//
// Copyright 2026 Peerline Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Common test utilities

// Requires the 'sim' feature

#![allow(dead_code)]

use std::{
    env,
    sync::{Arc, Mutex},
    time::Duration,
};

use lazy_static::lazy_static;
use log::{info, LevelFilter};
use rand::{
    distributions::{Distribution, Standard},
    Rng, SeedableRng,
};
use rand_chacha::ChaCha20Rng;

use peerline::{
    common::{ApplicationEvent, CallConfig, CallState, ConversationId, UserId},
    sim::{PushMode, SimPlatform, SimSignalStore},
    CallSessionController,
};

pub struct Prng {
    seed: u64,
    rng: Mutex<Option<ChaCha20Rng>>,
}

impl Prng {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: Mutex::new(None),
        }
    }

    // Use a freshly seeded PRNG for each test
    pub fn init(&self) {
        let mut opt = self.rng.lock().unwrap();
        let _ = opt.replace(ChaCha20Rng::seed_from_u64(self.seed));
    }

    pub fn gen<T>(&self) -> T
    where
        Standard: Distribution<T>,
    {
        self.rng.lock().unwrap().as_mut().unwrap().gen::<T>()
    }
}

lazy_static! {
    pub static ref PRNG: Prng = {
        let rand_seed = match env::var("RANDOM_SEED") {
            Ok(v) => v.parse().unwrap(),
            Err(_) => 0,
        };

        println!("\n*** Using random seed: {}", rand_seed);
        Prng::new(rand_seed)
    };
}

pub fn test_init() {
    let log_level = if env::var("DEBUG_TESTS").is_ok() {
        LevelFilter::Debug
    } else {
        LevelFilter::Error
    };
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log_level)
        .try_init();

    PRNG.init();
}

/// Application events as one side's observer saw them.
#[derive(Clone)]
pub struct EventLog {
    events: Arc<Mutex<Vec<ApplicationEvent>>>,
}

impl EventLog {
    fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn recorder(&self) -> Box<dyn Fn(ApplicationEvent) + Send + Sync> {
        let events = self.events.clone();
        Box::new(move |event| events.lock().unwrap().push(event))
    }

    pub fn all(&self) -> Vec<ApplicationEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: ApplicationEvent) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| **e == event)
            .count()
    }

    pub fn contains(&self, event: ApplicationEvent) -> bool {
        self.count(event) > 0
    }
}

/// Two controllers, one per participant, wired to the same simulated
/// signaling log. `caller` is "amy", `callee` is "ben"; nothing forces
/// amy to call first, the names just keep assertions readable.
pub struct TestContext {
    pub store: Arc<SimSignalStore>,
    pub conversation_id: ConversationId,

    pub caller_platform: Arc<SimPlatform>,
    pub callee_platform: Arc<SimPlatform>,
    pub caller: CallSessionController<SimPlatform>,
    pub callee: CallSessionController<SimPlatform>,

    pub caller_events: EventLog,
    pub callee_events: EventLog,
    observer_handles: Vec<peerline::core::platform::ObserverHandle>,
}

impl Drop for TestContext {
    fn drop(&mut self) {
        info!("test: dropping TestContext");
        self.caller.close();
        self.callee.close();
    }
}

impl TestContext {
    pub fn new(push_mode: PushMode) -> Self {
        Self::with_config(push_mode, CallConfig::default())
    }

    pub fn with_config(push_mode: PushMode, config: CallConfig) -> Self {
        let store = Arc::new(SimSignalStore::new(push_mode));
        let conversation_id: ConversationId = format!("conv-{:016x}", PRNG.gen::<u64>());
        let amy: UserId = "amy".to_string();
        let ben: UserId = "ben".to_string();

        let caller_platform = Arc::new(SimPlatform::new());
        let callee_platform = Arc::new(SimPlatform::new());

        let caller = CallSessionController::new(
            caller_platform.clone(),
            store.clone(),
            conversation_id.clone(),
            amy.clone(),
            ben.clone(),
            config.clone(),
        )
        .expect("create caller controller");
        let callee = CallSessionController::new(
            callee_platform.clone(),
            store.clone(),
            conversation_id.clone(),
            ben,
            amy,
            config,
        )
        .expect("create callee controller");

        let caller_events = EventLog::new();
        let callee_events = EventLog::new();
        let observer_handles = vec![
            caller.register_observer(caller_events.recorder()),
            callee.register_observer(callee_events.recorder()),
        ];

        Self {
            store,
            conversation_id,
            caller_platform,
            callee_platform,
            caller,
            callee,
            caller_events,
            callee_events,
            observer_handles,
        }
    }

    /// Advances virtual time and waits for both state machines to have
    /// drained everything injected so far.
    pub async fn advance(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
        self.caller.synchronize().await.expect("caller synchronize");
        self.callee.synchronize().await.expect("callee synchronize");
    }

    /// Lets in-flight signaling land on both sides, whichever path
    /// (push or poll) carries it. Advances a few seconds of virtual
    /// time, so ended sessions also settle back to idle.
    pub async fn deliver(&self) {
        for _ in 0..3 {
            self.advance(Duration::from_millis(1100)).await;
        }
    }

    pub fn caller_state(&self) -> CallState {
        self.caller.state().expect("caller state")
    }

    pub fn callee_state(&self) -> CallState {
        self.callee.state().expect("callee state")
    }

    /// Drives a voice call all the way to Connected on both sides.
    pub async fn connect_voice_call(&self) {
        self.caller.start_voice_call().expect("start_voice_call");
        self.deliver().await;
        assert_eq!(self.callee_state(), CallState::Ringing);

        self.callee.answer_call(false).expect("answer_call");
        self.deliver().await;
        assert_eq!(self.caller_state(), CallState::Connected);
        assert_eq!(self.callee_state(), CallState::Connected);
    }
}
