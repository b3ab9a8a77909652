//! Shared test utilities for observation integration tests
#![allow(dead_code)]

use std::sync::{Arc, Once};

use observation::prelude::*;
use observation::repository::{MemoryRepository, MemorySession, MemoryUserSession};
use parking_lot::Mutex;

static TRACING: Once = Once::new();

/// Install a test subscriber honoring RUST_LOG
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Listener that records every batch it receives
#[derive(Default)]
pub struct Recorder {
    batches: Mutex<Vec<Vec<Event>>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }

    /// Recorded (kind, path) pairs since the last call
    pub fn take(&self) -> Vec<(EventKind, String)> {
        std::mem::take(&mut *self.batches.lock())
            .into_iter()
            .flatten()
            .map(|e| (e.kind, e.path))
            .collect()
    }
}

impl EventListener for Recorder {
    fn on_event(&self, events: &[Event]) {
        self.batches.lock().push(events.to_vec());
    }
}

pub struct TestEnv {
    pub repo: MemoryRepository,
    pub user: Arc<MemoryUserSession>,
    pub coordinator: Arc<ObservationCoordinator>,
}

impl TestEnv {
    pub fn session(&self) -> Arc<MemorySession> {
        self.user.session().unwrap()
    }

    pub fn user(&self) -> Arc<dyn UserSession> {
        self.user.clone()
    }

    pub fn subscribe(&self, listener: &Arc<Recorder>, filter: EventFilter) -> Subscription {
        let listener: Arc<dyn EventListener> = listener.clone();
        self.coordinator
            .subscribe(&self.user(), &listener, filter)
            .unwrap()
    }

    /// One full cycle: refresh, then process
    pub fn cycle(&self) {
        let user = self.user();
        self.coordinator.refresh_session(&user);
        self.coordinator.process_events(&user);
    }
}

/// A repository with a saved `/content` node and an observing user session
pub fn setup_test_env() -> TestEnv {
    setup_with_config(ObservationConfig::default())
}

pub fn setup_with_config(config: ObservationConfig) -> TestEnv {
    init_tracing();
    let repo = MemoryRepository::new();
    let user = MemoryUserSession::new(&repo, "admin");
    let session = user.session().unwrap();
    session.add_node("/", "content", "nt:unstructured").unwrap();
    session.save().unwrap();

    TestEnv {
        repo,
        user,
        coordinator: Arc::new(ObservationCoordinator::new(config)),
    }
}
