//! Test doubles shared by unit tests, integration tests and embedders' suites.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::ThreadId;

use crate::callbacks::{CallbackOutcome, ResultCallback};
use crate::clock::Clock;
use crate::observers::MessageObserver;
use crate::types::NormalizedMessage;

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: i64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Callback that records every outcome it receives.
#[derive(Debug, Default)]
pub struct RecordingCallback {
    tag: Option<String>,
    outcomes: Mutex<Vec<CallbackOutcome>>,
}

impl RecordingCallback {
    pub fn new(tag: Option<&str>) -> Self {
        Self {
            tag: tag.map(str::to_string),
            outcomes: Mutex::new(Vec::new()),
        }
    }

    pub fn outcomes(&self) -> Vec<CallbackOutcome> {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ResultCallback for RecordingCallback {
    fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    fn on_result(&self, outcome: CallbackOutcome) {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(outcome);
    }
}

/// Observer that records data types it received, optionally ignoring some,
/// and appends its name to a shared journal to check delivery order.
pub struct RecordingObserver {
    name: String,
    ignore: Vec<i32>,
    received: Mutex<Vec<i32>>,
    threads: Mutex<Vec<ThreadId>>,
    journal: Option<Arc<Mutex<Vec<String>>>>,
}

impl RecordingObserver {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ignore: Vec::new(),
            received: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            journal: None,
        }
    }

    pub fn ignoring(mut self, data_types: &[i32]) -> Self {
        self.ignore = data_types.to_vec();
        self
    }

    pub fn with_journal(mut self, journal: Arc<Mutex<Vec<String>>>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn received(&self) -> Vec<i32> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Threads `on_message` ran on, one entry per delivery.
    pub fn threads(&self) -> Vec<ThreadId> {
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl MessageObserver for RecordingObserver {
    fn should_ignore(&self, message: &NormalizedMessage) -> bool {
        self.ignore.contains(&message.data_type())
    }

    fn on_message(&self, message: &NormalizedMessage) -> anyhow::Result<()> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.data_type());
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(std::thread::current().id());
        if let Some(journal) = &self.journal {
            journal
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(self.name.clone());
        }
        Ok(())
    }
}
