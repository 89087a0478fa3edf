//! Broadcast registry of inbound-message observers.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{info, trace, warn};

use crate::types::{DebugFlag, NormalizedMessage};

/// Listener for normalized inbound messages.
pub trait MessageObserver: Send + Sync {
    /// Returning `true` skips [`MessageObserver::on_message`] for this message only.
    fn should_ignore(&self, _message: &NormalizedMessage) -> bool {
        false
    }

    fn on_message(&self, message: &NormalizedMessage) -> anyhow::Result<()>;
}

/// Per-dispatch delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub ignored: usize,
    pub failed: usize,
}

type Snapshot = Arc<Vec<Arc<dyn MessageObserver>>>;

/// Copy-on-write list of observers, kept in registration order.
///
/// Mutations swap in a new list under the write lock; [`ObserverRegistry::dispatch`]
/// iterates a snapshot with no lock held, so observers may add or remove
/// observers (including themselves) while a message is being delivered.
pub struct ObserverRegistry {
    observers: RwLock<Snapshot>,
    debug: DebugFlag,
}

fn same_observer(a: &Arc<dyn MessageObserver>, b: &Arc<dyn MessageObserver>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Arc::new(Vec::new())),
            debug: DebugFlag::default(),
        }
    }

    pub(crate) fn with_debug(mut self, debug: DebugFlag) -> Self {
        self.debug = debug;
        self
    }

    fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.observers.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Adds `observer` unless the same instance is already registered.
    pub fn add(&self, observer: Arc<dyn MessageObserver>) {
        let mut guard = self.observers.write().unwrap_or_else(PoisonError::into_inner);
        if guard.iter().any(|existing| same_observer(existing, &observer)) {
            return;
        }
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(observer);
        *guard = Arc::new(next);
        let size = guard.len();
        drop(guard);

        if self.debug.enabled() {
            info!(size, thread = ?std::thread::current().name(), "message observer added");
        } else {
            trace!(size, "message observer added");
        }
    }

    /// Removes `observer` if present.
    pub fn remove(&self, observer: &Arc<dyn MessageObserver>) {
        let mut guard = self.observers.write().unwrap_or_else(PoisonError::into_inner);
        if !guard.iter().any(|existing| same_observer(existing, observer)) {
            return;
        }
        let next: Vec<_> = guard
            .iter()
            .filter(|existing| !same_observer(existing, observer))
            .cloned()
            .collect();
        *guard = Arc::new(next);
        let size = guard.len();
        drop(guard);

        if self.debug.enabled() {
            info!(size, thread = ?std::thread::current().name(), "message observer removed");
        } else {
            trace!(size, "message observer removed");
        }
    }

    pub fn contains(&self, observer: &Arc<dyn MessageObserver>) -> bool {
        self.snapshot()
            .iter()
            .any(|existing| same_observer(existing, observer))
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Delivers `message` to every observer registered at call time.
    ///
    /// A failing or panicking observer is logged and skipped; the remaining
    /// observers still receive the message.
    pub fn dispatch(&self, message: &NormalizedMessage) -> DispatchReport {
        let observers = self.snapshot();
        let mut report = DispatchReport::default();

        for (index, observer) in observers.iter().enumerate() {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                if observer.should_ignore(message) {
                    return Ok(false);
                }
                observer.on_message(message).map(|()| true)
            }));
            match outcome {
                Ok(Ok(true)) => report.delivered += 1,
                Ok(Ok(false)) => report.ignored += 1,
                Ok(Err(err)) => {
                    report.failed += 1;
                    warn!(observer = index, data_type = message.data_type(), error = %err, "message observer failed");
                    metrics::counter!("imb_observer_failures").increment(1);
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(observer = index, data_type = message.data_type(), "message observer panicked");
                    metrics::counter!("imb_observer_failures").increment(1);
                }
            }
        }

        if self.debug.enabled() {
            info!(
                data_type = message.data_type(),
                delivered = report.delivered,
                ignored = report.ignored,
                failed = report.failed,
                "inbound message dispatched"
            );
        }
        report
    }
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::RecordingObserver;
    use crate::types::MessageData;
    use serde_json::json;
    use std::sync::Mutex;
    use tracing_test::traced_test;

    fn message(data_type: i32) -> NormalizedMessage {
        NormalizedMessage::new(MessageData::new(data_type, json!({})), Arc::new(()))
    }

    #[test]
    fn duplicate_add_is_ignored() {
        let registry = ObserverRegistry::new();
        let observer = Arc::new(RecordingObserver::new("o1"));
        let dyn_observer: Arc<dyn MessageObserver> = observer.clone();
        registry.add(dyn_observer.clone());
        registry.add(dyn_observer);
        assert_eq!(registry.len(), 1);

        registry.dispatch(&message(1));
        assert_eq!(observer.received().len(), 1);
    }

    #[test]
    fn remove_unknown_is_noop() {
        let registry = ObserverRegistry::new();
        let kept: Arc<dyn MessageObserver> = Arc::new(RecordingObserver::new("kept"));
        let stranger: Arc<dyn MessageObserver> = Arc::new(RecordingObserver::new("stranger"));
        registry.add(kept.clone());
        registry.remove(&stranger);
        assert!(registry.contains(&kept));
        registry.remove(&kept);
        assert!(registry.is_empty());
    }

    struct Failing;

    impl MessageObserver for Failing {
        fn on_message(&self, _message: &NormalizedMessage) -> anyhow::Result<()> {
            anyhow::bail!("observer exploded")
        }
    }

    struct Panicking;

    impl MessageObserver for Panicking {
        fn on_message(&self, _message: &NormalizedMessage) -> anyhow::Result<()> {
            panic!("observer panicked")
        }
    }

    #[traced_test]
    #[test]
    fn failures_do_not_stop_delivery() {
        let registry = ObserverRegistry::new();
        let last = Arc::new(RecordingObserver::new("last"));
        registry.add(Arc::new(Failing));
        registry.add(Arc::new(Panicking));
        registry.add(last.clone());

        let report = registry.dispatch(&message(2));
        assert_eq!(
            report,
            DispatchReport {
                delivered: 1,
                ignored: 0,
                failed: 2
            }
        );
        assert_eq!(last.received(), vec![2]);
        assert!(logs_contain("message observer failed"));
        assert!(logs_contain("message observer panicked"));
    }

    struct SelfRemoving {
        registry: Arc<ObserverRegistry>,
        me: Mutex<Option<Arc<dyn MessageObserver>>>,
        calls: Mutex<usize>,
    }

    impl MessageObserver for SelfRemoving {
        fn on_message(&self, _message: &NormalizedMessage) -> anyhow::Result<()> {
            *self.calls.lock().unwrap() += 1;
            if let Some(me) = self.me.lock().unwrap().take() {
                self.registry.remove(&me);
            }
            Ok(())
        }
    }

    #[test]
    fn dispatch_uses_snapshot_while_observers_mutate() {
        let registry = Arc::new(ObserverRegistry::new());
        let remover = Arc::new(SelfRemoving {
            registry: Arc::clone(&registry),
            me: Mutex::new(None),
            calls: Mutex::new(0),
        });
        let as_dyn: Arc<dyn MessageObserver> = remover.clone();
        *remover.me.lock().unwrap() = Some(as_dyn.clone());
        let after = Arc::new(RecordingObserver::new("after"));

        registry.add(as_dyn);
        registry.add(after.clone());

        let report = registry.dispatch(&message(5));
        assert_eq!(report.delivered, 2);
        assert_eq!(after.received(), vec![5]);
        assert_eq!(registry.len(), 1);

        registry.dispatch(&message(6));
        assert_eq!(*remover.calls.lock().unwrap(), 1);
        assert_eq!(after.received(), vec![5, 6]);
    }
}
