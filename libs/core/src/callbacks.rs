//! Pending result callbacks keyed by correlation id.
//!
//! Every outgoing request that wants a result gets a [`CorrelationId`] bound to
//! its callback here. The backend later resolves the id; callers can abandon a
//! group of requests by tag, and an external scheduler reclaims entries whose
//! backend never answered.

use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::{debug, info, trace};

use crate::clock::{Clock, SystemClock};
use crate::error::RemoteError;
use crate::types::{CorrelationId, DebugFlag};

/// What a backend reports for a resolved request.
pub type CallbackOutcome = Result<Value, RemoteError>;

/// Completion handler supplied by call sites.
pub trait ResultCallback: Send + Sync {
    /// Grouping label used for bulk cancellation.
    fn tag(&self) -> Option<&str> {
        None
    }

    fn on_result(&self, outcome: CallbackOutcome);
}

/// Closure-backed [`ResultCallback`].
///
/// ```
/// use imb_core::{FnCallback, ResultCallback};
/// use std::sync::Arc;
///
/// let cb = Arc::new(FnCallback::new(|outcome| assert!(outcome.is_ok())).with_tag("chat"));
/// assert_eq!(cb.tag(), Some("chat"));
/// cb.on_result(Ok(serde_json::json!({"ok": true})));
/// ```
pub struct FnCallback<F> {
    tag: Option<String>,
    handler: F,
}

impl<F> FnCallback<F>
where
    F: Fn(CallbackOutcome) + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self { tag: None, handler }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

impl<F> ResultCallback for FnCallback<F>
where
    F: Fn(CallbackOutcome) + Send + Sync,
{
    fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    fn on_result(&self, outcome: CallbackOutcome) {
        (self.handler)(outcome)
    }
}

/// A registered callback awaiting resolution.
#[derive(Clone)]
pub struct PendingCallback {
    pub id: CorrelationId,
    pub callback: Arc<dyn ResultCallback>,
    pub tag: Option<String>,
    pub created_at_ms: i64,
}

impl Debug for PendingCallback {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCallback")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("created_at_ms", &self.created_at_ms)
            .finish_non_exhaustive()
    }
}

/// Thread-safe map of [`CorrelationId`] to [`PendingCallback`].
///
/// A single mutex guards the map; id generation and insertion happen inside
/// the same critical section, and sweeps never observe a half-updated map.
///
/// ```
/// use imb_core::{CallbackRegistry, FnCallback, ResultCallback};
/// use std::sync::Arc;
///
/// let registry = CallbackRegistry::new();
/// let cb: Arc<dyn ResultCallback> = Arc::new(FnCallback::new(|_| {}));
/// let id = registry.register(Some(cb), Some("chat")).expect("id");
/// assert!(registry.remove_by_id(&id).is_some());
/// assert!(registry.remove_by_id(&id).is_none());
/// ```
pub struct CallbackRegistry {
    entries: Mutex<HashMap<CorrelationId, PendingCallback>>,
    clock: Arc<dyn Clock>,
    debug: DebugFlag,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            debug: DebugFlag::default(),
        }
    }

    pub(crate) fn with_debug(mut self, debug: DebugFlag) -> Self {
        self.debug = debug;
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationId, PendingCallback>> {
        // Entries are plain data; a panic elsewhere cannot leave one half-written.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds `callback` to a fresh id. Returns `None` and stores nothing when
    /// `callback` is absent. An empty tag is stored as no tag.
    pub fn register(
        &self,
        callback: Option<Arc<dyn ResultCallback>>,
        tag: Option<&str>,
    ) -> Option<CorrelationId> {
        let callback = callback?;
        let tag = tag.filter(|t| !t.is_empty()).map(str::to_string);

        let mut guard = self.lock();
        let mut id = CorrelationId::generate();
        while guard.contains_key(&id) {
            id = CorrelationId::generate();
        }
        let pending = PendingCallback {
            id: id.clone(),
            callback,
            tag,
            created_at_ms: self.clock.now_millis(),
        };
        let tag_label = pending.tag.clone();
        guard.insert(id.clone(), pending);
        let size = guard.len();
        drop(guard);

        if self.debug.enabled() {
            info!(correlation_id = %id, tag = ?tag_label, size, "result callback registered");
        } else {
            trace!(correlation_id = %id, tag = ?tag_label, size, "result callback registered");
        }
        metrics::counter!("imb_callbacks_registered").increment(1);
        Some(id)
    }

    /// Removes and returns the callback bound to `id`.
    pub fn remove_by_id(&self, id: &CorrelationId) -> Option<Arc<dyn ResultCallback>> {
        if id.is_empty() {
            return None;
        }
        let removed = self.lock().remove(id);
        if removed.is_some() && self.debug.enabled() {
            info!(correlation_id = %id, "result callback removed");
        }
        removed.map(|pending| pending.callback)
    }

    /// Removes the callback bound to `id` and hands it `outcome`.
    ///
    /// Returns `false` when nobody is waiting on `id` any more (already
    /// resolved, cancelled by tag, or expired); the outcome is dropped.
    pub fn resolve(&self, id: &CorrelationId, outcome: CallbackOutcome) -> bool {
        match self.remove_by_id(id) {
            Some(callback) => {
                callback.on_result(outcome);
                true
            }
            None => {
                debug!(correlation_id = %id, "no pending callback for resolved id");
                metrics::counter!("imb_callbacks_unknown").increment(1);
                false
            }
        }
    }

    /// Removes every entry whose tag equals `tag` exactly. Returns how many.
    pub fn remove_by_tag(&self, tag: &str) -> usize {
        if tag.is_empty() {
            return 0;
        }
        let removed = self.remove_where(|pending| pending.tag.as_deref() == Some(tag));
        if !removed.is_empty() && self.debug.enabled() {
            info!(tag, count = removed.len(), size = self.len(), "result callbacks removed by tag");
        }
        removed.len()
    }

    /// Drops every entry at least `max_age_ms` old without invoking it.
    /// Returns how many were dropped.
    pub fn remove_expired(&self, max_age_ms: i64) -> usize {
        if max_age_ms <= 0 {
            return 0;
        }
        let now = self.clock.now_millis();
        let removed = self.remove_where(|pending| now - pending.created_at_ms >= max_age_ms);
        if removed.is_empty() {
            return 0;
        }
        if self.debug.enabled() {
            for pending in &removed {
                info!(correlation_id = %pending.id, tag = ?pending.tag, "result callback expired");
            }
        }
        metrics::counter!("imb_callbacks_expired").increment(removed.len() as u64);
        removed.len()
    }

    /// Takes matching entries out under one lock. They are dropped by the
    /// caller after the lock is released, so callback destructors may re-enter.
    fn remove_where(&self, predicate: impl Fn(&PendingCallback) -> bool) -> Vec<PendingCallback> {
        let mut guard = self.lock();
        if guard.is_empty() {
            return Vec::new();
        }
        let ids: Vec<CorrelationId> = guard
            .values()
            .filter(|pending| predicate(pending))
            .map(|pending| pending.id.clone())
            .collect();
        ids.iter().filter_map(|id| guard.remove(id)).collect()
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{ManualClock, RecordingCallback};
    use serde_json::json;
    use std::collections::HashSet;
    use std::thread;

    fn callback(tag: Option<&str>) -> Arc<RecordingCallback> {
        Arc::new(RecordingCallback::new(tag))
    }

    #[test]
    fn register_without_callback_stores_nothing() {
        let registry = CallbackRegistry::new();
        assert!(registry.register(None, Some("chat")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_by_id_returns_registered_callback_once() {
        let registry = CallbackRegistry::new();
        let cb = callback(None);
        let dyn_cb: Arc<dyn ResultCallback> = cb.clone();
        let id = registry.register(Some(dyn_cb.clone()), None).unwrap();

        let removed = registry.remove_by_id(&id).expect("registered");
        assert!(std::ptr::addr_eq(Arc::as_ptr(&removed), Arc::as_ptr(&dyn_cb)));
        assert!(registry.remove_by_id(&id).is_none());
        assert!(registry.remove_by_id(&CorrelationId::from("")).is_none());
    }

    #[test]
    fn ids_are_unique_across_threads() {
        let registry = Arc::new(CallbackRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    (0..200)
                        .map(|_| {
                            let cb: Arc<dyn ResultCallback> = callback(None);
                            registry.register(Some(cb), None).unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(registry.len(), 1600);
    }

    #[test]
    fn empty_tag_is_not_stored() {
        let registry = CallbackRegistry::new();
        let cb: Arc<dyn ResultCallback> = callback(None);
        registry.register(Some(cb), Some("")).unwrap();
        assert_eq!(registry.remove_by_tag(""), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_by_tag_is_exact_match() {
        let registry = CallbackRegistry::new();
        for tag in ["chat", "chat", "chatroom", "Chat"] {
            let cb: Arc<dyn ResultCallback> = callback(Some(tag));
            registry.register(Some(cb), Some(tag)).unwrap();
        }
        let untagged: Arc<dyn ResultCallback> = callback(None);
        registry.register(Some(untagged), None).unwrap();

        assert_eq!(registry.remove_by_tag("chat"), 2);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn remove_expired_uses_inclusive_age() {
        let clock = Arc::new(ManualClock::new(1_000));
        let registry = CallbackRegistry::with_clock(clock.clone());

        let old: Arc<dyn ResultCallback> = callback(None);
        let old_id = registry.register(Some(old), None).unwrap();
        clock.advance(500);
        let young: Arc<dyn ResultCallback> = callback(None);
        let young_id = registry.register(Some(young), None).unwrap();
        clock.advance(500);

        assert_eq!(registry.remove_expired(0), 0);
        assert_eq!(registry.remove_expired(-5), 0);
        assert_eq!(registry.remove_expired(1_000), 1);
        assert!(!registry.contains(&old_id));
        assert!(registry.contains(&young_id));
    }

    #[test]
    fn expired_callbacks_are_not_invoked() {
        let clock = Arc::new(ManualClock::new(0));
        let registry = CallbackRegistry::with_clock(clock.clone());
        let cb = callback(None);
        let dyn_cb: Arc<dyn ResultCallback> = cb.clone();
        registry.register(Some(dyn_cb), None).unwrap();
        clock.advance(10);

        assert_eq!(registry.remove_expired(10), 1);
        assert!(cb.outcomes().is_empty());
    }

    #[test]
    fn resolve_invokes_once_and_drops_unknown_ids() {
        let registry = CallbackRegistry::new();
        let cb = callback(None);
        let dyn_cb: Arc<dyn ResultCallback> = cb.clone();
        let id = registry.register(Some(dyn_cb), None).unwrap();

        assert!(registry.resolve(&id, Ok(json!({"seq": 1}))));
        assert!(!registry.resolve(&id, Ok(json!({"seq": 2}))));
        assert_eq!(cb.outcomes(), vec![Ok(json!({"seq": 1}))]);
    }
}
