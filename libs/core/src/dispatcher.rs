//! Facade composing the callback and observer registries with a backend.

use std::sync::{Arc, OnceLock};

use tracing::info;

use crate::backend::Backend;
use crate::callbacks::{CallbackRegistry, ResultCallback};
use crate::clock::{Clock, SystemClock};
use crate::coordination::CoordinationExecutor;
use crate::error::CoreError;
use crate::normalizer::MessageNotifier;
use crate::observers::{MessageObserver, ObserverRegistry};
use crate::types::{ConversationTarget, CorrelationId, DebugFlag, MessageData, NormalizedMessage};

/// Correlation and dispatch core for one backend.
///
/// Construct one per process at the composition root, hand
/// [`Dispatcher::callbacks`] and [`Dispatcher::notifier`] to the backend,
/// then install the backend with [`Dispatcher::set_backend`].
///
/// ```
/// use imb_core::{Dispatcher, FnCallback, InMemoryBackend, InlineExecutor, JsonNormalizer, MessageData, SystemClock};
/// use std::sync::Arc;
///
/// let dispatcher: Dispatcher<InMemoryBackend> =
///     Dispatcher::with_parts(Arc::new(SystemClock::new()), Arc::new(InlineExecutor), false);
/// let backend = InMemoryBackend::new(dispatcher.callbacks(), dispatcher.notifier(), JsonNormalizer::default());
/// dispatcher.set_backend(backend).expect("first backend");
///
/// let cb = Arc::new(FnCallback::new(|outcome| assert!(outcome.is_ok())).with_tag("chat"));
/// let handle = dispatcher.send_direct("alice", MessageData::new(1, serde_json::json!("hi")), Some(cb));
/// assert_eq!(handle.target.peer_id, "alice");
/// assert_eq!(dispatcher.backend().settle_all(), 1);
/// ```
pub struct Dispatcher<B: Backend> {
    backend: OnceLock<B>,
    callbacks: Arc<CallbackRegistry>,
    observers: Arc<ObserverRegistry>,
    executor: Arc<dyn CoordinationExecutor>,
    debug: DebugFlag,
}

impl<B: Backend> Dispatcher<B> {
    pub fn new(executor: Arc<dyn CoordinationExecutor>) -> Self {
        Self::with_parts(Arc::new(SystemClock::new()), executor, false)
    }

    pub fn with_parts(
        clock: Arc<dyn Clock>,
        executor: Arc<dyn CoordinationExecutor>,
        debug: bool,
    ) -> Self {
        let debug = DebugFlag::new(debug);
        Self {
            backend: OnceLock::new(),
            callbacks: Arc::new(CallbackRegistry::with_clock(clock).with_debug(debug.clone())),
            observers: Arc::new(ObserverRegistry::new().with_debug(debug.clone())),
            executor,
            debug,
        }
    }

    /// Installs the backend. Only the first call succeeds.
    pub fn set_backend(&self, backend: B) -> Result<(), CoreError> {
        self.backend
            .set(backend)
            .map_err(|_| CoreError::BackendAlreadyConfigured)?;
        info!("backend configured");
        Ok(())
    }

    pub fn has_backend(&self) -> bool {
        self.backend.get().is_some()
    }

    /// # Panics
    ///
    /// When no backend has been configured; that is a wiring bug in the
    /// composition root, not a runtime condition.
    pub fn backend(&self) -> &B {
        match self.backend.get() {
            Some(backend) => backend,
            None => panic!("a backend must be configured with Dispatcher::set_backend before use"),
        }
    }

    pub fn callbacks(&self) -> Arc<CallbackRegistry> {
        Arc::clone(&self.callbacks)
    }

    pub fn observers(&self) -> Arc<ObserverRegistry> {
        Arc::clone(&self.observers)
    }

    pub fn notifier(&self) -> MessageNotifier {
        MessageNotifier::new(Arc::clone(&self.observers), Arc::clone(&self.executor))
    }

    pub fn set_debug_mode(&self, enabled: bool) {
        self.debug.set(enabled);
    }

    pub fn is_debug_mode(&self) -> bool {
        self.debug.enabled()
    }

    pub fn add_observer(&self, observer: Arc<dyn MessageObserver>) {
        self.observers.add(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn MessageObserver>) {
        self.observers.remove(observer);
    }

    /// Fans `message` out to observers on the coordination context. Returns
    /// `false` if the context rejected it.
    pub fn notify_receive(&self, message: Arc<NormalizedMessage>) -> bool {
        self.notifier().notify(message)
    }

    pub fn remove_callbacks_by_tag(&self, tag: &str) -> usize {
        self.callbacks.remove_by_tag(tag)
    }

    pub fn remove_expired_callbacks(&self, max_age_ms: i64) -> usize {
        self.callbacks.remove_expired(max_age_ms)
    }

    fn correlate(&self, callback: Option<Arc<dyn ResultCallback>>) -> Option<CorrelationId> {
        let tag = callback.as_ref().and_then(|cb| cb.tag().map(str::to_string));
        self.callbacks.register(callback, tag.as_deref())
    }

    pub fn new_message_receiver(&self) -> B::Receiver {
        self.backend().new_message_receiver()
    }

    pub fn send_direct(
        &self,
        peer_id: &str,
        data: MessageData,
        callback: Option<Arc<dyn ResultCallback>>,
    ) -> B::Message {
        self.send(ConversationTarget::direct(peer_id), data, callback)
    }

    pub fn send_group(
        &self,
        group_id: &str,
        data: MessageData,
        callback: Option<Arc<dyn ResultCallback>>,
    ) -> B::Message {
        self.send(ConversationTarget::group(group_id), data, callback)
    }

    fn send(
        &self,
        target: ConversationTarget,
        data: MessageData,
        callback: Option<Arc<dyn ResultCallback>>,
    ) -> B::Message {
        let backend = self.backend();
        let correlation_id = self.correlate(callback);
        backend.send_message(&target, data, correlation_id)
    }

    pub fn join_group(&self, group_id: &str, callback: Option<Arc<dyn ResultCallback>>) {
        let backend = self.backend();
        backend.join_group(group_id, self.correlate(callback));
    }

    pub fn quit_group(&self, group_id: &str, callback: Option<Arc<dyn ResultCallback>>) {
        let backend = self.backend();
        backend.quit_group(group_id, self.correlate(callback));
    }
}
