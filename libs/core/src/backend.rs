use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::callbacks::{CallbackOutcome, CallbackRegistry};
use crate::error::RemoteError;
use crate::normalizer::{JsonNormalizer, MessageNotifier, ReceiveOutcome, Receiver};
use crate::types::{ConversationTarget, CorrelationId, MessageData};

/// Vendor-specific transport plugged into a [`crate::Dispatcher`].
///
/// Implementations perform the real I/O. They resolve correlation ids through
/// the dispatcher's [`CallbackRegistry`] once results arrive, and feed inbound
/// vendor messages through receivers built by `new_message_receiver`.
pub trait Backend: Send + Sync + 'static {
    /// Synchronous handle returned for a queued outbound message.
    type Message;
    /// Per-message parsing context for inbound vendor messages.
    type Receiver;

    fn new_message_receiver(&self) -> Self::Receiver;

    fn send_message(
        &self,
        target: &ConversationTarget,
        data: MessageData,
        correlation_id: Option<CorrelationId>,
    ) -> Self::Message;

    fn join_group(&self, group_id: &str, correlation_id: Option<CorrelationId>);

    fn quit_group(&self, group_id: &str, correlation_id: Option<CorrelationId>);
}

/// Handle for a message accepted by [`InMemoryBackend`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub seq: u64,
    pub target: ConversationTarget,
    pub data: MessageData,
}

/// One call recorded by [`InMemoryBackend`].
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Send {
        message: OutboundMessage,
        correlation_id: Option<CorrelationId>,
    },
    Join {
        group_id: String,
        correlation_id: Option<CorrelationId>,
    },
    Quit {
        group_id: String,
        correlation_id: Option<CorrelationId>,
    },
}

impl BackendCall {
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            BackendCall::Send { correlation_id, .. }
            | BackendCall::Join { correlation_id, .. }
            | BackendCall::Quit { correlation_id, .. } => correlation_id.as_ref(),
        }
    }

    fn success_value(&self) -> serde_json::Value {
        match self {
            BackendCall::Send { message, .. } => json!(message),
            BackendCall::Join { group_id, .. } => json!({ "joined": group_id }),
            BackendCall::Quit { group_id, .. } => json!({ "quit": group_id }),
        }
    }
}

/// Backend that records calls in memory and settles them on demand.
///
/// Inbound traffic is JSON text normalized by [`JsonNormalizer`].
pub struct InMemoryBackend {
    callbacks: Arc<CallbackRegistry>,
    notifier: MessageNotifier,
    normalizer: Arc<JsonNormalizer>,
    calls: Mutex<Vec<BackendCall>>,
    sequence: AtomicU64,
}

impl InMemoryBackend {
    pub fn new(
        callbacks: Arc<CallbackRegistry>,
        notifier: MessageNotifier,
        normalizer: JsonNormalizer,
    ) -> Self {
        Self {
            callbacks,
            notifier,
            normalizer: Arc::new(normalizer),
            calls: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(1),
        }
    }

    fn calls_guard(&self) -> MutexGuard<'_, Vec<BackendCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: BackendCall) {
        self.calls_guard().push(call);
    }

    /// Calls recorded and not yet settled.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls_guard().clone()
    }

    pub fn take_calls(&self) -> Vec<BackendCall> {
        std::mem::take(&mut *self.calls_guard())
    }

    /// Resolves every recorded call successfully. Returns how many callbacks
    /// were still waiting.
    pub fn settle_all(&self) -> usize {
        self.take_calls()
            .into_iter()
            .filter(|call| {
                let outcome: CallbackOutcome = Ok(call.success_value());
                self.complete(call.correlation_id(), outcome)
            })
            .count()
    }

    /// Resolves every recorded call with `error`.
    pub fn fail_all(&self, error: RemoteError) -> usize {
        self.take_calls()
            .into_iter()
            .filter(|call| self.complete(call.correlation_id(), Err(error.clone())))
            .count()
    }

    /// Resolves one correlation id; `None` or an abandoned id is a no-op.
    pub fn complete(&self, correlation_id: Option<&CorrelationId>, outcome: CallbackOutcome) -> bool {
        match correlation_id {
            Some(id) => self.callbacks.resolve(id, outcome),
            None => false,
        }
    }

    /// Feeds one inbound vendor message through a fresh receiver.
    pub fn deliver_inbound(&self, raw: impl Into<String>) -> ReceiveOutcome {
        self.new_message_receiver().receive(raw.into())
    }
}

impl Backend for InMemoryBackend {
    type Message = OutboundMessage;
    type Receiver = Receiver<JsonNormalizer>;

    fn new_message_receiver(&self) -> Self::Receiver {
        Receiver::new(Arc::clone(&self.normalizer), self.notifier.clone())
    }

    fn send_message(
        &self,
        target: &ConversationTarget,
        data: MessageData,
        correlation_id: Option<CorrelationId>,
    ) -> OutboundMessage {
        let message = OutboundMessage {
            seq: self.sequence.fetch_add(1, Ordering::Relaxed),
            target: target.clone(),
            data,
        };
        debug!(seq = message.seq, peer = %target.peer_id, kind = target.kind.as_str(), "outbound message queued");
        self.record(BackendCall::Send {
            message: message.clone(),
            correlation_id,
        });
        message
    }

    fn join_group(&self, group_id: &str, correlation_id: Option<CorrelationId>) {
        self.record(BackendCall::Join {
            group_id: group_id.to_string(),
            correlation_id,
        });
    }

    fn quit_group(&self, group_id: &str, correlation_id: Option<CorrelationId>) {
        self.record(BackendCall::Quit {
            group_id: group_id.to_string(),
            correlation_id,
        });
    }
}
