use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Opaque token binding an outgoing request to its pending result callback.
///
/// ```
/// use imb_core::CorrelationId;
///
/// let a = CorrelationId::generate();
/// let b = CorrelationId::generate();
/// assert_ne!(a, b);
/// assert!(!a.as_str().is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generates a fresh random (UUID v4) identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for CorrelationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Kind of conversation an outbound message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Direct => "direct",
            ConversationKind::Group => "group",
        }
    }
}

/// Destination of an outbound message.
///
/// ```
/// use imb_core::{ConversationKind, ConversationTarget};
///
/// let target = ConversationTarget::group("room-7");
/// assert_eq!(target.kind, ConversationKind::Group);
/// assert_eq!(target.peer_id, "room-7");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationTarget {
    pub peer_id: String,
    pub kind: ConversationKind,
}

impl ConversationTarget {
    pub fn new(peer_id: impl Into<String>, kind: ConversationKind) -> Self {
        Self {
            peer_id: peer_id.into(),
            kind,
        }
    }

    pub fn direct(peer_id: impl Into<String>) -> Self {
        Self::new(peer_id, ConversationKind::Direct)
    }

    pub fn group(group_id: impl Into<String>) -> Self {
        Self::new(group_id, ConversationKind::Group)
    }
}

/// Classified payload exchanged with a backend.
///
/// `data_type` is the integer classifier observers switch on; `0` means unknown.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessageData {
    pub data_type: i32,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub context: BTreeMap<String, Value>, // secondary fields populated by the fill step
}

impl MessageData {
    pub fn new(data_type: i32, payload: Value) -> Self {
        Self {
            data_type,
            payload,
            context: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// Inbound message after normalization. Immutable once built.
pub struct NormalizedMessage {
    data: MessageData,
    raw: Arc<dyn Any + Send + Sync>,
}

impl NormalizedMessage {
    pub fn new<V: Any + Send + Sync>(data: MessageData, raw: Arc<V>) -> Self {
        Self { data, raw }
    }

    pub fn data_type(&self) -> i32 {
        self.data.data_type
    }

    pub fn data(&self) -> &MessageData {
        &self.data
    }

    /// Returns the vendor message this was normalized from, if it is a `V`.
    pub fn raw<V: Any>(&self) -> Option<&V> {
        self.raw.downcast_ref::<V>()
    }
}

impl std::fmt::Debug for NormalizedMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NormalizedMessage")
            .field("data", &self.data)
            .finish_non_exhaustive()
    }
}

/// Shared verbose-logging switch. Never changes behaviour, only log levels.
#[derive(Debug, Clone, Default)]
pub struct DebugFlag(Arc<AtomicBool>);

impl DebugFlag {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Relaxed);
    }

    pub fn enabled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalized_message_downcasts_raw() {
        let msg = NormalizedMessage::new(MessageData::new(3, json!("hi")), Arc::new(42u64));
        assert_eq!(msg.data_type(), 3);
        assert_eq!(msg.raw::<u64>(), Some(&42));
        assert!(msg.raw::<String>().is_none());
    }

    #[test]
    fn debug_flag_is_shared_between_clones() {
        let flag = DebugFlag::default();
        let other = flag.clone();
        flag.set(true);
        assert!(other.enabled());
    }

    #[test]
    fn message_data_serializes_with_defaults() {
        let data: MessageData = serde_json::from_value(json!({"data_type": 2})).unwrap();
        assert_eq!(data.payload, Value::Null);
        assert!(data.context.is_empty());
    }
}
