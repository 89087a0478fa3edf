//! Vendor message normalization and the per-message receiver state machine.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::callbacks::ResultCallback;
use crate::coordination::{CoordinationExecutor, run_on};
use crate::error::NormalizeError;
use crate::observers::ObserverRegistry;
use crate::types::{MessageData, NormalizedMessage};

/// Default JSON field carrying the integer data-type classifier.
pub const DEFAULT_DATA_TYPE_FIELD: &str = "type";

/// Converts one vendor message type into [`MessageData`].
pub trait MessageNormalizer: Send + Sync + 'static {
    type Vendor: Send + Sync + 'static;

    fn normalize(&self, vendor: &Self::Vendor) -> Result<MessageData, NormalizeError>;

    /// Populates secondary fields once `normalize` succeeded.
    fn fill(&self, _data: &mut MessageData, _vendor: &Self::Vendor) {}

    /// Whether auxiliary content must still be fetched before the message is
    /// complete. When it must and `callback` is given, the download starts and
    /// `callback` is resolved when it finishes.
    fn needs_download(
        &self,
        _message: &NormalizedMessage,
        _callback: Option<Arc<dyn ResultCallback>>,
    ) -> bool {
        false
    }

    fn on_parse_error(&self, error: &NormalizeError) {
        warn!(error = %error, "vendor message could not be normalized");
    }
}

/// Hands normalized messages to the observers on the coordination context.
#[derive(Clone)]
pub struct MessageNotifier {
    observers: Arc<ObserverRegistry>,
    executor: Arc<dyn CoordinationExecutor>,
}

impl MessageNotifier {
    pub fn new(observers: Arc<ObserverRegistry>, executor: Arc<dyn CoordinationExecutor>) -> Self {
        Self {
            observers,
            executor,
        }
    }

    /// Returns `false` when the coordination context rejected the delivery.
    pub fn notify(&self, message: Arc<NormalizedMessage>) -> bool {
        let observers = Arc::clone(&self.observers);
        let data_type = message.data_type();
        let accepted = run_on(
            self.executor.as_ref(),
            Box::new(move || {
                observers.dispatch(&message);
            }),
        );
        if !accepted {
            warn!(data_type, "inbound message dropped; coordination context unavailable");
        }
        accepted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    Unparsed,
    Parsed,
    Failed,
}

/// Result of [`Receiver::receive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Failed,
    Notified,
    /// Parsed, but auxiliary content is outstanding; call
    /// [`Receiver::notify_receive`] once it arrives.
    PendingDownload,
    /// Parsed, but the coordination context no longer accepts work.
    Undelivered,
}

/// Parsing context for one inbound vendor message.
pub struct Receiver<N: MessageNormalizer> {
    normalizer: Arc<N>,
    notifier: MessageNotifier,
    state: ParseState,
    vendor: Option<Arc<N::Vendor>>,
    message: Option<Arc<NormalizedMessage>>,
}

impl<N: MessageNormalizer> Receiver<N> {
    pub fn new(normalizer: Arc<N>, notifier: MessageNotifier) -> Self {
        Self {
            normalizer,
            notifier,
            state: ParseState::Unparsed,
            vendor: None,
            message: None,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Normalizes `vendor`. Failures go to the normalizer's parse-error hook
    /// and yield `false`; they never propagate.
    pub fn parse(&mut self, vendor: N::Vendor) -> bool {
        let vendor = Arc::new(vendor);
        self.vendor = Some(Arc::clone(&vendor));
        self.message = None;

        match self.normalizer.normalize(&vendor) {
            Ok(mut data) => {
                self.normalizer.fill(&mut data, &vendor);
                debug!(data_type = data.data_type, "vendor message normalized");
                self.message = Some(Arc::new(NormalizedMessage::new(data, vendor)));
                self.state = ParseState::Parsed;
                true
            }
            Err(err) => {
                self.state = ParseState::Failed;
                metrics::counter!("imb_parse_failures").increment(1);
                self.normalizer.on_parse_error(&err);
                false
            }
        }
    }

    pub fn message(&self) -> Option<Arc<NormalizedMessage>> {
        self.message.clone()
    }

    pub fn vendor_message(&self) -> Option<&N::Vendor> {
        self.vendor.as_deref()
    }

    /// Classifier of the parsed message, `0` when nothing is parsed.
    pub fn data_type(&self) -> i32 {
        self.message.as_ref().map_or(0, |m| m.data_type())
    }

    pub fn is_need_download_data(&self, callback: Option<Arc<dyn ResultCallback>>) -> bool {
        match &self.message {
            Some(message) if self.state == ParseState::Parsed => {
                self.normalizer.needs_download(message, callback)
            }
            _ => false,
        }
    }

    /// Notifies every observer about the parsed message on the coordination
    /// context. Returns `false` if there is nothing parsed to deliver or the
    /// delivery was rejected.
    pub fn notify_receive(&self) -> bool {
        match &self.message {
            Some(message) if self.state == ParseState::Parsed => {
                self.notifier.notify(Arc::clone(message))
            }
            _ => {
                debug!(state = ?self.state, "notify requested without a parsed message");
                false
            }
        }
    }

    /// Parses `vendor` and notifies observers unless a download is outstanding.
    pub fn receive(&mut self, vendor: N::Vendor) -> ReceiveOutcome {
        if !self.parse(vendor) {
            return ReceiveOutcome::Failed;
        }
        if self.is_need_download_data(None) {
            return ReceiveOutcome::PendingDownload;
        }
        if self.notify_receive() {
            ReceiveOutcome::Notified
        } else {
            ReceiveOutcome::Undelivered
        }
    }
}

/// Reads the integer classifier `field` from a JSON object document.
///
/// ```
/// use imb_core::guess_data_type;
///
/// assert_eq!(guess_data_type(r#"{"type": 7, "text": "hi"}"#, "type"), Some(7));
/// assert_eq!(guess_data_type(r#"{"text": "hi"}"#, "type"), None);
/// assert_eq!(guess_data_type("not json", "type"), None);
/// ```
pub fn guess_data_type(json: &str, field: &str) -> Option<i32> {
    let value: Value = serde_json::from_str(json).ok()?;
    classifier(&value, field)
}

fn classifier(value: &Value, field: &str) -> Option<i32> {
    value
        .get(field)
        .and_then(Value::as_i64)
        .and_then(|n| i32::try_from(n).ok())
}

/// Normalizer for backends whose vendor messages are JSON text carrying an
/// integer classifier field.
#[derive(Debug, Clone)]
pub struct JsonNormalizer {
    data_type_field: String,
}

impl JsonNormalizer {
    pub fn new(data_type_field: impl Into<String>) -> Self {
        Self {
            data_type_field: data_type_field.into(),
        }
    }

    pub fn data_type_field(&self) -> &str {
        &self.data_type_field
    }
}

impl Default for JsonNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_TYPE_FIELD)
    }
}

impl MessageNormalizer for JsonNormalizer {
    type Vendor = String;

    fn normalize(&self, vendor: &String) -> Result<MessageData, NormalizeError> {
        let value: Value = serde_json::from_str(vendor)?;
        let data_type =
            classifier(&value, &self.data_type_field).ok_or_else(|| {
                NormalizeError::MissingDataType {
                    field: self.data_type_field.clone(),
                }
            })?;
        Ok(MessageData::new(data_type, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InlineExecutor;
    use crate::testkit::RecordingObserver;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn notifier_with(observer: Arc<RecordingObserver>) -> MessageNotifier {
        let observers = Arc::new(ObserverRegistry::new());
        observers.add(observer);
        MessageNotifier::new(observers, Arc::new(InlineExecutor))
    }

    #[test]
    fn json_normalizer_reads_configured_field() {
        let normalizer = JsonNormalizer::new("kind");
        let data = normalizer
            .normalize(&r#"{"kind": 4, "text": "yo"}"#.to_string())
            .unwrap();
        assert_eq!(data.data_type, 4);
        assert_eq!(data.payload["text"], json!("yo"));

        let err = normalizer
            .normalize(&r#"{"type": 4}"#.to_string())
            .unwrap_err();
        assert!(matches!(err, NormalizeError::MissingDataType { field } if field == "kind"));
    }

    #[test]
    fn failed_parse_reports_false_and_keeps_no_message() {
        let observer = Arc::new(RecordingObserver::new("o"));
        let mut receiver = Receiver::new(
            Arc::new(JsonNormalizer::default()),
            notifier_with(observer.clone()),
        );
        assert!(!receiver.parse("{oops".to_string()));
        assert_eq!(receiver.state(), ParseState::Failed);
        assert_eq!(receiver.data_type(), 0);
        assert!(!receiver.notify_receive());
        assert!(!receiver.is_need_download_data(None));
        assert!(observer.received().is_empty());
        assert_eq!(receiver.vendor_message().map(String::as_str), Some("{oops"));
    }

    struct Attachments {
        fills: AtomicUsize,
        started: Mutex<Vec<bool>>,
    }

    impl MessageNormalizer for Attachments {
        type Vendor = (i32, bool);

        fn normalize(&self, vendor: &(i32, bool)) -> Result<MessageData, NormalizeError> {
            Ok(MessageData::new(vendor.0, json!({})))
        }

        fn fill(&self, data: &mut MessageData, vendor: &(i32, bool)) {
            self.fills.fetch_add(1, Ordering::SeqCst);
            data.context.insert("has_file".into(), json!(vendor.1));
        }

        fn needs_download(
            &self,
            message: &NormalizedMessage,
            callback: Option<Arc<dyn ResultCallback>>,
        ) -> bool {
            let needed = message.data().context["has_file"] == json!(true);
            if needed {
                self.started.lock().unwrap().push(callback.is_some());
            }
            needed
        }
    }

    #[test]
    fn receive_defers_notification_until_download_completes() {
        let observer = Arc::new(RecordingObserver::new("o"));
        let normalizer = Arc::new(Attachments {
            fills: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
        });
        let mut receiver = Receiver::new(Arc::clone(&normalizer), notifier_with(observer.clone()));

        assert_eq!(receiver.receive((9, true)), ReceiveOutcome::PendingDownload);
        assert!(observer.received().is_empty());
        assert_eq!(normalizer.fills.load(Ordering::SeqCst), 1);

        let cb: Arc<dyn ResultCallback> =
            Arc::new(crate::testkit::RecordingCallback::new(None));
        assert!(receiver.is_need_download_data(Some(cb)));
        assert_eq!(*normalizer.started.lock().unwrap(), vec![false, true]);

        assert!(receiver.notify_receive());
        assert_eq!(observer.received(), vec![9]);

        assert_eq!(receiver.receive((3, false)), ReceiveOutcome::Notified);
        assert_eq!(observer.received(), vec![9, 3]);
        assert_eq!(receiver.message().unwrap().raw::<(i32, bool)>(), Some(&(3, false)));
    }
}
