use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use clap::Parser;
use imb_core::{
    CallbackOutcome, CoordinationExecutor, CoordinationThread, CoreConfig, Dispatcher, FnCallback,
    InMemoryBackend, JsonNormalizer, MessageData, MessageObserver, NormalizedMessage,
    ReceiveOutcome, RemoteError, ResultCallback, SweeperConfig, spawn_expiry_sweeper,
};
use imb_telemetry::{TelemetryLabels, record_counter, record_gauge};
use serde::Serialize;
use serde_json::json;
use tracing::info;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Drive a scripted IM session against the in-memory backend")]
struct Cli {
    /// Peer receiving the direct messages
    #[arg(long, default_value = "alice")]
    peer: String,
    /// Group used for the group send, join and quit steps
    #[arg(long, default_value = "team")]
    group: String,
    /// Number of direct messages to send
    #[arg(long, default_value_t = 3)]
    messages: usize,
    /// Inbound vendor payloads (JSON) to feed through the receiver
    #[arg(long = "inbound")]
    inbound: Vec<String>,
    /// Tag whose callbacks are cancelled before results arrive
    #[arg(long)]
    cancel_tag: Option<String>,
    /// Fail outstanding requests with this remote error code instead of settling them
    #[arg(long)]
    fail_code: Option<i32>,
    /// Enable verbose dispatch diagnostics
    #[arg(long)]
    debug: bool,
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
struct Summary {
    sent: usize,
    resolved: usize,
    succeeded: usize,
    failed: usize,
    cancelled: usize,
    inbound_notified: usize,
    inbound_pending: usize,
    inbound_undelivered: usize,
    inbound_failed: usize,
    observed: Vec<i32>,
    pending_callbacks: usize,
}

/// Printed on exit: the session summary plus counter totals.
#[derive(Serialize)]
struct Report<'a> {
    summary: &'a Summary,
    metrics: BTreeMap<String, u64>,
}

impl Summary {
    fn record_inbound(&mut self, outcome: ReceiveOutcome) {
        match outcome {
            ReceiveOutcome::Notified => self.inbound_notified += 1,
            ReceiveOutcome::PendingDownload => self.inbound_pending += 1,
            ReceiveOutcome::Undelivered => self.inbound_undelivered += 1,
            ReceiveOutcome::Failed => self.inbound_failed += 1,
        }
    }
}

/// Observer that logs every inbound message and keeps its data type.
#[derive(Default)]
struct LoggingObserver {
    seen: Mutex<Vec<i32>>,
}

impl LoggingObserver {
    fn seen(&self) -> Vec<i32> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl MessageObserver for LoggingObserver {
    fn on_message(&self, message: &NormalizedMessage) -> Result<()> {
        info!(data_type = message.data_type(), payload = %message.data().payload, "inbound message");
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.data_type());
        Ok(())
    }
}

#[derive(Default)]
struct Tally {
    succeeded: usize,
    failed: usize,
}

fn tallying_callback(tally: &Arc<Mutex<Tally>>, tag: &str) -> Arc<dyn ResultCallback> {
    let tally = Arc::clone(tally);
    Arc::new(
        FnCallback::new(move |outcome: CallbackOutcome| {
            let mut tally = tally.lock().unwrap_or_else(PoisonError::into_inner);
            match outcome {
                Ok(_) => tally.succeeded += 1,
                Err(err) => {
                    tracing::warn!(code = err.code, error = %err.message, "request failed");
                    tally.failed += 1;
                }
            }
        })
        .with_tag(tag),
    )
}

fn build_dispatcher(
    cfg: &CoreConfig,
    debug: bool,
    coordinator: &Arc<CoordinationThread>,
) -> Result<Arc<Dispatcher<InMemoryBackend>>> {
    let executor: Arc<dyn CoordinationExecutor> = coordinator.clone();
    let dispatcher: Dispatcher<InMemoryBackend> = Dispatcher::new(executor);
    dispatcher.set_debug_mode(cfg.debug || debug);
    let backend = InMemoryBackend::new(
        dispatcher.callbacks(),
        dispatcher.notifier(),
        JsonNormalizer::new(cfg.data_type_field.clone()),
    );
    dispatcher
        .set_backend(backend)
        .context("installing in-memory backend")?;
    Ok(Arc::new(dispatcher))
}

/// Runs the scripted session. Blocks on the coordination thread, so call it
/// off the async runtime.
fn run_session(
    cli: &Cli,
    dispatcher: &Dispatcher<InMemoryBackend>,
    coordinator: &CoordinationThread,
) -> Summary {
    let observer = Arc::new(LoggingObserver::default());
    let as_observer: Arc<dyn MessageObserver> = observer.clone();
    dispatcher.add_observer(as_observer.clone());

    let tally = Arc::new(Mutex::new(Tally::default()));
    let mut summary = Summary::default();

    for n in 0..cli.messages {
        let data = MessageData::new(1, json!({ "text": format!("hello #{n}") }));
        dispatcher.send_direct(&cli.peer, data, Some(tallying_callback(&tally, "chat")));
        summary.sent += 1;
    }
    let group_data = MessageData::new(1, json!({ "text": "hello group" }));
    dispatcher.send_group(&cli.group, group_data, Some(tallying_callback(&tally, "group")));
    summary.sent += 1;
    dispatcher.join_group(&cli.group, Some(tallying_callback(&tally, "group")));
    dispatcher.quit_group(&cli.group, Some(tallying_callback(&tally, "group")));

    if let Some(tag) = &cli.cancel_tag {
        summary.cancelled = dispatcher.remove_callbacks_by_tag(tag);
    }

    let backend = dispatcher.backend();
    summary.resolved = match cli.fail_code {
        Some(code) => backend.fail_all(RemoteError::new(code, "rejected by demo script")),
        None => backend.settle_all(),
    };

    for raw in &cli.inbound {
        summary.record_inbound(backend.deliver_inbound(raw.as_str()));
    }
    coordinator.flush();
    dispatcher.remove_observer(&as_observer);

    let tally = tally.lock().unwrap_or_else(PoisonError::into_inner);
    summary.succeeded = tally.succeeded;
    summary.failed = tally.failed;
    summary.observed = observer.seen();
    summary.pending_callbacks = dispatcher.callbacks().len();

    let outcome = if cli.fail_code.is_some() { "failed" } else { "settled" };
    let labels = TelemetryLabels::new("in-memory").with_label("outcome", outcome);
    record_counter("imb_demo_requests", summary.resolved as u64, &labels);
    record_gauge(
        "imb_demo_pending_callbacks",
        summary.pending_callbacks as f64,
        &TelemetryLabels::new("in-memory"),
    );
    summary
}

#[tokio::main]
async fn main() -> Result<()> {
    imb_telemetry::install("imb-demo")?;
    let cli = Cli::parse();
    let cfg = CoreConfig::from_env();
    info!(
        version = imb_core::version(),
        ttl_secs = cfg.callback_ttl.as_secs(),
        sweep_secs = cfg.sweep_interval.as_secs(),
        "starting scripted session"
    );

    let coordinator =
        CoordinationThread::spawn("imb-coordinator").context("spawning coordination thread")?;
    let dispatcher = build_dispatcher(&cfg, cli.debug, &coordinator)?;
    let sweeper = spawn_expiry_sweeper(dispatcher.callbacks(), SweeperConfig::from(&cfg));

    let session = {
        let dispatcher = Arc::clone(&dispatcher);
        let coordinator = Arc::clone(&coordinator);
        tokio::task::spawn_blocking(move || run_session(&cli, &dispatcher, &coordinator))
    };
    let summary = session.await.context("session task panicked")?;

    sweeper.abort();
    coordinator.shutdown();

    let report = Report {
        summary: &summary,
        metrics: imb_telemetry::metrics_snapshot()
            .map(|snapshot| snapshot.counters)
            .unwrap_or_default(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
