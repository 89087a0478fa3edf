//! The single logical thread observers are notified on.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Unit of work run on the coordination context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Designated context that owns observer notification.
pub trait CoordinationExecutor: Send + Sync {
    /// Whether the caller is already running on this context.
    fn is_current(&self) -> bool;

    /// Queues `job` to run on this context. Returns `false` when the context
    /// no longer accepts work and `job` was dropped.
    fn post(&self, job: Job) -> bool;
}

/// Runs `job` on `executor`: inline when already there, otherwise after
/// exactly one [`CoordinationExecutor::post`] hop. Returns `false` if the
/// job was rejected.
pub fn run_on(executor: &dyn CoordinationExecutor, job: Job) -> bool {
    if executor.is_current() {
        job();
        true
    } else {
        executor.post(job)
    }
}

/// Executor that treats every caller as the coordination context.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl CoordinationExecutor for InlineExecutor {
    fn is_current(&self) -> bool {
        true
    }

    fn post(&self, job: Job) -> bool {
        job();
        true
    }
}

/// Dedicated OS thread draining a job queue in FIFO order.
///
/// ```
/// use imb_core::{CoordinationExecutor, CoordinationThread};
/// use std::sync::{Arc, Mutex};
///
/// let coordinator = CoordinationThread::spawn("imb-doc").expect("spawn");
/// let seen = Arc::new(Mutex::new(false));
/// let flag = Arc::clone(&seen);
/// coordinator.post(Box::new(move || *flag.lock().unwrap() = true));
/// coordinator.flush();
/// assert!(*seen.lock().unwrap());
/// assert!(!coordinator.is_current());
/// ```
pub struct CoordinationThread {
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    thread_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CoordinationThread {
    pub fn spawn(name: &str) -> std::io::Result<Arc<Self>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        warn!("coordination job panicked");
                    }
                }
                debug!("coordination thread stopped");
            })?;
        Ok(Arc::new(Self {
            sender: Mutex::new(Some(tx)),
            thread_id: handle.thread().id(),
            handle: Mutex::new(Some(handle)),
        }))
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Blocks until every job posted before this call has run.
    ///
    /// Returns immediately when called from the coordination thread itself.
    pub fn flush(&self) {
        if self.is_current() {
            return;
        }
        let (tx, rx) = oneshot::channel::<()>();
        self.post(Box::new(move || {
            let _ = tx.send(());
        }));
        let _ = rx.blocking_recv();
    }

    /// Stops accepting jobs, lets queued jobs finish and joins the thread.
    pub fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if self.is_current() {
            return;
        }
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("coordination thread terminated by a panic");
            }
        }
    }
}

impl CoordinationExecutor for CoordinationThread {
    fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    fn post(&self, job: Job) -> bool {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(sender) if sender.send(job).is_ok() => true,
            _ => {
                warn!("coordination thread is shut down; job dropped");
                false
            }
        }
    }
}

impl Drop for CoordinationThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn run_on_redirects_foreign_callers_once() {
        let coordinator = CoordinationThread::spawn("imb-test-coord").unwrap();
        let target = coordinator.thread_id();
        let runs = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&runs);
        run_on(
            coordinator.as_ref(),
            Box::new(move || sink.lock().unwrap().push(thread::current().id())),
        );
        coordinator.flush();

        assert_eq!(*runs.lock().unwrap(), vec![target]);
    }

    #[test]
    fn run_on_is_inline_on_the_coordination_thread() {
        let coordinator = CoordinationThread::spawn("imb-test-inline").unwrap();
        let inner = Arc::clone(&coordinator);
        let order = Arc::new(Mutex::new(Vec::new()));
        let outer_order = Arc::clone(&order);

        coordinator.post(Box::new(move || {
            let nested = Arc::clone(&outer_order);
            run_on(
                inner.as_ref(),
                Box::new(move || nested.lock().unwrap().push("nested")),
            );
            outer_order.lock().unwrap().push("outer");
        }));
        coordinator.flush();

        assert_eq!(*order.lock().unwrap(), vec!["nested", "outer"]);
    }

    #[test]
    fn jobs_after_shutdown_are_dropped() {
        let coordinator = CoordinationThread::spawn("imb-test-shutdown").unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let first = Arc::clone(&count);
        coordinator.post(Box::new(move || {
            first.fetch_add(1, Ordering::SeqCst);
        }));
        coordinator.shutdown();
        let second = Arc::clone(&count);
        let accepted = coordinator.post(Box::new(move || {
            second.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!accepted);
        assert!(!run_on(coordinator.as_ref(), Box::new(|| {})));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_job_does_not_stop_the_thread() {
        let coordinator = CoordinationThread::spawn("imb-test-panic").unwrap();
        assert!(coordinator.post(Box::new(|| panic!("one bad job"))));
        coordinator.flush();

        let count = Arc::new(AtomicUsize::new(0));
        let after = Arc::clone(&count);
        assert!(coordinator.post(Box::new(move || {
            after.fetch_add(1, Ordering::SeqCst);
        })));
        coordinator.flush();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn inline_executor_runs_immediately() {
        let hit = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hit);
        assert!(run_on(&InlineExecutor, Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })));
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }
}
