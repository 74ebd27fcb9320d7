/// Background failover: a single worker fed by a one-slot queue.
///
/// A trigger is accepted only when no election is queued or running; any
/// trigger arriving in the meantime is dropped. One outage therefore yields
/// at most one election and one alert cycle, however many callers noticed
/// the broken connection.
use super::Elector;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Receives operator alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, title: &str, body: &str, cause: &str);
}

/// Alert sink that only writes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, title: &str, body: &str, cause: &str) {
        error!(cause = %cause, "{}: {}", title, body);
    }
}

/// Rate-limited front for an `AlertSink`
pub struct FailoverNotifier {
    sink: Arc<dyn AlertSink>,
    interval: Duration,
    last_outage_alert: Mutex<Option<Instant>>,
}

impl FailoverNotifier {
    pub fn new(sink: Arc<dyn AlertSink>, interval: Duration) -> Self {
        Self {
            sink,
            interval,
            last_outage_alert: Mutex::new(None),
        }
    }

    /// Report a lost master connection. Returns false when the alert was
    /// suppressed because another one went out less than `interval` ago.
    pub async fn outage(&self, cause: &str) -> bool {
        {
            let mut last = self.last_outage_alert.lock().await;
            let now = Instant::now();
            if matches!(*last, Some(at) if now.duration_since(at) < self.interval) {
                debug!(cause = %cause, "Outage alert suppressed");
                return false;
            }
            *last = Some(now);
        }

        self.sink
            .notify(
                "Store master connection lost",
                "Remote calls failed against the current master; a new election is running.",
                cause,
            )
            .await;
        true
    }

    /// Report the outcome of an election when the master changed
    pub async fn failover(&self, previous: Option<&str>, elected: &str, cause: &str) {
        let body = format!(
            "Master moved from {} to {}",
            previous.unwrap_or("<none>"),
            elected
        );
        self.sink.notify("Store master switched", &body, cause).await;
    }
}

#[derive(Debug)]
struct FailoverRequest {
    cause: String,
}

/// Cheap handle used to request an election
#[derive(Debug, Clone)]
pub struct FailoverHandle {
    tx: mpsc::Sender<FailoverRequest>,
    in_progress: Arc<AtomicBool>,
}

impl FailoverHandle {
    /// Ask for an election. Returns false when one is already queued or
    /// running, or the worker has stopped.
    pub fn trigger(&self, cause: &str) -> bool {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(cause = %cause, "Election already in progress, trigger dropped");
            return false;
        }

        let request = FailoverRequest {
            cause: cause.to_string(),
        };
        match self.tx.try_send(request) {
            Ok(()) => true,
            Err(e) => {
                self.in_progress.store(false, Ordering::SeqCst);
                warn!("Failover worker rejected trigger: {}", e);
                false
            }
        }
    }

    /// Whether an election is queued or running
    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }
}

pub struct FailoverWorker;

impl FailoverWorker {
    /// Start the worker task. It stops once every handle is dropped.
    pub fn spawn(elector: Arc<Elector>, notifier: Arc<FailoverNotifier>) -> (FailoverHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<FailoverRequest>(1);
        let in_progress = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&in_progress);
        let task = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                Self::run_once(&elector, &notifier, &request.cause).await;
                flag.store(false, Ordering::SeqCst);
            }
            debug!("Failover worker stopped");
        });

        (FailoverHandle { tx, in_progress }, task)
    }

    async fn run_once(elector: &Elector, notifier: &FailoverNotifier, cause: &str) {
        notifier.outage(cause).await;

        let previous = elector.master_descriptor().await;
        match elector.elect(cause).await {
            Some(elected) if previous.as_deref() != Some(elected.as_str()) => {
                info!(from = ?previous, to = %elected, "Failover completed");
                notifier.failover(previous.as_deref(), &elected, cause).await;
            }
            Some(elected) => {
                debug!(master = %elected, "Election kept the current master");
            }
            None => {
                error!(cause = %cause, "Failover found no reachable store node");
            }
        }
    }
}
