// Asynchronous publishing: producers capture snapshots, one task rebuilds and
// publishes them, backing off while the hub is unavailable.
pub mod backoff;

use async_trait::async_trait;
use logbus_common::LoggingParameters;
use logbus_wire::{DefaultLogEvent, Level};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DispatchConfig;
use crate::{ClientError, Result};
use backoff::Backoff;

/// Where rebuilt events go. Implemented by [`crate::SocketClient`].
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &DefaultLogEvent) -> Result<()>;

    async fn close(&self) {}
}

/// Observes the outcome of asynchronous publishes.
pub trait PublishingListener: Send + Sync {
    fn on_published(&self, event: &DefaultLogEvent);
    fn on_publish_failed(&self, event: &DefaultLogEvent, error: &ClientError);
}

/// Everything needed to build a [`DefaultLogEvent`] later, on the dispatch task.
#[derive(Debug, Clone)]
pub struct EventSnapshot {
    pub params: Arc<LoggingParameters>,
    pub time_millis: i64,
    pub level: Level,
    pub logger_name: String,
    pub message: String,
    pub thread_name: String,
    pub sequence_number: i64,
    pub channel: Option<String>,
    pub source_class_name: Option<String>,
    pub source_method_name: Option<String>,
    pub formatted_exception: Option<String>,
    pub formatted_object: Option<Vec<String>>,
}

impl EventSnapshot {
    /// Capture an event now, on the calling thread.
    pub fn capture(
        params: Arc<LoggingParameters>,
        level: Level,
        logger_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let thread_name = std::thread::current()
            .name()
            .unwrap_or("unnamed")
            .to_string();
        Self {
            params,
            time_millis: now_millis(),
            level,
            logger_name: logger_name.into(),
            message: message.into(),
            thread_name,
            sequence_number: 0,
            channel: None,
            source_class_name: None,
            source_method_name: None,
            formatted_exception: None,
            formatted_object: None,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_exception(mut self, formatted: impl Into<String>) -> Self {
        self.formatted_exception = Some(formatted.into());
        self
    }

    pub fn rebuild(&self) -> DefaultLogEvent {
        DefaultLogEvent {
            local_creation_time_millis: self.time_millis,
            level: self.level.value(),
            message: self.message.clone(),
            source_host: self.params.source_host.clone(),
            source_application: self.params.application_name.clone(),
            pid: self.params.pid,
            thread_name: self.thread_name.clone(),
            logger_name: self.logger_name.clone(),
            source_address: self.params.source_address.clone(),
            channel: self.channel.clone(),
            source_class_name: self.source_class_name.clone(),
            source_method_name: self.source_method_name.clone(),
            formatted_exception: self.formatted_exception.clone(),
            formatted_object: self.formatted_object.clone(),
            sequence_number: self.sequence_number,
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<EventSnapshot>,
    // The drain task holds a snapshot it has not finished publishing.
    in_flight: bool,
}

struct QueueShared {
    config: DispatchConfig,
    state: Mutex<QueueState>,
    discards: AtomicU64,
    closing: AtomicBool,
    work: Notify,
    idle: Notify,
}

impl QueueShared {
    fn is_idle(&self) -> bool {
        if self.closing.load(Ordering::SeqCst) {
            return true;
        }
        let state = self.state.lock();
        state.entries.is_empty() && !state.in_flight
    }
}

/// Bounded drop-oldest queue drained by a single publishing task.
///
/// ```
/// use logbus_client::{DispatchConfig, DispatchQueue, EventSnapshot};
/// use logbus_common::LoggingParameters;
/// use logbus_wire::Level;
/// use std::sync::Arc;
///
/// let queue = DispatchQueue::new(&DispatchConfig { max_dispatch_queue: 2, ..DispatchConfig::default() });
/// let params = Arc::new(LoggingParameters::new("demo"));
/// for message in ["a", "b", "c"] {
///     queue.enqueue(EventSnapshot::capture(params.clone(), Level::INFO, "demo", message));
/// }
/// assert_eq!(queue.len(), 2);
/// assert_eq!(queue.discards(), 1);
/// ```
pub struct DispatchQueue {
    shared: Arc<QueueShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchQueue {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                config: config.clone(),
                state: Mutex::new(QueueState::default()),
                discards: AtomicU64::new(0),
                closing: AtomicBool::new(false),
                work: Notify::new(),
                idle: Notify::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Spawn the drain task. Snapshots queued before this call are kept.
    pub fn start(&self, sink: Arc<dyn EventSink>, listener: Option<Arc<dyn PublishingListener>>) {
        let mut task = self.task.lock();
        if task.is_some() {
            warn!("dispatch task already running");
            return;
        }
        *task = Some(tokio::spawn(run_dispatch(
            Arc::clone(&self.shared),
            sink,
            listener,
        )));
    }

    /// Queue `snapshot`, discarding the oldest entry when over capacity.
    pub fn enqueue(&self, snapshot: EventSnapshot) {
        let discarded = {
            let mut state = self.shared.state.lock();
            state.entries.push_back(snapshot);
            state.entries.len() > self.shared.config.max_dispatch_queue
                && state.entries.pop_front().is_some()
        };
        if discarded {
            let total = self.shared.discards.fetch_add(1, Ordering::Relaxed) + 1;
            metrics::counter!("logbus_dispatch_discarded_total").increment(1);
            debug!(total, "dispatch queue full; discarded oldest event");
        }
        self.shared.work.notify_one();
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn discards(&self) -> u64 {
        self.shared.discards.load(Ordering::Relaxed)
    }

    /// Resolves once the queue is empty and nothing is being published, or
    /// the queue has been closed. Returns at once when no drain task was
    /// started, since nothing would ever empty the queue.
    pub async fn wait_until_all_published(&self) {
        loop {
            let idle = self.shared.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.shared.is_idle() {
                return;
            }
            if self.task.lock().is_none() {
                debug!(queued = self.len(), "no dispatch task; not waiting for queued events");
                return;
            }
            idle.await;
        }
    }

    /// Stop the drain task. Queued snapshots are not flushed.
    pub fn close(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.shared.idle.notify_waiters();
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

impl fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("len", &self.len())
            .field("discards", &self.discards())
            .field("closing", &self.shared.closing.load(Ordering::SeqCst))
            .finish()
    }
}

async fn run_dispatch(
    shared: Arc<QueueShared>,
    sink: Arc<dyn EventSink>,
    listener: Option<Arc<dyn PublishingListener>>,
) {
    let mut backoff = Backoff::from_config(&shared.config);
    loop {
        let next = {
            let mut state = shared.state.lock();
            let next = state.entries.pop_front();
            state.in_flight = next.is_some();
            next
        };
        let Some(snapshot) = next else {
            shared.idle.notify_waiters();
            shared.work.notified().await;
            continue;
        };

        let event = snapshot.rebuild();
        match sink.publish(&event).await {
            Ok(()) => {
                backoff.on_success();
                if let Some(listener) = &listener {
                    listener.on_published(&event);
                }
                shared.state.lock().in_flight = false;
            }
            Err(err) => {
                if shared.closing.load(Ordering::SeqCst) {
                    break;
                }
                if let Some(listener) = &listener {
                    listener.on_publish_failed(&event, &err);
                }
                {
                    let mut state = shared.state.lock();
                    state.entries.push_front(snapshot);
                    state.in_flight = false;
                }
                metrics::counter!("logbus_dispatch_publish_failures_total").increment(1);
                let delay = backoff.on_failure();
                if !shared.config.tolerate_hub_unavailable {
                    info!(
                        error = %err,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "could not publish to hub; retrying after delay"
                    );
                }
                tokio::time::sleep(delay).await;
            }
        }
    }
}
