use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use devflow_types::{new_subscription_id, Classified, ErrorClass, Event, EventType, Severity};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, error, warn};

/// Event bus errors.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("event bus dispatcher is not running")]
    Closed,

    #[error("blocking publish timed out after {0:?}")]
    DeadlineExceeded(Duration),

    #[error("journal I/O error: {0}")]
    Journal(#[from] std::io::Error),
}

impl Classified for BusError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Closed | Self::Journal(_) => ErrorClass::Internal,
            Self::DeadlineExceeded(_) => ErrorClass::Transient,
        }
    }
}

/// Subscription filter: absent fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_types: Option<Vec<EventType>>,
    pub severities: Option<Vec<Severity>>,
}

impl EventFilter {
    #[must_use]
    pub fn for_types(types: impl Into<Vec<EventType>>) -> Self {
        Self {
            event_types: Some(types.into()),
            severities: None,
        }
    }

    fn matches(&self, event: &Event) -> bool {
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(severities) = &self.severities {
            if !severities.contains(&event.severity) {
                return false;
            }
        }
        true
    }
}

type SyncHandler = Arc<dyn Fn(&Event) + Send + Sync>;
type AsyncHandler =
    Arc<dyn Fn(Event) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

struct Subscriber {
    id: String,
    filter: Option<EventFilter>,
    handler: Handler,
}

/// Bus tuning.
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Blocking-pool width for sync handlers; `0` runs them inline on the
    /// dispatcher task.
    pub max_workers: usize,
    /// Dispatches slower than this are flagged at WARN.
    pub slow_handler: Duration,
    /// How long `publish_blocking` waits for handler completion.
    pub blocking_deadline: Duration,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            max_workers: 10,
            slow_handler: Duration::from_millis(100),
            blocking_deadline: Duration::from_secs(30),
        }
    }
}

struct Job {
    event: Event,
    ack: Option<oneshot::Sender<()>>,
}

struct Shared {
    // Copy-on-write: the lock is held only to snapshot or swap the Arc.
    subscribers: Mutex<Arc<Vec<Arc<Subscriber>>>>,
    options: BusOptions,
    sync_permits: Option<Arc<Semaphore>>,
}

/// The in-process pub/sub bus. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Job>,
}

impl EventBus {
    /// Construct the bus and start its dispatcher task.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(options: BusOptions) -> Self {
        let sync_permits = if options.max_workers == 0 {
            None
        } else {
            Some(Arc::new(Semaphore::new(options.max_workers)))
        };
        let shared = Arc::new(Shared {
            subscribers: Mutex::new(Arc::new(Vec::new())),
            options,
            sync_permits,
        });
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(Arc::clone(&shared), rx));
        Self { shared, tx }
    }

    /// Register a synchronous handler. Returns the subscription id.
    pub fn subscribe_sync<F>(&self, filter: Option<EventFilter>, handler: F) -> String
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.push_subscriber(filter, Handler::Sync(Arc::new(handler)))
    }

    /// Register a cooperative-async handler. Returns the subscription id.
    pub fn subscribe_async<F, Fut>(&self, filter: Option<EventFilter>, handler: F) -> String
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: AsyncHandler = Arc::new(move |event| Box::pin(handler(event)));
        self.push_subscriber(filter, Handler::Async(handler))
    }

    fn push_subscriber(&self, filter: Option<EventFilter>, handler: Handler) -> String {
        let id = new_subscription_id();
        let subscriber = Arc::new(Subscriber {
            id: id.clone(),
            filter,
            handler,
        });
        let mut guard = self.shared.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let mut next: Vec<_> = guard.iter().cloned().collect();
        next.push(subscriber);
        *guard = Arc::new(next);
        id
    }

    /// Remove a subscription. Idempotent: unknown ids are ignored.
    pub fn unsubscribe(&self, id: &str) {
        let mut guard = self.shared.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if guard.iter().any(|s| s.id == id) {
            let next: Vec<_> = guard.iter().filter(|s| s.id != id).cloned().collect();
            *guard = Arc::new(next);
        }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Fire-and-forget publish: returns once dispatch is scheduled.
    pub fn publish(&self, event: Event) {
        if self.tx.send(Job { event, ack: None }).is_err() {
            warn!("event dropped: bus dispatcher is gone");
        }
    }

    /// Publish and wait until every handler has completed (or the deadline
    /// expires).
    pub async fn publish_blocking(&self, event: Event) -> Result<(), BusError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Job {
                event,
                ack: Some(ack_tx),
            })
            .map_err(|_| BusError::Closed)?;
        let deadline = self.shared.options.blocking_deadline;
        match tokio::time::timeout(deadline, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => Err(BusError::DeadlineExceeded(deadline)),
        }
    }

    /// True while the dispatcher task is alive; used by health checks.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

async fn dispatch_loop(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        let snapshot = {
            let guard = shared.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(&guard)
        };
        dispatch_one(&shared, &snapshot, &job.event).await;
        if let Some(ack) = job.ack {
            let _ = ack.send(());
        }
    }
    debug!("event bus dispatcher stopped");
}

/// Deliver one event to every matching subscriber, awaiting completion so
/// the next event in the queue observes FIFO ordering.
async fn dispatch_one(shared: &Shared, subscribers: &[Arc<Subscriber>], event: &Event) {
    let mut joins = Vec::new();
    for subscriber in subscribers {
        if let Some(filter) = &subscriber.filter {
            if !filter.matches(event) {
                continue;
            }
        }
        match &subscriber.handler {
            Handler::Sync(handler) => {
                if let Some(permits) = &shared.sync_permits {
                    let permits = Arc::clone(permits);
                    let handler = Arc::clone(handler);
                    let event = event.clone();
                    let sub_id = subscriber.id.clone();
                    let slow = shared.options.slow_handler;
                    joins.push(tokio::spawn(async move {
                        let _permit = permits.acquire_owned().await.ok();
                        let handle = tokio::task::spawn_blocking(move || {
                            let started = Instant::now();
                            (handler.as_ref())(&event);
                            started.elapsed()
                        });
                        finish_dispatch(&sub_id, slow, handle.await);
                    }));
                } else {
                    // max_workers = 0: run inline on the dispatcher.
                    let started = Instant::now();
                    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                        (handler.as_ref())(event);
                    }));
                    observe_duration(&subscriber.id, shared.options.slow_handler, started.elapsed());
                    if result.is_err() {
                        error!(subscription = %subscriber.id, event_type = %event.event_type,
                            "event handler panicked");
                    }
                }
            }
            Handler::Async(handler) => {
                let future = (handler.as_ref())(event.clone());
                let sub_id = subscriber.id.clone();
                let slow = shared.options.slow_handler;
                joins.push(tokio::spawn(async move {
                    let handle = tokio::spawn(async move {
                        let started = Instant::now();
                        future.await;
                        started.elapsed()
                    });
                    finish_dispatch(&sub_id, slow, handle.await);
                }));
            }
        }
    }
    for join in joins {
        // The inner task already logged its own failure.
        let _ = join.await;
    }
}

fn finish_dispatch(
    sub_id: &str,
    slow: Duration,
    result: Result<Duration, tokio::task::JoinError>,
) {
    match result {
        Ok(elapsed) => observe_duration(sub_id, slow, elapsed),
        Err(join_err) => {
            error!(subscription = %sub_id, error = %join_err, "event handler failed");
        }
    }
}

fn observe_duration(sub_id: &str, slow: Duration, elapsed: Duration) {
    if elapsed > slow {
        warn!(subscription = %sub_id, duration_ms = elapsed.as_millis() as u64,
            threshold_ms = slow.as_millis() as u64, "slow event handler");
    }
}
