//! Batching event queue with bounded retry.
//!
//! Events accepted by the collector land in an in-memory buffer owned by
//! a background actor task. The buffer is flushed to storage when any of
//! three triggers fires:
//!
//! 1. **Threshold**: the buffer reaches `batch_size` events
//! 2. **Timeout**: `batch_timeout` elapses after the first buffered event
//! 3. **Ceiling**: `max_batch_delay` elapses since the last flush whose
//!    writes all committed, while events are still trickling in
//!
//! A flush atomically detaches the buffer inside the actor, groups the
//! detached events by type, and writes one batch per group; batches for
//! different stores proceed concurrently, and types sharing a store
//! serialize on that store's write gate. At most one flush is in flight;
//! events enqueued meanwhile land in a fresh buffer segment and a flush
//! requested during that window runs right after the current one lands.
//!
//! A failed batch write moves to the retry path: sleep
//! `base_delay * 2^attempt`, re-attempt, and after `max_retries`
//! failures drop the batch and count its length against the `dropped`
//! statistic. Shutdown cancels pending retries the same way.
//!
//! # Example
//!
//! ```no_run
//! use popmetrics_analytics::queue::{EventQueue, QueueConfig};
//! use popmetrics_analytics::storage::{game_store_schemas, StorageEngine};
//! use popmetrics_analytics::types::{EventType, GameEvent};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = StorageEngine::open("/tmp/popmetrics", 1, game_store_schemas()).unwrap();
//!     let queue = EventQueue::new(engine, QueueConfig::default());
//!
//!     let event = GameEvent::new(
//!         EventType::Performance,
//!         Some("session-1".to_string()),
//!         json!({ "fps": 60.0 }),
//!     );
//!     queue.enqueue(event).await.unwrap();
//!
//!     queue.flush().await.unwrap();
//!     queue.shutdown().await.unwrap();
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::config::AnalyticsConfig;
use crate::retry::{BatchJob, RetryPolicy};
use crate::storage::{BatchReport, StorageEngine, StorageError};
use crate::types::{EventType, GameEvent};

/// Capacity of the command channel into the queue actor.
const QUEUE_CHANNEL_CAPACITY: usize = 1024;

/// Errors returned by queue operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue actor has shut down.
    #[error("event queue is closed")]
    Closed,
}

/// Counters exposed by [`EventQueue::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStats {
    /// Events accepted into the buffer.
    pub collected: u64,
    /// Records written durably to storage.
    pub processed: u64,
    /// Failed write attempts plus individually rejected records.
    pub errors: u64,
    /// Records abandoned after retry exhaustion or at shutdown.
    pub dropped: u64,
    /// Events currently buffered and awaiting a flush.
    pub queue_size: usize,
}

/// Write-side interface the queue needs from storage.
///
/// [`StorageEngine`] is the production implementation; tests substitute
/// failure-injecting sinks to exercise the retry path.
pub trait BatchSink: Send + Sync + 'static {
    /// Upserts one batch of records into a store.
    fn save_batch(
        &self,
        store: &str,
        records: Vec<Value>,
    ) -> BoxFuture<'static, Result<BatchReport, StorageError>>;
}

impl BatchSink for StorageEngine {
    fn save_batch(
        &self,
        store: &str,
        records: Vec<Value>,
    ) -> BoxFuture<'static, Result<BatchReport, StorageError>> {
        let engine = self.clone();
        let store = store.to_string();
        Box::pin(async move { StorageEngine::save_batch(&engine, &store, records).await })
    }
}

/// Flush and retry tuning for the queue.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Buffered-event count that triggers an immediate flush.
    pub batch_size: usize,
    /// Flush deadline measured from the first buffered event.
    pub batch_timeout: Duration,
    /// Ceiling on event wait, measured from the last successful flush.
    pub max_batch_delay: Duration,
    /// Backoff schedule for failed batch writes.
    pub retry: RetryPolicy,
}

impl From<&AnalyticsConfig> for QueueConfig {
    fn from(config: &AnalyticsConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            batch_timeout: config.batch_timeout,
            max_batch_delay: config.max_batch_delay,
            retry: config.retry_policy(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from(&AnalyticsConfig::default())
    }
}

#[derive(Debug, Default)]
struct SharedStats {
    collected: AtomicU64,
    processed: AtomicU64,
    errors: AtomicU64,
    dropped: AtomicU64,
    queue_size: AtomicUsize,
}

impl SharedStats {
    fn add_collected(&self, n: u64) {
        self.collected.fetch_add(n, Ordering::SeqCst);
    }

    fn add_processed(&self, n: u64) {
        self.processed.fetch_add(n, Ordering::SeqCst);
    }

    fn add_errors(&self, n: u64) {
        self.errors.fetch_add(n, Ordering::SeqCst);
    }

    fn add_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::SeqCst);
    }

    fn set_queue_size(&self, n: usize) {
        self.queue_size.store(n, Ordering::SeqCst);
    }

    fn snapshot(&self) -> EventStats {
        EventStats {
            collected: self.collected.load(Ordering::SeqCst),
            processed: self.processed.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
            queue_size: self.queue_size.load(Ordering::SeqCst),
        }
    }
}

enum QueueCommand {
    Enqueue(GameEvent),
    Flush { done: oneshot::Sender<()> },
    Stats { reply: oneshot::Sender<EventStats> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Handle to the queue actor; commands are processed in send order.
#[derive(Debug)]
pub struct EventQueue {
    input_tx: mpsc::Sender<QueueCommand>,
    stats: Arc<SharedStats>,
    /// Handle to the background task (kept for cleanup).
    #[allow(dead_code)]
    task_handle: tokio::task::JoinHandle<()>,
}

impl EventQueue {
    /// Creates a queue writing batches to the storage engine.
    #[must_use]
    pub fn new(engine: StorageEngine, config: QueueConfig) -> Self {
        Self::with_sink(Arc::new(engine), config)
    }

    /// Creates a queue writing batches to an arbitrary sink.
    #[must_use]
    pub fn with_sink(sink: Arc<dyn BatchSink>, config: QueueConfig) -> Self {
        let (input_tx, input_rx) = mpsc::channel(QUEUE_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(SharedStats::default());

        let actor = QueueActor {
            sink,
            config,
            stats: Arc::clone(&stats),
            buffer: Vec::new(),
            first_event_at: None,
            last_success_at: Instant::now(),
            flush_requested: false,
            pending_waiters: Vec::new(),
            flushes: JoinSet::new(),
            retries: JoinSet::new(),
            shutdown_tx,
            shutdown_rx,
        };
        let task_handle = tokio::spawn(actor.run(input_rx));

        Self {
            input_tx,
            stats,
            task_handle,
        }
    }

    /// Appends an event to the buffer. A threshold flush triggered by
    /// this event starts before the actor takes its next command.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] after [`shutdown`](Self::shutdown).
    pub async fn enqueue(&self, event: GameEvent) -> Result<(), QueueError> {
        self.input_tx
            .send(QueueCommand::Enqueue(event))
            .await
            .map_err(|_| QueueError::Closed)
    }

    /// Forces a flush and resolves once its writes have completed
    /// (successfully or by hand-off to the retry path).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] after [`shutdown`](Self::shutdown).
    pub async fn flush(&self) -> Result<(), QueueError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.input_tx
            .send(QueueCommand::Flush { done: done_tx })
            .await
            .map_err(|_| QueueError::Closed)?;
        done_rx.await.map_err(|_| QueueError::Closed)
    }

    /// Snapshot of the collection counters, ordered after every command
    /// sent before it.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] after [`shutdown`](Self::shutdown).
    pub async fn stats(&self) -> Result<EventStats, QueueError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.input_tx
            .send(QueueCommand::Stats { reply: reply_tx })
            .await
            .map_err(|_| QueueError::Closed)?;
        reply_rx.await.map_err(|_| QueueError::Closed)
    }

    /// Stops the queue: waits for the in-flight flush, force-flushes the
    /// remaining buffer, cancels pending retries (counting their batches
    /// dropped), and resolves once the actor has exited.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] when the queue already shut down.
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.input_tx
            .send(QueueCommand::Shutdown { reply: reply_tx })
            .await
            .map_err(|_| QueueError::Closed)?;
        reply_rx.await.map_err(|_| QueueError::Closed)
    }
}

struct QueueActor {
    sink: Arc<dyn BatchSink>,
    config: QueueConfig,
    stats: Arc<SharedStats>,
    buffer: Vec<GameEvent>,
    /// When the oldest buffered event arrived; `None` while empty.
    first_event_at: Option<Instant>,
    /// When the last flush with every write committed landed; the
    /// max-delay ceiling measures from here, so failed flushes do not
    /// push it out.
    last_success_at: Instant,
    flush_requested: bool,
    pending_waiters: Vec<oneshot::Sender<()>>,
    flushes: JoinSet<FlushOutcome>,
    retries: JoinSet<()>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl QueueActor {
    async fn run(mut self, mut input_rx: mpsc::Receiver<QueueCommand>) {
        debug!(
            batch_size = self.config.batch_size,
            batch_timeout_ms = self.config.batch_timeout.as_millis() as u64,
            max_batch_delay_ms = self.config.max_batch_delay.as_millis() as u64,
            "Event queue started"
        );

        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                command = input_rx.recv() => match command {
                    Some(QueueCommand::Enqueue(event)) => self.on_enqueue(event),
                    Some(QueueCommand::Flush { done }) => self.on_flush_request(done),
                    Some(QueueCommand::Stats { reply }) => {
                        let _ = reply.send(self.stats.snapshot());
                    }
                    Some(QueueCommand::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        // Every handle dropped; drain and stop.
                        self.shutdown().await;
                        break;
                    }
                },

                Some(result) = self.flushes.join_next(), if !self.flushes.is_empty() => {
                    match result {
                        Ok(outcome) => self.on_flush_complete(outcome),
                        Err(join_error) => {
                            error!(error = %join_error, "Flush task failed");
                            self.on_flush_complete(FlushOutcome::failed());
                        }
                    }
                }

                // Reap finished retry tasks so the set stays small.
                Some(_) = self.retries.join_next(), if !self.retries.is_empty() => {}

                () = deadline_wait(deadline) => {
                    trace!("Flush deadline reached");
                    self.start_flush();
                }
            }
        }

        debug!("Event queue stopped");
    }

    /// The next instant a flush must start, if any.
    ///
    /// While a flush is in flight no deadline is armed; completion
    /// re-evaluates the fresh buffer segment.
    fn next_deadline(&self) -> Option<Instant> {
        if !self.flushes.is_empty() {
            return None;
        }
        let first = self.first_event_at?;
        let timeout_deadline = first + self.config.batch_timeout;
        let ceiling = self.last_success_at + self.config.max_batch_delay;
        Some(timeout_deadline.min(ceiling))
    }

    fn on_enqueue(&mut self, event: GameEvent) {
        if self.buffer.is_empty() {
            self.first_event_at = Some(Instant::now());
        }
        self.buffer.push(event);
        self.stats.add_collected(1);
        self.stats.set_queue_size(self.buffer.len());
        trace!(queue_size = self.buffer.len(), "Event buffered");

        if self.buffer.len() >= self.config.batch_size {
            self.start_flush();
        }
    }

    fn on_flush_request(&mut self, done: oneshot::Sender<()>) {
        if self.buffer.is_empty() && self.flushes.is_empty() {
            let _ = done.send(());
            return;
        }
        self.pending_waiters.push(done);
        self.start_flush();
    }

    /// Detaches the buffer and spawns the batch writes. With a flush
    /// already in flight the request is deferred until it lands.
    fn start_flush(&mut self) {
        if !self.flushes.is_empty() {
            self.flush_requested = true;
            return;
        }
        if self.buffer.is_empty() {
            for waiter in self.pending_waiters.drain(..) {
                let _ = waiter.send(());
            }
            return;
        }

        let events = std::mem::take(&mut self.buffer);
        self.first_event_at = None;
        self.stats.set_queue_size(0);
        let waiters = std::mem::take(&mut self.pending_waiters);

        let event_count = events.len();
        let batches = group_events(events);
        debug!(
            events = event_count,
            batches = batches.len(),
            "Flushing event buffer"
        );

        let sink = Arc::clone(&self.sink);
        let stats = Arc::clone(&self.stats);
        self.flushes
            .spawn(async move { write_batches(sink, stats, batches, waiters).await });
    }

    fn on_flush_complete(&mut self, outcome: FlushOutcome) {
        if outcome.all_written {
            self.last_success_at = Instant::now();
        }
        for job in outcome.retry_jobs {
            self.spawn_retry(job);
        }
        if self.flush_requested {
            self.flush_requested = false;
            self.start_flush();
        }
    }

    fn spawn_retry(&mut self, job: BatchJob) {
        let sink = Arc::clone(&self.sink);
        let stats = Arc::clone(&self.stats);
        let policy = self.config.retry;
        let shutdown = self.shutdown_rx.clone();
        self.retries
            .spawn(async move { run_retry(sink, stats, policy, job, shutdown).await });
    }

    /// Drains the pipeline: in-flight flush first, then a final inline
    /// flush of the remaining buffer, then retry cancellation.
    async fn shutdown(&mut self) {
        debug!("Event queue shutting down");

        while let Some(result) = self.flushes.join_next().await {
            match result {
                Ok(outcome) => self.drop_jobs(outcome.retry_jobs),
                Err(join_error) => error!(error = %join_error, "Flush task failed"),
            }
        }

        let events = std::mem::take(&mut self.buffer);
        self.first_event_at = None;
        self.stats.set_queue_size(0);
        if !events.is_empty() {
            info!(events = events.len(), "Final flush before shutdown");
            let batches = group_events(events);
            let outcome = write_batches(
                Arc::clone(&self.sink),
                Arc::clone(&self.stats),
                batches,
                Vec::new(),
            )
            .await;
            self.drop_jobs(outcome.retry_jobs);
        }

        for waiter in self.pending_waiters.drain(..) {
            let _ = waiter.send(());
        }

        // Pending retry timers cancel and count their batches dropped.
        let _ = self.shutdown_tx.send(true);
        while self.retries.join_next().await.is_some() {}
    }

    fn drop_jobs(&self, jobs: Vec<BatchJob>) {
        for job in jobs {
            self.stats.add_dropped(job.len() as u64);
            warn!(
                store = %job.store,
                batch_len = job.len(),
                "Dropping batch at shutdown"
            );
        }
    }
}

async fn deadline_wait(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Groups detached events by type, preserving buffer order within each
/// group. Types that share a store still flush as separate batches.
fn group_events(events: Vec<GameEvent>) -> Vec<(EventType, Vec<Value>)> {
    let mut groups: BTreeMap<EventType, Vec<Value>> = BTreeMap::new();
    for event in events {
        groups
            .entry(event.event_type)
            .or_default()
            .push(event_to_record(event));
    }
    groups.into_iter().collect()
}

/// Builds the stored record: the payload object with the envelope's
/// event id, session id, and timestamp projected onto it. Envelope
/// values win over same-named payload fields.
fn event_to_record(event: GameEvent) -> Value {
    let mut record = match event.payload {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    record.insert("eventId".to_string(), Value::String(event.id));
    if let Some(session_id) = event.session_id {
        record.insert("sessionId".to_string(), Value::String(session_id));
    }
    record.insert("timestamp".to_string(), Value::from(event.timestamp));
    Value::Object(record)
}

/// What one flush pass produced: batches that failed retryably, and
/// whether every write committed.
struct FlushOutcome {
    retry_jobs: Vec<BatchJob>,
    all_written: bool,
}

impl FlushOutcome {
    fn failed() -> Self {
        Self {
            retry_jobs: Vec::new(),
            all_written: false,
        }
    }
}

/// Writes every batch of one flush; batches for different stores run
/// concurrently.
async fn write_batches(
    sink: Arc<dyn BatchSink>,
    stats: Arc<SharedStats>,
    batches: Vec<(EventType, Vec<Value>)>,
    waiters: Vec<oneshot::Sender<()>>,
) -> FlushOutcome {
    let writes = batches.into_iter().map(|(event_type, records)| {
        let sink = Arc::clone(&sink);
        let stats = Arc::clone(&stats);
        async move {
            let store = event_type.store_name();
            let batch_len = records.len();
            match sink.save_batch(store, records.clone()).await {
                Ok(report) => {
                    stats.add_processed(report.written as u64);
                    if report.rejected > 0 {
                        stats.add_errors(report.rejected as u64);
                    }
                    debug!(
                        store,
                        event_type = ?event_type,
                        written = report.written,
                        rejected = report.rejected,
                        "Batch written"
                    );
                    (true, None)
                }
                Err(error) if error.is_retryable() => {
                    stats.add_errors(1);
                    warn!(store, batch_len, %error, "Batch write failed, scheduling retry");
                    (false, Some(BatchJob::new(store, records)))
                }
                Err(error) => {
                    stats.add_errors(1);
                    stats.add_dropped(batch_len as u64);
                    error!(store, batch_len, %error, "Batch write failed terminally");
                    (false, None)
                }
            }
        }
    });

    let mut all_written = true;
    let mut retry_jobs = Vec::new();
    for (written, job) in join_all(writes).await {
        all_written &= written;
        retry_jobs.extend(job);
    }
    for waiter in waiters {
        let _ = waiter.send(());
    }
    FlushOutcome {
        retry_jobs,
        all_written,
    }
}

/// Drives one batch through its backoff schedule until it commits, the
/// budget runs out, or shutdown cancels it.
async fn run_retry(
    sink: Arc<dyn BatchSink>,
    stats: Arc<SharedStats>,
    policy: RetryPolicy,
    mut job: BatchJob,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow_and_update() {
            stats.add_dropped(job.len() as u64);
            warn!(
                store = %job.store,
                batch_len = job.len(),
                "Shutdown cancelled pending retry, dropping batch"
            );
            return;
        }
        if policy.is_exhausted(job.attempt) {
            stats.add_dropped(job.len() as u64);
            warn!(
                store = %job.store,
                batch_len = job.len(),
                attempts = job.attempt,
                "Retry budget exhausted, dropping batch"
            );
            return;
        }

        let delay = policy.delay_for(job.attempt);
        trace!(
            store = %job.store,
            attempt = job.attempt,
            delay_ms = delay.as_millis() as u64,
            "Waiting before retry"
        );
        tokio::select! {
            () = sleep(delay) => {}
            _ = shutdown.changed() => {
                stats.add_dropped(job.len() as u64);
                warn!(
                    store = %job.store,
                    batch_len = job.len(),
                    "Shutdown cancelled pending retry, dropping batch"
                );
                return;
            }
        }

        match sink.save_batch(&job.store, job.records.clone()).await {
            Ok(report) => {
                stats.add_processed(report.written as u64);
                if report.rejected > 0 {
                    stats.add_errors(report.rejected as u64);
                }
                debug!(
                    store = %job.store,
                    written = report.written,
                    attempt = job.attempt,
                    "Retry succeeded"
                );
                return;
            }
            Err(error) if error.is_retryable() => {
                stats.add_errors(1);
                warn!(
                    store = %job.store,
                    attempt = job.attempt,
                    %error,
                    "Retry attempt failed"
                );
                job = job.next_attempt();
            }
            Err(error) => {
                stats.add_errors(1);
                stats.add_dropped(job.len() as u64);
                error!(store = %job.store, %error, "Retry failed terminally, dropping batch");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::game_store_schemas;
    use crate::types::EventType;
    use serde_json::json;
    use std::io;
    use tempfile::{tempdir, TempDir};
    use tokio::time::advance;

    fn test_config(batch_size: usize) -> QueueConfig {
        QueueConfig {
            batch_size,
            batch_timeout: Duration::from_millis(5_000),
            max_batch_delay: Duration::from_millis(30_000),
            retry: RetryPolicy::new(3, Duration::from_millis(1_000)),
        }
    }

    fn open_engine(dir: &TempDir) -> StorageEngine {
        StorageEngine::open(dir.path(), 1, game_store_schemas()).unwrap()
    }

    fn performance_event(session: &str, fps: f64) -> GameEvent {
        GameEvent::new(
            EventType::Performance,
            Some(session.to_string()),
            json!({ "fps": fps }),
        )
    }

    fn interaction_event(session: &str, bubble_type: &str) -> GameEvent {
        GameEvent::new(
            EventType::BubbleInteraction,
            Some(session.to_string()),
            json!({ "bubbleType": bubble_type, "action": "popped" }),
        )
    }

    /// Polls the stats until `cond` holds, yielding so the actor and its
    /// write tasks can run. Panics if the condition is never reached.
    async fn until(queue: &EventQueue, cond: impl Fn(&EventStats) -> bool) -> EventStats {
        let mut last = EventStats::default();
        for _ in 0..500 {
            last = queue.stats().await.unwrap();
            if cond(&last) {
                return last;
            }
            tokio::task::yield_now().await;
        }
        panic!("stats condition never reached, last: {last:?}");
    }

    /// Sink that fails the first `failures` writes with an I/O error and
    /// delegates to a real engine afterwards.
    struct FlakySink {
        failures: AtomicUsize,
        inner: StorageEngine,
    }

    impl FlakySink {
        fn new(failures: usize, inner: StorageEngine) -> Self {
            Self {
                failures: AtomicUsize::new(failures),
                inner,
            }
        }
    }

    impl BatchSink for FlakySink {
        fn save_batch(
            &self,
            store: &str,
            records: Vec<Value>,
        ) -> BoxFuture<'static, Result<BatchReport, StorageError>> {
            let remaining = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if remaining {
                Box::pin(async {
                    Err(StorageError::Io(io::Error::other("injected write failure")))
                })
            } else {
                BatchSink::save_batch(&self.inner, store, records)
            }
        }
    }

    /// Sink that records each batch write it receives and reports it
    /// fully written.
    struct RecordingSink {
        calls: std::sync::Mutex<Vec<(String, usize)>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                calls: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    impl BatchSink for RecordingSink {
        fn save_batch(
            &self,
            store: &str,
            records: Vec<Value>,
        ) -> BoxFuture<'static, Result<BatchReport, StorageError>> {
            self.calls
                .lock()
                .unwrap()
                .push((store.to_string(), records.len()));
            let written = records.len();
            Box::pin(async move {
                Ok(BatchReport {
                    written,
                    rejected: 0,
                })
            })
        }
    }

    #[tokio::test]
    async fn threshold_flush_commits_a_full_batch() {
        let dir = tempdir().unwrap();
        let engine = open_engine(&dir);
        let queue = EventQueue::new(engine.clone(), test_config(3));

        for i in 0..3 {
            queue
                .enqueue(performance_event("s1", 60.0 + f64::from(i)))
                .await
                .unwrap();
        }

        let stats = until(&queue, |s| s.processed == 3).await;
        assert_eq!(stats.collected, 3);
        assert_eq!(stats.queue_size, 0);
        assert_eq!(stats.errors, 0);
        assert_eq!(engine.get_all("performance").unwrap().len(), 3);
    }

    #[tokio::test]
    async fn explicit_flush_persists_a_partial_buffer() {
        let dir = tempdir().unwrap();
        let engine = open_engine(&dir);
        let queue = EventQueue::new(engine.clone(), test_config(50));

        queue.enqueue(performance_event("s1", 59.8)).await.unwrap();
        queue.flush().await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.queue_size, 0);

        let records = engine.get_all("performance").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["sessionId"], json!("s1"));
        assert_eq!(records[0]["fps"], json!(59.8));
        assert!(records[0]["eventId"].as_str().unwrap().starts_with("evt_"));
    }

    #[tokio::test]
    async fn flush_of_an_empty_queue_resolves_immediately() {
        let dir = tempdir().unwrap();
        let queue = EventQueue::new(open_engine(&dir), test_config(50));

        queue.flush().await.unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats, EventStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_flush_fires_at_exactly_the_deadline() {
        let dir = tempdir().unwrap();
        let engine = open_engine(&dir);
        let queue = EventQueue::new(engine.clone(), test_config(50));

        queue.enqueue(performance_event("s1", 60.0)).await.unwrap();

        advance(Duration::from_millis(4_999)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.stats().await.unwrap().processed, 0);

        advance(Duration::from_millis(1)).await;
        let stats = until(&queue, |s| s.processed == 1).await;
        assert_eq!(stats.collected, 1);
        assert_eq!(engine.get_all("performance").unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn max_delay_ceiling_caps_the_gap_between_flushes() {
        let dir = tempdir().unwrap();
        let engine = open_engine(&dir);
        let mut config = test_config(50);
        config.max_batch_delay = Duration::from_millis(8_000);
        let queue = EventQueue::new(engine.clone(), config);

        // Quiet until t=6000, then one event. The timeout alone would
        // flush at t=11000; the ceiling pulls it in to t=8000.
        advance(Duration::from_millis(6_000)).await;
        queue.enqueue(performance_event("s1", 60.0)).await.unwrap();

        advance(Duration::from_millis(1_999)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.stats().await.unwrap().processed, 0);

        advance(Duration::from_millis(1)).await;
        until(&queue, |s| s.processed == 1).await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_does_not_push_out_the_delay_ceiling() {
        let dir = tempdir().unwrap();
        let engine = open_engine(&dir);
        let sink = Arc::new(FlakySink::new(1, engine));
        let queue = EventQueue::with_sink(sink, test_config(50));

        // The timeout flush at t=5000 fails; its retry at t=6000 lands
        // the batch but is not a flush.
        queue.enqueue(performance_event("s1", 60.0)).await.unwrap();
        advance(Duration::from_millis(5_000)).await;
        until(&queue, |s| s.errors == 1).await;
        // Let the actor pick up the failed batch and park the retry.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        advance(Duration::from_millis(1_000)).await;
        until(&queue, |s| s.processed == 1).await;

        // No flush has fully succeeded, so the ceiling still measures
        // from startup. An event arriving past it flushes immediately
        // rather than waiting out the batch timeout.
        advance(Duration::from_millis(28_000)).await;
        queue.enqueue(performance_event("s1", 59.0)).await.unwrap();
        until(&queue, |s| s.processed == 2).await;
    }

    #[tokio::test]
    async fn flush_routes_each_event_type_to_its_store() {
        let dir = tempdir().unwrap();
        let engine = open_engine(&dir);
        let queue = EventQueue::new(engine.clone(), test_config(50));

        queue.enqueue(performance_event("s1", 60.0)).await.unwrap();
        queue.enqueue(interaction_event("s1", "normal")).await.unwrap();
        queue.enqueue(interaction_event("s1", "rainbow")).await.unwrap();
        queue.flush().await.unwrap();

        assert_eq!(engine.get_all("performance").unwrap().len(), 1);
        let interactions = engine.get_all("bubbleInteractions").unwrap();
        assert_eq!(interactions.len(), 2);
        // Buffer order survives into the store (auto-keys ascend).
        assert_eq!(interactions[0]["bubbleType"], json!("normal"));
        assert_eq!(interactions[1]["bubbleType"], json!("rainbow"));
    }

    #[tokio::test]
    async fn types_sharing_a_store_flush_as_separate_batches() {
        let sink = Arc::new(RecordingSink::new());
        let queue = EventQueue::with_sink(sink.clone(), test_config(50));

        queue.enqueue(interaction_event("s1", "normal")).await.unwrap();
        queue
            .enqueue(GameEvent::new(
                EventType::Score,
                Some("s1".to_string()),
                json!({ "bubbleType": "combo", "action": "scored", "amount": 150 }),
            ))
            .await
            .unwrap();
        queue.enqueue(performance_event("s1", 60.0)).await.unwrap();
        queue.flush().await.unwrap();

        // One write per event type: the interaction and score events
        // both target bubbleInteractions but stay separate batches.
        let mut calls = sink.calls.lock().unwrap().clone();
        calls.sort();
        assert_eq!(
            calls,
            vec![
                ("bubbleInteractions".to_string(), 1),
                ("bubbleInteractions".to_string(), 1),
                ("performance".to_string(), 1),
            ]
        );
    }

    #[tokio::test]
    async fn rapid_enqueues_are_persisted_exactly_once() {
        let dir = tempdir().unwrap();
        let engine = open_engine(&dir);
        let queue = EventQueue::new(engine.clone(), test_config(2));

        for i in 0..5 {
            queue
                .enqueue(performance_event("s1", f64::from(i)))
                .await
                .unwrap();
        }
        queue.flush().await.unwrap();

        let stats = until(&queue, |s| s.processed == 5).await;
        assert_eq!(stats.collected, 5);
        assert_eq!(stats.dropped, 0);
        // Each event exactly once: auto-keyed records, no duplicates.
        assert_eq!(engine.get_all("performance").unwrap().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_after_transient_failures() {
        let dir = tempdir().unwrap();
        let engine = open_engine(&dir);
        let sink = Arc::new(FlakySink::new(2, engine.clone()));
        let queue = EventQueue::with_sink(sink, test_config(50));

        for i in 0..3 {
            queue
                .enqueue(performance_event("s1", f64::from(i)))
                .await
                .unwrap();
        }
        // Initial write fails (attempt 1).
        queue.flush().await.unwrap();
        assert_eq!(queue.stats().await.unwrap().errors, 1);
        // Let the actor pick up the failed batch and park the retry.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        // First retry after 1000 ms fails (attempt 2).
        advance(Duration::from_millis(1_000)).await;
        until(&queue, |s| s.errors == 2).await;
        assert_eq!(queue.stats().await.unwrap().processed, 0);

        // Second retry after a further 2000 ms succeeds (attempt 3).
        advance(Duration::from_millis(2_000)).await;
        let stats = until(&queue, |s| s.processed == 3).await;
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.dropped, 0);
        assert_eq!(engine.get_all("performance").unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_is_dropped_after_exhausting_all_retries() {
        let dir = tempdir().unwrap();
        let engine = open_engine(&dir);
        let sink = Arc::new(FlakySink::new(usize::MAX, engine.clone()));
        let queue = EventQueue::with_sink(sink, test_config(50));

        queue.enqueue(performance_event("s1", 60.0)).await.unwrap();
        queue.enqueue(performance_event("s1", 58.0)).await.unwrap();
        queue.flush().await.unwrap();
        assert_eq!(queue.stats().await.unwrap().errors, 1);
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        // Three retries at 1s, 2s, 4s all fail, then the batch drops.
        advance(Duration::from_millis(1_000)).await;
        until(&queue, |s| s.errors == 2).await;
        advance(Duration::from_millis(2_000)).await;
        until(&queue, |s| s.errors == 3).await;
        advance(Duration::from_millis(4_000)).await;
        let stats = until(&queue, |s| s.dropped == 2).await;

        assert_eq!(stats.errors, 4);
        assert_eq!(stats.processed, 0);

        // No further attempt is scheduled.
        advance(Duration::from_millis(60_000)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.errors, 4);
        assert_eq!(stats.dropped, 2);
    }

    #[tokio::test]
    async fn shutdown_flushes_the_remaining_buffer() {
        let dir = tempdir().unwrap();
        let engine = open_engine(&dir);
        let queue = EventQueue::new(engine.clone(), test_config(50));

        queue.enqueue(performance_event("s1", 60.0)).await.unwrap();
        queue.enqueue(performance_event("s1", 59.0)).await.unwrap();
        queue.shutdown().await.unwrap();

        assert_eq!(engine.get_all("performance").unwrap().len(), 2);
        let stats = queue.stats.snapshot();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.queue_size, 0);
        assert!(matches!(
            queue.enqueue(performance_event("s1", 58.0)).await,
            Err(QueueError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_retries_and_counts_them_dropped() {
        let dir = tempdir().unwrap();
        let engine = open_engine(&dir);
        let sink = Arc::new(FlakySink::new(usize::MAX, engine));
        let queue = EventQueue::with_sink(sink, test_config(50));

        queue.enqueue(performance_event("s1", 60.0)).await.unwrap();
        queue.flush().await.unwrap();
        assert_eq!(queue.stats().await.unwrap().errors, 1);

        // The retry is parked on its 1000 ms backoff; shutdown cancels
        // it without waiting out the schedule.
        queue.shutdown().await.unwrap();
        assert!(matches!(queue.stats().await, Err(QueueError::Closed)));

        let stats = queue.stats.snapshot();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.processed, 0);
    }

    #[tokio::test]
    async fn schema_invalid_records_count_as_errors_not_drops() {
        let dir = tempdir().unwrap();
        let engine = open_engine(&dir);
        let queue = EventQueue::new(engine.clone(), test_config(50));

        // Missing the indexed bubbleType/action fields.
        let bad = GameEvent::new(
            EventType::BubbleInteraction,
            Some("s1".to_string()),
            json!({ "oops": true }),
        );
        queue.enqueue(bad).await.unwrap();
        queue.enqueue(interaction_event("s1", "normal")).await.unwrap();
        queue.flush().await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.dropped, 0);
        assert_eq!(engine.get_all("bubbleInteractions").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn queue_error_displays_clearly() {
        assert_eq!(QueueError::Closed.to_string(), "event queue is closed");
    }
}
