//! Pipeline orchestration.
//!
//! [`Collector`] owns every pipeline stage: the consent gate, the
//! anonymization engine, the batching event queue, the storage engine,
//! and the retention cleanup timer. Game code calls the `collect_*`
//! methods; everything downstream (consent checks, anonymization,
//! batching, retry, persistence) happens behind them.
//!
//! # Collection flow
//!
//! Each `collect_*` call runs the same gauntlet:
//!
//! 1. The consent gate: collection must be enabled, not paused, consent
//!    granted, and the event's feature not opted out
//! 2. Session attachment: every event joins the active session; with no
//!    session running the event is skipped
//! 3. Anonymization of the payload, exactly once
//! 4. Hand-off to the event queue
//!
//! Failures inside a `collect_*` call never reach the caller; they are
//! logged and show up in the statistics instead.
//!
//! # Example
//!
//! ```no_run
//! use popmetrics_analytics::collector::Collector;
//! use popmetrics_analytics::config::AnalyticsConfig;
//! use popmetrics_analytics::types::SessionStartData;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let collector = Collector::new(AnalyticsConfig::default())?;
//!
//!     collector
//!         .collect_session_start(SessionStartData {
//!             stage_id: "stage-3".to_string(),
//!             difficulty: "normal".to_string(),
//!             sound_enabled: true,
//!             effects_enabled: true,
//!             player_level: Some(12),
//!             previous_best_score: None,
//!         })
//!         .await;
//!
//!     collector.destroy().await?;
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AnalyticsConfig;
use crate::consent::{ConsentGate, ConsentRecord, ConsentUi, Feature};
use crate::error::Result;
use crate::privacy::{AnonymizeRule, Anonymizer};
use crate::queue::{EventQueue, EventStats, QueueConfig};
use crate::storage::{game_store_schemas, StorageEngine, StorageInfo};
use crate::types::{
    now_millis, BubbleInteractionData, EventType, GameBalanceData, GameEvent, ItemUsageData,
    PerformanceData, ScoreData, SessionEndData, SessionStartData, INTERACTIONS_STORE,
    PERFORMANCE_STORE, SESSIONS_STORE,
};

/// Version of the declared store set; bump when stores change shape.
pub const SCHEMA_VERSION: u32 = 1;

/// The session currently being played, if any.
struct ActiveSession {
    /// Session identifier as it appears in stored records (already
    /// pseudonymized when anonymization is on).
    id: String,
    started_at: i64,
    start: SessionStartData,
}

/// Orchestrates the full ingest-to-storage pipeline.
///
/// One collector per game instance. Cheap accessors are synchronous;
/// anything touching the queue or storage is `async`. All methods take
/// `&self`, so the collector can live behind an `Arc` shared with the
/// game loop.
pub struct Collector {
    config: AnalyticsConfig,
    engine: StorageEngine,
    consent: RwLock<ConsentGate>,
    anonymizer: Anonymizer,
    queue: EventQueue,
    session: RwLock<Option<ActiveSession>>,
    enabled: AtomicBool,
    paused: AtomicBool,
    destroyed: AtomicBool,
    cleanup_shutdown: watch::Sender<bool>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl Collector {
    /// Opens storage, loads any persisted consent record, and starts the
    /// queue and the retention cleanup timer.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage engine cannot open its data
    /// directory or the consent record cannot be read.
    pub fn new(config: AnalyticsConfig) -> Result<Self> {
        let engine = StorageEngine::open(
            config.data_dir.clone(),
            SCHEMA_VERSION,
            game_store_schemas(),
        )?;
        let consent = ConsentGate::load(config.data_dir.clone())?;
        let anonymizer = Anonymizer::new(config.anonymize_data);
        let queue = EventQueue::new(engine.clone(), QueueConfig::from(&config));

        let (cleanup_shutdown, cleanup_rx) = watch::channel(false);
        let cleanup_task = spawn_cleanup_task(
            engine.clone(),
            config.retention,
            config.cleanup_interval,
            cleanup_rx,
        );

        info!(
            data_dir = %config.data_dir.display(),
            enabled = config.enabled,
            anonymize = config.anonymize_data,
            consent_decided = consent.is_decided(),
            "Analytics collector initialized"
        );

        Ok(Self {
            enabled: AtomicBool::new(config.enabled),
            paused: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            engine,
            consent: RwLock::new(consent),
            anonymizer,
            queue,
            session: RwLock::new(None),
            cleanup_shutdown,
            cleanup_task: Mutex::new(Some(cleanup_task)),
            config,
        })
    }

    // ===== Consent =====

    /// Prompts through `ui` if no valid consent decision is on record,
    /// persists the outcome, and returns whether collection is allowed.
    ///
    /// An existing decision at the current consent version short-circuits
    /// the prompt. The UI future is awaited without holding any lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the decision cannot be persisted.
    pub async fn request_consent(&self, ui: &dyn ConsentUi) -> Result<bool> {
        {
            let gate = self.consent.read().unwrap();
            if gate.is_decided() {
                return Ok(gate.record().is_some_and(|record| record.granted));
            }
        }

        info!("Requesting consent decision");
        let decision = ui.request_consent(Feature::ALL.to_vec()).await;
        let granted = self.consent.write().unwrap().apply_decision(decision)?;
        info!(granted, "Consent decision recorded");
        Ok(granted)
    }

    /// Withdraws consent; collection stops at the next gate check.
    ///
    /// # Errors
    ///
    /// Returns an error if the revocation cannot be persisted.
    pub fn revoke_consent(&self) -> Result<()> {
        self.consent.write().unwrap().revoke()?;
        info!("Consent revoked");
        Ok(())
    }

    /// The persisted consent record, if one exists.
    #[must_use]
    pub fn consent_record(&self) -> Option<ConsentRecord> {
        self.consent.read().unwrap().record().cloned()
    }

    /// The configuration this collector was built with.
    #[must_use]
    pub fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    // ===== Collection surface =====

    /// Starts a new gameplay session and records its opening snapshot.
    ///
    /// A session already in progress is abandoned with a warning; its
    /// stored record keeps whatever state the last upsert left.
    pub async fn collect_session_start(&self, data: SessionStartData) {
        if !self.should_collect(Feature::SessionTracking) {
            return;
        }

        let session_id = self.make_session_id();
        let started_at = now_millis();
        {
            let mut session = self.session.write().unwrap();
            if let Some(previous) = session.as_ref() {
                warn!(session_id = %previous.id, "Starting a session while one is active");
            }
            *session = Some(ActiveSession {
                id: session_id.clone(),
                started_at,
                start: data.clone(),
            });
        }

        let payload = json!({
            "startTime": started_at,
            "stageId": data.stage_id,
            "difficulty": data.difficulty,
            "soundEnabled": data.sound_enabled,
            "effectsEnabled": data.effects_enabled,
            "playerLevel": data.player_level,
            "previousBestScore": data.previous_best_score,
            "completed": false,
        });
        debug!(stage_id = %data.stage_id, "Session started");
        self.enqueue(EventType::Session, Some(session_id), payload)
            .await;
    }

    /// Ends the active session, freezing its final record.
    ///
    /// The end upsert replaces the start record wholesale (same primary
    /// key), so it carries the opening snapshot as well as the results.
    /// Without an active session this is a no-op.
    pub async fn collect_session_end(&self, data: SessionEndData) {
        let Some(active) = self.session.write().unwrap().take() else {
            debug!("Session end without an active session, ignored");
            return;
        };
        if !self.should_collect(Feature::SessionTracking) {
            return;
        }

        let ended_at = now_millis();
        let payload = json!({
            "startTime": active.started_at,
            "endTime": ended_at,
            "duration": ended_at - active.started_at,
            "stageId": active.start.stage_id,
            "difficulty": active.start.difficulty,
            "soundEnabled": active.start.sound_enabled,
            "effectsEnabled": active.start.effects_enabled,
            "playerLevel": active.start.player_level,
            "previousBestScore": active.start.previous_best_score,
            "finalScore": data.final_score,
            "bubblesPopped": data.bubbles_popped,
            "bubblesMissed": data.bubbles_missed,
            "maxCombo": data.max_combo,
            "completed": data.completed,
            "exitReason": data.exit_reason,
        });
        info!(
            duration_ms = ended_at - active.started_at,
            completed = data.completed,
            "Session ended"
        );
        self.enqueue(EventType::Session, Some(active.id), payload)
            .await;
    }

    /// Records one bubble interaction (pop, miss, expiry, burst).
    pub async fn collect_bubble_interaction(&self, data: BubbleInteractionData) {
        let payload = json!({
            "bubbleType": data.bubble_type,
            "action": data.action,
            "position": data.position,
            "reactionTime": data.reaction_time,
            "scoreGained": data.score_gained,
            "comboCount": data.combo_count,
        });
        self.collect(EventType::BubbleInteraction, payload).await;
    }

    /// Records a frame-rate and memory sample.
    pub async fn collect_performance_data(&self, data: PerformanceData) {
        let payload = json!({
            "fps": data.fps,
            "frameTime": data.frame_time,
            "memoryUsage": data.memory_usage,
        });
        self.collect(EventType::Performance, payload).await;
    }

    /// Records a difficulty/balance observation.
    ///
    /// Balance events land in the interactions store, so they carry the
    /// indexed `bubbleType`/`action` pair (`action` fixed to `spawned`).
    pub async fn collect_game_balance_data(&self, data: GameBalanceData) {
        let payload = json!({
            "bubbleType": data.bubble_type,
            "action": "spawned",
            "stageProgress": data.stage_progress,
            "currentScore": data.current_score,
            "remainingTime": data.remaining_time,
            "playerHp": data.player_hp,
        });
        self.collect(EventType::GameBalance, payload).await;
    }

    /// Records a scoring event.
    ///
    /// Routed into the interactions store under `action = scored`, with
    /// the score source standing in for the bubble type.
    pub async fn collect_score_data(&self, data: ScoreData) {
        let payload = json!({
            "bubbleType": data.source.as_deref().unwrap_or("unknown"),
            "action": "scored",
            "scoreType": data.score_type,
            "amount": data.amount,
            "multiplier": data.multiplier,
            "reactionTime": data.reaction_time,
            "comboCount": data.combo_count,
            "totalScore": data.total_score,
        });
        self.collect(EventType::Score, payload).await;
    }

    /// Records a consumable or power-up usage.
    pub async fn collect_item_usage_data(&self, data: ItemUsageData) {
        let payload = json!({
            "bubbleType": data.item_id,
            "action": data.action,
            "itemId": data.item_id,
            "cost": data.cost,
            "effectDuration": data.effect_duration,
        });
        self.collect(EventType::ItemUsage, payload).await;
    }

    // ===== Controls & observability =====

    /// Turns collection on or off wholesale. Already-buffered events are
    /// kept and flush on their normal schedule.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        info!(enabled, "Collection enabled state changed");
    }

    /// Suspends or resumes collection without touching buffered events.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        debug!(paused, "Collection pause state changed");
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Identifier of the active session, if one is running.
    #[must_use]
    pub fn current_session_id(&self) -> Option<String> {
        self.session
            .read()
            .unwrap()
            .as_ref()
            .map(|active| active.id.clone())
    }

    /// Collection counters: collected, processed, errors, dropped, and
    /// the current buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error after [`destroy`](Self::destroy).
    pub async fn get_event_stats(&self) -> Result<EventStats> {
        Ok(self.queue.stats().await?)
    }

    /// Forces a flush of the event buffer and waits for it to land.
    ///
    /// # Errors
    ///
    /// Returns an error after [`destroy`](Self::destroy).
    pub async fn flush_queue(&self) -> Result<()> {
        Ok(self.queue.flush().await?)
    }

    /// Per-store record counts and on-disk log sizes.
    ///
    /// # Errors
    ///
    /// Returns an error after [`destroy`](Self::destroy).
    pub fn storage_info(&self) -> Result<StorageInfo> {
        Ok(self.engine.info()?)
    }

    /// The storage engine, for downstream report and trend readers that
    /// consume the query interface (`get`, `query_by_index`,
    /// `aggregate`).
    #[must_use]
    pub fn storage(&self) -> &StorageEngine {
        &self.engine
    }

    // ===== Data management =====

    /// Flushes the buffer and gathers every stored record into one JSON
    /// document, for the user-facing "download my data" flow.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush or any store read fails.
    pub async fn export_data(&self) -> Result<Value> {
        self.queue.flush().await?;
        let sessions = self.engine.get_all(SESSIONS_STORE)?;
        let interactions = self.engine.get_all(INTERACTIONS_STORE)?;
        let performance = self.engine.get_all(PERFORMANCE_STORE)?;
        info!(
            sessions = sessions.len(),
            interactions = interactions.len(),
            performance = performance.len(),
            "Exported analytics data"
        );
        Ok(json!({
            "exportedAt": now_millis(),
            "sessions": sessions,
            "bubbleInteractions": interactions,
            "performance": performance,
        }))
    }

    /// Erases everything: buffered events are flushed and then wiped
    /// along with all stored records, and the persisted consent record
    /// is removed (collection stops until consent is granted again).
    ///
    /// # Errors
    ///
    /// Returns an error if a store or the consent file cannot be
    /// cleared.
    pub async fn delete_all_data(&self) -> Result<()> {
        self.queue.flush().await?;
        self.engine.clear_all().await?;
        self.consent.write().unwrap().clear()?;
        info!("All analytics data and the consent record deleted");
        Ok(())
    }

    /// Shuts the pipeline down: stops the cleanup timer, drains the
    /// queue (final flush, retry cancellation), and closes storage.
    ///
    /// Idempotent; the second and later calls return `Ok` immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush or the storage close fails.
    pub async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Shutting down analytics collector");

        let _ = self.cleanup_shutdown.send(true);
        let cleanup = self.cleanup_task.lock().unwrap().take();
        if let Some(handle) = cleanup {
            if let Err(join_error) = handle.await {
                error!(error = %join_error, "Cleanup task failed during shutdown");
            }
        }

        self.queue.shutdown().await?;
        self.engine.close().await?;
        info!("Analytics collector stopped");
        Ok(())
    }

    // ===== Internals =====

    /// Gate check shared by every `collect_*` method.
    fn should_collect(&self, feature: Feature) -> bool {
        if self.destroyed.load(Ordering::SeqCst)
            || !self.enabled.load(Ordering::SeqCst)
            || self.paused.load(Ordering::SeqCst)
        {
            return false;
        }
        self.consent.read().unwrap().should_collect(feature)
    }

    /// Common path for in-session events: gate, session attachment,
    /// anonymization, enqueue.
    async fn collect(&self, event_type: EventType, payload: Value) {
        if !self.should_collect(Feature::for_event(event_type)) {
            return;
        }
        let Some(session_id) = self.current_session_id() else {
            debug!(event_type = ?event_type, "No active session, event skipped");
            return;
        };
        self.enqueue(event_type, Some(session_id), payload).await;
    }

    async fn enqueue(&self, event_type: EventType, session_id: Option<String>, payload: Value) {
        let payload = self.anonymizer.anonymize(payload);
        let event = GameEvent::new(event_type, session_id, payload);
        if let Err(enqueue_error) = self.queue.enqueue(event).await {
            warn!(event_type = ?event_type, error = %enqueue_error, "Failed to enqueue event");
        }
    }

    /// A fresh session identifier, pseudonymized up front when
    /// anonymization is on so that the stored id is never the raw UUID.
    fn make_session_id(&self) -> String {
        let raw = Uuid::new_v4().to_string();
        if !self.anonymizer.is_enabled() {
            return raw;
        }
        match AnonymizeRule::HashIdentifier.apply(&Value::String(raw.clone())) {
            Ok(Value::String(hashed)) => hashed,
            _ => raw,
        }
    }
}

/// Background timer enforcing the retention window.
fn spawn_cleanup_task(
    engine: StorageEngine,
    retention: Duration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(
            interval_secs = interval.as_secs(),
            retention_secs = retention.as_secs(),
            "Retention cleanup timer started"
        );
        loop {
            tokio::select! {
                () = sleep(interval) => {
                    let cutoff = now_millis().saturating_sub(retention.as_millis() as i64);
                    match engine.delete_old_data(cutoff).await {
                        Ok(0) => debug!("Retention cleanup found no expired records"),
                        Ok(removed) => info!(removed, "Retention cleanup removed expired records"),
                        Err(cleanup_error) => warn!(error = %cleanup_error, "Retention cleanup failed"),
                    }
                }
                _ = shutdown.changed() => {
                    debug!("Retention cleanup timer stopped");
                    break;
                }
            }
        }
    })
}
