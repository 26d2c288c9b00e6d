//! Event types for the PopMetrics telemetry pipeline.
//!
//! This module defines the shared event schema used between the collector,
//! the batching queue, and the storage engine. All types serialize to
//! camelCase JSON so persisted records match the reporting tooling.

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Length of the random alphanumeric suffix in event IDs.
const EVENT_ID_SUFFIX_LEN: usize = 20;

/// Prefix for all event IDs.
const EVENT_ID_PREFIX: &str = "evt_";

/// Store receiving session lifecycle records.
pub const SESSIONS_STORE: &str = "sessions";

/// Store receiving bubble interaction, balance, score, and item records.
pub const INTERACTIONS_STORE: &str = "bubbleInteractions";

/// Store receiving frame-rate and memory samples.
pub const PERFORMANCE_STORE: &str = "performance";

/// Store receiving pre-computed summary rows.
pub const AGGREGATED_STORE: &str = "aggregatedData";

/// Type classification for collected events.
///
/// Each variant routes to a fixed target store; several gameplay event
/// types share the `bubbleInteractions` store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    Session,
    BubbleInteraction,
    Performance,
    GameBalance,
    Score,
    ItemUsage,
}

impl EventType {
    /// All event types, in routing-table order.
    pub const ALL: [EventType; 6] = [
        EventType::Session,
        EventType::BubbleInteraction,
        EventType::Performance,
        EventType::GameBalance,
        EventType::Score,
        EventType::ItemUsage,
    ];

    /// Returns the name of the store this event type persists into.
    #[must_use]
    pub fn store_name(&self) -> &'static str {
        match self {
            EventType::Session => SESSIONS_STORE,
            EventType::BubbleInteraction
            | EventType::GameBalance
            | EventType::Score
            | EventType::ItemUsage => INTERACTIONS_STORE,
            EventType::Performance => PERFORMANCE_STORE,
        }
    }
}

/// A single collected telemetry event.
///
/// Events are immutable once enqueued: the payload has already passed the
/// consent gate and the anonymization engine by the time one is
/// constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameEvent {
    /// Unique event identifier with format `evt_` followed by 20 alphanumeric characters.
    pub id: String,

    /// Classification of the event.
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// When the event occurred, in epoch milliseconds.
    pub timestamp: i64,

    /// Owning session, if one is active.
    pub session_id: Option<String>,

    /// Event-specific payload data (a JSON object).
    pub payload: Value,
}

impl GameEvent {
    /// Creates a new event with a randomly generated ID and the current
    /// time.
    ///
    /// # Examples
    ///
    /// ```
    /// use popmetrics_analytics::types::{EventType, GameEvent};
    /// use serde_json::json;
    ///
    /// let event = GameEvent::new(
    ///     EventType::Score,
    ///     Some("session-1".to_string()),
    ///     json!({ "amount": 120 }),
    /// );
    ///
    /// assert!(event.id.starts_with("evt_"));
    /// assert_eq!(event.id.len(), 24); // "evt_" + 20 chars
    /// ```
    #[must_use]
    pub fn new(event_type: EventType, session_id: Option<String>, payload: Value) -> Self {
        Self {
            id: generate_event_id(),
            event_type,
            timestamp: now_millis(),
            session_id,
            payload,
        }
    }
}

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Generates a unique event ID with the format `evt_` followed by 20 alphanumeric characters.
fn generate_event_id() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

    let mut rng = rand::rng();
    let suffix: String = (0..EVENT_ID_SUFFIX_LEN)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect();

    format!("{EVENT_ID_PREFIX}{suffix}")
}

/// Outcome of a tracked bubble interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionAction {
    Popped,
    Missed,
    Expired,
    Burst,
}

/// A 2-D canvas coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Browser heap usage sampled alongside frame rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    pub used: u64,
    pub total: u64,
}

/// Parameters captured when a gameplay session begins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartData {
    pub stage_id: String,
    pub difficulty: String,
    pub sound_enabled: bool,
    pub effects_enabled: bool,
    pub player_level: Option<u32>,
    pub previous_best_score: Option<i64>,
}

/// Parameters captured when a gameplay session ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEndData {
    pub final_score: i64,
    pub bubbles_popped: u32,
    pub bubbles_missed: u32,
    pub max_combo: u32,
    pub completed: bool,
    pub exit_reason: Option<String>,
}

/// A single bubble interaction (pop, miss, or expiry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BubbleInteractionData {
    pub bubble_type: String,
    pub action: InteractionAction,
    pub position: Option<Position>,
    /// Time from spawn to interaction, in milliseconds.
    pub reaction_time: Option<f64>,
    pub score_gained: Option<i64>,
    pub combo_count: Option<u32>,
}

/// A frame-rate and memory sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceData {
    pub fps: f64,
    /// Milliseconds spent rendering the sampled frame.
    pub frame_time: Option<f64>,
    pub memory_usage: Option<MemoryUsage>,
}

/// A difficulty/balance observation taken when a bubble resolves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameBalanceData {
    pub bubble_type: String,
    /// Stage completion fraction in `[0, 1]`.
    pub stage_progress: f64,
    pub current_score: i64,
    pub remaining_time: f64,
    pub player_hp: u32,
}

/// A scoring event with its multipliers and combo context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreData {
    #[serde(rename = "type")]
    pub score_type: String,
    pub amount: i64,
    pub multiplier: f64,
    pub source: Option<String>,
    pub reaction_time: Option<f64>,
    pub combo_count: u32,
    pub total_score: i64,
}

/// A consumable or power-up usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemUsageData {
    pub item_id: String,
    pub action: String,
    pub cost: Option<i64>,
    pub effect_duration: Option<f64>,
}
