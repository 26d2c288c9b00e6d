//! Privacy guarantees checked end to end: identifiers leave the pipeline
//! only as one-way pseudonyms, coordinates only on the coarse grid, and
//! opted-out categories not at all.

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};
use uuid::Uuid;

use popmetrics_analytics::privacy::POSITION_GRID_SIZE;
use popmetrics_analytics::storage::game_store_schemas;
use popmetrics_analytics::types::{
    now_millis, BubbleInteractionData, InteractionAction, PerformanceData, Position,
    SessionStartData, INTERACTIONS_STORE, PERFORMANCE_STORE, SESSIONS_STORE,
};
use popmetrics_analytics::{
    AnalyticsConfig, Anonymizer, Collector, ConsentDecision, ConsentUi, Feature, KeyRange,
    StorageEngine, SCHEMA_VERSION,
};

// ============================================================================
// Test Helpers
// ============================================================================

/// Consent UI stub that grants every feature.
struct GrantAllUi;

impl ConsentUi for GrantAllUi {
    fn request_consent(&self, _features: Vec<Feature>) -> BoxFuture<'_, ConsentDecision> {
        Box::pin(async { ConsentDecision::grant_all() })
    }
}

/// Grants everything except one feature.
struct OptOutUi(Feature);

impl ConsentUi for OptOutUi {
    fn request_consent(&self, _features: Vec<Feature>) -> BoxFuture<'_, ConsentDecision> {
        let mut decision = ConsentDecision::grant_all();
        decision.per_feature.insert(self.0, false);
        Box::pin(async move { decision })
    }
}

fn test_config(dir: &TempDir) -> AnalyticsConfig {
    AnalyticsConfig {
        data_dir: dir.path().to_path_buf(),
        ..AnalyticsConfig::default()
    }
}

async fn granted_collector(dir: &TempDir) -> Collector {
    let collector = Collector::new(test_config(dir)).unwrap();
    assert!(collector.request_consent(&GrantAllUi).await.unwrap());
    collector
}

fn start() -> SessionStartData {
    SessionStartData {
        stage_id: "stage-1".to_string(),
        difficulty: "hard".to_string(),
        sound_enabled: false,
        effects_enabled: true,
        player_level: Some(12),
        previous_best_score: None,
    }
}

fn bubble(x: f64, y: f64) -> BubbleInteractionData {
    BubbleInteractionData {
        bubble_type: "rainbow".to_string(),
        action: InteractionAction::Popped,
        position: Some(Position { x, y }),
        reaction_time: Some(210.0),
        score_gained: Some(25),
        combo_count: Some(4),
    }
}

fn frame(fps: f64) -> PerformanceData {
    PerformanceData {
        fps,
        frame_time: None,
        memory_usage: None,
    }
}

fn on_grid(value: &Value) -> bool {
    value
        .as_f64()
        .is_some_and(|v| (v / POSITION_GRID_SIZE).fract() == 0.0)
}

// ============================================================================
// Identifier Tests
// ============================================================================

/// Session ids are pseudonymized the moment the session starts; the raw
/// random id never exists outside the call that derived it.
#[tokio::test]
async fn test_session_ids_become_one_way_pseudonyms() {
    let dir = tempdir().unwrap();
    let collector = granted_collector(&dir).await;

    collector.collect_session_start(start()).await;
    let session_id = collector.current_session_id().unwrap();
    collector.collect_bubble_interaction(bubble(80.0, 80.0)).await;
    collector.flush_queue().await.unwrap();

    // Even the live id is the pseudonym: a name-based (v5) UUID, not the
    // random v4 it was derived from.
    assert_eq!(Uuid::parse_str(&session_id).unwrap().get_version_num(), 5);

    let sessions = collector.storage().get_all(SESSIONS_STORE).unwrap();
    assert_eq!(sessions[0]["sessionId"], json!(session_id));
    let interactions = collector.storage().get_all(INTERACTIONS_STORE).unwrap();
    assert_eq!(interactions[0]["sessionId"], json!(session_id));
}

/// Turning anonymization off stores the raw random session id.
#[tokio::test]
async fn test_disabled_anonymization_keeps_raw_identifiers() {
    let dir = tempdir().unwrap();
    let config = AnalyticsConfig {
        anonymize_data: false,
        ..test_config(&dir)
    };
    let collector = Collector::new(config).unwrap();
    assert!(collector.request_consent(&GrantAllUi).await.unwrap());

    collector.collect_session_start(start()).await;
    let session_id = collector.current_session_id().unwrap();
    collector.flush_queue().await.unwrap();

    assert_eq!(Uuid::parse_str(&session_id).unwrap().get_version_num(), 4);
    let sessions = collector.storage().get_all(SESSIONS_STORE).unwrap();
    assert_eq!(sessions[0]["sessionId"], json!(session_id));
}

/// Exported documents carry the same pseudonyms as the stores.
#[tokio::test]
async fn test_export_carries_only_pseudonymous_identifiers() {
    let dir = tempdir().unwrap();
    let collector = granted_collector(&dir).await;

    collector.collect_session_start(start()).await;
    collector
        .collect_bubble_interaction(bubble(120.0, 180.0))
        .await;
    collector.collect_performance_data(frame(59.0)).await;

    // export_data flushes internally before reading.
    let export = collector.export_data().await.unwrap();
    for section in ["sessions", "bubbleInteractions", "performance"] {
        let records = export[section].as_array().unwrap();
        assert!(!records.is_empty(), "{section} should not be empty");
        for record in records {
            let id = record["sessionId"].as_str().unwrap();
            assert_eq!(Uuid::parse_str(id).unwrap().get_version_num(), 5);
        }
    }

    let bubbles = export["bubbleInteractions"].as_array().unwrap();
    assert!(on_grid(&bubbles[0]["position"]["x"]));
    assert!(on_grid(&bubbles[0]["position"]["y"]));
}

// ============================================================================
// Payload Scrubbing Tests
// ============================================================================

/// Positions reach storage only as grid cells, rounded to the nearest
/// cell rather than truncated.
#[tokio::test]
async fn test_positions_reach_storage_only_on_the_grid() {
    let dir = tempdir().unwrap();
    let collector = granted_collector(&dir).await;

    collector.collect_session_start(start()).await;
    for (x, y) in [(123.0, 77.0), (249.9, 250.1), (0.0, 499.0)] {
        collector.collect_bubble_interaction(bubble(x, y)).await;
    }
    collector.flush_queue().await.unwrap();

    let interactions = collector.storage().get_all(INTERACTIONS_STORE).unwrap();
    assert_eq!(interactions.len(), 3);
    for record in &interactions {
        let position = record["position"].as_object().unwrap();
        assert!(on_grid(&position["x"]), "x off grid: {position:?}");
        assert!(on_grid(&position["y"]), "y off grid: {position:?}");
    }
    assert_eq!(interactions[0]["position"]["x"], json!(100));
    assert_eq!(interactions[0]["position"]["y"], json!(100));
    assert_eq!(interactions[1]["position"]["x"], json!(250));
    assert_eq!(interactions[1]["position"]["y"], json!(250));
    assert_eq!(interactions[2]["position"]["x"], json!(0));
    assert_eq!(interactions[2]["position"]["y"], json!(500));
}

/// The envelope timestamp is stamped after anonymization, so retention
/// math keeps millisecond accuracy while payload timestamps coarsen.
#[tokio::test]
async fn test_envelope_timestamps_stay_precise_for_retention() {
    let dir = tempdir().unwrap();
    let collector = granted_collector(&dir).await;
    collector.collect_session_start(start()).await;

    let before = now_millis();
    collector.collect_bubble_interaction(bubble(80.0, 80.0)).await;
    collector.flush_queue().await.unwrap();
    let after = now_millis();

    let interactions = collector.storage().get_all(INTERACTIONS_STORE).unwrap();
    let timestamp = interactions[0]["timestamp"].as_i64().unwrap();
    assert!(
        timestamp >= before && timestamp <= after,
        "timestamp {timestamp} outside [{before}, {after}]"
    );
}

/// The storage engine persists and returns the anonymized form verbatim;
/// nothing downstream can recover what the rules removed.
#[tokio::test]
async fn test_storage_returns_exactly_the_anonymized_form() {
    let dir = tempdir().unwrap();
    let engine = StorageEngine::open(dir.path(), SCHEMA_VERSION, game_store_schemas()).unwrap();
    let anonymizer = Anonymizer::default();

    let raw = json!({
        "id": 7,
        "sessionId": "session-raw",
        "timestamp": 1_700_000_299_999i64,
        "bubbleType": "rainbow",
        "action": "popped",
        "position": { "x": 123.4, "y": 76.0 },
        "ipAddress": "203.0.113.42",
        "userAgent": "Mozilla/5.0 Chrome/120.0.0.0",
    });
    let anonymized = anonymizer.anonymize(raw.clone());
    assert_ne!(anonymized, raw);

    engine
        .save_batch(INTERACTIONS_STORE, vec![anonymized.clone()])
        .await
        .unwrap();
    let stored = engine.get(INTERACTIONS_STORE, 7i64).unwrap().unwrap();
    assert_eq!(stored, anonymized);

    // Spot-check the transforms the stored record went through.
    assert_ne!(stored["sessionId"], json!("session-raw"));
    assert_eq!(stored["timestamp"], json!(1_700_000_100_000i64));
    assert_eq!(stored["position"]["x"], json!(100));
    assert_eq!(stored["ipAddress"], json!("203.0.113.0"));
    assert_eq!(stored["userAgent"], json!("Mozilla/x Chrome/x"));

    // The pseudonym still works as an index key.
    let hashed = stored["sessionId"].as_str().unwrap().to_string();
    let by_session = engine
        .query_by_index(INTERACTIONS_STORE, "sessionId", KeyRange::only(hashed))
        .unwrap();
    assert_eq!(by_session, vec![anonymized]);
}

// ============================================================================
// Opt-Out Tests
// ============================================================================

/// An opted-out category never reaches its store; the rest keep flowing.
#[tokio::test]
async fn test_opted_out_category_never_reaches_its_store() {
    let dir = tempdir().unwrap();
    let collector = Collector::new(test_config(&dir)).unwrap();
    assert!(collector
        .request_consent(&OptOutUi(Feature::PerformanceTracking))
        .await
        .unwrap());

    collector.collect_session_start(start()).await;
    collector.collect_performance_data(frame(60.0)).await;
    collector.collect_performance_data(frame(30.0)).await;
    collector.collect_bubble_interaction(bubble(40.0, 40.0)).await;
    collector.flush_queue().await.unwrap();

    assert!(collector
        .storage()
        .get_all(PERFORMANCE_STORE)
        .unwrap()
        .is_empty());
    assert_eq!(
        collector.storage().get_all(INTERACTIONS_STORE).unwrap().len(),
        1
    );
    assert_eq!(collector.storage().get_all(SESSIONS_STORE).unwrap().len(), 1);

    // The frames were refused at the gate, not dropped downstream.
    let stats = collector.get_event_stats().await.unwrap();
    assert_eq!(stats.collected, 2);
    assert_eq!(stats.dropped, 0);
}

/// Revoking consent stops the flow immediately; already-persisted data
/// stays until the player deletes it.
#[tokio::test]
async fn test_revoked_consent_stops_the_flow_immediately() {
    let dir = tempdir().unwrap();
    let collector = granted_collector(&dir).await;

    collector.collect_session_start(start()).await;
    collector.collect_bubble_interaction(bubble(60.0, 60.0)).await;
    collector.flush_queue().await.unwrap();

    collector.revoke_consent().unwrap();
    assert!(!collector.consent_record().unwrap().granted);

    collector.collect_bubble_interaction(bubble(90.0, 90.0)).await;
    collector.flush_queue().await.unwrap();

    let stats = collector.get_event_stats().await.unwrap();
    assert_eq!(stats.collected, 2);
    assert_eq!(
        collector.storage().get_all(INTERACTIONS_STORE).unwrap().len(),
        1
    );
}
