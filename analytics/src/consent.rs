//! Consent gating for telemetry collection.
//!
//! Nothing is collected until the player has granted consent, and each
//! tracking feature can be opted out of individually. The resolved
//! decision is persisted as JSON in the data directory so it survives
//! restarts; bumping [`CONSENT_VERSION`] invalidates stored decisions
//! and forces a re-prompt through the [`ConsentUi`] collaborator.
//!
//! Consent denial is not an error: a blocked collection call is a silent
//! no-op at the gate.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::PathBuf;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{now_millis, EventType};

/// Current consent version. A persisted decision made under an older
/// version is treated as undecided.
pub const CONSENT_VERSION: u32 = 1;

/// File name of the persisted consent record inside the data directory.
pub const CONSENT_FILE: &str = "consent.json";

/// Errors that can occur while persisting consent state.
#[derive(Debug, Error)]
pub enum ConsentError {
    /// Reading or writing the consent file failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The consent record could not be encoded.
    #[error("failed to encode consent record: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// An independently opt-out-able category of data collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Feature {
    SessionTracking,
    InteractionTracking,
    PerformanceTracking,
    BalanceTracking,
    ScoreTracking,
    ItemTracking,
}

impl Feature {
    /// All features, in the order they are presented to the player.
    pub const ALL: [Feature; 6] = [
        Feature::SessionTracking,
        Feature::InteractionTracking,
        Feature::PerformanceTracking,
        Feature::BalanceTracking,
        Feature::ScoreTracking,
        Feature::ItemTracking,
    ];

    /// The feature that governs collection of an event type.
    #[must_use]
    pub fn for_event(event_type: EventType) -> Self {
        match event_type {
            EventType::Session => Feature::SessionTracking,
            EventType::BubbleInteraction => Feature::InteractionTracking,
            EventType::Performance => Feature::PerformanceTracking,
            EventType::GameBalance => Feature::BalanceTracking,
            EventType::Score => Feature::ScoreTracking,
            EventType::ItemUsage => Feature::ItemTracking,
        }
    }
}

/// The outcome of a consent prompt.
///
/// `per_feature` entries set to `false` become opt-outs; features absent
/// from the map follow the overall grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentDecision {
    pub granted: bool,
    #[serde(default)]
    pub per_feature: HashMap<Feature, bool>,
}

impl ConsentDecision {
    /// A blanket grant with no opt-outs.
    #[must_use]
    pub fn grant_all() -> Self {
        Self {
            granted: true,
            per_feature: HashMap::new(),
        }
    }

    /// A blanket denial.
    #[must_use]
    pub fn deny() -> Self {
        Self {
            granted: false,
            per_feature: HashMap::new(),
        }
    }
}

/// Asynchronous collaborator that puts the consent question to the
/// player. The pipeline itself only ever sees the resolved record.
pub trait ConsentUi: Send + Sync {
    /// Presents the listed features and resolves to the player's choice.
    fn request_consent(&self, features: Vec<Feature>) -> BoxFuture<'_, ConsentDecision>;
}

/// A resolved, persisted consent decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentRecord {
    /// Whether collection is permitted at all.
    pub granted: bool,
    /// Features the player opted out of, even under a grant.
    #[serde(default)]
    pub opted_out: HashSet<Feature>,
    /// Consent version the decision was made under.
    pub version: u32,
    /// Epoch milliseconds when the decision was made.
    pub decided_at: i64,
}

impl ConsentRecord {
    /// Builds a record from a prompt outcome under the given version.
    #[must_use]
    pub fn from_decision(decision: ConsentDecision, version: u32) -> Self {
        let opted_out = decision
            .per_feature
            .into_iter()
            .filter(|(_, allowed)| !allowed)
            .map(|(feature, _)| feature)
            .collect();
        Self {
            granted: decision.granted,
            opted_out,
            version,
            decided_at: now_millis(),
        }
    }

    /// True when collection of the feature is permitted.
    #[must_use]
    pub fn allows(&self, feature: Feature) -> bool {
        self.granted && !self.opted_out.contains(&feature)
    }
}

/// Loads, answers, and persists the consent question.
///
/// With no record (or a record from an older consent version) the gate
/// is *undecided* and blocks every feature until a decision is applied.
#[derive(Debug)]
pub struct ConsentGate {
    path: PathBuf,
    record: Option<ConsentRecord>,
}

impl ConsentGate {
    /// Loads persisted consent state from the data directory.
    ///
    /// A missing file, an unreadable record, or a record from an older
    /// consent version all leave the gate undecided.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::Io`] when the data directory cannot be
    /// created or the file exists but cannot be read.
    pub fn load(data_dir: impl Into<PathBuf>) -> Result<Self, ConsentError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;
        let path = data_dir.join(CONSENT_FILE);

        let record = match fs::read_to_string(&path) {
            Ok(body) => match serde_json::from_str::<ConsentRecord>(&body) {
                Ok(record) if record.version >= CONSENT_VERSION => {
                    debug!(
                        granted = record.granted,
                        opted_out = record.opted_out.len(),
                        "Loaded consent record"
                    );
                    Some(record)
                }
                Ok(record) => {
                    info!(
                        stored_version = record.version,
                        current_version = CONSENT_VERSION,
                        "Stored consent is outdated, re-prompt required"
                    );
                    None
                }
                Err(error) => {
                    warn!(%error, "Ignoring unreadable consent record");
                    None
                }
            },
            Err(error) if error.kind() == io::ErrorKind::NotFound => None,
            Err(error) => return Err(error.into()),
        };

        Ok(Self { path, record })
    }

    /// True once a current-version decision exists.
    #[must_use]
    pub fn is_decided(&self) -> bool {
        self.record.is_some()
    }

    /// The resolved record, if any.
    #[must_use]
    pub fn record(&self) -> Option<&ConsentRecord> {
        self.record.as_ref()
    }

    /// True when collection of the feature is permitted right now.
    ///
    /// Undecided consent blocks everything.
    #[must_use]
    pub fn should_collect(&self, feature: Feature) -> bool {
        self.record
            .as_ref()
            .is_some_and(|record| record.allows(feature))
    }

    /// Applies and persists a prompt outcome, returning whether
    /// collection was granted.
    pub fn apply_decision(&mut self, decision: ConsentDecision) -> Result<bool, ConsentError> {
        let record = ConsentRecord::from_decision(decision, CONSENT_VERSION);
        self.persist(&record)?;
        info!(
            granted = record.granted,
            opted_out = record.opted_out.len(),
            "Recorded consent decision"
        );
        let granted = record.granted;
        self.record = Some(record);
        Ok(granted)
    }

    /// Withdraws consent entirely and persists the denial.
    pub fn revoke(&mut self) -> Result<(), ConsentError> {
        let record = ConsentRecord {
            granted: false,
            opted_out: HashSet::new(),
            version: CONSENT_VERSION,
            decided_at: now_millis(),
        };
        self.persist(&record)?;
        self.record = Some(record);
        info!("Consent revoked");
        Ok(())
    }

    /// Removes the persisted record and returns the gate to undecided.
    ///
    /// Part of the data-deletion flow: after this, collection stays
    /// blocked until the player is asked again.
    pub fn clear(&mut self) -> Result<(), ConsentError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }
        self.record = None;
        info!("Cleared persisted consent record");
        Ok(())
    }

    fn persist(&self, record: &ConsentRecord) -> Result<(), ConsentError> {
        let body = serde_json::to_string_pretty(record)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
