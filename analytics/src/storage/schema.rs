//! Store schemas: primary key paths, secondary indexes, and the declared
//! store set for the gameplay telemetry pipeline.
//!
//! Schemas are fixed when the engine opens. Changing the declared set
//! requires a schema version bump, which migrates the data directory by
//! dropping stores that are no longer declared.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::key::{lookup_path, KeyValue};
use crate::types::{
    AGGREGATED_STORE, INTERACTIONS_STORE, PERFORMANCE_STORE, SESSIONS_STORE,
};

/// Location of a store's primary key within its records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPath {
    /// A single (possibly dotted) field path.
    Single(String),
    /// An ordered list of field paths forming a composite array key.
    Composite(Vec<String>),
}

impl KeyPath {
    /// Extracts the primary key from a record, if every component is
    /// present and key-able.
    #[must_use]
    pub fn extract(&self, record: &Value) -> Option<KeyValue> {
        match self {
            KeyPath::Single(path) => lookup_path(record, path).and_then(KeyValue::from_value),
            KeyPath::Composite(paths) => paths
                .iter()
                .map(|path| lookup_path(record, path).and_then(KeyValue::from_value))
                .collect::<Option<Vec<_>>>()
                .map(KeyValue::Array),
        }
    }
}

/// A secondary index over one record field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub key_path: String,
    pub unique: bool,
}

impl IndexSchema {
    /// An index named after the field it covers.
    #[must_use]
    pub fn on(name: &str) -> Self {
        Self {
            name: name.to_string(),
            key_path: name.to_string(),
            unique: false,
        }
    }

    /// Marks the index as unique.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Declaration of one store: name, primary key, and secondary indexes.
///
/// `auto_increment` is only meaningful with a [`KeyPath::Single`] primary
/// key; the engine assigns the next integer key when a record arrives
/// without one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSchema {
    pub name: String,
    pub key_path: KeyPath,
    pub auto_increment: bool,
    pub indexes: Vec<IndexSchema>,
    /// Index whose values are epoch-millisecond ages for retention
    /// pruning, or `None` when the store is exempt.
    pub retention_key: Option<String>,
}

impl StoreSchema {
    /// Looks up a declared index by name.
    #[must_use]
    pub fn index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|index| index.name == name)
    }
}

/// The declared store set for gameplay telemetry.
///
/// Store and index names are part of the external contract; reporting
/// consumers address them by these exact names.
#[must_use]
pub fn game_store_schemas() -> Vec<StoreSchema> {
    vec![
        StoreSchema {
            name: SESSIONS_STORE.to_string(),
            key_path: KeyPath::Single("sessionId".to_string()),
            auto_increment: false,
            indexes: vec![
                IndexSchema::on("startTime"),
                IndexSchema::on("stageId"),
                IndexSchema::on("completed"),
            ],
            retention_key: Some("startTime".to_string()),
        },
        StoreSchema {
            name: INTERACTIONS_STORE.to_string(),
            key_path: KeyPath::Single("id".to_string()),
            auto_increment: true,
            indexes: vec![
                IndexSchema::on("sessionId"),
                IndexSchema::on("timestamp"),
                IndexSchema::on("bubbleType"),
                IndexSchema::on("action"),
            ],
            retention_key: Some("timestamp".to_string()),
        },
        StoreSchema {
            name: PERFORMANCE_STORE.to_string(),
            key_path: KeyPath::Single("id".to_string()),
            auto_increment: true,
            indexes: vec![
                IndexSchema::on("sessionId"),
                IndexSchema::on("timestamp"),
                IndexSchema::on("fps"),
            ],
            retention_key: Some("timestamp".to_string()),
        },
        StoreSchema {
            name: AGGREGATED_STORE.to_string(),
            key_path: KeyPath::Composite(vec![
                "period".to_string(),
                "startDate".to_string(),
            ]),
            auto_increment: false,
            indexes: vec![IndexSchema::on("period"), IndexSchema::on("endDate")],
            retention_key: None,
        },
    ]
}
