//! In-memory store state and ordered cursor scans.
//!
//! Each store keeps its records in a primary-key-ordered map plus one
//! ordered entry set per secondary index. Mutation happens only under the
//! engine's per-store write gate; cursors re-acquire the read lock on
//! every step and seek strictly past the last yielded position, so a
//! record deleted mid-scan never hides its successor.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use serde_json::Value;
use tracing::warn;

use super::key::{lookup_path, KeyRange, KeyValue};
use super::log::LogFrame;
use super::schema::{KeyPath, StoreSchema};
use super::StorageError;

/// A batch validated against the store schema, ready to commit.
#[derive(Debug)]
pub(crate) struct PreparedBatch {
    /// Primary key and fully materialized record per accepted entry.
    pub entries: Vec<(KeyValue, Value)>,
    /// Records rejected by schema validation.
    pub rejected: usize,
    /// Auto-increment counter value after the batch commits.
    pub next_auto_key: u64,
}

/// The in-memory image of one store.
pub(crate) struct StoreState {
    schema: StoreSchema,
    records: BTreeMap<KeyValue, Value>,
    indexes: HashMap<String, BTreeSet<(KeyValue, KeyValue)>>,
    next_auto_key: u64,
}

impl StoreState {
    pub(crate) fn new(schema: StoreSchema) -> Self {
        let indexes = schema
            .indexes
            .iter()
            .map(|index| (index.name.clone(), BTreeSet::new()))
            .collect();
        Self {
            schema,
            records: BTreeMap::new(),
            indexes,
            next_auto_key: 1,
        }
    }

    pub(crate) fn schema(&self) -> &StoreSchema {
        &self.schema
    }

    pub(crate) fn record_count(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn next_auto_key(&self) -> u64 {
        self.next_auto_key
    }

    pub(crate) fn set_next_auto_key(&mut self, next: u64) {
        self.next_auto_key = next;
    }

    pub(crate) fn get(&self, key: &KeyValue) -> Option<Value> {
        self.records.get(key).cloned()
    }

    /// All records in primary-key order.
    pub(crate) fn snapshot_records(&self) -> Vec<Value> {
        self.records.values().cloned().collect()
    }

    /// Validates a batch and materializes primary keys, assigning
    /// auto-increment keys where the schema allows.
    ///
    /// Records that fail validation are counted and skipped; they never
    /// abort their siblings. A later record with the same primary key as
    /// an earlier one replaces it within the batch (last write wins).
    pub(crate) fn prepare_batch(&self, records: Vec<Value>) -> PreparedBatch {
        let mut entries: Vec<(KeyValue, Value)> = Vec::with_capacity(records.len());
        let mut positions: BTreeMap<KeyValue, usize> = BTreeMap::new();
        let mut claimed_unique: HashMap<String, BTreeMap<KeyValue, KeyValue>> = HashMap::new();
        let mut next_auto = self.next_auto_key;
        let mut rejected = 0usize;

        for record in records {
            match self.prepare_record(record, &mut next_auto) {
                Ok((key, record)) => {
                    if let Err(message) =
                        self.check_unique(&key, &record, &mut claimed_unique)
                    {
                        warn!(
                            store = %self.schema.name,
                            reason = %message,
                            "Rejecting record that violates a unique index"
                        );
                        rejected += 1;
                        continue;
                    }
                    match positions.get(&key) {
                        Some(&at) => entries[at] = (key, record),
                        None => {
                            positions.insert(key.clone(), entries.len());
                            entries.push((key, record));
                        }
                    }
                }
                Err(message) => {
                    warn!(
                        store = %self.schema.name,
                        reason = %message,
                        "Rejecting record that violates the store schema"
                    );
                    rejected += 1;
                }
            }
        }

        PreparedBatch {
            entries,
            rejected,
            next_auto_key: next_auto,
        }
    }

    fn prepare_record(
        &self,
        mut record: Value,
        next_auto: &mut u64,
    ) -> Result<(KeyValue, Value), String> {
        let Some(fields) = record.as_object_mut() else {
            return Err("record is not a JSON object".to_string());
        };

        if self.schema.auto_increment {
            if let KeyPath::Single(path) = &self.schema.key_path {
                let missing = fields.get(path.as_str()).is_none_or(Value::is_null);
                if missing {
                    fields.insert(path.clone(), Value::from(*next_auto));
                    *next_auto = next_auto.saturating_add(1);
                }
            }
        }

        let key = self
            .schema
            .key_path
            .extract(&record)
            .ok_or_else(|| "missing or invalid primary key".to_string())?;
        if self.schema.auto_increment {
            bump_auto_counter(next_auto, &key);
        }

        for index in &self.schema.indexes {
            let value = lookup_path(&record, &index.key_path);
            let keyable = value.is_some_and(|v| KeyValue::from_value(v).is_some());
            if !keyable {
                return Err(format!("missing or invalid indexed field `{}`", index.key_path));
            }
        }

        Ok((key, record))
    }

    fn check_unique(
        &self,
        key: &KeyValue,
        record: &Value,
        claimed: &mut HashMap<String, BTreeMap<KeyValue, KeyValue>>,
    ) -> Result<(), String> {
        for index in self.schema.indexes.iter().filter(|index| index.unique) {
            let Some(index_key) =
                lookup_path(record, &index.key_path).and_then(KeyValue::from_value)
            else {
                continue;
            };

            if self.index_has_conflict(&index.name, &index_key, key) {
                return Err(format!("duplicate value for unique index `{}`", index.name));
            }

            let in_batch = claimed.entry(index.name.clone()).or_default();
            match in_batch.get(&index_key) {
                Some(owner) if owner != key => {
                    return Err(format!("duplicate value for unique index `{}`", index.name));
                }
                _ => {
                    in_batch.insert(index_key, key.clone());
                }
            }
        }
        Ok(())
    }

    fn index_has_conflict(&self, index: &str, index_key: &KeyValue, key: &KeyValue) -> bool {
        let Some(entries) = self.indexes.get(index) else {
            return false;
        };
        entries
            .range((
                Bound::Included((index_key.clone(), KeyValue::min())),
                Bound::Unbounded,
            ))
            .take_while(|(entry_key, _)| entry_key == index_key)
            .any(|(_, owner)| owner != key)
    }

    /// Inserts or replaces a record, keeping every index in step.
    ///
    /// Returns true when an existing record was replaced, which leaves a
    /// dead entry behind in the store log.
    pub(crate) fn apply_put(&mut self, key: KeyValue, record: Value) -> bool {
        let replaced = if let Some(old) = self.records.get(&key) {
            for (index, index_key) in self.index_keys(old) {
                if let Some(entries) = self.indexes.get_mut(&index) {
                    entries.remove(&(index_key, key.clone()));
                }
            }
            true
        } else {
            false
        };

        let new_keys = self.index_keys(&record);
        self.records.insert(key.clone(), record);
        for (index, index_key) in new_keys {
            if let Some(entries) = self.indexes.get_mut(&index) {
                entries.insert((index_key, key.clone()));
            }
        }
        replaced
    }

    /// Removes a record and its index entries.
    pub(crate) fn apply_delete(&mut self, key: &KeyValue) -> Option<Value> {
        let record = self.records.remove(key)?;
        for (index, index_key) in self.index_keys(&record) {
            if let Some(entries) = self.indexes.get_mut(&index) {
                entries.remove(&(index_key, key.clone()));
            }
        }
        Some(record)
    }

    /// Removes every record. The auto-increment counter is not reset.
    pub(crate) fn apply_clear(&mut self) {
        self.records.clear();
        for entries in self.indexes.values_mut() {
            entries.clear();
        }
    }

    /// Re-applies one durable log frame during replay.
    ///
    /// Returns how many log entries the frame made dead: records it
    /// replaced, deleted, or cleared away.
    pub(crate) fn apply_frame(&mut self, frame: LogFrame) -> u64 {
        let mut dead = 0u64;
        match frame {
            LogFrame::Put { records } => {
                for record in records {
                    match self.schema.key_path.extract(&record) {
                        Some(key) => {
                            if self.schema.auto_increment {
                                bump_auto_counter(&mut self.next_auto_key, &key);
                            }
                            if self.apply_put(key, record) {
                                dead += 1;
                            }
                        }
                        None => warn!(
                            store = %self.schema.name,
                            "Skipping replayed record without a primary key"
                        ),
                    }
                }
            }
            LogFrame::Delete { keys } => {
                for key in &keys {
                    if let Some(key) = KeyValue::from_value(key) {
                        if self.apply_delete(&key).is_some() {
                            dead += 1;
                        }
                    }
                }
            }
            LogFrame::Clear => {
                dead = self.records.len() as u64;
                self.apply_clear();
            }
        }
        dead
    }

    fn index_keys(&self, record: &Value) -> Vec<(String, KeyValue)> {
        self.schema
            .indexes
            .iter()
            .filter_map(|index| {
                lookup_path(record, &index.key_path)
                    .and_then(KeyValue::from_value)
                    .map(|key| (index.name.clone(), key))
            })
            .collect()
    }
}

enum CursorSource {
    Primary,
    Index(String),
}

enum CursorPosition {
    Start,
    AfterKey(KeyValue),
    AfterEntry(KeyValue, KeyValue),
    Done,
}

/// A lazy, restartable scan over one store in ascending key order.
///
/// Each [`next`](Cursor::next) call re-acquires the store's read lock and
/// seeks to the first entry strictly past the previous position, so the
/// sequence stays correct when records are deleted between steps.
pub struct Cursor<'a> {
    state: &'a RwLock<StoreState>,
    open: &'a AtomicBool,
    source: CursorSource,
    range: KeyRange,
    position: CursorPosition,
}

impl<'a> Cursor<'a> {
    pub(crate) fn over_primary(
        state: &'a RwLock<StoreState>,
        open: &'a AtomicBool,
        range: KeyRange,
    ) -> Self {
        Self {
            state,
            open,
            source: CursorSource::Primary,
            range,
            position: CursorPosition::Start,
        }
    }

    pub(crate) fn over_index(
        state: &'a RwLock<StoreState>,
        open: &'a AtomicBool,
        index: String,
        range: KeyRange,
    ) -> Self {
        Self {
            state,
            open,
            source: CursorSource::Index(index),
            range,
            position: CursorPosition::Start,
        }
    }

    /// Advances to the next matching record.
    ///
    /// Returns the record's primary key alongside a clone of the record,
    /// or `None` once the scan is exhausted.
    pub fn next(&mut self) -> Result<Option<(KeyValue, Value)>, StorageError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        if matches!(self.position, CursorPosition::Done) {
            return Ok(None);
        }

        let state = self.state.read().unwrap();
        let found = match &self.source {
            CursorSource::Primary => self.seek_primary(&state),
            CursorSource::Index(index) => self.seek_index(&state, index),
        };

        match found {
            Some((position, key, record)) => {
                self.position = position;
                Ok(Some((key, record)))
            }
            None => {
                self.position = CursorPosition::Done;
                Ok(None)
            }
        }
    }

    fn seek_primary(&self, state: &StoreState) -> Option<(CursorPosition, KeyValue, Value)> {
        let start = match &self.position {
            CursorPosition::Start => match &self.range.lower {
                Some(lower) => Bound::Included(lower.clone()),
                None => Bound::Unbounded,
            },
            CursorPosition::AfterKey(key) => Bound::Excluded(key.clone()),
            _ => return None,
        };

        for (key, record) in state.records.range((start, Bound::Unbounded)) {
            if self.range.is_below(key) {
                continue;
            }
            if self.range.is_above(key) {
                return None;
            }
            return Some((
                CursorPosition::AfterKey(key.clone()),
                key.clone(),
                record.clone(),
            ));
        }
        None
    }

    fn seek_index(
        &self,
        state: &StoreState,
        index: &str,
    ) -> Option<(CursorPosition, KeyValue, Value)> {
        let entries = state.indexes.get(index)?;
        let start = match &self.position {
            CursorPosition::Start => match &self.range.lower {
                Some(lower) => Bound::Included((lower.clone(), KeyValue::min())),
                None => Bound::Unbounded,
            },
            CursorPosition::AfterEntry(index_key, key) => {
                Bound::Excluded((index_key.clone(), key.clone()))
            }
            _ => return None,
        };

        for (index_key, key) in entries.range((start, Bound::Unbounded)) {
            if self.range.is_below(index_key) {
                continue;
            }
            if self.range.is_above(index_key) {
                return None;
            }
            // Index entries and records mutate together under the write
            // gate, so the lookup cannot miss.
            let record = state.records.get(key)?;
            return Some((
                CursorPosition::AfterEntry(index_key.clone(), key.clone()),
                key.clone(),
                record.clone(),
            ));
        }
        None
    }
}

/// Keeps an auto-increment counter ahead of an explicit integer key.
/// Saturates rather than wrap on keys past the counter range, so stale
/// auto keys are never handed out again.
fn bump_auto_counter(next: &mut u64, key: &KeyValue) {
    if let KeyValue::Number(n) = key {
        if *n >= 0.0 && n.is_finite() {
            let floor = n.floor() as u64;
            if floor >= *next {
                *next = floor.saturating_add(1);
            }
        }
    }
}
