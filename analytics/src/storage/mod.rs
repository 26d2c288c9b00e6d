//! Schema-defined indexed storage engine with durable store logs.
//!
//! The engine owns a fixed set of stores declared at open time. Each
//! store keeps its records in memory (primary-key ordered, with ordered
//! secondary indexes) and is backed by an append-only JSONL log: a batch
//! commits by writing one synced log frame before the in-memory state
//! changes, so callers never observe a partially durable batch. Logs are
//! rewritten from live state once dead entries outweigh live records,
//! and right after bulk deletes and clears.
//!
//! # Concurrency
//!
//! Writes to one store serialize through that store's async write gate;
//! writes to different stores proceed concurrently. Reads take a shared
//! lock and never block on the write gate. Cursor scans re-acquire the
//! read lock per step, which keeps them correct while deletes interleave.
//!
//! # Migration
//!
//! A manifest records the schema version and store set the data
//! directory was built with. Opening with a higher version drops the
//! logs of stores that are no longer declared; changing the store set
//! without a version bump is refused.

mod aggregate;
mod key;
mod log;
mod schema;
mod store;

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub use aggregate::{AggregateOp, AggregateQuery, AggregateResult, AggregateRule, AggregateValue};
pub use key::{lookup_path, KeyRange, KeyValue};
pub use schema::{game_store_schemas, IndexSchema, KeyPath, StoreSchema};
pub use store::Cursor;

use log::{LogFrame, Manifest, ReplayedLog, StoreLog};
use store::StoreState;

/// Dead log entries a store tolerates before a rewrite is considered.
const COMPACT_MIN_DEAD: u64 = 256;
/// Fraction of dead entries (over dead plus live) that triggers a rewrite.
const COMPACT_DEAD_FRACTION: f64 = 0.5;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The engine has been closed; the medium is no longer reachable.
    #[error("storage engine is closed")]
    Closed,

    /// An underlying filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The named store was never declared.
    #[error("unknown store: {0}")]
    UnknownStore(String),

    /// The named index does not exist on the store.
    #[error("unknown index `{index}` on store `{store}`")]
    UnknownIndex { store: String, index: String },

    /// The data directory disagrees with the declared schema.
    #[error("schema mismatch: {message}")]
    SchemaMismatch { message: String },
}

impl StorageError {
    /// True for transient failures that a bounded retry may resolve.
    ///
    /// Schema and addressing problems are programmer errors and stay
    /// non-retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Closed | StorageError::Io(_))
    }
}

/// Outcome of a batch write.
///
/// Records that violate the store schema are rejected individually;
/// their valid siblings still commit as one durable unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchReport {
    /// Records committed durably.
    pub written: usize,
    /// Records rejected by schema validation.
    pub rejected: usize,
}

/// Per-store diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreInfo {
    pub name: String,
    pub record_count: usize,
    pub log_bytes: u64,
}

/// Engine-wide diagnostics, stores sorted by name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageInfo {
    pub stores: Vec<StoreInfo>,
}

impl StorageInfo {
    #[must_use]
    pub fn total_records(&self) -> usize {
        self.stores.iter().map(|store| store.record_count).sum()
    }
}

struct StoreShard {
    state: RwLock<StoreState>,
    log: Mutex<StoreLog>,
    /// Log entries made dead by overwrites and deletes since the last
    /// compaction.
    dead: AtomicU64,
}

struct EngineInner {
    data_dir: PathBuf,
    stores: HashMap<String, StoreShard>,
    open: AtomicBool,
}

/// Handle to the storage engine; clones share the same engine.
#[derive(Clone)]
pub struct StorageEngine {
    inner: Arc<EngineInner>,
}

impl StorageEngine {
    /// Opens the engine at `data_dir`, replaying store logs and running
    /// the version migration if the declared schema moved ahead.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::SchemaMismatch`] when the store set
    /// changed without a version bump or the directory was written by a
    /// newer version, and [`StorageError::Io`] for filesystem failures.
    pub fn open(
        data_dir: impl Into<PathBuf>,
        schema_version: u32,
        schemas: Vec<StoreSchema>,
    ) -> Result<Self, StorageError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;

        let declared: Vec<String> = schemas.iter().map(|schema| schema.name.clone()).collect();
        match Manifest::load(&data_dir)? {
            None => {
                Manifest {
                    version: schema_version,
                    stores: declared.clone(),
                }
                .store(&data_dir)?;
            }
            Some(manifest) if manifest.version == schema_version => {
                let mut known = manifest.stores.clone();
                known.sort();
                let mut wanted = declared.clone();
                wanted.sort();
                if known != wanted {
                    return Err(StorageError::SchemaMismatch {
                        message: "declared stores changed without a schema version bump"
                            .to_string(),
                    });
                }
            }
            Some(manifest) if manifest.version < schema_version => {
                for stale in manifest
                    .stores
                    .iter()
                    .filter(|name| !declared.contains(name))
                {
                    let path = data_dir.join(format!("{stale}.log"));
                    if path.exists() {
                        fs::remove_file(&path)?;
                    }
                    info!(store = %stale, "Dropped store during schema migration");
                }
                Manifest {
                    version: schema_version,
                    stores: declared.clone(),
                }
                .store(&data_dir)?;
                info!(
                    from_version = manifest.version,
                    to_version = schema_version,
                    "Migrated storage schema"
                );
            }
            Some(manifest) => {
                return Err(StorageError::SchemaMismatch {
                    message: format!(
                        "data directory was written by newer schema version {}",
                        manifest.version
                    ),
                });
            }
        }

        let mut stores = HashMap::new();
        for schema in schemas {
            let name = schema.name.clone();
            let path = data_dir.join(format!("{name}.log"));
            let ReplayedLog {
                mut log,
                frames,
                needs_compact,
            } = StoreLog::open(path)?;

            let mut state = StoreState::new(schema);
            let mut dead = 0u64;
            for frame in frames {
                dead += state.apply_frame(frame);
            }
            if needs_compact || should_compact(dead, state.record_count()) {
                log.compact(state.snapshot_records())?;
                dead = 0;
            }
            debug!(
                store = %name,
                record_count = state.record_count(),
                "Opened store"
            );
            stores.insert(
                name,
                StoreShard {
                    state: RwLock::new(state),
                    log: Mutex::new(log),
                    dead: AtomicU64::new(dead),
                },
            );
        }

        info!(
            data_dir = %data_dir.display(),
            store_count = stores.len(),
            schema_version,
            "Storage engine opened"
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                data_dir,
                stores,
                open: AtomicBool::new(true),
            }),
        })
    }

    /// Upserts a batch of records by primary key (last write wins), as
    /// one durable commit.
    ///
    /// Schema-invalid records are rejected individually and reported in
    /// the returned [`BatchReport`] without aborting their siblings.
    ///
    /// # Errors
    ///
    /// Whole-batch failures only: unknown store, closed engine, or an
    /// I/O failure while writing the log frame (nothing is applied).
    pub async fn save_batch(
        &self,
        store: &str,
        records: Vec<Value>,
    ) -> Result<BatchReport, StorageError> {
        let shard = self.shard(store)?;
        self.ensure_open()?;
        if records.is_empty() {
            return Ok(BatchReport::default());
        }

        let mut log = shard.log.lock().await;
        self.ensure_open()?;

        let prepared = {
            let state = shard.state.read().unwrap();
            state.prepare_batch(records)
        };
        if prepared.entries.is_empty() {
            return Ok(BatchReport {
                written: 0,
                rejected: prepared.rejected,
            });
        }

        let frame = LogFrame::Put {
            records: prepared
                .entries
                .iter()
                .map(|(_, record)| record.clone())
                .collect(),
        };
        log.append(&frame)?;

        let written = prepared.entries.len();
        let (replaced, live) = {
            let mut state = shard.state.write().unwrap();
            let mut replaced = 0u64;
            for (key, record) in prepared.entries {
                if state.apply_put(key, record) {
                    replaced += 1;
                }
            }
            state.set_next_auto_key(prepared.next_auto_key);
            (replaced, state.record_count())
        };

        // Overwrites leave their old versions behind in the log; rewrite
        // it once they outweigh the live records. The batch is already
        // committed, so a failed rewrite is only logged.
        let dead = shard.dead.fetch_add(replaced, Ordering::Relaxed) + replaced;
        if should_compact(dead, live) {
            match log.compact(shard.state.read().unwrap().snapshot_records()) {
                Ok(()) => shard.dead.store(0, Ordering::Relaxed),
                Err(error) => warn!(store, %error, "Log compaction failed"),
            }
        }

        debug!(
            store,
            written,
            rejected = prepared.rejected,
            "Committed batch"
        );
        Ok(BatchReport {
            written,
            rejected: prepared.rejected,
        })
    }

    /// Point lookup by primary key. Not-found is `Ok(None)`.
    pub fn get(
        &self,
        store: &str,
        key: impl Into<KeyValue>,
    ) -> Result<Option<Value>, StorageError> {
        let shard = self.shard(store)?;
        self.ensure_open()?;
        Ok(shard.state.read().unwrap().get(&key.into()))
    }

    /// All records whose indexed field falls in `range`, in ascending
    /// index order.
    pub fn query_by_index(
        &self,
        store: &str,
        index: &str,
        range: KeyRange,
    ) -> Result<Vec<Value>, StorageError> {
        let mut cursor = self.index_cursor(store, index, range)?;
        let mut records = Vec::new();
        while let Some((_, record)) = cursor.next()? {
            records.push(record);
        }
        Ok(records)
    }

    /// Every record in the store, in primary-key order.
    pub fn get_all(&self, store: &str) -> Result<Vec<Value>, StorageError> {
        let shard = self.shard(store)?;
        self.ensure_open()?;
        Ok(shard.state.read().unwrap().snapshot_records())
    }

    /// Opens a cursor over the store in primary-key order.
    pub fn cursor(&self, store: &str, range: KeyRange) -> Result<Cursor<'_>, StorageError> {
        let shard = self.shard(store)?;
        self.ensure_open()?;
        Ok(Cursor::over_primary(&shard.state, &self.inner.open, range))
    }

    /// Opens a cursor over an index range in ascending index order.
    pub fn index_cursor(
        &self,
        store: &str,
        index: &str,
        range: KeyRange,
    ) -> Result<Cursor<'_>, StorageError> {
        let shard = self.shard(store)?;
        self.ensure_open()?;
        let known = shard.state.read().unwrap().schema().index(index).is_some();
        if !known {
            return Err(StorageError::UnknownIndex {
                store: store.to_string(),
                index: index.to_string(),
            });
        }
        Ok(Cursor::over_index(
            &shard.state,
            &self.inner.open,
            index.to_string(),
            range,
        ))
    }

    /// Streams the matched records once, feeding every rule of the query
    /// from the same pass.
    pub fn aggregate(
        &self,
        store: &str,
        query: AggregateQuery,
    ) -> Result<AggregateResult, StorageError> {
        let AggregateQuery { index, rules } = query;
        let mut cursor = match index {
            Some((index, range)) => self.index_cursor(store, &index, range)?,
            None => self.cursor(store, KeyRange::all())?,
        };

        let mut run = aggregate::AggregateRun::new(rules);
        while let Some((_, record)) = cursor.next()? {
            run.observe(&record);
        }
        Ok(run.finish())
    }

    /// Deletes every record whose indexed field falls in `range`, as one
    /// durable delete frame. Returns the number of records removed.
    pub async fn delete_by_index(
        &self,
        store: &str,
        index: &str,
        range: KeyRange,
    ) -> Result<u64, StorageError> {
        let shard = self.shard(store)?;
        self.ensure_open()?;
        let known = shard.state.read().unwrap().schema().index(index).is_some();
        if !known {
            return Err(StorageError::UnknownIndex {
                store: store.to_string(),
                index: index.to_string(),
            });
        }

        let mut log = shard.log.lock().await;
        self.ensure_open()?;

        let mut keys: Vec<KeyValue> = Vec::new();
        let mut cursor =
            Cursor::over_index(&shard.state, &self.inner.open, index.to_string(), range);
        while let Some((key, _)) = cursor.next()? {
            keys.push(key);
        }
        if keys.is_empty() {
            return Ok(0);
        }

        // Frame first: a failed append must leave the records in place,
        // or memory would show them gone while a restart brings them back.
        let count = keys.len() as u64;
        log.append(&LogFrame::Delete {
            keys: keys.iter().map(KeyValue::to_value).collect(),
        })?;
        {
            let mut state = shard.state.write().unwrap();
            for key in &keys {
                state.apply_delete(key);
            }
        }

        // The removed records still occupy log space; rewrite from live
        // state so nothing of them stays on disk. The delete frame is
        // already durable, so a crash mid-rewrite loses nothing.
        shard.dead.fetch_add(count, Ordering::Relaxed);
        match log.compact(shard.state.read().unwrap().snapshot_records()) {
            Ok(()) => shard.dead.store(0, Ordering::Relaxed),
            Err(error) => warn!(store, %error, "Log compaction failed after bulk delete"),
        }

        debug!(store, index, count, "Deleted records by index");
        Ok(count)
    }

    /// Prunes records older than `cutoff_millis` from every store that
    /// declares a retention index. Idempotent across repeated calls.
    pub async fn delete_old_data(&self, cutoff_millis: i64) -> Result<u64, StorageError> {
        self.ensure_open()?;
        let mut total = 0u64;
        for (name, shard) in &self.inner.stores {
            let retention = shard.state.read().unwrap().schema().retention_key.clone();
            let Some(index) = retention else { continue };
            total += self
                .delete_by_index(name, &index, KeyRange::below(cutoff_millis as f64))
                .await?;
        }
        if total > 0 {
            info!(removed = total, cutoff_millis, "Pruned expired records");
        }
        Ok(total)
    }

    /// Removes every record from one store.
    pub async fn clear_store(&self, store: &str) -> Result<(), StorageError> {
        let shard = self.shard(store)?;
        self.ensure_open()?;

        let mut log = shard.log.lock().await;
        self.ensure_open()?;
        log.append(&LogFrame::Clear)?;
        let cleared = {
            let mut state = shard.state.write().unwrap();
            let count = state.record_count() as u64;
            state.apply_clear();
            count
        };

        // Truncate rather than leave the cleared records in the log file.
        shard.dead.fetch_add(cleared, Ordering::Relaxed);
        match log.compact(Vec::new()) {
            Ok(()) => shard.dead.store(0, Ordering::Relaxed),
            Err(error) => warn!(store, %error, "Log compaction failed after clear"),
        }

        debug!(store, "Cleared store");
        Ok(())
    }

    /// Removes every record from every store.
    pub async fn clear_all(&self) -> Result<(), StorageError> {
        let names: Vec<String> = self.inner.stores.keys().cloned().collect();
        for name in names {
            self.clear_store(&name).await?;
        }
        info!("Cleared all stores");
        Ok(())
    }

    /// Record counts and log sizes per store, sorted by store name.
    pub fn info(&self) -> Result<StorageInfo, StorageError> {
        self.ensure_open()?;
        let mut stores: Vec<StoreInfo> = self
            .inner
            .stores
            .iter()
            .map(|(name, shard)| {
                let record_count = shard.state.read().unwrap().record_count();
                let log_bytes = fs::metadata(self.inner.data_dir.join(format!("{name}.log")))
                    .map(|meta| meta.len())
                    .unwrap_or(0);
                StoreInfo {
                    name: name.clone(),
                    record_count,
                    log_bytes,
                }
            })
            .collect();
        stores.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(StorageInfo { stores })
    }

    /// Returns true until [`close`](Self::close) runs.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Closes the engine: in-flight writes finish, then the store logs
    /// sync and release their handles. Later operations fail with
    /// [`StorageError::Closed`]. Idempotent.
    pub async fn close(&self) -> Result<(), StorageError> {
        if !self.inner.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        for shard in self.inner.stores.values() {
            let mut log = shard.log.lock().await;
            log.close()?;
        }
        info!("Storage engine closed");
        Ok(())
    }

    fn shard(&self, store: &str) -> Result<&StoreShard, StorageError> {
        self.inner
            .stores
            .get(store)
            .ok_or_else(|| StorageError::UnknownStore(store.to_string()))
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(StorageError::Closed)
        }
    }
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("data_dir", &self.inner.data_dir)
            .field("store_count", &self.inner.stores.len())
            .field("open", &self.is_open())
            .finish()
    }
}

/// Whether a store log with `dead` superseded entries and `live` records
/// is worth rewriting.
fn should_compact(dead: u64, live: usize) -> bool {
    dead >= COMPACT_MIN_DEAD
        && dead as f64 >= COMPACT_DEAD_FRACTION * (dead + live as u64) as f64
}
