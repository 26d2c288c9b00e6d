//! Append-only store logs and the engine manifest.
//!
//! Every committed batch writes exactly one JSONL frame, flushed and
//! synced before the in-memory state changes. Replay tolerates a torn
//! final line by truncating the file back to the last intact frame, so a
//! crash mid-append never exposes a partial batch.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// One durable commit unit in a store's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum LogFrame {
    /// Upsert of fully materialized records (keys already assigned).
    Put { records: Vec<Value> },
    /// Removal of the listed primary keys.
    Delete { keys: Vec<Value> },
    /// Removal of every record in the store.
    Clear,
}

/// Result of opening a store log: the writable log plus replayed frames.
pub(crate) struct ReplayedLog {
    pub log: StoreLog,
    pub frames: Vec<LogFrame>,
    /// True when the log carries dead weight (deletes, clears, or a
    /// discarded tail) worth rewriting from live state.
    pub needs_compact: bool,
}

/// The append-only JSONL log backing one store.
pub(crate) struct StoreLog {
    path: PathBuf,
    file: Option<File>,
}

impl StoreLog {
    /// Opens (or creates) the log at `path` and replays its frames.
    ///
    /// A torn or unparseable tail is discarded: the file is truncated to
    /// the end of the last intact frame before the write handle opens.
    pub(crate) fn open(path: PathBuf) -> io::Result<ReplayedLog> {
        let mut frames = Vec::new();
        let mut needs_compact = false;

        if path.exists() {
            let reader = File::open(&path)?;
            let mut reader = BufReader::new(reader);
            let mut line = String::new();
            let mut offset: u64 = 0;
            let mut intact: u64 = 0;

            loop {
                line.clear();
                let read = reader.read_line(&mut line)?;
                if read == 0 {
                    break;
                }
                offset += read as u64;
                if !line.ends_with('\n') {
                    // A frame is only committed once its newline lands.
                    break;
                }
                match serde_json::from_str::<LogFrame>(line.trim_end()) {
                    Ok(frame) => {
                        if !matches!(frame, LogFrame::Put { .. }) {
                            needs_compact = true;
                        }
                        frames.push(frame);
                        intact = offset;
                    }
                    Err(error) => {
                        warn!(
                            path = %path.display(),
                            %error,
                            "Stopping log replay at unparseable frame"
                        );
                        break;
                    }
                }
            }

            let len = fs::metadata(&path)?.len();
            if intact < len {
                warn!(
                    path = %path.display(),
                    discarded_bytes = len - intact,
                    "Discarding torn log tail"
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(intact)?;
                file.sync_all()?;
                needs_compact = true;
            }
        }

        let file = OpenOptions::new().append(true).create(true).open(&path)?;
        Ok(ReplayedLog {
            log: StoreLog {
                path,
                file: Some(file),
            },
            frames,
            needs_compact,
        })
    }

    /// Appends one frame, flushed and synced before returning.
    pub(crate) fn append(&mut self, frame: &LogFrame) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "log file closed"))?;

        let mut line = serde_json::to_string(frame)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Rewrites the log as a single put frame holding the live records.
    ///
    /// The replacement is written to a sibling temp file, synced, and
    /// renamed over the old log so the swap is atomic.
    pub(crate) fn compact(&mut self, records: Vec<Value>) -> io::Result<()> {
        let record_count = records.len();
        let tmp = self.path.with_extension("log.tmp");
        {
            let mut file = File::create(&tmp)?;
            if !records.is_empty() {
                let mut line = serde_json::to_string(&LogFrame::Put { records })
                    .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
                line.push('\n');
                file.write_all(line.as_bytes())?;
            }
            file.sync_all()?;
        }

        self.file = None;
        fs::rename(&tmp, &self.path)?;
        self.file = Some(OpenOptions::new().append(true).create(true).open(&self.path)?);

        debug!(
            path = %self.path.display(),
            record_count,
            "Compacted store log"
        );
        Ok(())
    }

    /// Syncs and releases the file handle; later appends fail.
    pub(crate) fn close(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_data()?;
        }
        Ok(())
    }
}

/// Records the schema version and store set a data directory was built
/// with, so a version bump can migrate it deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Manifest {
    pub version: u32,
    pub stores: Vec<String>,
}

impl Manifest {
    pub(crate) fn path_in(data_dir: &Path) -> PathBuf {
        data_dir.join("manifest.json")
    }

    /// Loads the manifest, or `None` when the directory is fresh.
    pub(crate) fn load(data_dir: &Path) -> io::Result<Option<Manifest>> {
        let path = Self::path_in(data_dir);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        let manifest = serde_json::from_str(&contents)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
        Ok(Some(manifest))
    }

    /// Writes the manifest atomically (temp file plus rename).
    pub(crate) fn store(&self, data_dir: &Path) -> io::Result<()> {
        let path = Self::path_in(data_dir);
        let tmp = data_dir.join("manifest.json.tmp");
        {
            let mut file = File::create(&tmp)?;
            let contents = serde_json::to_string_pretty(self)
                .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
            file.write_all(contents.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}
