//! Append-only per-(workspace, pane) history records.
//!
//! Layout: `<root>/<workspace>/<pane>/meta.json` + `output.gz`. The output
//! stream is a single gzip member appended for the life of the session and
//! finished at finalize; metadata is written atomically (temp file +
//! rename). A record that was never finalized (host crash) fails to
//! decompress cleanly and recovery degrades to an empty scrollback rather
//! than an error.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::scrollback::sanitize_start;
use crate::util::now_millis;

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMeta {
    pub pane_id: String,
    pub workspace_id: String,
    pub cwd: String,
    pub started_at: u64,
    pub finalized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub bytes_written: u64,
}

/// What a prior record yields on session creation.
pub struct HistorySnapshot {
    pub scrollback: Vec<u8>,
    pub was_recovered: bool,
}

pub struct HistoryStore {
    root: PathBuf,
}

impl HistoryStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn record_dir(&self, workspace_id: &str, pane_id: &str) -> PathBuf {
        self.root.join(workspace_id).join(pane_id)
    }

    /// Start a fresh record for the pane, replacing any previous one.
    pub fn create_writer(
        &self,
        workspace_id: &str,
        pane_id: &str,
        cwd: &str,
    ) -> Result<HistoryWriter> {
        let dir = self.record_dir(workspace_id, pane_id);
        fs::create_dir_all(&dir).map_err(Error::History)?;

        let output = File::create(dir.join("output.gz")).map_err(Error::History)?;
        let meta = HistoryMeta {
            pane_id: pane_id.to_string(),
            workspace_id: workspace_id.to_string(),
            cwd: cwd.to_string(),
            started_at: now_millis(),
            finalized: false,
            exit_code: None,
            signal: None,
            bytes_written: 0,
        };
        let meta_path = dir.join("meta.json");
        atomic_write_json(&meta_path, &meta);

        Ok(HistoryWriter {
            meta_path,
            meta,
            encoder: Some(GzEncoder::new(output, Compression::fast())),
            finalized: false,
        })
    }

    /// Recover the previous record's tail for replay. Missing, corrupt, or
    /// unfinalized records all degrade to `was_recovered=false`.
    pub fn latest_session(
        &self,
        workspace_id: &str,
        pane_id: &str,
        tail_limit: usize,
    ) -> HistorySnapshot {
        let dir = self.record_dir(workspace_id, pane_id);
        let empty = HistorySnapshot {
            scrollback: Vec::new(),
            was_recovered: false,
        };

        let meta: HistoryMeta = match fs::read(dir.join("meta.json"))
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
        {
            Some(m) => m,
            None => return empty,
        };
        if !meta.finalized {
            debug!(pane_id, "previous history record was never finalized, skipping");
            return empty;
        }

        let file = match File::open(dir.join("output.gz")) {
            Ok(f) => f,
            Err(_) => return empty,
        };
        let mut data = Vec::new();
        if GzDecoder::new(file).read_to_end(&mut data).is_err() {
            warn!(pane_id, "history record is corrupt, starting empty");
            return empty;
        }

        let scrollback = if data.len() > tail_limit {
            sanitize_start(data[data.len() - tail_limit..].to_vec())
        } else {
            data
        };
        HistorySnapshot {
            scrollback,
            was_recovered: true,
        }
    }

    /// Delete the pane's record. Missing records are not an error.
    pub fn cleanup(&self, workspace_id: &str, pane_id: &str) {
        let dir = self.record_dir(workspace_id, pane_id);
        if let Err(err) = fs::remove_dir_all(&dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(pane_id, %err, "failed to delete history record");
            }
        }
    }
}

pub struct HistoryWriter {
    meta_path: PathBuf,
    meta: HistoryMeta,
    encoder: Option<GzEncoder<File>>,
    finalized: bool,
}

impl HistoryWriter {
    /// Append output bytes. Disk errors degrade the record, never the
    /// session.
    pub fn write_data(&mut self, data: &[u8]) {
        if let Some(encoder) = self.encoder.as_mut() {
            if let Err(err) = encoder.write_all(data) {
                warn!(pane_id = %self.meta.pane_id, %err, "history write failed, dropping writer");
                self.encoder = None;
                return;
            }
            self.meta.bytes_written += data.len() as u64;
        }
    }

    pub fn write_exit(&mut self, exit_code: Option<i32>, signal: Option<i32>) {
        self.meta.exit_code = exit_code;
        self.meta.signal = signal;
    }

    /// Finish the gzip stream and mark the record complete. Idempotent;
    /// exactly one finalize wins even if exit paths race.
    pub fn finalize(&mut self, exit_code: Option<i32>) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        if self.meta.exit_code.is_none() {
            self.meta.exit_code = exit_code;
        }
        if let Some(encoder) = self.encoder.take() {
            if let Err(err) = encoder.finish() {
                warn!(pane_id = %self.meta.pane_id, %err, "failed to finish history stream");
            }
        }
        self.meta.finalized = true;
        atomic_write_json(&self.meta_path, &self.meta);
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

/// Atomic JSON write: write to temp file then rename, with a direct-write
/// fallback.
fn atomic_write_json<T: Serialize>(path: &Path, value: &T) {
    let tmp_path = path.with_extension("json.tmp");
    match serde_json::to_string(value) {
        Ok(json) => {
            if fs::write(&tmp_path, &json).is_ok() {
                if fs::rename(&tmp_path, path).is_err() {
                    let _ = fs::write(path, &json);
                }
            } else {
                let _ = fs::write(path, &json);
            }
        }
        Err(err) => warn!(%err, "failed to serialize history metadata"),
    }
}
