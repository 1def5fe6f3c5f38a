//! Durable store of previously-seen event fingerprints.
//!
//! The store persists digests, never event payloads, which bounds growth and
//! keeps attendance data out of long-term state. It is replaced wholesale
//! after each successful snapshot comparison so a process restart resumes
//! without re-announcing old events.

use crate::error::{MonitorError, Result};
use crate::types::Fingerprint;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Current state file format version.
const STATE_VERSION: u32 = 1;

/// On-disk shape of the state file.
#[derive(Serialize, Deserialize)]
struct PersistedState {
    version: u32,
    last_checked_at: Option<DateTime<Utc>>,
    known: Vec<String>,
}

/// Set of previously-observed fingerprints plus the last comparison time,
/// backed by a JSON file keyed to one monitored subject.
pub struct FingerprintStore {
    path: PathBuf,
    /// Advisory lock against a second monitor using the same state file.
    _lock_file: File,
    known: HashSet<Fingerprint>,
    last_checked_at: Option<DateTime<Utc>>,
}

impl FingerprintStore {
    /// Open the store, loading prior state if the file exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_file = Self::acquire_lock(&path)?;

        let (known, last_checked_at) = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let state: PersistedState = serde_json::from_str(&raw)
                .map_err(|e| MonitorError::Deserialization(e.to_string()))?;
            if state.version != STATE_VERSION {
                return Err(MonitorError::InvalidState(format!(
                    "unsupported state version: {}",
                    state.version
                )));
            }

            let mut known = HashSet::with_capacity(state.known.len());
            for entry in &state.known {
                let fp = Fingerprint::from_hex(entry).map_err(|e| {
                    MonitorError::Deserialization(format!("bad fingerprint {entry:?}: {e}"))
                })?;
                known.insert(fp);
            }
            (known, state.last_checked_at)
        } else {
            (HashSet::new(), None)
        };

        Ok(Self {
            path,
            _lock_file: lock_file,
            known,
            last_checked_at,
        })
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.with_extension("lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| MonitorError::Locked)?;
        Ok(lock_file)
    }

    /// Fingerprints observed in the last persisted snapshot.
    pub fn known(&self) -> &HashSet<Fingerprint> {
        &self.known
    }

    /// When the last snapshot comparison was persisted.
    pub fn last_checked_at(&self) -> Option<DateTime<Utc>> {
        self.last_checked_at
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Replace the stored set with the latest snapshot's fingerprints and
    /// persist. Replacement is atomic on disk (temp file + rename), so a
    /// crash leaves either the old state or the new one, never a mix.
    pub fn replace(&mut self, fingerprints: HashSet<Fingerprint>) -> Result<()> {
        self.known = fingerprints;
        self.last_checked_at = Some(Utc::now());
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let mut known: Vec<String> = self.known.iter().map(|fp| fp.to_hex()).collect();
        known.sort();

        let state = PersistedState {
            version: STATE_VERSION,
            last_checked_at: self.last_checked_at,
            known,
        };

        let tmp_path = self.path.with_extension("tmp");
        let encoded = serde_json::to_vec_pretty(&state)?;
        fs::write(&tmp_path, encoded)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}
