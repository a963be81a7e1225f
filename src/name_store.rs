//! Persistent peer-name map and the rolling rate limiter guarding writes to
//! it. Mirrors the registry's "load once, rewrite whole file on change"
//! persistence style rather than an embedded database, since the map is
//! small and writes are infrequent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::NameStoreError;

const RATE_LIMIT_WINDOW_NS: i64 = 60 * 60 * 1_000_000_000;
const RATE_LIMIT_MAX_PER_WINDOW: usize = 5;

pub struct NameStore {
    path: PathBuf,
    names: Mutex<HashMap<String, String>>,
    rate_limits: Mutex<HashMap<String, Vec<i64>>>,
}

impl NameStore {
    pub fn load(path: PathBuf) -> Result<Self, NameStoreError> {
        let names = if path.exists() {
            let contents = std::fs::read_to_string(&path).map_err(|source| NameStoreError::Read {
                path: path.display().to_string(),
                source,
            })?;
            serde_json::from_str(&contents)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            names: Mutex::new(names),
            rate_limits: Mutex::new(HashMap::new()),
        })
    }

    pub fn get(&self, self_id_hash: &str) -> Option<String> {
        self.names.lock().unwrap().get(self_id_hash).cloned()
    }

    pub fn all(&self) -> HashMap<String, String> {
        self.names.lock().unwrap().clone()
    }

    pub fn set(&self, self_id_hash: &str, name: String) -> Result<(), NameStoreError> {
        {
            let mut names = self.names.lock().unwrap();
            names.insert(self_id_hash.to_owned(), name);
        }
        self.persist()
    }

    fn persist(&self) -> Result<(), NameStoreError> {
        let names = self.names.lock().unwrap();
        let json = serde_json::to_string_pretty(&*names)?;
        write_atomic(&self.path, &json).map_err(|source| NameStoreError::Write {
            path: self.path.display().to_string(),
            source,
        })
    }

    /// Checks whether a naming attempt is within the rolling-hour budget,
    /// without recording one. Callers record a tick via
    /// [`NameStore::record_name_change`] only once the attempt is actually
    /// accepted, so a rejected name doesn't consume a slot.
    pub fn check_rate_limit(&self, self_id_hash: &str, now: i64) -> Result<(), u64> {
        let mut limits = self.rate_limits.lock().unwrap();
        let entries = limits.entry(self_id_hash.to_owned()).or_default();
        entries.retain(|ts| now - ts < RATE_LIMIT_WINDOW_NS);
        if entries.len() >= RATE_LIMIT_MAX_PER_WINDOW {
            let oldest = entries[0];
            let retry_ns = RATE_LIMIT_WINDOW_NS - (now - oldest);
            let retry_minutes = (retry_ns / 1_000_000_000 / 60).max(1) as u64;
            return Err(retry_minutes);
        }
        Ok(())
    }

    /// Records a rolling-hour tick for an accepted naming attempt.
    pub fn record_name_change(&self, self_id_hash: &str, now: i64) {
        let mut limits = self.rate_limits.lock().unwrap();
        limits.entry(self_id_hash.to_owned()).or_default().push(now);
    }
}

fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)
}
