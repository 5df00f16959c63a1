//! File-backed fallback for records whose sink delivery did not happen
//! before shutdown. A future (restarted) process picks them up at
//! `initialize` and feeds them back into the pipeline with their
//! original window timestamps.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::EmergencyError;
use crate::record::RecordData;

/// One persisted batch: a window boundary and the records that were
/// waiting for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchEntry {
    pub window_end: i64,
    pub records: Vec<RecordData>,
}

/// Append store holding serialized batches at a fixed path, written as
/// one JSON object per line.
#[derive(Debug, Clone)]
pub struct EmergencyStore {
    path: PathBuf,
}

impl EmergencyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        EmergencyStore { path: path.into() }
    }

    /// The conventional location for a queue named `name`:
    /// `{tmp}/{name}_dump.{pid}.jsonl`.
    pub fn default_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{name}_dump.{}.jsonl", std::process::id()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist the batches atomically: write to a sibling temp file,
    /// then rename over the target.
    pub fn save(&self, batches: &[BatchEntry]) -> Result<(), EmergencyError> {
        let mut blob = String::new();
        for entry in batches {
            blob.push_str(&serde_json::to_string(entry)?);
            blob.push('\n');
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, blob)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Read and delete the store file, returning its batches. A missing
    /// file yields no batches; an unparseable file is moved aside with
    /// a `.corrupt` suffix and also yields none.
    pub fn load_and_clear(&self) -> Result<Vec<BatchEntry>, EmergencyError> {
        let blob = match fs::read_to_string(&self.path) {
            Ok(blob) => blob,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let parsed: Result<Vec<BatchEntry>, _> = blob
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str)
            .collect();

        match parsed {
            Ok(batches) => {
                fs::remove_file(&self.path)?;
                Ok(batches)
            }
            Err(error) => {
                let quarantine = self.path.with_extension("corrupt");
                tracing::warn!(
                    path = %self.path.display(),
                    %error,
                    "emergency save file is corrupt; moving it aside"
                );
                fs::rename(&self.path, &quarantine)?;
                Ok(Vec::new())
            }
        }
    }
}
