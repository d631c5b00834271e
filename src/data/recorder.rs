//! Post-mortem record of accepted slot tables.

use std::fs;
use std::io::Write as _;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::{SlotTable, now_ms};

pub trait SlotTableRecorder: Send + Sync {
    fn record(&self, table: &SlotTable);
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordedSlotTable {
    pub recorded_at_ms: u64,
    pub table: SlotTable,
}

/// Appends each accepted slot table as a JSON line, rotating the file when
/// it grows past `max_bytes` and keeping a bounded number of rotations.
/// Recording failures are logged and swallowed; a post-mortem aid must not
/// disturb serving.
pub struct DiskSlotTableRecorder {
    path: PathBuf,
    max_bytes: u64,
    max_rotations: usize,
}

impl DiskSlotTableRecorder {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64, max_rotations: usize) -> Self {
        Self {
            path: path.into(),
            max_bytes: max_bytes.max(1),
            max_rotations: max_rotations.max(1),
        }
    }

    fn append(&self, table: &SlotTable) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.rotate_if_needed()?;
        let record = RecordedSlotTable {
            recorded_at_ms: now_ms(),
            table: table.clone(),
        };
        let mut line = serde_json::to_vec(&record).map_err(std::io::Error::other)?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)
    }

    fn rotate_if_needed(&self) -> std::io::Result<()> {
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if size < self.max_bytes {
            return Ok(());
        }
        for index in (1..self.max_rotations).rev() {
            let from = self.rotation_path(index);
            if from.exists() {
                fs::rename(&from, self.rotation_path(index + 1))?;
            }
        }
        let overflow = self.rotation_path(self.max_rotations + 1);
        if overflow.exists() {
            fs::remove_file(&overflow)?;
        }
        fs::rename(&self.path, self.rotation_path(1))
    }

    fn rotation_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }
}

impl SlotTableRecorder for DiskSlotTableRecorder {
    fn record(&self, table: &SlotTable) {
        if let Err(err) = self.append(table) {
            warn!(path = %self.path.display(), %err, "slot table record failed");
        }
    }
}
