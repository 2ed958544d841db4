//! On-disk snapshot retention.
//!
//! Snapshots subsume a prefix of the operation log. At most `max_snapshots`
//! are kept; saving a new one atomically prunes the oldest beyond that.

use crate::error::{ConsensusError, ConsensusResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Snapshots retained on disk by default.
pub const MAX_SNAPSHOTS: usize = 5;

const SNAP_EXT: &str = "snap";

/// A stored snapshot: serialized state plus the log position it reflects.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Index of the last log entry the state reflects.
    pub index: u64,
    /// Term of that entry.
    pub term: u64,
    /// Serialized state bytes (the state crate's snapshot codec).
    pub state: Vec<u8>,
}

/// Directory of numbered snapshot files.
pub struct SnapshotStore {
    dir: PathBuf,
    max_snapshots: usize,
}

impl SnapshotStore {
    pub fn open(dir: &Path, max_snapshots: usize) -> ConsensusResult<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            max_snapshots: max_snapshots.max(1),
        })
    }

    /// Persist a snapshot and prune the oldest beyond the retention limit.
    pub fn save(&self, record: &SnapshotRecord) -> ConsensusResult<()> {
        let payload =
            bincode::serialize(record).map_err(|e| ConsensusError::Codec(e.to_string()))?;
        let crc = crc32fast::hash(&payload);

        let mut bytes = Vec::with_capacity(payload.len() + 4);
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes.extend_from_slice(&payload);

        let path = self.path_for(record.index);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &path)?;
        tracing::debug!(index = record.index, path = %path.display(), "snapshot saved");

        self.prune()?;
        Ok(())
    }

    /// The most recent readable snapshot, if any. Unreadable files are
    /// skipped with a warning.
    pub fn latest(&self) -> ConsensusResult<Option<SnapshotRecord>> {
        let mut files = self.snapshot_files()?;
        files.sort();
        for path in files.into_iter().rev() {
            match read_snapshot(&path) {
                Ok(record) => return Ok(Some(record)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable snapshot");
                }
            }
        }
        Ok(None)
    }

    /// Index of the most recent snapshot, 0 when none exist.
    pub fn latest_index(&self) -> ConsensusResult<u64> {
        Ok(self.latest()?.map(|r| r.index).unwrap_or(0))
    }

    fn prune(&self) -> ConsensusResult<()> {
        let mut files = self.snapshot_files()?;
        files.sort();
        while files.len() > self.max_snapshots {
            let victim = files.remove(0);
            tracing::debug!(path = %victim.display(), "pruning old snapshot");
            std::fs::remove_file(&victim)?;
        }
        Ok(())
    }

    fn path_for(&self, index: u64) -> PathBuf {
        self.dir.join(format!("{index:020}.{SNAP_EXT}"))
    }

    fn snapshot_files(&self) -> ConsensusResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(SNAP_EXT) {
                files.push(path);
            }
        }
        Ok(files)
    }
}

fn read_snapshot(path: &Path) -> ConsensusResult<SnapshotRecord> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < 4 {
        return Err(ConsensusError::Codec("snapshot file too short".to_string()));
    }
    let stored_crc = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let payload = &bytes[4..];
    if crc32fast::hash(payload) != stored_crc {
        return Err(ConsensusError::Codec("snapshot crc mismatch".to_string()));
    }
    bincode::deserialize(payload).map_err(|e| ConsensusError::Codec(e.to_string()))
}
