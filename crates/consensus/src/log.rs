//! The durable replicated operation log.
//!
//! Append-only binary log of `{index, term, payload}` entries, durable
//! across restarts and exclusively owned by one consensus engine at a time.
//!
//! Wire format, one record per entry:
//!
//! ```text
//! [magic: u32][len: u32][crc32: u32][payload: [u8; len]]
//! ```
//!
//! The first record is a small metadata header recording how far the log
//! has been compacted by snapshots. On open, a record with a bad CRC or a
//! truncated payload marks a corrupted tail; everything after it is
//! discarded.

use crate::error::{ConsensusError, ConsensusResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const MAGIC: u32 = 0x43504C47; // "CPLG"

/// Maximum record payload size (64 MiB). Prevents OOM on corrupted files.
const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

const LOG_FILE: &str = "oplog.bin";
const LOCK_FILE: &str = "oplog.lock";

/// One entry of the replicated log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    /// Encoded [`LogCommand`](crate::op::LogCommand).
    pub payload: Vec<u8>,
}

/// Compaction watermark stored as the log file's first record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct LogMeta {
    /// Highest index removed by snapshot compaction (0 = none).
    compacted_index: u64,
    /// Term of the entry at `compacted_index`.
    compacted_term: u64,
}

/// The on-disk operation log with an in-memory mirror of its live entries.
#[derive(Debug)]
pub struct OpLog {
    dir: PathBuf,
    path: PathBuf,
    lock_path: PathBuf,
    writer: BufWriter<File>,
    meta: LogMeta,
    /// Entries with indexes `compacted_index+1 ..= last_index`, in order.
    entries: Vec<LogEntry>,
}

impl OpLog {
    /// Open (or create) the log under `dir`, acquiring the exclusive lock.
    ///
    /// Fails with [`ConsensusError::LogLocked`] if another engine holds the
    /// directory. A corrupted tail is truncated before loading.
    pub fn open(dir: &Path) -> ConsensusResult<Self> {
        std::fs::create_dir_all(dir)?;

        let lock_path = dir.join(LOCK_FILE);
        match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(ConsensusError::LogLocked(dir.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        }

        let path = dir.join(LOG_FILE);
        let open_result = Self::open_locked(dir, &path, &lock_path);
        if open_result.is_err() {
            let _ = std::fs::remove_file(&lock_path);
        }
        open_result
    }

    fn open_locked(dir: &Path, path: &Path, lock_path: &Path) -> ConsensusResult<Self> {
        let (meta, entries) = if path.exists() {
            truncate_corrupted_tail(path)?;
            load_records(path)?
        } else {
            (None, Vec::new())
        };
        let had_header = meta.is_some();

        let mut log = Self {
            dir: dir.to_path_buf(),
            path: path.to_path_buf(),
            lock_path: lock_path.to_path_buf(),
            writer: BufWriter::new(OpenOptions::new().create(true).append(true).open(path)?),
            meta: meta.unwrap_or_default(),
            entries,
        };

        if !had_header {
            // Fresh log: persist the header record.
            log.write_record(&LogMeta::default())?;
            log.flush()?;
        }
        Ok(log)
    }

    /// Index of the last entry (or the compaction watermark when empty).
    pub fn last_index(&self) -> u64 {
        self.meta.compacted_index + self.entries.len() as u64
    }

    /// Term of the last entry (or of the compaction watermark when empty).
    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.meta.compacted_term)
    }

    /// Highest index removed by compaction; entries at or below it are only
    /// available through snapshots.
    pub fn compacted_index(&self) -> u64 {
        self.meta.compacted_index
    }

    /// The entry at `index`, if it is still in the log.
    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.meta.compacted_index || index > self.last_index() {
            return None;
        }
        self.entries.get((index - self.meta.compacted_index - 1) as usize)
    }

    /// Term of the entry at `index`. Index 0 and the compaction watermark
    /// resolve without an entry lookup.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.meta.compacted_index {
            return Some(self.meta.compacted_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Clone the entries from `from` (inclusive) to the end.
    pub fn slice_from(&self, from: u64) -> Vec<LogEntry> {
        let from = from.max(self.meta.compacted_index + 1);
        if from > self.last_index() {
            return Vec::new();
        }
        let offset = (from - self.meta.compacted_index - 1) as usize;
        self.entries[offset..].to_vec()
    }

    /// Append a new entry with the next index, fsyncing before returning.
    pub fn append(&mut self, term: u64, payload: Vec<u8>) -> ConsensusResult<u64> {
        let index = self.last_index() + 1;
        let entry = LogEntry { index, term, payload };
        self.write_record(&entry)?;
        self.flush()?;
        self.entries.push(entry);
        Ok(index)
    }

    /// Append replicated entries. They must continue the log contiguously;
    /// the caller resolves conflicts with [`truncate_from`](Self::truncate_from)
    /// first.
    pub fn append_replicated(&mut self, entries: &[LogEntry]) -> ConsensusResult<()> {
        for entry in entries {
            let expected = self.last_index() + 1;
            if entry.index != expected {
                return Err(ConsensusError::Codec(format!(
                    "replicated entry index {} does not continue log at {}",
                    entry.index, expected
                )));
            }
            self.write_record(entry)?;
            self.entries.push(entry.clone());
        }
        self.flush()
    }

    /// Drop every entry with index >= `from` (divergence repair) and
    /// rewrite the file.
    pub fn truncate_from(&mut self, from: u64) -> ConsensusResult<()> {
        if from > self.last_index() {
            return Ok(());
        }
        let keep = from.saturating_sub(self.meta.compacted_index + 1) as usize;
        self.entries.truncate(keep);
        self.rewrite()
    }

    /// Drop every entry with index <= `through` after a snapshot subsumed
    /// them, and advance the compaction watermark.
    pub fn compact_through(&mut self, through: u64, term: u64) -> ConsensusResult<()> {
        if through <= self.meta.compacted_index {
            return Ok(());
        }
        let drop = (through.min(self.last_index()) - self.meta.compacted_index) as usize;
        self.entries.drain(..drop);
        self.meta = LogMeta {
            compacted_index: through,
            compacted_term: term,
        };
        self.rewrite()
    }

    /// Replace the log contents entirely with a compaction watermark, as
    /// after installing a snapshot from the leader.
    pub fn reset_to(&mut self, index: u64, term: u64) -> ConsensusResult<()> {
        self.entries.clear();
        self.meta = LogMeta {
            compacted_index: index,
            compacted_term: term,
        };
        self.rewrite()
    }

    /// Rewrite the file from the in-memory mirror (temp file + rename).
    fn rewrite(&mut self) -> ConsensusResult<()> {
        let tmp = self.dir.join(format!("{LOG_FILE}.tmp"));
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            write_record_to(&mut writer, &self.meta)?;
            for entry in &self.entries {
                write_record_to(&mut writer, entry)?;
            }
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        self.writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        Ok(())
    }

    fn write_record<T: Serialize>(&mut self, value: &T) -> ConsensusResult<()> {
        write_record_to(&mut self.writer, value)
    }

    fn flush(&mut self) -> ConsensusResult<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}

impl Drop for OpLog {
    fn drop(&mut self) {
        let _ = self.writer.flush();
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

fn write_record_to<T: Serialize>(writer: &mut BufWriter<File>, value: &T) -> ConsensusResult<()> {
    let payload = bincode::serialize(value).map_err(|e| ConsensusError::Codec(e.to_string()))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&MAGIC.to_le_bytes())?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&crc.to_le_bytes())?;
    writer.write_all(&payload)?;
    Ok(())
}

/// Read one framed record payload. `Ok(None)` means a clean end of file;
/// a corrupted record also reads as end of data.
fn read_record(reader: &mut BufReader<File>) -> ConsensusResult<Option<Vec<u8>>> {
    let mut magic_buf = [0u8; 4];
    match reader.read_exact(&mut magic_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if u32::from_le_bytes(magic_buf) != MAGIC {
        return Ok(None);
    }

    let mut len_buf = [0u8; 4];
    if reader.read_exact(&mut len_buf).is_err() {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_RECORD_SIZE {
        return Ok(None);
    }

    let mut crc_buf = [0u8; 4];
    if reader.read_exact(&mut crc_buf).is_err() {
        return Ok(None);
    }
    let stored_crc = u32::from_le_bytes(crc_buf);

    let mut payload = vec![0u8; len as usize];
    if reader.read_exact(&mut payload).is_err() {
        return Ok(None);
    }
    if crc32fast::hash(&payload) != stored_crc {
        return Ok(None);
    }
    Ok(Some(payload))
}

fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Option<T> {
    bincode::deserialize(payload).ok()
}

/// Load the header and entries from a verified file.
#[allow(clippy::type_complexity)]
fn load_records(path: &Path) -> ConsensusResult<(Option<LogMeta>, Vec<LogEntry>)> {
    let mut reader = BufReader::new(File::open(path)?);

    let Some(header) = read_record(&mut reader)? else {
        return Ok((None, Vec::new()));
    };
    let Some(meta) = decode_payload::<LogMeta>(&header) else {
        return Ok((None, Vec::new()));
    };

    let mut entries: Vec<LogEntry> = Vec::new();
    let mut expected = meta.compacted_index + 1;
    while let Some(payload) = read_record(&mut reader)? {
        let Some(entry) = decode_payload::<LogEntry>(&payload) else {
            break;
        };
        if entry.index != expected {
            tracing::warn!(
                index = entry.index,
                expected,
                "log entry out of sequence, discarding tail"
            );
            break;
        }
        expected += 1;
        entries.push(entry);
    }
    Ok((Some(meta), entries))
}

/// Find the last valid record boundary and truncate the file there.
fn truncate_corrupted_tail(path: &Path) -> ConsensusResult<()> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut offset: u64 = 0;
    let mut last_good: u64 = 0;

    while let Some(payload) = read_record(&mut reader)? {
        offset += 12 + payload.len() as u64;
        last_good = offset;
    }

    let file = OpenOptions::new().write(true).open(path)?;
    let actual_len = file.metadata()?.len();
    if actual_len > last_good {
        tracing::warn!(
            path = %path.display(),
            truncated = actual_len - last_good,
            "truncating corrupted log tail"
        );
        file.set_len(last_good)?;
    }
    Ok(())
}
