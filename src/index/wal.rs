//! Write Buffer WAL
//!
//! `buffer.wal` is an append-only sequence of length-prefixed index records.
//! Every upsert is appended before it enters the in-memory buffer (both
//! happen under the buffer lock, so log and buffer never diverge). When the
//! buffer is flushed the log is rotated aside, and the rotated segment is
//! deleted only once the partition and manifest are durable; a crash at any
//! point replays every record that had not reached a partition. A torn tail
//! (crash mid-append) is detected and discarded at replay.
//!
//! Appends are small synchronous writes so they can run under the buffer
//! lock without an await point.

use crate::error::Result;
use crate::index::record::IndexRecord;
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Append-only log guarding unflushed buffer rows
pub struct IndexWal {
    path: PathBuf,
    /// Rotated segment covering rows taken by an in-progress flush
    flushing_path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl IndexWal {
    /// Open (creating if absent) the log at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let flushing_path = path.with_extension("wal.flushing");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            flushing_path,
            file: Mutex::new(file),
        })
    }

    /// Append one record: `u32 LE length` then the bincode payload
    pub fn append(&self, record: &IndexRecord) -> Result<()> {
        let payload = bincode::serialize(record)?;
        let mut file = self.file.lock();
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(&payload)?;
        file.flush()?;
        Ok(())
    }

    /// Move the current log aside for a flush in progress.
    ///
    /// Appends onto any existing rotated segment (a failed earlier flush),
    /// then empties the live log. Called under the buffer lock so the
    /// rotated segment covers exactly the rows the flush took.
    pub fn rotate(&self) -> Result<()> {
        let file = self.file.lock();
        let current = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        if !current.is_empty() {
            let mut flushing = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.flushing_path)?;
            flushing.write_all(&current)?;
            flushing.flush()?;
        }
        file.set_len(0)?;
        Ok(())
    }

    /// Drop the rotated segment; its rows reached a partition
    pub fn clear_flushed(&self) -> Result<()> {
        match std::fs::remove_file(&self.flushing_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Replay every intact record: rotated segment first (older), then the
    /// live log. A torn tail is dropped with a warning.
    pub fn replay(&self) -> Result<Vec<IndexRecord>> {
        let mut records = Vec::new();
        for path in [&self.flushing_path, &self.path] {
            let bytes = match std::fs::read(path) {
                Ok(b) => b,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            records.extend(Self::decode_segment(path, &bytes));
        }
        Ok(records)
    }

    fn decode_segment(path: &Path, bytes: &[u8]) -> Vec<IndexRecord> {
        let mut records = Vec::new();
        let mut cursor = 0usize;
        while cursor + 4 <= bytes.len() {
            let len = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap()) as usize;
            let start = cursor + 4;
            let end = start + len;
            if end > bytes.len() {
                warn!(path = %path.display(), offset = cursor, "torn tail in buffer log, discarding");
                break;
            }
            match bincode::deserialize::<IndexRecord>(&bytes[start..end]) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(path = %path.display(), offset = cursor, error = %e, "undecodable record in buffer log, discarding tail");
                    break;
                }
            }
            cursor = end;
        }
        records
    }
}
