//! Append-only journal: the single-file on-disk form of a store.
//!
//! Layout:
//! ```text
//! ┌────────────────────────────┐
//! │ "STPWSTOR" │ store uuid    │  header (24 bytes)
//! ├────────────────────────────┤
//! │ len u32 │ crc u32 │ record │  frame 0  (one atomic unit)
//! │ len u32 │ crc u32 │ record │  frame 1
//! │ ...                        │
//! └────────────────────────────┘
//! record = bincode(JournalRecord { sequence, ops })
//! ```
//!
//! Frames are buffered in memory and written on flush. A frame is either
//! fully present or ignored: a torn trailing frame (crash mid-write, or a
//! writer still appending) is never applied. A complete frame whose checksum
//! does not match is corruption.
//!
//! Performance targets:
//! - Append: buffer copy only, no I/O
//! - Flush: one `write_all` per batch of frames
//! - Replay (100k rows): <200ms

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::schema::{CatalogOp, ColumnId, TableId};
use crate::table::StoredRow;

/// File magic.
pub const MAGIC: &[u8; 8] = b"STPWSTOR";
/// Magic + store uuid.
pub const HEADER_LEN: u64 = 24;
/// Frame prefix: payload length + checksum.
const FRAME_PREFIX: usize = 8;

/// Row-level mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowOp {
    /// Append rows (exchange tables: replace the single row)
    Insert { table: TableId, rows: Vec<StoredRow> },
    /// Overwrite cells of one row; `None` clears the cell
    Update {
        table: TableId,
        row: i64,
        cells: Vec<(ColumnId, Option<Vec<u8>>)>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalOp {
    Catalog(CatalogOp),
    Rows(RowOp),
}

/// Payload of one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Strictly increasing per file
    pub sequence: u64,
    pub ops: Vec<JournalOp>,
}

impl JournalRecord {
    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let (record, _): (Self, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| e.to_string())?;
        Ok(record)
    }
}

/// FNV-1a over 4-byte words.
pub fn checksum(payload: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    hash ^= payload.len() as u32;
    hash = hash.wrapping_mul(0x0100_0193);
    for chunk in payload.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        hash ^= u32::from_le_bytes(word);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Encode a record as a complete frame.
pub fn encode_frame(record: &JournalRecord) -> StoreResult<Vec<u8>> {
    let payload = record.encode()?;
    let mut frame = Vec::with_capacity(FRAME_PREFIX + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&checksum(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Journal configuration.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Buffered bytes before auto-flush. Default: 64KB.
    pub flush_threshold: usize,
    /// Buffered records before auto-flush. Default: 1000.
    pub max_buffered_records: usize,
    /// fsync after every flush (close always syncs). Default: false.
    pub sync_on_flush: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 64 * 1024,
            max_buffered_records: 1000,
            sync_on_flush: false,
        }
    }
}

impl JournalConfig {
    /// Config for testing (small buffers).
    pub fn for_testing() -> Self {
        Self {
            flush_threshold: 1024,
            max_buffered_records: 4,
            sync_on_flush: false,
        }
    }
}

/// Buffered journal writer. One per store file.
pub struct Journal {
    config: JournalConfig,
    file: File,
    /// Encoded frames not yet written
    buffer: Vec<u8>,
    buffered_records: usize,
    next_sequence: u64,
    total_appended: u64,
    /// Bytes on disk, header included
    written: u64,
    open: bool,
}

impl Journal {
    /// Create a fresh file with a header. Fails if the file exists.
    pub fn create(path: &Path, store_id: Uuid, config: JournalConfig) -> io::Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.write_all(MAGIC)?;
        file.write_all(store_id.as_bytes())?;
        file.sync_all()?;
        Ok(Self::with_file(file, config, HEADER_LEN, 0))
    }

    /// Reopen an existing file for appending after `end` (bytes past it are
    /// a torn frame and get truncated).
    pub fn open_append(path: &Path, config: JournalConfig, end: u64, next_sequence: u64) -> io::Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        if file.metadata()?.len() > end {
            file.set_len(end)?;
        }
        file.seek(SeekFrom::Start(end))?;
        Ok(Self::with_file(file, config, end, next_sequence))
    }

    fn with_file(file: File, config: JournalConfig, written: u64, next_sequence: u64) -> Self {
        Self {
            buffer: Vec::with_capacity(config.flush_threshold),
            buffered_records: 0,
            next_sequence,
            total_appended: 0,
            written,
            open: true,
            file,
            config,
        }
    }

    /// Buffer one atomic unit. Returns its sequence and whether a flush is due.
    pub fn append(&mut self, ops: Vec<JournalOp>) -> StoreResult<(u64, bool)> {
        if !self.open {
            return Err(StoreError::ReadOnly);
        }
        let sequence = self.next_sequence;
        let frame = encode_frame(&JournalRecord { sequence, ops })?;
        self.next_sequence += 1;
        self.buffer.extend_from_slice(&frame);
        self.buffered_records += 1;
        self.total_appended += 1;
        Ok((sequence, self.needs_flush()))
    }

    pub fn needs_flush(&self) -> bool {
        self.buffer.len() >= self.config.flush_threshold
            || self.buffered_records >= self.config.max_buffered_records
    }

    /// Write buffered frames to the file. Returns the bytes written.
    pub fn flush(&mut self) -> io::Result<usize> {
        if self.buffer.is_empty() {
            return Ok(0);
        }
        self.file.write_all(&self.buffer)?;
        if self.config.sync_on_flush {
            self.file.sync_data()?;
        }
        let n = self.buffer.len();
        self.written += n as u64;
        self.buffer.clear();
        self.buffered_records = 0;
        Ok(n)
    }

    /// Flush, fsync, and refuse further appends.
    pub fn close(&mut self) -> io::Result<()> {
        if !self.open {
            return Ok(());
        }
        self.flush()?;
        self.file.sync_all()?;
        self.open = false;
        Ok(())
    }

    pub fn buffered_count(&self) -> usize {
        self.buffered_records
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn total_appended(&self) -> u64 {
        self.total_appended
    }

    /// File size once the buffer is flushed.
    pub fn logical_len(&self) -> u64 {
        self.written + self.buffer.len() as u64
    }
}

/// Result of scanning frames.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    pub records: Vec<JournalRecord>,
    /// Offset just past the last complete frame
    pub end: u64,
    /// Trailing bytes that do not form a complete frame
    pub torn: bool,
}

/// Read and check the file header, returning the store id.
pub fn read_header(file: &mut File) -> Result<Uuid, String> {
    let mut header = [0u8; HEADER_LEN as usize];
    file.seek(SeekFrom::Start(0)).map_err(|e| e.to_string())?;
    file.read_exact(&mut header)
        .map_err(|_| "file too short for header".to_string())?;
    if &header[..8] != MAGIC {
        return Err("bad magic".to_string());
    }
    let mut id = [0u8; 16];
    id.copy_from_slice(&header[8..]);
    Ok(Uuid::from_bytes(id))
}

/// Read every complete frame from `offset` to the end of the file.
pub fn read_from(file: &mut File, offset: u64, last_sequence: Option<u64>) -> Result<ReadOutcome, String> {
    file.seek(SeekFrom::Start(offset)).map_err(|e| e.to_string())?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).map_err(|e| e.to_string())?;
    scan_frames(&bytes, offset, last_sequence)
}

/// Parse frames from a byte slice starting at file offset `base`.
pub fn scan_frames(bytes: &[u8], base: u64, mut last_sequence: Option<u64>) -> Result<ReadOutcome, String> {
    let mut outcome = ReadOutcome {
        end: base,
        ..ReadOutcome::default()
    };
    let mut pos = 0usize;
    while pos < bytes.len() {
        let rest = &bytes[pos..];
        if rest.len() < FRAME_PREFIX {
            outcome.torn = true;
            break;
        }
        let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let crc = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]);
        if rest.len() < FRAME_PREFIX + len {
            outcome.torn = true;
            break;
        }
        let payload = &rest[FRAME_PREFIX..FRAME_PREFIX + len];
        let at = base + pos as u64;
        if checksum(payload) != crc {
            return Err(format!("checksum mismatch in frame at offset {at}"));
        }
        let record = JournalRecord::decode(payload)
            .map_err(|e| format!("undecodable frame at offset {at}: {e}"))?;
        if last_sequence.is_some_and(|last| record.sequence <= last) {
            return Err(format!("sequence {} out of order at offset {at}", record.sequence));
        }
        last_sequence = Some(record.sequence);
        outcome.records.push(record);
        pos += FRAME_PREFIX + len;
        outcome.end = base + pos as u64;
    }
    Ok(outcome)
}
