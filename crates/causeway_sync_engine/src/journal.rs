//! Durable append-only journal of queue and storage events.
//!
//! Every record is framed as:
//!
//! ```text
//! | magic "CWJ1" (4) | version (1) | length (4, LE) | CBOR body | CRC32 (4, LE) |
//! ```
//!
//! The CRC covers everything before it. Scanning stops at the first frame
//! that is incomplete or fails its checksum; [`FileJournal::open`]
//! truncates such a tail so later appends start on a frame boundary.

use crate::queue::{QueueStatus, SyncQueueItem};
use crate::storage::{EntityRecord, StorageError, StorageResult};
use causeway_sync_protocol::codec::{from_cbor, to_cbor};
use causeway_sync_protocol::{ConflictId, ConflictRecord, OpId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Frame magic.
pub const JOURNAL_MAGIC: [u8; 4] = *b"CWJ1";

/// Frame format version.
pub const JOURNAL_VERSION: u8 = 1;

const HEADER_SIZE: usize = 4 + 1 + 4;
const TRAILER_SIZE: usize = 4;

/// Largest accepted body, guarding against garbage length fields.
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// A single journaled event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntry {
    /// A new queue item.
    Enqueued(SyncQueueItem),
    /// A queue item changed status.
    Transition {
        /// Item sequence number.
        seq: u64,
        /// New status.
        status: QueueStatus,
        /// Retry count after the transition.
        retry_count: u32,
        /// Last error, if any.
        last_error: Option<String>,
        /// Earliest time the item may be picked again.
        not_before: u64,
        /// Transition time.
        at: u64,
    },
    /// Completed items dropped by retention.
    Pruned {
        /// Sequence numbers removed.
        seqs: Vec<u64>,
    },
    /// Pull cursor advanced.
    Cursor(u64),
    /// A conflict parked for an operator, linked to its queue item.
    Parked {
        /// Queue item holding the remote operation.
        seq: u64,
        /// The conflict.
        record: ConflictRecord,
    },
    /// An operator resolved a parked conflict.
    Unparked {
        /// Conflict id.
        conflict_id: ConflictId,
    },
    /// Entity state committed together with the operations it applies
    /// and the queue items it creates.
    Committed {
        /// New entity record.
        record: EntityRecord,
        /// Operation ids applied by this commit.
        applied: Vec<OpId>,
        /// Items queued by this commit.
        #[serde(default)]
        enqueued: Vec<SyncQueueItem>,
    },
}

impl LogEntry {
    /// Encodes the entry body.
    ///
    /// Fails with [`StorageError::Oversized`] when the body would not fit in
    /// one journal frame.
    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        let body = to_cbor(self).map_err(|e| StorageError::Encode(e.to_string()))?;
        check_body_size(body.len())?;
        Ok(body)
    }

    /// Decodes an entry body.
    pub fn decode(bytes: &[u8]) -> StorageResult<Self> {
        from_cbor(bytes).map_err(|e| StorageError::Codec(e.to_string()))
    }

    /// Short name for listings.
    pub fn label(&self) -> &'static str {
        match self {
            LogEntry::Enqueued(_) => "enqueued",
            LogEntry::Transition { .. } => "transition",
            LogEntry::Pruned { .. } => "pruned",
            LogEntry::Cursor(_) => "cursor",
            LogEntry::Parked { .. } => "parked",
            LogEntry::Unparked { .. } => "unparked",
            LogEntry::Committed { .. } => "committed",
        }
    }
}

/// Append-only byte-record store backing [`crate::storage::MemoryStorage`].
///
/// # Invariants
///
/// - `append` returns only after the record is durable
/// - `records` returns every appended record, in append order
pub trait JournalBackend: Send + Sync {
    /// Appends one record.
    fn append(&self, record: &[u8]) -> StorageResult<()>;

    /// Returns all records.
    fn records(&self) -> StorageResult<Vec<Vec<u8>>>;
}

/// Journal kept in process memory. Survives coordinator restarts that
/// share the same instance, not process restarts.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    records: Mutex<Vec<Vec<u8>>>,
}

impl MemoryJournal {
    /// Creates an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if nothing was appended.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl JournalBackend for MemoryJournal {
    fn append(&self, record: &[u8]) -> StorageResult<()> {
        self.records.lock().push(record.to_vec());
        Ok(())
    }

    fn records(&self) -> StorageResult<Vec<Vec<u8>>> {
        Ok(self.records.lock().clone())
    }
}

/// Journal persisted to a single file of framed records.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileJournal {
    /// Opens or creates a journal, truncating any torn tail.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, read, or truncated.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        let (_, valid_len) = scan_frames(&data);

        if valid_len < data.len() {
            tracing::warn!(
                path = %path.display(),
                dropped = data.len() - valid_len,
                "truncating torn journal tail"
            );
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// Returns the journal path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl JournalBackend for FileJournal {
    fn append(&self, record: &[u8]) -> StorageResult<()> {
        let frame = encode_frame(record)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::End(0))?;
        file.write_all(&frame)?;
        file.sync_data()?;
        Ok(())
    }

    fn records(&self) -> StorageResult<Vec<Vec<u8>>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(scan_frames(&data).0)
    }
}

/// Reads and decodes every entry of a journal file without modifying it.
///
/// A torn tail is ignored.
pub fn read_journal_file(path: &Path) -> StorageResult<Vec<LogEntry>> {
    let data = std::fs::read(path)?;
    scan_frames(&data)
        .0
        .iter()
        .map(|body| LogEntry::decode(body))
        .collect()
}

/// Frames one record body.
pub fn encode_frame(body: &[u8]) -> StorageResult<Vec<u8>> {
    check_body_size(body.len())?;

    let mut frame = Vec::with_capacity(HEADER_SIZE + body.len() + TRAILER_SIZE);
    frame.extend_from_slice(&JOURNAL_MAGIC);
    frame.push(JOURNAL_VERSION);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(body);
    let crc = compute_crc32(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

fn check_body_size(size: usize) -> StorageResult<()> {
    if size > MAX_BODY_SIZE {
        return Err(StorageError::Oversized {
            size,
            limit: MAX_BODY_SIZE,
        });
    }
    Ok(())
}

/// Splits `data` into record bodies.
///
/// Returns the bodies and the length of the valid prefix.
pub fn scan_frames(data: &[u8]) -> (Vec<Vec<u8>>, usize) {
    let mut bodies = Vec::new();
    let mut pos = 0;

    while let Some((body, next)) = read_frame(data, pos) {
        bodies.push(body.to_vec());
        pos = next;
    }

    (bodies, pos)
}

fn read_frame(data: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let header = data.get(pos..pos.checked_add(HEADER_SIZE)?)?;
    if header[..4] != JOURNAL_MAGIC || header[4] != JOURNAL_VERSION {
        return None;
    }

    let len = u32::from_le_bytes([header[5], header[6], header[7], header[8]]) as usize;
    if len > MAX_BODY_SIZE {
        return None;
    }

    let body_start = pos + HEADER_SIZE;
    let body_end = body_start.checked_add(len)?;
    let frame_end = body_end.checked_add(TRAILER_SIZE)?;
    let trailer = data.get(body_end..frame_end)?;

    let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    if compute_crc32(&data[pos..body_end]) != stored {
        return None;
    }

    Some((&data[body_start..body_end], frame_end))
}

/// Computes the IEEE CRC32 of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc = (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize];
    }
    !crc
}
