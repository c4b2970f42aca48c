//! Transfer journal: the append-only log that makes a multi-frame transfer
//! atomic across power loss.
//!
//! Record layout (little-endian):
//!
//! ```text
//! +-----------+----+-------+-----+------------------+
//! | timestamp | op | flags | len | payload          |
//! |     4     | 1  |   1   |  2  | len bytes        |
//! +-----------+----+-------+-----+------------------+
//! ```
//!
//! Every record is durable before the transfer machine answers the peer.
//! On startup [`TransferJournal::replay`] turns whatever is in the log into
//! either a published file (the log ends in a well-formed commit) or nothing
//! (anything else), then clears it.

use bytes::{Buf, BufMut, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::storage::{JournalStore, Storage, StorageError};

pub const RECORD_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct RecordHeader {
    timestamp: U32<LittleEndian>,
    op: u8,
    flags: u8,
    len: U16<LittleEndian>,
}

assert_eq_size!(RecordHeader, [u8; RECORD_HEADER_LEN]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JournalOp {
    Begin = 1,
    Put = 2,
    Data = 3,
    Done = 4,
    Commit = 5,
    Abort = 6,
}

impl JournalOp {
    fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            1 => JournalOp::Begin,
            2 => JournalOp::Put,
            3 => JournalOp::Data,
            4 => JournalOp::Done,
            5 => JournalOp::Commit,
            6 => JournalOp::Abort,
            _ => return None,
        })
    }
}

/// One logged transition. Chunk records carry the running content CRC
/// through the end of the chunk rather than the chunk bytes themselves; the
/// bytes are in the staged file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalRecord {
    Begin {
        transfer_id: u16,
        size: u32,
        crc: Option<u32>,
        path: String,
    },
    Put {
        transfer_id: u16,
        offset: u32,
        len: u32,
        content_crc: u32,
    },
    Data {
        transfer_id: u16,
        offset: u32,
        len: u32,
        content_crc: u32,
    },
    Done {
        transfer_id: u16,
        received: u32,
        crc: u32,
    },
    Commit {
        transfer_id: u16,
    },
    Abort {
        transfer_id: u16,
    },
}

impl JournalRecord {
    pub fn op(&self) -> JournalOp {
        match self {
            JournalRecord::Begin { .. } => JournalOp::Begin,
            JournalRecord::Put { .. } => JournalOp::Put,
            JournalRecord::Data { .. } => JournalOp::Data,
            JournalRecord::Done { .. } => JournalOp::Done,
            JournalRecord::Commit { .. } => JournalOp::Commit,
            JournalRecord::Abort { .. } => JournalOp::Abort,
        }
    }

    pub fn transfer_id(&self) -> u16 {
        match *self {
            JournalRecord::Begin { transfer_id, .. }
            | JournalRecord::Put { transfer_id, .. }
            | JournalRecord::Data { transfer_id, .. }
            | JournalRecord::Done { transfer_id, .. }
            | JournalRecord::Commit { transfer_id }
            | JournalRecord::Abort { transfer_id } => transfer_id,
        }
    }

    fn encode_payload(&self, out: &mut BytesMut) {
        out.put_u16_le(self.transfer_id());
        match self {
            JournalRecord::Begin {
                size, crc, path, ..
            } => {
                out.put_u32_le(*size);
                out.put_u8(crc.is_some() as u8);
                out.put_u32_le(crc.unwrap_or(0));
                out.put_slice(path.as_bytes());
            }
            JournalRecord::Put {
                offset,
                len,
                content_crc,
                ..
            }
            | JournalRecord::Data {
                offset,
                len,
                content_crc,
                ..
            } => {
                out.put_u32_le(*offset);
                out.put_u32_le(*len);
                out.put_u32_le(*content_crc);
            }
            JournalRecord::Done { received, crc, .. } => {
                out.put_u32_le(*received);
                out.put_u32_le(*crc);
            }
            JournalRecord::Commit { .. } | JournalRecord::Abort { .. } => {}
        }
    }

    fn decode_payload(op: JournalOp, mut buf: &[u8]) -> Option<Self> {
        let fixed = match op {
            JournalOp::Begin => 2 + 9,
            JournalOp::Put | JournalOp::Data => 2 + 12,
            JournalOp::Done => 2 + 8,
            JournalOp::Commit | JournalOp::Abort => 2,
        };
        if buf.len() < fixed {
            return None;
        }
        let transfer_id = buf.get_u16_le();
        Some(match op {
            JournalOp::Begin => {
                let size = buf.get_u32_le();
                let has_crc = buf.get_u8() != 0;
                let crc = buf.get_u32_le();
                let path = std::str::from_utf8(buf).ok()?.to_string();
                JournalRecord::Begin {
                    transfer_id,
                    size,
                    crc: has_crc.then_some(crc),
                    path,
                }
            }
            JournalOp::Put | JournalOp::Data => {
                let offset = buf.get_u32_le();
                let len = buf.get_u32_le();
                let content_crc = buf.get_u32_le();
                if op == JournalOp::Put {
                    JournalRecord::Put {
                        transfer_id,
                        offset,
                        len,
                        content_crc,
                    }
                } else {
                    JournalRecord::Data {
                        transfer_id,
                        offset,
                        len,
                        content_crc,
                    }
                }
            }
            JournalOp::Done => JournalRecord::Done {
                transfer_id,
                received: buf.get_u32_le(),
                crc: buf.get_u32_le(),
            },
            JournalOp::Commit => JournalRecord::Commit { transfer_id },
            JournalOp::Abort => JournalRecord::Abort { transfer_id },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Seconds since the Unix epoch when the record was written.
    pub timestamp: u32,
    pub flags: u8,
    pub record: JournalRecord,
}

/// The last transfer the log describes, folded from its records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalSummary {
    pub transfer_id: u16,
    pub path: String,
    pub size: u32,
    pub expected_crc: Option<u32>,
    pub received: u32,
    /// Running CRC32 of content through `received` bytes.
    pub content_crc: u32,
    pub last_op: JournalOp,
    /// Records follow begin, chunk*, done, commit order for one transfer
    /// with contiguous offsets.
    pub well_formed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Nothing was pending.
    Clean,
    /// A committed transfer was (re)published.
    Committed { path: String },
    /// Unfinished or aborted work was discarded.
    RolledBack { path: String },
}

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("journal record payload of {0} bytes is too large")]
    RecordTooLarge(usize),
}

fn now_secs() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

pub struct TransferJournal<J> {
    store: J,
}

impl<J: JournalStore> TransferJournal<J> {
    pub fn new(store: J) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &J {
        &self.store
    }

    /// Durably append one record.
    pub fn append(&mut self, record: &JournalRecord) -> Result<(), JournalError> {
        let mut payload = BytesMut::new();
        record.encode_payload(&mut payload);
        let len = u16::try_from(payload.len())
            .map_err(|_| JournalError::RecordTooLarge(payload.len()))?;

        let header = RecordHeader {
            timestamp: U32::new(now_secs()),
            op: record.op() as u8,
            flags: 0,
            len: U16::new(len),
        };
        let mut out = BytesMut::with_capacity(RECORD_HEADER_LEN + payload.len());
        out.put_slice(header.as_bytes());
        out.put_slice(&payload);
        self.store.append(&out)?;
        tracing::trace!(op = ?record.op(), id = record.transfer_id(), "journal record appended");
        Ok(())
    }

    /// All complete records in order. Parsing stops at a torn or unreadable
    /// tail; everything before it is still returned.
    pub fn entries(&mut self) -> Result<Vec<JournalEntry>, JournalError> {
        let bytes = self.store.read_all()?;
        let mut rest = bytes.as_slice();
        let mut entries = Vec::new();
        while !rest.is_empty() {
            let Some(header) = RecordHeader::read_from_prefix(rest) else {
                tracing::warn!(trailing = rest.len(), "torn journal record header ignored");
                break;
            };
            let len = header.len.get() as usize;
            let Some(payload) = rest.get(RECORD_HEADER_LEN..RECORD_HEADER_LEN + len) else {
                tracing::warn!(trailing = rest.len(), "torn journal record ignored");
                break;
            };
            let Some(record) = JournalOp::from_byte(header.op)
                .and_then(|op| JournalRecord::decode_payload(op, payload))
            else {
                tracing::warn!(op = header.op, "unreadable journal record, stopping");
                break;
            };
            entries.push(JournalEntry {
                timestamp: header.timestamp.get(),
                flags: header.flags,
                record,
            });
            rest = &rest[RECORD_HEADER_LEN + len..];
        }
        Ok(entries)
    }

    pub fn is_empty(&mut self) -> Result<bool, JournalError> {
        Ok(self.store.read_all()?.is_empty())
    }

    /// Fold the log into the transfer it describes, if any.
    pub fn reconstruct(&mut self) -> Result<Option<JournalSummary>, JournalError> {
        let entries = self.entries()?;
        let mut iter = entries.into_iter().map(|e| e.record);

        let Some(JournalRecord::Begin {
            transfer_id,
            size,
            crc,
            path,
        }) = iter.next()
        else {
            return Ok(None);
        };

        let mut summary = JournalSummary {
            transfer_id,
            path,
            size,
            expected_crc: crc,
            received: 0,
            content_crc: 0,
            last_op: JournalOp::Begin,
            well_formed: true,
        };

        for record in iter {
            let op = record.op();
            let in_order = record.transfer_id() == transfer_id
                && match (summary.last_op, &record) {
                    (
                        JournalOp::Begin | JournalOp::Put | JournalOp::Data,
                        JournalRecord::Put { offset, .. } | JournalRecord::Data { offset, .. },
                    ) => *offset == summary.received,
                    (JournalOp::Begin | JournalOp::Put | JournalOp::Data, JournalRecord::Done { .. }) => true,
                    (JournalOp::Done, JournalRecord::Commit { .. }) => true,
                    (
                        JournalOp::Begin | JournalOp::Put | JournalOp::Data | JournalOp::Done,
                        JournalRecord::Abort { .. },
                    ) => true,
                    _ => false,
                };
            if !in_order {
                tracing::warn!(op = ?op, after = ?summary.last_op, "out-of-order journal record");
                summary.well_formed = false;
            }

            match record {
                JournalRecord::Put {
                    len, content_crc, ..
                }
                | JournalRecord::Data {
                    len, content_crc, ..
                } => {
                    summary.received = summary.received.saturating_add(len);
                    summary.content_crc = content_crc;
                }
                JournalRecord::Done { received, crc, .. } => {
                    if received != summary.received || received != summary.size {
                        summary.well_formed = false;
                    }
                    summary.content_crc = crc;
                }
                _ => {}
            }
            summary.last_op = op;
        }
        Ok(Some(summary))
    }

    /// Converge storage with the log after a restart, then clear the log.
    pub fn replay<S: Storage>(&mut self, storage: &mut S) -> Result<RecoveryOutcome, JournalError> {
        let Some(summary) = self.reconstruct()? else {
            if !self.is_empty()? {
                tracing::warn!("journal holds no readable transfer, clearing");
                self.clear()?;
            }
            return Ok(RecoveryOutcome::Clean);
        };

        let outcome = if summary.last_op == JournalOp::Commit && summary.well_formed {
            match storage.finalize(&summary.path) {
                Ok(()) => {}
                Err(e @ StorageError::Unsynced(..)) => {
                    tracing::warn!(error = %e, "journal replay: publish not yet durable, journal kept");
                    return Ok(RecoveryOutcome::Committed { path: summary.path });
                }
                Err(e) => return Err(e.into()),
            }
            tracing::info!(
                id = summary.transfer_id,
                path = %summary.path,
                "journal replay: committed transfer published"
            );
            RecoveryOutcome::Committed { path: summary.path }
        } else {
            storage.discard(&summary.path)?;
            tracing::info!(
                id = summary.transfer_id,
                path = %summary.path,
                last_op = ?summary.last_op,
                received = summary.received,
                "journal replay: unfinished transfer rolled back"
            );
            RecoveryOutcome::RolledBack { path: summary.path }
        };
        self.clear()?;
        Ok(outcome)
    }

    pub fn clear(&mut self) -> Result<(), JournalError> {
        self.store.truncate()?;
        Ok(())
    }
}
