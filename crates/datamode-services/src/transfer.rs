//! File-transfer state machine.
//!
//! Idle -> Begun -> Receiving -> Done -> Committed | Aborted
//!
//! One transfer at a time. Every transition is journaled before storage is
//! touched and before the reply goes out, so an answer to the peer always
//! describes durable state. A storage or journal failure kills the transfer
//! through the same path as an explicit abort.

use bytes::Bytes;
use datamode_core::message::{
    decode_done, decode_transfer_id, encode_offset, encode_transfer_id, BeginRequest,
    ChunkRequest, MessageError,
};
use datamode_core::wire::Crc32;
use datamode_core::{MsgType, NakCode};

use crate::auth::AuthGate;
use crate::journal::{
    JournalError, JournalOp, JournalRecord, RecoveryOutcome, TransferJournal,
};
use crate::storage::{validate_path, JournalStore, Storage, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Begun,
    Receiving,
    Done,
    Committed,
    Aborted,
}

impl TransferState {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferState::Idle => "idle",
            TransferState::Begun => "begun",
            TransferState::Receiving => "receiving",
            TransferState::Done => "done",
            TransferState::Committed => "committed",
            TransferState::Aborted => "aborted",
        }
    }
}

/// The transfer in progress.
#[derive(Debug, Clone)]
pub struct TransferContext {
    pub id: u16,
    pub path: String,
    pub total_size: u32,
    pub expected_crc: Option<u32>,
    pub received: u32,
    pub last_acked_offset: u32,
    pub state: TransferState,
    /// Set after a failed FS_DONE; only an abort is accepted from here.
    pub abort_required: bool,
    content_crc: Crc32,
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("peer is not authenticated")]
    NotAuthenticated,
    #[error("a transfer is already in progress")]
    TransferInProgress,
    #[error("no active transfer")]
    NoActiveTransfer,
    #[error("chunk at offset {got}, expected {expected}")]
    OutOfOrderChunk { expected: u32, got: u32 },
    #[error("chunk runs past declared size {size}")]
    ChunkOverflow { size: u32 },
    #[error("incomplete transfer: received {received} of {size} bytes, crc ok: {crc_ok}")]
    IncompleteTransfer {
        received: u32,
        size: u32,
        crc_ok: bool,
    },
    #[error("{op} not valid in state {state:?}")]
    InvalidState {
        op: &'static str,
        state: TransferState,
    },
    #[error("{0:?} is not a transfer message")]
    NotTransfer(MsgType),
    #[error(transparent)]
    Malformed(#[from] MessageError),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("journal: {0}")]
    Journal(#[from] JournalError),
}

impl TransferError {
    pub fn nak_code(&self) -> NakCode {
        match self {
            TransferError::NotAuthenticated => NakCode::NotAuthenticated,
            TransferError::TransferInProgress => NakCode::TransferInProgress,
            TransferError::NoActiveTransfer => NakCode::NoActiveTransfer,
            TransferError::OutOfOrderChunk { .. } => NakCode::OutOfOrderChunk,
            TransferError::ChunkOverflow { .. } => NakCode::ChunkOverflow,
            TransferError::IncompleteTransfer { .. } => NakCode::IncompleteTransfer,
            TransferError::InvalidState { .. } => NakCode::InvalidState,
            TransferError::NotTransfer(_) => NakCode::Unsupported,
            TransferError::Malformed(_) => NakCode::Malformed,
            TransferError::Storage(e) | TransferError::Journal(JournalError::Storage(e)) => {
                match e {
                    StorageError::Full => NakCode::StorageFull,
                    StorageError::InvalidPath(_) => NakCode::InvalidPath,
                    StorageError::NotOpen(_)
                    | StorageError::Io(_)
                    | StorageError::Unsynced(..) => NakCode::IoError,
                }
            }
            TransferError::Journal(JournalError::RecordTooLarge(_)) => NakCode::IoError,
        }
    }
}

pub struct TransferMachine<S, J> {
    storage: S,
    journal: TransferJournal<J>,
    ctx: Option<TransferContext>,
    last_outcome: TransferState,
    next_id: u16,
}

impl<S: Storage, J: JournalStore> TransferMachine<S, J> {
    pub fn new(storage: S, journal: TransferJournal<J>) -> Self {
        Self {
            storage,
            journal,
            ctx: None,
            last_outcome: TransferState::Idle,
            next_id: 1,
        }
    }

    pub fn context(&self) -> Option<&TransferContext> {
        self.ctx.as_ref()
    }

    /// Current state; once a transfer ends this is how it ended.
    pub fn state(&self) -> TransferState {
        self.ctx.as_ref().map_or(self.last_outcome, |c| c.state)
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn journal_mut(&mut self) -> &mut TransferJournal<J> {
        &mut self.journal
    }

    /// Startup recovery: converge storage with whatever the journal holds.
    pub fn recover(&mut self) -> Result<RecoveryOutcome, TransferError> {
        self.ctx = None;
        let outcome = self.journal.replay(&mut self.storage)?;
        self.last_outcome = match outcome {
            RecoveryOutcome::Clean => TransferState::Idle,
            RecoveryOutcome::Committed { .. } => TransferState::Committed,
            RecoveryOutcome::RolledBack { .. } => TransferState::Aborted,
        };
        Ok(outcome)
    }

    /// Handle one transfer request and produce the reply payload.
    pub fn handle(
        &mut self,
        auth: &AuthGate,
        msg: MsgType,
        payload: &[u8],
    ) -> Result<Bytes, TransferError> {
        auth.require()
            .map_err(|_| TransferError::NotAuthenticated)?;

        match msg {
            MsgType::FsBegin => {
                let req = BeginRequest::decode(payload)?;
                Ok(encode_transfer_id(self.begin(req)?))
            }
            MsgType::FsPut | MsgType::FsData => {
                let chunk = ChunkRequest::decode(payload)?;
                Ok(encode_offset(self.chunk(msg, chunk.offset, chunk.data)?))
            }
            MsgType::FsResume => {
                let id = decode_transfer_id(payload)?;
                Ok(encode_offset(self.resume(id)?))
            }
            MsgType::FsDone => {
                self.done(decode_done(payload)?)?;
                Ok(Bytes::new())
            }
            MsgType::FsCommit => {
                self.commit()?;
                Ok(Bytes::new())
            }
            MsgType::FsAbort | MsgType::RollbackLast => {
                self.abort()?;
                Ok(Bytes::new())
            }
            other => Err(TransferError::NotTransfer(other)),
        }
    }

    fn allocate_id(&mut self) -> u16 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    fn active(&mut self, op: &'static str) -> Result<&mut TransferContext, TransferError> {
        let ctx = self.ctx.as_mut().ok_or(TransferError::NoActiveTransfer)?;
        if ctx.abort_required {
            return Err(TransferError::InvalidState {
                op,
                state: ctx.state,
            });
        }
        Ok(ctx)
    }

    /// Kill the current transfer after a storage or journal failure. The
    /// abort is journaled if the journal still takes writes; if it does not,
    /// replay rolls the transfer back anyway because there is no commit.
    fn fail_transfer(&mut self, err: TransferError) -> TransferError {
        if let Some(ctx) = self.ctx.take() {
            tracing::warn!(id = ctx.id, path = %ctx.path, error = %err, "transfer failed, aborting");
            self.teardown(&ctx);
        }
        err
    }

    fn teardown(&mut self, ctx: &TransferContext) {
        self.last_outcome = TransferState::Aborted;
        if let Err(e) = self.journal.append(&JournalRecord::Abort {
            transfer_id: ctx.id,
        }) {
            tracing::warn!(id = ctx.id, error = %e, "could not journal abort");
        }
        match self.storage.discard(&ctx.path) {
            Ok(()) => {
                if let Err(e) = self.journal.clear() {
                    tracing::warn!(error = %e, "could not clear journal after abort");
                }
            }
            Err(e) => {
                tracing::warn!(path = %ctx.path, error = %e, "discard failed, left for replay");
            }
        }
    }

    fn begin(&mut self, req: BeginRequest) -> Result<u16, TransferError> {
        if self.ctx.is_some() {
            return Err(TransferError::TransferInProgress);
        }
        validate_path(&req.path)?;

        // A previous transfer's cleanup did not finish; settle it first.
        if !self.journal.is_empty()? {
            let outcome = self.journal.replay(&mut self.storage)?;
            tracing::info!(?outcome, "settled leftover journal before new transfer");
        }

        let id = self.allocate_id();
        let BeginRequest { size, crc, path } = req;
        self.journal.append(&JournalRecord::Begin {
            transfer_id: id,
            size,
            crc,
            path: path.clone(),
        })?;

        self.ctx = Some(TransferContext {
            id,
            path: path.clone(),
            total_size: size,
            expected_crc: crc,
            received: 0,
            last_acked_offset: 0,
            state: TransferState::Begun,
            abort_required: false,
            content_crc: Crc32::new(),
        });

        if let Err(e) = self.storage.open_write(&path, size) {
            return Err(self.fail_transfer(e.into()));
        }
        tracing::info!(id, path = %path, size, "transfer begun");
        Ok(id)
    }

    fn chunk(&mut self, msg: MsgType, offset: u32, data: &[u8]) -> Result<u32, TransferError> {
        let ctx = self.active("chunk")?;
        if !matches!(ctx.state, TransferState::Begun | TransferState::Receiving) {
            return Err(TransferError::InvalidState {
                op: "chunk",
                state: ctx.state,
            });
        }
        if offset != ctx.received {
            tracing::warn!(id = ctx.id, expected = ctx.received, got = offset, "out-of-order chunk");
            return Err(TransferError::OutOfOrderChunk {
                expected: ctx.received,
                got: offset,
            });
        }
        let len = data.len() as u32;
        if ctx.received as u64 + len as u64 > ctx.total_size as u64 {
            return Err(TransferError::ChunkOverflow {
                size: ctx.total_size,
            });
        }

        let mut crc = ctx.content_crc;
        crc.update(data);
        let (id, path) = (ctx.id, ctx.path.clone());
        let record = if msg == MsgType::FsPut {
            JournalRecord::Put {
                transfer_id: id,
                offset,
                len,
                content_crc: crc.finalize(),
            }
        } else {
            JournalRecord::Data {
                transfer_id: id,
                offset,
                len,
                content_crc: crc.finalize(),
            }
        };

        if let Err(e) = self.journal.append(&record) {
            return Err(self.fail_transfer(e.into()));
        }
        if let Err(e) = self.storage.write_at(&path, offset, data) {
            return Err(self.fail_transfer(e.into()));
        }

        let ctx = self.active("chunk")?;
        ctx.received += len;
        ctx.last_acked_offset = offset;
        ctx.content_crc = crc;
        ctx.state = TransferState::Receiving;
        tracing::debug!(id, offset, len, received = ctx.received, "chunk stored");
        Ok(ctx.received)
    }

    fn done(&mut self, crc: Option<u32>) -> Result<(), TransferError> {
        let ctx = self.active("done")?;
        let allowed = match ctx.state {
            TransferState::Receiving => true,
            TransferState::Begun => ctx.total_size == 0,
            _ => false,
        };
        if !allowed {
            return Err(TransferError::InvalidState {
                op: "done",
                state: ctx.state,
            });
        }

        let actual = ctx.content_crc.finalize();
        let crc_ok = [crc, ctx.expected_crc]
            .into_iter()
            .flatten()
            .all(|expected| expected == actual);
        if ctx.received != ctx.total_size || !crc_ok {
            ctx.abort_required = true;
            tracing::warn!(
                id = ctx.id,
                received = ctx.received,
                size = ctx.total_size,
                crc_ok,
                "transfer incomplete, abort required"
            );
            return Err(TransferError::IncompleteTransfer {
                received: ctx.received,
                size: ctx.total_size,
                crc_ok,
            });
        }

        let (id, path, received) = (ctx.id, ctx.path.clone(), ctx.received);
        if let Err(e) = self.storage.flush(&path) {
            return Err(self.fail_transfer(e.into()));
        }
        if let Err(e) = self.journal.append(&JournalRecord::Done {
            transfer_id: id,
            received,
            crc: actual,
        }) {
            return Err(self.fail_transfer(e.into()));
        }
        self.active("done")?.state = TransferState::Done;
        tracing::info!(id, received, crc = format_args!("{actual:#010x}"), "transfer done");
        Ok(())
    }

    fn commit(&mut self) -> Result<(), TransferError> {
        let ctx = self.active("commit")?;
        if ctx.state != TransferState::Done {
            return Err(TransferError::InvalidState {
                op: "commit",
                state: ctx.state,
            });
        }
        let (id, path) = (ctx.id, ctx.path.clone());

        if let Err(e) = self.journal.append(&JournalRecord::Commit { transfer_id: id }) {
            return Err(self.fail_transfer(e.into()));
        }
        match self.storage.finalize(&path) {
            Ok(()) => {
                if let Err(e) = self.journal.clear() {
                    // Replay re-runs the idempotent finalize and clears it.
                    tracing::warn!(error = %e, "could not clear journal after commit");
                }
            }
            Err(e @ StorageError::Unsynced(..)) => {
                // Published; the commit record stays so replay redoes the sync.
                tracing::warn!(id, error = %e, "commit not yet durable, journal kept");
            }
            Err(e) => return Err(self.fail_transfer(e.into())),
        }

        self.ctx = None;
        self.last_outcome = TransferState::Committed;
        tracing::info!(id, path = %path, "transfer committed");
        Ok(())
    }

    fn abort(&mut self) -> Result<(), TransferError> {
        let ctx = self.ctx.take().ok_or(TransferError::NoActiveTransfer)?;
        tracing::info!(id = ctx.id, path = %ctx.path, state = ctx.state.as_str(), "transfer aborted");
        self.teardown(&ctx);
        Ok(())
    }

    /// Rebuild the transfer from the journal and report where to continue.
    fn resume(&mut self, id: u16) -> Result<u32, TransferError> {
        if let Some(ctx) = &self.ctx {
            if ctx.id != id {
                return Err(TransferError::NoActiveTransfer);
            }
            if ctx.abort_required {
                return Err(TransferError::InvalidState {
                    op: "resume",
                    state: ctx.state,
                });
            }
        }

        let summary = self
            .journal
            .reconstruct()?
            .filter(|s| s.transfer_id == id && s.well_formed)
            .ok_or(TransferError::NoActiveTransfer)?;
        let state = match summary.last_op {
            JournalOp::Begin => TransferState::Begun,
            JournalOp::Put | JournalOp::Data => TransferState::Receiving,
            JournalOp::Done => TransferState::Done,
            JournalOp::Commit | JournalOp::Abort => return Err(TransferError::NoActiveTransfer),
        };

        let ctx = TransferContext {
            id,
            path: summary.path,
            total_size: summary.size,
            expected_crc: summary.expected_crc,
            received: summary.received,
            last_acked_offset: self
                .ctx
                .as_ref()
                .map_or(summary.received, |c| c.last_acked_offset),
            state,
            abort_required: false,
            content_crc: if summary.received == 0 {
                Crc32::new()
            } else {
                Crc32::resume(summary.content_crc)
            },
        };
        tracing::info!(id, received = ctx.received, state = state.as_str(), "transfer resumed");
        let received = ctx.received;
        self.ctx = Some(ctx);
        Ok(received)
    }
}
