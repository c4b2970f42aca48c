//! Host side of the link: blocking request/reply on top of a
//! [`SequencedChannel`], plus the push/abort sequences a tool needs.

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use datamode_core::crypto::{compute_proof, SharedSecret};
use datamode_core::message::{
    decode_nonce, decode_offset, decode_transfer_id, encode_done, encode_transfer_id,
    AuthProve, BeginRequest, ChunkRequest, DeviceInfo,
};
use datamode_core::wire::{crc32, FLAG_NAK, FLAG_RESPONSE};
use datamode_core::{MsgType, NakCode};

use crate::channel::{ChannelError, SequencedChannel};
use crate::transport::{Transport, TransportError};

const POLL_INTERVAL: Duration = Duration::from_millis(1);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("device refused {msg:?}: {code:?}")]
    Nak { msg: MsgType, code: NakCode },
    #[error("no reply to {0:?} within {1:?}")]
    Timeout(MsgType, Duration),
}

pub struct HostSession<T> {
    channel: SequencedChannel<T>,
    timeout: Duration,
}

impl<T: Transport> HostSession<T> {
    pub fn new(channel: SequencedChannel<T>) -> Self {
        Self {
            channel,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn channel(&self) -> &SequencedChannel<T> {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut SequencedChannel<T> {
        &mut self.channel
    }

    /// Send one request and wait for its reply. A NAK comes back as
    /// [`HostError::Nak`] inside the `anyhow` error.
    ///
    /// On link loss the channel is reset before the error is returned, so the
    /// next call opens a fresh session.
    pub fn call(&mut self, msg: MsgType, payload: &[u8]) -> Result<Bytes> {
        let result = self.exchange(msg, payload);
        if let Err(e) = &result {
            if link_lost(e) {
                tracing::warn!(error = %e, "link lost, channel reset");
                self.channel.reset();
            }
        }
        result
    }

    fn exchange(&mut self, msg: MsgType, payload: &[u8]) -> Result<Bytes> {
        let deadline = Instant::now() + self.timeout;

        while !self.channel.can_send() {
            self.pump(msg, deadline)?;
        }
        self.channel.send(msg, 0, payload, Instant::now())?;

        loop {
            if let Some(reply) = self.pump(msg, deadline)? {
                return Ok(reply);
            }
        }
    }

    /// One poll/ack/retransmit round. Returns the reply to `msg` if it arrived.
    fn pump(&mut self, msg: MsgType, deadline: Instant) -> Result<Option<Bytes>> {
        let mut reply = None;
        for frame in self.channel.poll()? {
            self.channel.processed(frame.header.seq);
            let header = frame.header;
            if !header.has_flag(FLAG_RESPONSE) || header.msg_type != u8::from(msg) {
                tracing::debug!(msg_type = header.msg_type, "unsolicited frame ignored");
                continue;
            }
            if header.has_flag(FLAG_NAK) {
                let code = frame
                    .payload
                    .first()
                    .and_then(|b| NakCode::try_from(*b).ok())
                    .context("NAK without a valid code")?;
                self.channel.flush_ack()?;
                return Err(HostError::Nak { msg, code }.into());
            }
            reply = Some(frame.payload);
        }
        self.channel.flush_ack()?;
        if reply.is_some() {
            return Ok(reply);
        }

        let now = Instant::now();
        self.channel.tick(now)?;
        if now >= deadline {
            return Err(HostError::Timeout(msg, self.timeout).into());
        }
        std::thread::sleep(POLL_INTERVAL);
        Ok(None)
    }

    pub fn info(&mut self) -> Result<DeviceInfo> {
        let raw = self.call(MsgType::CtrlGetInfo, &[])?;
        DeviceInfo::from_bytes(&raw).context("malformed device info")
    }

    pub fn authenticate(&mut self, secret: &SharedSecret, token: &[u8]) -> Result<()> {
        let raw = self.call(MsgType::AuthInit, &[])?;
        let nonce = decode_nonce(&raw)?;
        let prove = AuthProve {
            token: token.to_vec(),
            proof: compute_proof(secret, token, &nonce).to_vec(),
        };
        self.call(MsgType::AuthProve, &prove.encode()?)?;
        tracing::info!("authenticated");
        Ok(())
    }

    /// Stream `data` to `remote` and commit it. Any failure after the begin
    /// triggers a best-effort abort.
    pub fn push(&mut self, remote: &str, data: &[u8], chunk_size: usize) -> Result<u16> {
        let size = u32::try_from(data.len()).context("file larger than 4 GiB")?;
        let max_chunk = usize::from(self.channel.config().max_payload).saturating_sub(4);
        let chunk_size = chunk_size.min(max_chunk);
        if chunk_size == 0 {
            bail!("link payload too small for file chunks");
        }
        let crc = crc32(data);

        let begin = BeginRequest {
            size,
            crc: Some(crc),
            path: remote.to_string(),
        };
        let id = decode_transfer_id(&self.call(MsgType::FsBegin, &begin.encode())?)?;
        tracing::info!(id, remote, size, "transfer started");

        match self.stream(data, chunk_size, crc) {
            Ok(()) => Ok(id),
            Err(e) => {
                if let Err(abort_err) = self.abort() {
                    tracing::warn!(error = %abort_err, "abort after failed push also failed");
                }
                Err(e.context(format!("push to {remote} failed")))
            }
        }
    }

    fn stream(&mut self, data: &[u8], chunk_size: usize, crc: u32) -> Result<()> {
        let mut offset = 0u32;
        for chunk in data.chunks(chunk_size) {
            let req = ChunkRequest {
                offset,
                data: chunk,
            };
            let acked = decode_offset(&self.call(MsgType::FsData, &req.encode())?)?;
            offset += chunk.len() as u32;
            if acked != offset {
                bail!("device acknowledged offset {acked}, expected {offset}");
            }
        }
        self.call(MsgType::FsDone, &encode_done(Some(crc)))?;
        self.call(MsgType::FsCommit, &[])?;
        Ok(())
    }

    /// Ask the device to rebuild transfer `id` from its journal. Returns the
    /// offset to continue from.
    pub fn resume(&mut self, id: u16) -> Result<u32> {
        let raw = self.call(MsgType::FsResume, &encode_transfer_id(id))?;
        Ok(decode_offset(&raw)?)
    }

    pub fn abort(&mut self) -> Result<()> {
        self.call(MsgType::FsAbort, &[])?;
        Ok(())
    }

    pub fn sd_free(&mut self) -> Result<u64> {
        let raw = self.call(MsgType::DiagSdFree, &[])?;
        let bytes: [u8; 8] = raw.as_ref().try_into().context("malformed free-space reply")?;
        Ok(u64::from_le_bytes(bytes))
    }
}

fn link_lost(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ChannelError>(),
        Some(ChannelError::LinkLost | ChannelError::Transport(TransportError::Closed))
    )
}
