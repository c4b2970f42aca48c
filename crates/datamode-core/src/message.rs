//! Message payloads carried inside data-mode frames.
//!
//! Requests and replies are small fixed little-endian layouts, except the
//! device-info reply which is JSON so desktop tooling can read it without
//! tracking firmware struct changes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::crypto::{NONCE_LEN, PROOF_LEN};
use crate::telemetry::TelemetrySnapshot;

/// Errors decoding a message payload. Always answered with NAK `Malformed`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("{what}: need {needed} bytes, have {available}")]
    TooShort {
        what: &'static str,
        needed: usize,
        available: usize,
    },
    #[error("{0}: unexpected trailing bytes")]
    TrailingBytes(&'static str),
    #[error("path is not valid utf-8")]
    PathNotUtf8,
    #[error("token longer than 255 bytes")]
    TokenTooLong,
}

fn need(what: &'static str, buf: &[u8], needed: usize) -> Result<(), MessageError> {
    if buf.len() < needed {
        return Err(MessageError::TooShort {
            what,
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

// ── Auth ──────────────────────────────────────────────────────────────────────

/// AUTH_PROVE request: `token_len:1, token, proof`.
///
/// The proof is kept at whatever length arrived; a wrong length is a
/// verification failure, not a decode failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthProve {
    pub token: Vec<u8>,
    pub proof: Vec<u8>,
}

impl AuthProve {
    pub fn encode(&self) -> Result<Bytes, MessageError> {
        let token_len = u8::try_from(self.token.len()).map_err(|_| MessageError::TokenTooLong)?;
        let mut out = BytesMut::with_capacity(1 + self.token.len() + PROOF_LEN);
        out.put_u8(token_len);
        out.put_slice(&self.token);
        out.put_slice(&self.proof);
        Ok(out.freeze())
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, MessageError> {
        need("auth prove", buf, 1)?;
        let token_len = buf.get_u8() as usize;
        need("auth prove token", buf, token_len)?;
        let token = buf[..token_len].to_vec();
        buf.advance(token_len);
        Ok(Self {
            token,
            proof: buf.to_vec(),
        })
    }
}

/// AUTH_INIT reply: the raw nonce.
pub fn decode_nonce(buf: &[u8]) -> Result<[u8; NONCE_LEN], MessageError> {
    need("nonce", buf, NONCE_LEN)?;
    if buf.len() > NONCE_LEN {
        return Err(MessageError::TrailingBytes("nonce"));
    }
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(buf);
    Ok(nonce)
}

// ── Transfer ──────────────────────────────────────────────────────────────────

/// FS_BEGIN request: `size:4, flags:1, crc:4, path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginRequest {
    pub size: u32,
    /// CRC32 of the whole file, if the host knows it up front.
    pub crc: Option<u32>,
    pub path: String,
}

const BEGIN_HAS_CRC: u8 = 0x01;

impl BeginRequest {
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(9 + self.path.len());
        out.put_u32_le(self.size);
        out.put_u8(if self.crc.is_some() { BEGIN_HAS_CRC } else { 0 });
        out.put_u32_le(self.crc.unwrap_or(0));
        out.put_slice(self.path.as_bytes());
        out.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, MessageError> {
        need("begin", buf, 9)?;
        let size = buf.get_u32_le();
        let flags = buf.get_u8();
        let crc = buf.get_u32_le();
        let path = std::str::from_utf8(buf)
            .map_err(|_| MessageError::PathNotUtf8)?
            .to_string();
        Ok(Self {
            size,
            crc: (flags & BEGIN_HAS_CRC != 0).then_some(crc),
            path,
        })
    }
}

/// FS_PUT / FS_DATA request: `offset:4, bytes`. Borrows the chunk bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRequest<'a> {
    pub offset: u32,
    pub data: &'a [u8],
}

impl<'a> ChunkRequest<'a> {
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(4 + self.data.len());
        out.put_u32_le(self.offset);
        out.put_slice(self.data);
        out.freeze()
    }

    pub fn decode(mut buf: &'a [u8]) -> Result<Self, MessageError> {
        need("chunk", buf, 4)?;
        let offset = buf.get_u32_le();
        Ok(Self { offset, data: buf })
    }
}

/// FS_DONE request: empty, or the CRC32 of the whole file.
pub fn encode_done(crc: Option<u32>) -> Bytes {
    match crc {
        Some(c) => Bytes::copy_from_slice(&c.to_le_bytes()),
        None => Bytes::new(),
    }
}

pub fn decode_done(mut buf: &[u8]) -> Result<Option<u32>, MessageError> {
    match buf.len() {
        0 => Ok(None),
        4 => Ok(Some(buf.get_u32_le())),
        n if n < 4 => Err(MessageError::TooShort {
            what: "done",
            needed: 4,
            available: n,
        }),
        _ => Err(MessageError::TrailingBytes("done")),
    }
}

/// `transfer_id:2`: FS_BEGIN reply and FS_RESUME request.
pub fn encode_transfer_id(id: u16) -> Bytes {
    Bytes::copy_from_slice(&id.to_le_bytes())
}

pub fn decode_transfer_id(mut buf: &[u8]) -> Result<u16, MessageError> {
    need("transfer id", buf, 2)?;
    Ok(buf.get_u16_le())
}

/// `next_offset:4`: FS_DATA / FS_RESUME reply.
pub fn encode_offset(offset: u32) -> Bytes {
    Bytes::copy_from_slice(&offset.to_le_bytes())
}

pub fn decode_offset(mut buf: &[u8]) -> Result<u32, MessageError> {
    need("offset", buf, 4)?;
    Ok(buf.get_u32_le())
}

// ── Info ──────────────────────────────────────────────────────────────────────

/// CTRL_GET_INFO reply body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub protocol_version: u8,
    pub window: u8,
    pub max_payload: u16,
    pub authenticated: bool,
    pub transfer_state: String,
    pub telemetry: TelemetrySnapshot,
}

impl DeviceInfo {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
