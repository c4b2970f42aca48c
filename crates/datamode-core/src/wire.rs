//! Data-mode wire format: the frame that carries every message on the link.
//!
//! These types ARE the protocol. The header layout, the flag bits, the message
//! type bytes and the CRC parameters are shared with the device firmware and
//! the desktop tooling; changing any of them is a breaking change.
//!
//! ```text
//! +-----+-------+-----+-----+------+--------+-----+-----------------+-------+
//! | ver | flags | seq | ack | type | window | len | payload         | crc32 |
//! |  1  |   1   |  2  |  2  |  1   |   1    |  2  | len bytes       |   4   |
//! +-----+-------+-----+-----+------+--------+-----+-----------------+-------+
//! ```
//!
//! All multi-byte fields are little-endian. The CRC trailer covers header and
//! payload. The header is a zerocopy struct built from byte-order-explicit
//! field types, so there is no unsafe code and no alignment requirement.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Protocol version carried in every frame header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Encoded header size in bytes.
pub const HEADER_LEN: usize = 10;

/// CRC32 trailer size in bytes.
pub const CRC_LEN: usize = 4;

/// Largest payload the 16-bit length field can describe.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Default advertised receive window (frames).
pub const DEFAULT_WINDOW: u8 = 4;

// ── Flags ─────────────────────────────────────────────────────────────────────

/// Pure acknowledgement. Not sequenced, never delivered upward, never retransmitted.
pub const FLAG_ACK_ONLY: u8 = 0x01;

/// Reply to a request carrying the same message type.
pub const FLAG_RESPONSE: u8 = 0x02;

/// Negative reply. The payload is a single [`NakCode`] byte.
pub const FLAG_NAK: u8 = 0x04;

/// First sequenced frame after a channel (re)start. The receiver re-bases
/// its expected sequence number on this frame.
pub const FLAG_SYNC: u8 = 0x08;

/// The `ack` field is meaningful. Clear until the sender has synced to the
/// receiver's sequence stream.
pub const FLAG_ACK_VALID: u8 = 0x10;

/// Every flag bit this protocol version defines. Other bits must be zero.
pub const KNOWN_FLAGS: u8 =
    FLAG_ACK_ONLY | FLAG_RESPONSE | FLAG_NAK | FLAG_SYNC | FLAG_ACK_VALID;

// ── Frame Header ──────────────────────────────────────────────────────────────

/// On-wire header layout. Only used for (de)serialization; everything else
/// works with [`FrameHeader`].
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct WireHeader {
    version: u8,
    flags: u8,
    seq: U16<LittleEndian>,
    ack: U16<LittleEndian>,
    msg_type: u8,
    window: u8,
    len: U16<LittleEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(WireHeader, [u8; HEADER_LEN]);

/// Decoded frame header.
///
/// `msg_type` stays a raw byte here: the codec is type-agnostic and a frame
/// with an unknown type is still a valid frame. Use [`MsgType::try_from`] at
/// dispatch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub flags: u8,
    /// Sender sequence number.
    pub seq: u16,
    /// Cumulative acknowledgement: highest in-order sequence delivered.
    pub ack: u16,
    pub msg_type: u8,
    /// Receive window the sender is advertising.
    pub window: u8,
    /// Payload length in bytes.
    pub len: u16,
}

impl FrameHeader {
    /// Header for a frame of `msg_type` with the current protocol version
    /// and every other field zeroed.
    pub fn new(msg_type: MsgType) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags: 0,
            seq: 0,
            ack: 0,
            msg_type: msg_type.into(),
            window: 0,
            len: 0,
        }
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Total encoded size of the frame this header describes.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.len as usize + CRC_LEN
    }

    fn to_wire(self) -> WireHeader {
        WireHeader {
            version: self.version,
            flags: self.flags,
            seq: U16::new(self.seq),
            ack: U16::new(self.ack),
            msg_type: self.msg_type,
            window: self.window,
            len: U16::new(self.len),
        }
    }

    fn from_wire(w: &WireHeader) -> Self {
        Self {
            version: w.version,
            flags: w.flags,
            seq: w.seq.get(),
            ack: w.ack.get(),
            msg_type: w.msg_type,
            window: w.window,
            len: w.len.get(),
        }
    }
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// Encode a frame into `out`, returning the number of bytes written.
///
/// The payload length comes from `header.len`. A non-zero length with no
/// payload, or a payload whose size disagrees with the header, is an
/// `InvalidArgument`. `out` must hold header + payload + CRC.
pub fn encode_into(
    header: &FrameHeader,
    payload: Option<&[u8]>,
    out: &mut [u8],
) -> Result<usize, WireError> {
    let len = header.len as usize;
    let payload = match payload {
        Some(p) if p.len() == len => p,
        Some(p) => return Err(WireError::InvalidArgument(p.len(), len)),
        None if len == 0 => &[][..],
        None => return Err(WireError::InvalidArgument(0, len)),
    };

    let total = header.frame_len();
    if out.len() < total {
        return Err(WireError::BufferTooSmall {
            needed: total,
            available: out.len(),
        });
    }

    out[..HEADER_LEN].copy_from_slice(header.to_wire().as_bytes());
    out[HEADER_LEN..HEADER_LEN + len].copy_from_slice(payload);

    let crc = crc32(&out[..HEADER_LEN + len]);
    out[HEADER_LEN + len..total].copy_from_slice(&crc.to_le_bytes());
    Ok(total)
}

/// Encode a frame into a fresh buffer. `header.len` is taken from `payload`.
pub fn encode(header: &FrameHeader, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(WireError::PayloadTooLarge(payload.len()));
    }
    let header = FrameHeader {
        len: payload.len() as u16,
        ..*header
    };
    let mut out = vec![0u8; header.frame_len()];
    encode_into(&header, Some(payload), &mut out)?;
    Ok(out)
}

/// Decode one frame from the front of `bytes`.
///
/// On success returns the header and a view of the payload borrowed from
/// `bytes`; trailing bytes past the frame are ignored (use
/// [`FrameHeader::frame_len`] to advance). The CRC is checked before the
/// version, so a corrupted version byte reports `CrcMismatch`.
pub fn decode(bytes: &[u8]) -> Result<(FrameHeader, &[u8]), WireError> {
    if bytes.len() < HEADER_LEN + CRC_LEN {
        return Err(WireError::Truncated {
            needed: HEADER_LEN + CRC_LEN,
            available: bytes.len(),
        });
    }

    let wire = WireHeader::ref_from_prefix(bytes).ok_or(WireError::Truncated {
        needed: HEADER_LEN,
        available: bytes.len(),
    })?;
    let header = FrameHeader::from_wire(wire);

    let body_len = HEADER_LEN + header.len as usize;
    let total = body_len + CRC_LEN;
    if bytes.len() < total {
        return Err(WireError::Truncated {
            needed: total,
            available: bytes.len(),
        });
    }

    let mut trailer = [0u8; CRC_LEN];
    trailer.copy_from_slice(&bytes[body_len..total]);
    let expected = u32::from_le_bytes(trailer);
    let actual = crc32(&bytes[..body_len]);
    if expected != actual {
        return Err(WireError::CrcMismatch { expected, actual });
    }

    if header.version != PROTOCOL_VERSION {
        return Err(WireError::UnknownVersion(header.version));
    }

    Ok((header, &bytes[HEADER_LEN..body_len]))
}

// ── CRC32 ─────────────────────────────────────────────────────────────────────

const CRC_POLY: u32 = 0xEDB8_8320;
const CRC_SEED: u32 = 0xFFFF_FFFF;

const CRC_TABLE: [u32; 256] = build_crc_table();

const fn build_crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ CRC_POLY } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Standard reflected CRC32 (IEEE): seed 0xFFFFFFFF, polynomial 0xEDB88320,
/// one's-complement finalization.
pub fn crc32(data: &[u8]) -> u32 {
    let mut c = Crc32::new();
    c.update(data);
    c.finalize()
}

/// Incremental CRC32 for data that arrives in pieces (transfer content).
#[derive(Debug, Clone, Copy)]
pub struct Crc32(u32);

impl Crc32 {
    pub fn new() -> Self {
        Self(CRC_SEED)
    }

    /// Continue from a previously finalized value, so a running CRC can be
    /// stored as a plain `u32` (journal records) and picked up later.
    pub fn resume(finalized: u32) -> Self {
        Self(!finalized)
    }

    pub fn update(&mut self, data: &[u8]) {
        let mut crc = self.0;
        for &b in data {
            crc = CRC_TABLE[((crc ^ b as u32) & 0xFF) as usize] ^ (crc >> 8);
        }
        self.0 = crc;
    }

    pub fn finalize(&self) -> u32 {
        !self.0
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

// ── Message Types ─────────────────────────────────────────────────────────────

/// Message type byte carried in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    CtrlGetInfo = 0x01,
    AuthInit = 0x02,
    AuthProve = 0x03,
    FsBegin = 0x10,
    FsPut = 0x11,
    FsData = 0x12,
    FsResume = 0x13,
    FsDone = 0x14,
    FsCommit = 0x15,
    FsAbort = 0x16,
    RollbackLast = 0x17,
    DiagSdFree = 0x20,
    DiagI2cScan = 0x21,
    DiagReadBtns = 0x22,
    SetVolume = 0x30,
    Beep = 0x31,
    Led = 0x32,
    LogStart = 0x40,
    LogStop = 0x41,
    LogChunk = 0x42,
}

impl MsgType {
    /// File-transfer messages, handled by the transfer state machine.
    pub fn is_transfer(self) -> bool {
        matches!(
            self,
            MsgType::FsBegin
                | MsgType::FsPut
                | MsgType::FsData
                | MsgType::FsResume
                | MsgType::FsDone
                | MsgType::FsCommit
                | MsgType::FsAbort
                | MsgType::RollbackLast
        )
    }

    /// Everything except info and the handshake itself is gated on auth.
    pub fn requires_auth(self) -> bool {
        !matches!(
            self,
            MsgType::CtrlGetInfo | MsgType::AuthInit | MsgType::AuthProve
        )
    }
}

impl TryFrom<u8> for MsgType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => MsgType::CtrlGetInfo,
            0x02 => MsgType::AuthInit,
            0x03 => MsgType::AuthProve,
            0x10 => MsgType::FsBegin,
            0x11 => MsgType::FsPut,
            0x12 => MsgType::FsData,
            0x13 => MsgType::FsResume,
            0x14 => MsgType::FsDone,
            0x15 => MsgType::FsCommit,
            0x16 => MsgType::FsAbort,
            0x17 => MsgType::RollbackLast,
            0x20 => MsgType::DiagSdFree,
            0x21 => MsgType::DiagI2cScan,
            0x22 => MsgType::DiagReadBtns,
            0x30 => MsgType::SetVolume,
            0x31 => MsgType::Beep,
            0x32 => MsgType::Led,
            0x40 => MsgType::LogStart,
            0x41 => MsgType::LogStop,
            0x42 => MsgType::LogChunk,
            other => return Err(WireError::UnknownMsgType(other)),
        })
    }
}

impl From<MsgType> for u8 {
    fn from(t: MsgType) -> u8 {
        t as u8
    }
}

// ── NAK Codes ─────────────────────────────────────────────────────────────────

/// Reason byte carried in a NAK reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NakCode {
    NotAuthenticated = 0x01,
    AuthFailed = 0x02,
    TransferInProgress = 0x03,
    OutOfOrderChunk = 0x04,
    IncompleteTransfer = 0x05,
    InvalidState = 0x06,
    NoActiveTransfer = 0x07,
    StorageFull = 0x08,
    IoError = 0x09,
    Malformed = 0x0A,
    Unsupported = 0x0B,
    ChunkOverflow = 0x0C,
    InvalidPath = 0x0D,
}

impl TryFrom<u8> for NakCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => NakCode::NotAuthenticated,
            0x02 => NakCode::AuthFailed,
            0x03 => NakCode::TransferInProgress,
            0x04 => NakCode::OutOfOrderChunk,
            0x05 => NakCode::IncompleteTransfer,
            0x06 => NakCode::InvalidState,
            0x07 => NakCode::NoActiveTransfer,
            0x08 => NakCode::StorageFull,
            0x09 => NakCode::IoError,
            0x0A => NakCode::Malformed,
            0x0B => NakCode::Unsupported,
            0x0C => NakCode::ChunkOverflow,
            0x0D => NakCode::InvalidPath,
            other => return Err(WireError::UnknownNakCode(other)),
        })
    }
}

impl From<NakCode> for u8 {
    fn from(c: NakCode) -> u8 {
        c as u8
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when encoding or interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("crc mismatch: trailer 0x{expected:08x}, computed 0x{actual:08x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("output buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("payload of {0} bytes does not match declared length {1}")]
    InvalidArgument(usize, usize),

    #[error("payload length {0} exceeds maximum {}", MAX_PAYLOAD)]
    PayloadTooLarge(usize),

    #[error("unknown protocol version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("unknown message type: 0x{0:02x}")]
    UnknownMsgType(u8),

    #[error("unknown nak code: 0x{0:02x}")]
    UnknownNakCode(u8),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn header(msg_type: MsgType, seq: u16, ack: u16, window: u8) -> FrameHeader {
        FrameHeader {
            seq,
            ack,
            window,
            ..FrameHeader::new(msg_type)
        }
    }

    #[test]
    fn crc32_matches_reference_check_value() {
        // The standard CRC-32/ISO-HDLC check value.
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn incremental_crc_equals_one_shot() {
        let mut c = Crc32::new();
        c.update(b"hello ");
        c.update(b"world");
        assert_eq!(c.finalize(), crc32(b"hello world"));

        let mut resumed = Crc32::resume(crc32(b"hello "));
        resumed.update(b"world");
        assert_eq!(resumed.finalize(), crc32(b"hello world"));
    }

    #[test]
    fn header_layout_is_little_endian() {
        let h = FrameHeader {
            flags: FLAG_SYNC,
            len: 3,
            ..header(MsgType::FsBegin, 0x0102, 0x0304, 4)
        };
        let bytes = encode(&h, b"abc").unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 3 + CRC_LEN);
        assert_eq!(
            &bytes[..HEADER_LEN],
            &[1, FLAG_SYNC, 0x02, 0x01, 0x04, 0x03, 0x10, 4, 3, 0]
        );
        let crc = crc32(&bytes[..HEADER_LEN + 3]);
        assert_eq!(&bytes[HEADER_LEN + 3..], &crc.to_le_bytes());
    }

    #[test]
    fn decode_returns_borrowed_payload() {
        let bytes = encode(&header(MsgType::FsData, 9, 8, 2), b"payload").unwrap();
        let (h, payload) = decode(&bytes).unwrap();
        assert_eq!(h.seq, 9);
        assert_eq!(h.ack, 8);
        assert_eq!(h.len, 7);
        assert_eq!(payload, b"payload");
        // Borrowed view into the input buffer, not a copy.
        assert_eq!(payload.as_ptr(), bytes[HEADER_LEN..].as_ptr());
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        let mut bytes = encode(&header(MsgType::Beep, 1, 0, 4), b"x").unwrap();
        let frame_len = bytes.len();
        bytes.extend_from_slice(&[0xAA, 0xBB]);
        let (h, _) = decode(&bytes).unwrap();
        assert_eq!(h.frame_len(), frame_len);
    }

    #[test]
    fn short_input_is_truncated() {
        let err = decode(&[1, 0, 0]).unwrap_err();
        assert!(matches!(err, WireError::Truncated { .. }));
    }

    #[test]
    fn declared_length_past_buffer_is_truncated() {
        let bytes = encode(&header(MsgType::FsData, 1, 0, 4), &[7u8; 32]).unwrap();
        let err = decode(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, WireError::Truncated { .. }));
    }

    #[test]
    fn encode_rejects_small_buffer() {
        let h = FrameHeader {
            len: 4,
            ..header(MsgType::FsData, 1, 0, 4)
        };
        let mut out = [0u8; HEADER_LEN + 4 + CRC_LEN - 1];
        let err = encode_into(&h, Some(b"abcd"), &mut out).unwrap_err();
        assert!(matches!(err, WireError::BufferTooSmall { .. }));
    }

    #[test]
    fn encode_rejects_missing_payload() {
        let h = FrameHeader {
            len: 4,
            ..header(MsgType::FsData, 1, 0, 4)
        };
        let mut out = [0u8; 64];
        assert_eq!(
            encode_into(&h, None, &mut out).unwrap_err(),
            WireError::InvalidArgument(0, 4)
        );
        // Zero-length frames need no payload buffer.
        let empty = header(MsgType::FsCommit, 1, 0, 4);
        assert_eq!(
            encode_into(&empty, None, &mut out).unwrap(),
            HEADER_LEN + CRC_LEN
        );
    }

    #[test]
    fn unknown_version_is_rejected_after_crc() {
        let h = FrameHeader {
            version: 2,
            ..header(MsgType::Led, 1, 0, 4)
        };
        let bytes = encode(&h, b"").unwrap();
        assert_eq!(decode(&bytes).unwrap_err(), WireError::UnknownVersion(2));
    }

    #[test]
    fn msg_type_round_trip() {
        for byte in 0u8..=0xFF {
            if let Ok(t) = MsgType::try_from(byte) {
                assert_eq!(u8::from(t), byte);
            }
        }
        assert!(MsgType::try_from(0x00).is_err());
        assert!(MsgType::FsCommit.is_transfer());
        assert!(!MsgType::Beep.is_transfer());
        assert!(!MsgType::AuthProve.requires_auth());
        assert!(MsgType::DiagSdFree.requires_auth());
    }

    #[test]
    fn unknown_nak_code_error_message() {
        let err = NakCode::try_from(0xEE).unwrap_err();
        assert!(err.to_string().contains("0xee"));
    }

    proptest! {
        #[test]
        fn encode_decode_round_trip(
            flags in any::<u8>(),
            seq in any::<u16>(),
            ack in any::<u16>(),
            msg_type in any::<u8>(),
            window in any::<u8>(),
            payload in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let h = FrameHeader {
                version: PROTOCOL_VERSION,
                flags,
                seq,
                ack,
                msg_type,
                window,
                len: payload.len() as u16,
            };
            let bytes = encode(&h, &payload).unwrap();
            let (decoded, body) = decode(&bytes).unwrap();
            prop_assert_eq!(decoded, h);
            prop_assert_eq!(body, &payload[..]);
        }

        #[test]
        fn single_bit_flip_never_decodes(
            seq in any::<u16>(),
            payload in proptest::collection::vec(any::<u8>(), 0..128),
            bit in any::<prop::sample::Index>(),
        ) {
            let h = header(MsgType::FsData, seq, seq.wrapping_sub(1), 4);
            let mut bytes = encode(&h, &payload).unwrap();
            let bit = bit.index(bytes.len() * 8);
            bytes[bit / 8] ^= 1 << (bit % 8);
            match decode(&bytes) {
                Err(WireError::CrcMismatch { .. }) | Err(WireError::Truncated { .. }) => {}
                other => prop_assert!(false, "corrupted frame decoded: {:?}", other),
            }
        }
    }
}
