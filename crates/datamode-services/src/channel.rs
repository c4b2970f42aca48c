//! Sequenced channel: ordered, deduplicated, windowed delivery over a lossy
//! byte transport.
//!
//! The transport is a byte stream. Incoming bytes are accumulated and frames
//! are decoded from the front; on a corrupt frame the channel drops one byte
//! and tries again, so it resynchronizes on the next good frame boundary.
//!
//! Every sequenced frame stays in flight until the peer's cumulative ack
//! covers it. `tick` retransmits overdue frames with a doubling timeout and
//! gives up with `LinkLost` after `max_retries`.
//!
//! Acks are deferred until the upper layer is done with a frame. `poll`
//! hands frames up; the caller marks each one with `processed` once its
//! effects are durable, replies (the reply piggybacks the ack), and calls
//! `flush_ack` to cover frames that produced no reply. A frame delivered but
//! not yet processed is never acknowledged. The `ack` field is only read
//! from frames that carry `FLAG_ACK_VALID`.
//!
//! The transport may take fewer bytes than offered. The unsent tail waits in
//! a transmit buffer and is pushed again on every send, poll and tick.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use datamode_core::config::LinkConfig;
use datamode_core::wire::{
    self, FrameHeader, WireError, CRC_LEN, FLAG_ACK_ONLY, FLAG_ACK_VALID, FLAG_SYNC, HEADER_LEN,
    KNOWN_FLAGS, PROTOCOL_VERSION,
};
use datamode_core::Telemetry;

use crate::transport::{Transport, TransportError};

/// Read size per transport `recv` call.
const RECV_CHUNK: usize = 512;

/// Backoff stops doubling after this many retries (8x the base timeout).
const MAX_BACKOFF_SHIFT: u8 = 3;

#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    /// Receive window advertised to the peer.
    pub window: u8,
    pub retransmit_timeout: Duration,
    pub max_retries: u8,
    pub max_payload: u16,
}

impl From<&LinkConfig> for ChannelConfig {
    fn from(c: &LinkConfig) -> Self {
        Self {
            window: c.window.max(1),
            retransmit_timeout: c.retransmit_timeout(),
            max_retries: c.max_retries,
            max_payload: c.max_payload,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::from(&LinkConfig::default())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("peer receive window is full")]
    WindowFull,
    #[error("link lost: retransmit limit reached")]
    LinkLost,
    #[error("payload of {0} bytes exceeds link maximum {1}")]
    PayloadTooLarge(usize, u16),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Encode(#[from] WireError),
}

/// A frame handed to the upper layer, in sequence order, exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub header: FrameHeader,
    pub payload: Bytes,
}

struct InFlight {
    seq: u16,
    frame: Bytes,
    deadline: Instant,
    retries: u8,
}

/// `a` precedes `b` in 16-bit serial-number arithmetic.
fn seq_before(a: u16, b: u16) -> bool {
    (b.wrapping_sub(a) as i16) > 0
}

fn backoff(base: Duration, retries: u8) -> Duration {
    base * (1u32 << retries.min(MAX_BACKOFF_SHIFT))
}

pub struct SequencedChannel<T> {
    transport: T,
    config: ChannelConfig,
    telemetry: Arc<Telemetry>,

    // send side
    next_seq: u16,
    last_acked: u16,
    peer_window: u8,
    in_flight: VecDeque<InFlight>,
    send_sync: bool,

    // receive side
    rx_synced: bool,
    expected: u16,
    sync_base: Option<u16>,
    reorder: HashMap<u16, Delivered>,
    ack_point: u16,
    ack_owed: bool,
    peer_restarted: bool,
    rx_buf: BytesMut,
    tx_buf: BytesMut,
}

impl<T: Transport> SequencedChannel<T> {
    pub fn new(transport: T, config: ChannelConfig, telemetry: Arc<Telemetry>) -> Self {
        let next_seq = rand::random::<u16>();
        Self {
            transport,
            config,
            telemetry,
            next_seq,
            last_acked: next_seq.wrapping_sub(1),
            peer_window: config.window,
            in_flight: VecDeque::new(),
            send_sync: true,
            rx_synced: false,
            expected: 0,
            sync_base: None,
            reorder: HashMap::new(),
            ack_point: 0,
            ack_owed: false,
            peer_restarted: false,
            rx_buf: BytesMut::with_capacity(4 * RECV_CHUNK),
            tx_buf: BytesMut::new(),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn peer_window(&self) -> u8 {
        self.peer_window
    }

    /// True once after the peer re-synced with a new base, i.e. it is a new
    /// session on the same transport.
    pub fn take_peer_restart(&mut self) -> bool {
        std::mem::take(&mut self.peer_restarted)
    }

    /// True when another sequenced frame fits in the peer's window.
    pub fn can_send(&self) -> bool {
        self.in_flight.len() < self.peer_window as usize
    }

    /// Bytes accepted for sending that the transport has not taken yet.
    pub fn unsent(&self) -> usize {
        self.tx_buf.len()
    }

    fn header(&self, msg_type: u8, flags: u8, seq: u16) -> FrameHeader {
        // Until our receive side has synced there is nothing to acknowledge.
        let (flags, ack) = if self.rx_synced {
            (flags | FLAG_ACK_VALID, self.ack_point)
        } else {
            (flags & !FLAG_ACK_VALID, 0)
        };
        FrameHeader {
            version: PROTOCOL_VERSION,
            flags,
            seq,
            ack,
            msg_type,
            window: self.config.window,
            len: 0,
        }
    }

    // ── Send ──────────────────────────────────────────────────────────────────

    /// Send one sequenced frame. Returns the sequence number assigned.
    ///
    /// Any owed acknowledgement rides along in the header.
    pub fn send(
        &mut self,
        msg_type: impl Into<u8>,
        flags: u8,
        payload: &[u8],
        now: Instant,
    ) -> Result<u16, ChannelError> {
        if payload.len() > self.config.max_payload as usize {
            return Err(ChannelError::PayloadTooLarge(
                payload.len(),
                self.config.max_payload,
            ));
        }
        if !self.can_send() {
            return Err(ChannelError::WindowFull);
        }

        let seq = self.next_seq;
        let mut flags = flags & !FLAG_ACK_ONLY;
        if self.send_sync {
            flags |= FLAG_SYNC;
        }
        let header = self.header(msg_type.into(), flags, seq);
        let frame = Bytes::from(wire::encode(&header, payload)?);

        self.next_seq = seq.wrapping_add(1);
        self.send_sync = false;
        if self.ack_owed {
            self.ack_owed = false;
            self.telemetry.ack_sent();
        }
        self.in_flight.push_back(InFlight {
            seq,
            frame: frame.clone(),
            deadline: now + self.config.retransmit_timeout,
            retries: 0,
        });

        tracing::debug!(
            seq,
            ack = header.ack,
            msg_type = header.msg_type,
            flags = header.flags,
            len = payload.len(),
            "frame sent"
        );
        self.telemetry.frame_sent();
        self.write_out(&frame)?;
        Ok(seq)
    }

    fn send_ack(&mut self) -> Result<(), ChannelError> {
        let header = self.header(0, FLAG_ACK_ONLY, self.next_seq);
        let frame = wire::encode(&header, &[])?;
        self.ack_owed = false;
        self.telemetry.ack_sent();
        self.telemetry.frame_sent();
        tracing::trace!(ack = header.ack, "ack sent");
        self.write_out(&frame)
    }

    fn write_out(&mut self, frame: &[u8]) -> Result<(), ChannelError> {
        self.tx_buf.extend_from_slice(frame);
        self.flush_tx()
    }

    /// Push buffered bytes until the transport stops taking them.
    fn flush_tx(&mut self) -> Result<(), ChannelError> {
        while !self.tx_buf.is_empty() {
            let n = self.transport.send(&self.tx_buf)?;
            if n == 0 {
                tracing::trace!(unsent = self.tx_buf.len(), "transport busy, holding bytes");
                break;
            }
            self.tx_buf.advance(n);
        }
        Ok(())
    }

    /// Mark a delivered frame as processed, allowing it to be acknowledged.
    pub fn processed(&mut self, seq: u16) {
        let delivered_through = self.expected.wrapping_sub(1);
        if self.rx_synced
            && seq_before(self.ack_point, seq)
            && !seq_before(delivered_through, seq)
        {
            self.ack_point = seq;
            self.ack_owed = true;
        }
    }

    /// Send a bare acknowledgement if one is owed for processed frames.
    pub fn flush_ack(&mut self) -> Result<(), ChannelError> {
        if self.ack_owed {
            self.send_ack()?;
        }
        Ok(())
    }

    // ── Receive ───────────────────────────────────────────────────────────────

    /// Drain the transport and return newly deliverable frames in order.
    ///
    /// Errors only come from the transport before any frame is decoded, so a
    /// frame taken off the wire is always handed up.
    pub fn poll(&mut self) -> Result<Vec<Delivered>, ChannelError> {
        self.flush_tx()?;
        let mut scratch = [0u8; RECV_CHUNK];
        loop {
            let n = self.transport.recv(&mut scratch)?;
            if n == 0 {
                break;
            }
            self.rx_buf.extend_from_slice(&scratch[..n]);
        }

        let mut delivered = Vec::new();
        while self.rx_buf.len() >= HEADER_LEN + CRC_LEN {
            // Plausibility check before paying for the CRC or waiting on a
            // length read out of garbage.
            let declared = u16::from_le_bytes([self.rx_buf[8], self.rx_buf[9]]);
            if self.rx_buf[0] != PROTOCOL_VERSION
                || self.rx_buf[1] & !KNOWN_FLAGS != 0
                || declared > self.config.max_payload
            {
                self.rx_buf.advance(1);
                continue;
            }

            match wire::decode(&self.rx_buf).map(|(header, _)| header) {
                Ok(header) => {
                    let frame = self.rx_buf.split_to(header.frame_len()).freeze();
                    let payload = frame.slice(HEADER_LEN..HEADER_LEN + header.len as usize);
                    self.on_frame(header, payload, &mut delivered);
                }
                Err(WireError::Truncated { .. }) => break,
                Err(WireError::CrcMismatch { expected, actual }) => {
                    self.telemetry.crc_error();
                    tracing::warn!(
                        expected = format_args!("{expected:#010x}"),
                        actual = format_args!("{actual:#010x}"),
                        "corrupt frame discarded, resyncing"
                    );
                    self.rx_buf.advance(1);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "undecodable frame, resyncing");
                    self.rx_buf.advance(1);
                }
            }
        }
        Ok(delivered)
    }

    fn on_frame(&mut self, header: FrameHeader, payload: Bytes, out: &mut Vec<Delivered>) {
        self.telemetry.frame_received();
        self.peer_window = header.window.max(1);

        let ack_only = header.has_flag(FLAG_ACK_ONLY);
        let advanced = header.has_flag(FLAG_ACK_VALID) && self.apply_ack(header.ack);
        if advanced || ack_only {
            self.telemetry.ack_received();
        }
        if ack_only {
            return;
        }

        let seq = header.seq;
        if header.has_flag(FLAG_SYNC) && self.sync_base != Some(seq) {
            if self.rx_synced {
                tracing::warn!(seq, "peer restarted its channel, re-basing");
                self.reorder.clear();
                self.in_flight.clear();
                self.last_acked = self.next_seq.wrapping_sub(1);
                self.send_sync = true;
                self.peer_restarted = true;
            }
            self.rx_synced = true;
            self.sync_base = Some(seq);
            self.expected = seq;
            self.ack_point = seq.wrapping_sub(1);
            self.ack_owed = false;
        }
        if !self.rx_synced {
            tracing::debug!(seq, "frame before sync, dropped");
            return;
        }

        if seq == self.expected {
            self.deliver(Delivered { header, payload }, out);
            while let Some(next) = self.reorder.remove(&self.expected) {
                self.deliver(next, out);
            }
        } else if seq_before(seq, self.expected) {
            tracing::debug!(seq, expected = self.expected, "duplicate frame, re-acking");
            self.ack_owed = true;
        } else if seq.wrapping_sub(self.expected) < self.config.window as u16 {
            tracing::debug!(seq, expected = self.expected, "frame ahead of sequence, buffered");
            self.reorder.insert(seq, Delivered { header, payload });
        } else {
            tracing::debug!(seq, expected = self.expected, "frame beyond window, dropped");
        }
    }

    fn deliver(&mut self, frame: Delivered, out: &mut Vec<Delivered>) {
        tracing::debug!(
            seq = frame.header.seq,
            msg_type = frame.header.msg_type,
            len = frame.payload.len(),
            "frame delivered"
        );
        self.expected = self.expected.wrapping_add(1);
        out.push(frame);
    }

    /// Retire in-flight frames covered by a cumulative ack. Returns true if
    /// the ack moved forward.
    fn apply_ack(&mut self, ack: u16) -> bool {
        if !(seq_before(self.last_acked, ack) && seq_before(ack, self.next_seq)) {
            return false;
        }
        while let Some(front) = self.in_flight.front() {
            if seq_before(ack, front.seq) {
                break;
            }
            self.in_flight.pop_front();
        }
        self.last_acked = ack;
        true
    }

    // ── Timers ────────────────────────────────────────────────────────────────

    /// Retransmit overdue frames. Fails with `LinkLost` once a frame has used
    /// up its retries; the in-flight set is cleared when that happens.
    pub fn tick(&mut self, now: Instant) -> Result<(), ChannelError> {
        let base = self.config.retransmit_timeout;
        let max_retries = self.config.max_retries;
        let mut lost = false;
        let mut resend = Vec::new();

        for frame in self.in_flight.iter_mut() {
            if now < frame.deadline {
                continue;
            }
            if frame.retries >= max_retries {
                lost = true;
                break;
            }
            frame.retries += 1;
            frame.deadline = now + backoff(base, frame.retries);
            self.telemetry.timeout();
            tracing::warn!(seq = frame.seq, retry = frame.retries, "retransmitting frame");
            resend.push(frame.frame.clone());
        }

        if lost {
            tracing::warn!(
                in_flight = self.in_flight.len(),
                "retransmit limit reached, link lost"
            );
            self.in_flight.clear();
            self.last_acked = self.next_seq.wrapping_sub(1);
            return Err(ChannelError::LinkLost);
        }

        self.flush_tx()?;
        for frame in resend {
            if !self.tx_buf.is_empty() {
                tracing::debug!(unsent = self.tx_buf.len(), "transport backed up, retransmit deferred");
                break;
            }
            self.telemetry.frame_sent();
            self.write_out(&frame)?;
        }
        Ok(())
    }

    /// Forget all state and start over with a fresh initial sequence number.
    /// The next frame sent carries SYNC.
    pub fn reset(&mut self) {
        self.next_seq = rand::random::<u16>();
        self.last_acked = self.next_seq.wrapping_sub(1);
        self.peer_window = self.config.window;
        self.in_flight.clear();
        self.send_sync = true;
        self.rx_synced = false;
        self.sync_base = None;
        self.expected = 0;
        self.reorder.clear();
        self.ack_point = 0;
        self.ack_owed = false;
        self.peer_restarted = false;
        self.rx_buf.clear();
        self.tx_buf.clear();
    }
}
