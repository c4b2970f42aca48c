//! Device side of the link: channel, auth gate, transfer machine and
//! peripherals wired together and driven by a cooperative loop.
//!
//! The surrounding loop calls [`DeviceLink::service`] often (poll the
//! transport, dispatch, reply) and [`DeviceLink::tick`] periodically
//! (retransmits). Neither blocks.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use datamode_core::message::{AuthProve, DeviceInfo};
use datamode_core::wire::{FLAG_NAK, FLAG_RESPONSE, PROTOCOL_VERSION};
use datamode_core::{MsgType, NakCode, Telemetry};

use crate::auth::AuthGate;
use crate::channel::{ChannelError, Delivered, SequencedChannel};
use crate::journal::RecoveryOutcome;
use crate::peripherals::Peripherals;
use crate::storage::{JournalStore, Storage};
use crate::transfer::{TransferError, TransferMachine};
use crate::transport::{Transport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The link was reset; auth is cleared and the peer must start over.
    #[error("link lost")]
    LinkLost,
    #[error(transparent)]
    Channel(ChannelError),
}

struct Outgoing {
    msg_type: u8,
    flags: u8,
    payload: Bytes,
}

impl Outgoing {
    fn reply(msg_type: u8, payload: Bytes) -> Self {
        Self {
            msg_type,
            flags: FLAG_RESPONSE,
            payload,
        }
    }

    fn nak(msg_type: u8, code: NakCode) -> Self {
        Self {
            msg_type,
            flags: FLAG_RESPONSE | FLAG_NAK,
            payload: Bytes::copy_from_slice(&[u8::from(code)]),
        }
    }
}

pub struct DeviceLink<T, S, J, P> {
    channel: SequencedChannel<T>,
    auth: AuthGate,
    transfers: TransferMachine<S, J>,
    peripherals: P,
    telemetry: Arc<Telemetry>,
    outbox: VecDeque<Outgoing>,
}

impl<T, S, J, P> DeviceLink<T, S, J, P>
where
    T: Transport,
    S: Storage,
    J: JournalStore,
    P: Peripherals,
{
    pub fn new(
        channel: SequencedChannel<T>,
        auth: AuthGate,
        transfers: TransferMachine<S, J>,
        peripherals: P,
    ) -> Self {
        let telemetry = channel.telemetry().clone();
        Self {
            channel,
            auth,
            transfers,
            peripherals,
            telemetry,
            outbox: VecDeque::new(),
        }
    }

    pub fn auth(&self) -> &AuthGate {
        &self.auth
    }

    pub fn transfers(&self) -> &TransferMachine<S, J> {
        &self.transfers
    }

    pub fn channel(&self) -> &SequencedChannel<T> {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut SequencedChannel<T> {
        &mut self.channel
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    /// Replay the journal. Call once before serving.
    pub fn recover(&mut self) -> Result<RecoveryOutcome, TransferError> {
        let outcome = self.transfers.recover()?;
        tracing::info!(?outcome, "startup recovery complete");
        Ok(outcome)
    }

    pub fn info(&self) -> DeviceInfo {
        let config = self.channel.config();
        DeviceInfo {
            protocol_version: PROTOCOL_VERSION,
            window: config.window,
            max_payload: config.max_payload,
            authenticated: self.auth.is_authenticated(),
            transfer_state: self.transfers.state().as_str().to_string(),
            telemetry: self.telemetry.snapshot(),
        }
    }

    /// Receive, dispatch and answer everything that has arrived. Every
    /// delivered frame is dispatched even if sending a reply fails part way;
    /// the first send error is returned afterwards.
    pub fn service(&mut self, now: Instant) -> Result<(), LinkError> {
        let delivered = match self.channel.poll() {
            Ok(d) => d,
            Err(e) => return Err(self.channel_failed(e)),
        };
        if self.channel.take_peer_restart() {
            tracing::info!("peer started a new session, dropping auth");
            self.auth.reset();
            self.outbox.clear();
        }

        let mut failure = None;
        for frame in delivered {
            let reply = self.dispatch(&frame);
            self.channel.processed(frame.header.seq);
            self.outbox.extend(reply);
            if failure.is_none() {
                failure = self.flush_outbox(now).err();
            }
        }

        let flushed = match failure {
            Some(e) => Err(e),
            None => self.channel.flush_ack(),
        };
        flushed.map_err(|e| self.channel_failed(e))
    }

    /// Retransmit overdue frames and push out queued replies.
    pub fn tick(&mut self, now: Instant) -> Result<(), LinkError> {
        self.channel
            .tick(now)
            .and_then(|()| self.flush_outbox(now))
            .map_err(|e| self.channel_failed(e))
    }

    /// Drop the session: auth, channel state and queued replies. The transfer
    /// context and journal are kept so the peer can resume.
    pub fn reset(&mut self) {
        self.auth.reset();
        self.channel.reset();
        self.outbox.clear();
    }

    fn channel_failed(&mut self, e: ChannelError) -> LinkError {
        match e {
            ChannelError::LinkLost | ChannelError::Transport(TransportError::Closed) => {
                tracing::warn!(error = %e, "link lost, resetting session");
                self.reset();
                LinkError::LinkLost
            }
            other => LinkError::Channel(other),
        }
    }

    fn flush_outbox(&mut self, now: Instant) -> Result<(), ChannelError> {
        while self.channel.can_send() {
            let Some(out) = self.outbox.pop_front() else {
                break;
            };
            match self.channel.send(out.msg_type, out.flags, &out.payload, now) {
                Ok(_) => {}
                Err(ChannelError::PayloadTooLarge(len, max)) => {
                    tracing::warn!(msg_type = out.msg_type, len, max, "reply too large, dropped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, frame: &Delivered) -> Option<Outgoing> {
        let raw = frame.header.msg_type;
        if frame.header.has_flag(FLAG_RESPONSE) {
            tracing::debug!(msg_type = raw, "unexpected response frame ignored");
            return None;
        }
        let Ok(msg) = MsgType::try_from(raw) else {
            tracing::warn!(msg_type = raw, "unknown message type");
            return Some(Outgoing::nak(raw, NakCode::Unsupported));
        };
        let payload = &frame.payload;

        let result: Result<Bytes, NakCode> = match msg {
            MsgType::CtrlGetInfo => self
                .info()
                .to_bytes()
                .map(Bytes::from)
                .map_err(|_| NakCode::IoError),
            MsgType::AuthInit => Ok(Bytes::copy_from_slice(&self.auth.begin_handshake())),
            MsgType::AuthProve => match AuthProve::decode(payload) {
                Ok(prove) if self.auth.verify(&prove.token, &prove.proof) => Ok(Bytes::new()),
                Ok(_) => Err(NakCode::AuthFailed),
                Err(e) => {
                    tracing::warn!(error = %e, "malformed auth proof");
                    self.auth.reset();
                    Err(NakCode::Malformed)
                }
            },
            m if m.is_transfer() => self
                .transfers
                .handle(&self.auth, m, payload)
                .map_err(|e| {
                    tracing::warn!(msg = ?m, error = %e, "transfer request refused");
                    e.nak_code()
                }),
            m => {
                if self.auth.is_authenticated() {
                    self.peripherals.handle(m, payload).map_err(|e| {
                        tracing::debug!(msg = ?m, error = %e, "peripheral request refused");
                        e.nak_code()
                    })
                } else {
                    Err(NakCode::NotAuthenticated)
                }
            }
        };

        Some(match result {
            Ok(reply) => Outgoing::reply(raw, reply),
            Err(code) => Outgoing::nak(raw, code),
        })
    }
}
