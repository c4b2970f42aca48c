//! Link counters. Shared by `Arc` between the components that update them;
//! read through [`Telemetry::snapshot`] for diagnostics. Nothing branches on
//! these values.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct Telemetry {
    frames_tx: AtomicU32,
    frames_rx: AtomicU32,
    acks_tx: AtomicU32,
    acks_rx: AtomicU32,
    crc_errors: AtomicU32,
    timeouts: AtomicU32,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub frames_tx: u32,
    pub frames_rx: u32,
    pub acks_tx: u32,
    pub acks_rx: u32,
    pub crc_errors: u32,
    pub timeouts: u32,
}

impl Telemetry {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frame_sent(&self) {
        self.frames_tx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_received(&self) {
        self.frames_rx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ack_sent(&self) {
        self.acks_tx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ack_received(&self) {
        self.acks_rx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn crc_error(&self) {
        self.crc_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            frames_tx: self.frames_tx.load(Ordering::Relaxed),
            frames_rx: self.frames_rx.load(Ordering::Relaxed),
            acks_tx: self.acks_tx.load(Ordering::Relaxed),
            acks_rx: self.acks_rx.load(Ordering::Relaxed),
            crc_errors: self.crc_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.frames_tx,
            &self.frames_rx,
            &self.acks_tx,
            &self.acks_rx,
            &self.crc_errors,
            &self.timeouts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_reset() {
        let t = Telemetry::shared();
        t.frame_sent();
        t.frame_sent();
        t.crc_error();
        t.timeout();
        let snap = t.snapshot();
        assert_eq!(snap.frames_tx, 2);
        assert_eq!(snap.crc_errors, 1);
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.acks_rx, 0);

        t.reset();
        assert_eq!(t.snapshot(), TelemetrySnapshot::default());
    }
}
