//! Data-mode integration test harness.
//!
//! Each test runs a real device link (filesystem storage and journal in a
//! temp dir) on its own thread and drives it with a host session over an
//! in-memory transport pair. Faults are injected per direction on the
//! loopback ends.
//!
//!   cargo test --test integration
//!
//! "Power loss" is modelled by stopping the device thread and dropping the
//! link without any shutdown path, then building a new one on the same dir.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use datamode_core::crypto::{SharedSecret, SECRET_LEN};
use datamode_core::Telemetry;
use datamode_services::{
    AuthGate, ChannelConfig, DeviceLink, FileJournalStore, FsStorage, HostSession,
    LoopbackTransport, SequencedChannel, StorageDiagnostics, TransferJournal, TransferMachine,
};
use tempfile::TempDir;

mod auth;
mod link_faults;
mod power_loss;
mod transfer;

// ── Harness ───────────────────────────────────────────────────────────────────

pub type Device = DeviceLink<LoopbackTransport, FsStorage, FileJournalStore, StorageDiagnostics>;

pub const TOKEN: &[u8] = b"it-host";

pub fn secret() -> SharedSecret {
    SharedSecret::from_bytes([0x42; SECRET_LEN])
}

pub fn link_config() -> ChannelConfig {
    ChannelConfig {
        window: 4,
        retransmit_timeout: Duration::from_millis(20),
        max_retries: 6,
        max_payload: 1024,
    }
}

pub fn files_dir(dir: &Path) -> PathBuf {
    dir.join("files")
}

pub fn journal_path(dir: &Path) -> PathBuf {
    dir.join("journal.bin")
}

/// Build a device on `dir`. Does not replay the journal.
pub fn build_device(dir: &Path, wire: LoopbackTransport) -> Device {
    let storage = FsStorage::new(files_dir(dir)).expect("storage root");
    let journal = FileJournalStore::open(journal_path(dir)).expect("journal file");
    DeviceLink::new(
        SequencedChannel::new(wire, link_config(), Telemetry::shared()),
        AuthGate::new(secret()),
        TransferMachine::new(storage, TransferJournal::new(journal)),
        StorageDiagnostics::new(files_dir(dir)),
    )
}

pub fn host_session(wire: LoopbackTransport) -> HostSession<LoopbackTransport> {
    HostSession::new(SequencedChannel::new(wire, link_config(), Telemetry::shared()))
        .with_timeout(Duration::from_secs(3))
}

/// A device link serviced on a background thread.
pub struct RunningDevice {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<Device>>,
}

impl RunningDevice {
    pub fn start(mut device: Device) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::Relaxed) {
                let now = Instant::now();
                // LinkLost is part of the scenarios; the link resets itself.
                let _ = device.service(now);
                let _ = device.tick(now);
                thread::sleep(Duration::from_millis(1));
            }
            device
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stop servicing and hand the link back for inspection.
    pub fn stop(mut self) -> Device {
        self.stop.store(true, Ordering::Relaxed);
        self.handle
            .take()
            .expect("device already stopped")
            .join()
            .expect("device thread panicked")
    }
}

impl Drop for RunningDevice {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Field order matters: the device thread stops before the temp dir goes.
pub struct Rig {
    pub device: RunningDevice,
    pub host: HostSession<LoopbackTransport>,
    pub host_wire: LoopbackTransport,
    pub device_wire: LoopbackTransport,
    pub dir: TempDir,
}

/// Fresh device (journal replayed) plus a connected, unauthenticated host.
pub fn rig() -> Rig {
    let dir = tempfile::tempdir().expect("tempdir");
    let (host_wire, device_wire) = LoopbackTransport::pair();
    let mut device = build_device(dir.path(), device_wire.clone());
    device.recover().expect("recovery");
    Rig {
        device: RunningDevice::start(device),
        host: host_session(host_wire.clone()),
        host_wire,
        device_wire,
        dir,
    }
}

impl Rig {
    pub fn authenticated() -> Rig {
        let mut rig = rig();
        rig.host.authenticate(&secret(), TOKEN).expect("authenticate");
        rig
    }

    pub fn published(&self, remote: &str) -> Option<Vec<u8>> {
        std::fs::read(files_dir(self.dir.path()).join(remote)).ok()
    }

    pub fn staged_exists(&self, remote: &str) -> bool {
        files_dir(self.dir.path())
            .join(format!("{remote}.part"))
            .exists()
    }
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// The NAK code inside a host error, if that is what it was.
pub fn nak_code(err: &anyhow::Error) -> Option<datamode_core::NakCode> {
    match err.downcast_ref::<datamode_services::HostError>() {
        Some(datamode_services::HostError::Nak { code, .. }) => Some(*code),
        _ => None,
    }
}
