//! datamoded: device-side data-mode daemon.
//!
//! Serves one link (serial or TCP) with the sequenced channel, auth gate and
//! crash-safe transfer machine. The journal is replayed before serving.

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use datamode_core::config::DataModeConfig;
use datamode_core::config::TransportKind;
use datamode_core::crypto::SharedSecret;
use datamode_core::Telemetry;
use datamode_services::transport::Transport;
use datamode_services::{
    AuthGate, ChannelConfig, DeviceLink, FileJournalStore, FsStorage, LinkError, LinkTransport,
    NetworkTransport, SequencedChannel, SerialTransport, StorageDiagnostics, TransferJournal,
    TransferMachine,
};

const SERVICE_INTERVAL: Duration = Duration::from_millis(5);
const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Use the configured secret, or generate one and persist it so the host
/// tool can read it from the same config file.
fn load_secret(config: &mut DataModeConfig) -> Result<SharedSecret> {
    if !config.auth.secret_hex.is_empty() {
        return SharedSecret::from_hex(&config.auth.secret_hex).context("invalid auth.secret_hex");
    }
    let secret = SharedSecret::generate();
    config.auth.secret_hex = secret.to_hex().to_string();
    let path = DataModeConfig::file_path();
    config
        .save_to(&path)
        .with_context(|| format!("failed to persist generated secret to {}", path.display()))?;
    tracing::warn!(path = %path.display(), "no shared secret configured, generated one");
    Ok(secret)
}

fn open_transport(config: &DataModeConfig) -> Result<LinkTransport> {
    let mut transport = match config.transport.kind {
        TransportKind::Serial => {
            LinkTransport::Serial(SerialTransport::new(&config.transport.serial_device))
        }
        TransportKind::Network => LinkTransport::Network(
            NetworkTransport::listen(config.transport.listen_addr.as_str()).with_context(|| {
                format!("failed to listen on {}", config.transport.listen_addr)
            })?,
        ),
    };
    if !transport.begin() {
        bail!("transport {:?} failed to start", config.transport.kind);
    }
    Ok(transport)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = DataModeConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = DataModeConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        DataModeConfig::default()
    });
    let secret = load_secret(&mut config)?;

    // Storage and journal
    let storage = FsStorage::new(&config.storage.root)
        .with_context(|| format!("failed to open storage {}", config.storage.root.display()))?;
    let journal = FileJournalStore::open(&config.storage.journal_path).with_context(|| {
        format!("failed to open journal {}", config.storage.journal_path.display())
    })?;
    tracing::info!(
        root = %config.storage.root.display(),
        journal = %config.storage.journal_path.display(),
        "storage ready"
    );

    // Link
    let transport = open_transport(&config)?;
    let channel = SequencedChannel::new(
        transport,
        ChannelConfig::from(&config.link),
        Telemetry::shared(),
    );
    let mut link = DeviceLink::new(
        channel,
        AuthGate::new(secret),
        TransferMachine::new(storage, TransferJournal::new(journal)),
        StorageDiagnostics::new(&config.storage.root),
    );
    link.recover().context("journal recovery failed")?;
    tracing::info!(kind = ?config.transport.kind, "datamoded serving");

    // ── Service loop ─────────────────────────────────────────────────────────

    let mut service = tokio::time::interval(SERVICE_INTERVAL);
    let mut tick = tokio::time::interval(TICK_INTERVAL);
    let mut stats = tokio::time::interval(Duration::from_secs(30));

    loop {
        tokio::select! {
            _ = service.tick() => {
                match link.service(Instant::now()) {
                    Ok(()) | Err(LinkError::LinkLost) => {}
                    Err(e) => tracing::error!(error = %e, "service failed"),
                }
            }
            _ = tick.tick() => {
                match link.tick(Instant::now()) {
                    Ok(()) | Err(LinkError::LinkLost) => {}
                    Err(e) => tracing::error!(error = %e, "tick failed"),
                }
            }
            _ = stats.tick() => {
                let t = link.telemetry().snapshot();
                tracing::info!(
                    frames_tx = t.frames_tx,
                    frames_rx = t.frames_rx,
                    crc_errors = t.crc_errors,
                    timeouts = t.timeouts,
                    "link stats"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }

    link.channel_mut().transport_mut().end();
    Ok(())
}
