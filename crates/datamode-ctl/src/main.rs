//! datamode-ctl: host-side tool for a device in data mode.

use std::time::Duration;

use anyhow::{Context, Result};

use datamode_core::config::DataModeConfig;
use datamode_core::crypto::SharedSecret;
use datamode_core::Telemetry;
use datamode_services::transport::Transport;
use datamode_services::{ChannelConfig, HostSession, NetworkTransport, SequencedChannel};

const DEFAULT_CHUNK: usize = 512;

// ── Connection ────────────────────────────────────────────────────────────────

fn connect(config: &DataModeConfig, addr: &str) -> Result<HostSession<NetworkTransport>> {
    let mut transport = NetworkTransport::connect(addr);
    if !transport.begin() {
        anyhow::bail!("failed to connect to device at {addr}, is datamoded running?");
    }
    let channel = SequencedChannel::new(
        transport,
        ChannelConfig::from(&config.link),
        Telemetry::shared(),
    );
    Ok(HostSession::new(channel).with_timeout(Duration::from_secs(10)))
}

fn secret(config: &DataModeConfig) -> Result<SharedSecret> {
    if config.auth.secret_hex.is_empty() {
        anyhow::bail!("auth.secret_hex is not set in {}", DataModeConfig::file_path().display());
    }
    SharedSecret::from_hex(&config.auth.secret_hex).context("invalid auth.secret_hex")
}

fn authenticated(config: &DataModeConfig, addr: &str) -> Result<HostSession<NetworkTransport>> {
    let mut session = connect(config, addr)?;
    session
        .authenticate(&secret(config)?, config.auth.token.as_bytes())
        .context("authentication failed")?;
    Ok(session)
}

// ── Subcommand handlers ───────────────────────────────────────────────────────

fn cmd_info(config: &DataModeConfig, addr: &str, json: bool) -> Result<()> {
    let info = connect(config, addr)?.info()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    let t = &info.telemetry;
    println!("═══════════════════════════════════════");
    println!("  Device Info");
    println!("═══════════════════════════════════════");
    println!("  Protocol version : {}", info.protocol_version);
    println!("  Window           : {}", info.window);
    println!("  Max payload      : {} bytes", info.max_payload);
    println!("  Authenticated    : {}", info.authenticated);
    println!("  Transfer state   : {}", info.transfer_state);
    println!();
    println!("  Frames tx / rx   : {} / {}", t.frames_tx, t.frames_rx);
    println!("  Acks tx / rx     : {} / {}", t.acks_tx, t.acks_rx);
    println!("  CRC errors       : {}", t.crc_errors);
    println!("  Timeouts         : {}", t.timeouts);
    Ok(())
}

fn cmd_push(
    config: &DataModeConfig,
    addr: &str,
    local: &str,
    remote: &str,
    chunk: usize,
) -> Result<()> {
    let data = std::fs::read(local).with_context(|| format!("failed to read file: {local}"))?;
    let mut session = authenticated(config, addr)?;
    let id = session.push(remote, &data, chunk)?;
    println!("Committed {} ({} bytes) as transfer {}.", remote, data.len(), id);
    Ok(())
}

fn cmd_resume(config: &DataModeConfig, addr: &str, id: u16) -> Result<()> {
    let offset = authenticated(config, addr)?.resume(id)?;
    println!("Transfer {id} resumable from offset {offset}.");
    Ok(())
}

fn cmd_abort(config: &DataModeConfig, addr: &str) -> Result<()> {
    authenticated(config, addr)?.abort()?;
    println!("Transfer aborted.");
    Ok(())
}

fn cmd_sd_free(config: &DataModeConfig, addr: &str) -> Result<()> {
    let free = authenticated(config, addr)?.sd_free()?;
    println!("Free: {} bytes ({:.1} MB)", free, free as f64 / (1024.0 * 1024.0));
    Ok(())
}

fn cmd_keygen() -> Result<()> {
    let secret = SharedSecret::generate();
    println!("{}", secret.to_hex().as_str());
    Ok(())
}

fn print_usage() {
    println!("Usage: datamode-ctl [--addr <host:port>] [--chunk <bytes>] <command>");
    println!();
    println!("Commands:");
    println!("  info [--json]          Show device info and link counters");
    println!("  push <local> <remote>  Send a file and commit it on the device");
    println!("  resume <id>            Rebuild an interrupted transfer on the device");
    println!("  abort                  Abort the device's current transfer");
    println!("  sd-free                Show free storage on the device");
    println!("  keygen                 Print a fresh shared secret");
    println!();
    println!("Options:");
    println!("  --addr <host:port>   Device address (default: transport.connect_addr)");
    println!("  --chunk <bytes>      File chunk size (default: {})", DEFAULT_CHUNK);
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = DataModeConfig::load().context("failed to load config")?;

    let mut addr = config.transport.connect_addr.clone();
    let mut chunk = DEFAULT_CHUNK;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" => {
                i += 1;
                addr = args.get(i).context("--addr requires a value")?.clone();
            }
            "--chunk" => {
                i += 1;
                chunk = args
                    .get(i)
                    .context("--chunk requires a value")?
                    .parse()
                    .context("--chunk must be a number")?;
            }
            other => remaining.push(other),
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["info"] | [] => cmd_info(&config, &addr, false),
        ["info", "--json"] => cmd_info(&config, &addr, true),
        ["push", local, remote] => cmd_push(&config, &addr, local, remote, chunk),
        ["resume", id] => {
            let id = id.parse().context("transfer id must be a number")?;
            cmd_resume(&config, &addr, id)
        }
        ["abort"] => cmd_abort(&config, &addr),
        ["sd-free"] => cmd_sd_free(&config, &addr),
        ["keygen"] => cmd_keygen(),
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
