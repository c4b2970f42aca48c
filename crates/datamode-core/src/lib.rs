//! datamode-core: wire format, message payloads, and proof primitives for
//! the device data-mode link. All other datamode crates depend on this one.
//!
//! Nothing in here performs I/O except `config`, which reads its TOML file.

pub mod config;
pub mod crypto;
pub mod message;
pub mod telemetry;
pub mod wire;

pub use telemetry::{Telemetry, TelemetrySnapshot};
pub use wire::{FrameHeader, MsgType, NakCode, WireError};
