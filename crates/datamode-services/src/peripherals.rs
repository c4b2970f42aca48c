//! Device-specific requests (diagnostics, audio, LEDs, logging). The link
//! gates them on auth and hands them here untouched.

use std::path::PathBuf;

use bytes::Bytes;
use datamode_core::{MsgType, NakCode};

use crate::storage::free_bytes;

#[derive(Debug, thiserror::Error)]
pub enum PeripheralError {
    #[error("{0:?} is not supported on this device")]
    Unsupported(MsgType),
    #[error("malformed {0:?} request")]
    Malformed(MsgType),
    #[error("peripheral i/o: {0}")]
    Io(String),
}

impl PeripheralError {
    pub fn nak_code(&self) -> NakCode {
        match self {
            PeripheralError::Unsupported(_) => NakCode::Unsupported,
            PeripheralError::Malformed(_) => NakCode::Malformed,
            PeripheralError::Io(_) => NakCode::IoError,
        }
    }
}

pub trait Peripherals {
    fn handle(&mut self, msg: MsgType, payload: &[u8]) -> Result<Bytes, PeripheralError>;
}

/// No hardware attached: everything is unsupported.
pub struct NoPeripherals;

impl Peripherals for NoPeripherals {
    fn handle(&mut self, msg: MsgType, _payload: &[u8]) -> Result<Bytes, PeripheralError> {
        Err(PeripheralError::Unsupported(msg))
    }
}

/// Diagnostics a hosted daemon can answer: free space under the storage
/// root (`DIAG_SD_FREE`, reply `free_bytes:8`).
pub struct StorageDiagnostics {
    root: PathBuf,
}

impl StorageDiagnostics {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Peripherals for StorageDiagnostics {
    fn handle(&mut self, msg: MsgType, payload: &[u8]) -> Result<Bytes, PeripheralError> {
        match msg {
            MsgType::DiagSdFree => {
                if !payload.is_empty() {
                    return Err(PeripheralError::Malformed(msg));
                }
                let free = free_bytes(&self.root).map_err(|e| PeripheralError::Io(e.to_string()))?;
                Ok(Bytes::copy_from_slice(&free.to_le_bytes()))
            }
            other => Err(PeripheralError::Unsupported(other)),
        }
    }
}
