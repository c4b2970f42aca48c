//! Byte transports the link runs over.
//!
//! Every transport is non-blocking: `recv` returning `Ok(0)` means "no data
//! right now", never end-of-stream. A peer that went away is reported as
//! `TransportError::Closed`. The concrete transport is picked once at
//! construction ([`LinkTransport`]); the channel is generic over the trait.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport not started")]
    NotStarted,
    #[error("peer closed the connection")]
    Closed,
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw byte pump.
pub trait Transport {
    /// Bring the transport up. Returns false if it cannot be used.
    fn begin(&mut self) -> bool;

    fn end(&mut self);

    /// Send bytes, returning how many were accepted.
    fn send(&mut self, bytes: &[u8]) -> Result<usize, TransportError>;

    /// Read whatever is available into `buf`. `Ok(0)` = nothing yet.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
}

fn would_block(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted)
}

// ── Serial ────────────────────────────────────────────────────────────────────

/// A tty device opened non-blocking. Line settings (baud, parity) belong to
/// the driver and are expected to be configured already.
pub struct SerialTransport {
    path: PathBuf,
    port: Option<File>,
}

impl SerialTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            port: None,
        }
    }
}

impl Transport for SerialTransport {
    fn begin(&mut self) -> bool {
        let mut options = OpenOptions::new();
        options.read(true).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY);
        }
        match options.open(&self.path) {
            Ok(port) => {
                tracing::info!(device = %self.path.display(), "serial transport open");
                self.port = Some(port);
                true
            }
            Err(e) => {
                tracing::warn!(device = %self.path.display(), error = %e, "failed to open serial device");
                false
            }
        }
    }

    fn end(&mut self) {
        self.port = None;
    }

    fn send(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotStarted)?;
        match port.write(bytes) {
            Ok(n) => Ok(n),
            Err(e) if would_block(&e) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotStarted)?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if would_block(&e) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

// ── Network ───────────────────────────────────────────────────────────────────

/// Non-blocking TCP. The device side listens and serves one peer at a time;
/// the host side connects.
///
/// Writes the socket cannot take yet are held and flushed on the next call,
/// so `send` accepts whole frames.
pub struct NetworkTransport {
    listener: Option<TcpListener>,
    connect_addr: Option<String>,
    stream: Option<TcpStream>,
    pending: Vec<u8>,
}

impl NetworkTransport {
    /// Device side: listen on `addr` and accept peers as they arrive.
    pub fn listen(addr: impl ToSocketAddrs) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        tracing::info!(addr = %listener.local_addr()?, "network transport listening");
        Ok(Self {
            listener: Some(listener),
            connect_addr: None,
            stream: None,
            pending: Vec::new(),
        })
    }

    /// Host side: connect to `addr` in `begin`.
    pub fn connect(addr: impl Into<String>) -> Self {
        Self {
            listener: None,
            connect_addr: Some(addr.into()),
            stream: None,
            pending: Vec::new(),
        }
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    fn accept_pending(&mut self) -> Result<(), TransportError> {
        let Some(listener) = &self.listener else {
            return Ok(());
        };
        if self.stream.is_some() {
            return Ok(());
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(true)?;
                stream.set_nodelay(true)?;
                tracing::info!(%peer, "peer connected");
                self.pending.clear();
                self.stream = Some(stream);
                Ok(())
            }
            Err(e) if would_block(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn drop_peer(&mut self) -> TransportError {
        self.stream = None;
        self.pending.clear();
        TransportError::Closed
    }

    fn flush_pending(&mut self) -> Result<(), TransportError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        while !self.pending.is_empty() {
            match stream.write(&self.pending) {
                Ok(0) => return Err(self.drop_peer()),
                Ok(n) => {
                    self.pending.drain(..n);
                }
                Err(e) if would_block(&e) => break,
                Err(e) if e.kind() == ErrorKind::BrokenPipe => return Err(self.drop_peer()),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl Transport for NetworkTransport {
    fn begin(&mut self) -> bool {
        let Some(addr) = self.connect_addr.clone() else {
            // Listening side is ready as soon as it is bound.
            return self.listener.is_some();
        };
        let stream = match TcpStream::connect(&addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(addr, error = %e, "connect failed");
                return false;
            }
        };
        if let Err(e) = stream.set_nonblocking(true).and_then(|_| stream.set_nodelay(true)) {
            tracing::warn!(addr, error = %e, "failed to configure socket");
            return false;
        }
        tracing::info!(addr, "connected");
        self.stream = Some(stream);
        true
    }

    fn end(&mut self) {
        self.stream = None;
        self.pending.clear();
    }

    fn send(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        self.accept_pending()?;
        if self.stream.is_none() {
            if self.listener.is_some() {
                // Nobody connected: the bytes go nowhere, retransmit covers it.
                return Ok(bytes.len());
            }
            return Err(TransportError::NotStarted);
        }
        self.pending.extend_from_slice(bytes);
        self.flush_pending()?;
        Ok(bytes.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.accept_pending()?;
        self.flush_pending()?;
        let Some(stream) = self.stream.as_mut() else {
            return if self.listener.is_some() {
                Ok(0)
            } else {
                Err(TransportError::NotStarted)
            };
        };
        match stream.read(buf) {
            Ok(0) => Err(self.drop_peer()),
            Ok(n) => Ok(n),
            Err(e) if would_block(&e) => Ok(0),
            Err(e) if e.kind() == ErrorKind::ConnectionReset => Err(self.drop_peer()),
            Err(e) => Err(e.into()),
        }
    }
}

// ── Selection ─────────────────────────────────────────────────────────────────

/// The transport chosen from config at startup.
pub enum LinkTransport {
    Serial(SerialTransport),
    Network(NetworkTransport),
}

impl Transport for LinkTransport {
    fn begin(&mut self) -> bool {
        match self {
            LinkTransport::Serial(t) => t.begin(),
            LinkTransport::Network(t) => t.begin(),
        }
    }

    fn end(&mut self) {
        match self {
            LinkTransport::Serial(t) => t.end(),
            LinkTransport::Network(t) => t.end(),
        }
    }

    fn send(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        match self {
            LinkTransport::Serial(t) => t.send(bytes),
            LinkTransport::Network(t) => t.send(bytes),
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self {
            LinkTransport::Serial(t) => t.recv(buf),
            LinkTransport::Network(t) => t.recv(buf),
        }
    }
}

// ── Loopback ──────────────────────────────────────────────────────────────────

/// Faults applied to frames sent from one end of a loopback pair.
#[derive(Debug, Default)]
pub struct Faults {
    /// Silently drop the next N sends.
    pub drop_sends: usize,
    /// Flip one bit in the next N sends.
    pub corrupt_sends: usize,
    /// Deliver the next N sends twice.
    pub duplicate_sends: usize,
    /// Drop everything until cleared.
    pub cut: bool,
    /// Fail the next N sends with an I/O error, taking nothing.
    pub fail_sends: usize,
}

type Pipe = Arc<Mutex<VecDeque<u8>>>;

/// In-memory transport pair for tests and simulations. Each `send` is one
/// unit for fault injection, which matches one frame from the channel.
#[derive(Clone)]
pub struct LoopbackTransport {
    inbox: Pipe,
    outbox: Pipe,
    faults: Arc<Mutex<Faults>>,
}

impl LoopbackTransport {
    pub fn pair() -> (Self, Self) {
        let a_to_b: Pipe = Arc::default();
        let b_to_a: Pipe = Arc::default();
        (
            Self {
                inbox: b_to_a.clone(),
                outbox: a_to_b.clone(),
                faults: Arc::default(),
            },
            Self {
                inbox: a_to_b,
                outbox: b_to_a,
                faults: Arc::default(),
            },
        )
    }

    /// Run `f` against the faults applied to this end's sends.
    pub fn with_faults<R>(&self, f: impl FnOnce(&mut Faults) -> R) -> R {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut faults)
    }

    /// Push raw bytes as if the peer had sent them, bypassing faults.
    pub fn inject(&self, bytes: &[u8]) {
        let mut inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
        inbox.extend(bytes.iter().copied());
    }

    /// Bytes waiting to be read by this end.
    pub fn pending(&self) -> usize {
        self.inbox.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Transport for LoopbackTransport {
    fn begin(&mut self) -> bool {
        true
    }

    fn end(&mut self) {}

    fn send(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        let fail = self.with_faults(|f| {
            let hit = f.fail_sends > 0;
            if hit {
                f.fail_sends -= 1;
            }
            hit
        });
        if fail {
            return Err(std::io::Error::other("injected send failure").into());
        }
        let copies = self.with_faults(|f| {
            if f.cut {
                return 0;
            }
            if f.drop_sends > 0 {
                f.drop_sends -= 1;
                return 0;
            }
            if f.duplicate_sends > 0 {
                f.duplicate_sends -= 1;
                return 2;
            }
            1
        });
        let corrupt = self.with_faults(|f| {
            let hit = copies > 0 && f.corrupt_sends > 0;
            if hit {
                f.corrupt_sends -= 1;
            }
            hit
        });

        let mut data = bytes.to_vec();
        if corrupt && !data.is_empty() {
            let mid = data.len() / 2;
            data[mid] ^= 0x10;
        }
        let mut outbox = self.outbox.lock().unwrap_or_else(|e| e.into_inner());
        for _ in 0..copies {
            outbox.extend(data.iter().copied());
        }
        Ok(bytes.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
        let n = buf.len().min(inbox.len());
        for (slot, byte) in buf.iter_mut().zip(inbox.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}
