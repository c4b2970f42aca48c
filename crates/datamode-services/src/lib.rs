//! datamode-services: the stateful parts of the data-mode link: transports,
//! the sequenced channel, the auth gate, storage and the crash-safe transfer
//! machine, plus the device and host engines that tie them together.

pub mod auth;
pub mod channel;
pub mod host;
pub mod journal;
pub mod link;
pub mod peripherals;
pub mod storage;
pub mod transfer;
pub mod transport;

pub use auth::{AuthGate, AuthState};
pub use channel::{ChannelConfig, ChannelError, Delivered, SequencedChannel};
pub use host::{HostError, HostSession};
pub use journal::{RecoveryOutcome, TransferJournal};
pub use link::{DeviceLink, LinkError};
pub use peripherals::{NoPeripherals, Peripherals, StorageDiagnostics};
pub use storage::{FileJournalStore, FsStorage, JournalStore, MemJournalStore, MemStorage, Storage};
pub use transfer::{TransferMachine, TransferState};
pub use transport::{LinkTransport, LoopbackTransport, NetworkTransport, SerialTransport, Transport};
