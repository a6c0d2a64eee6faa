use async_trait::async_trait;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod mem;
#[cfg(unix)]
pub mod sysv;

#[cfg(feature = "amqp")]
pub use amqp::{AmqpPool, AmqpTransport};
pub use mem::{MemBroker, MemTransport};
#[cfg(unix)]
pub use sysv::SysvQueueTransport;

/// Outcome of a single transport write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The transport accepted the message.
    Sent,
    /// The transport is at capacity right now; the message was not taken.
    Full,
    /// The underlying resource no longer exists.
    Gone,
}

/// Outcome of a single transport read attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvOutcome {
    /// A message was dequeued.
    Received(Vec<u8>),
    /// Nothing was pending.
    Empty,
    /// The underlying resource no longer exists.
    Gone,
}

/// Outcome of destroying a transport resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// This call destroyed the resource.
    Removed,
    /// Someone else already destroyed it.
    AlreadyGone,
}

/// A live handle onto one named message-queue resource.
///
/// Handles are cheap to share (`Arc<dyn Transport>`) and carry no direction:
/// the comm layer decides who reads and who writes. Busy and vanished
/// resources are reported through the outcome enums, never as errors, so
/// callers can route them without string matching.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable key naming the underlying resource. Doubles as the registry
    /// key and the address peers attach with.
    fn key(&self) -> &str;

    /// Largest payload a single message may carry on this backend.
    fn max_payload(&self) -> usize;

    /// Number of messages currently queued in the resource, or `None` when
    /// the resource no longer exists.
    async fn pending(&self) -> Result<Option<usize>>;

    /// One write attempt that never blocks. `Full` leaves the payload with
    /// the caller.
    async fn try_send(&self, payload: &[u8]) -> Result<SendOutcome>;

    /// Write that waits for capacity. Never reports `Full`.
    async fn send_wait(&self, payload: &[u8]) -> Result<SendOutcome>;

    /// One read attempt that never blocks.
    async fn try_recv(&self) -> Result<RecvOutcome>;

    /// Destroy the underlying resource. Idempotent at the backend: a second
    /// removal reports `AlreadyGone`.
    async fn remove(&self) -> Result<RemoveOutcome>;
}

/// Backend selection for a comm, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum TransportKind {
    /// System V message queue addressed by a numeric key
    #[clap(name = "sysv")]
    SysvQueue,

    /// In-process queue, visible only inside one process
    #[clap(name = "mem")]
    Memory,

    /// Queue on an AMQP broker (requires the `amqp` feature)
    #[clap(name = "amqp")]
    Amqp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::SysvQueue => write!(f, "System V queue"),
            TransportKind::Memory => write!(f, "in-process queue"),
            TransportKind::Amqp => write!(f, "AMQP queue"),
        }
    }
}
