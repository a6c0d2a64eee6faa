//! # IPC Channels Library
//!
//! Uniform message channels for processes that need to exchange discrete
//! byte messages without caring how the bytes travel. A [`Comm`] is a
//! single-direction channel over a pluggable transport; the transports
//! shipped here cover three very different distances:
//!
//! - **System V message queues** (`sysv`): kernel queues for processes on
//!   the same host, addressed by numeric key
//! - **AMQP queues** (`amqp`, optional feature): broker-hosted queues for
//!   processes on different hosts
//! - **In-process queues** (`mem`): plain buffers for tests and
//!   single-process wiring
//!
//! ## Architecture Overview
//!
//! The library is organized into several key modules:
//!
//! - `comm`: the channel type itself with its open/close lifecycle and
//!   send/recv operations
//! - `transport`: the `Transport` trait and the concrete backends
//! - `backlog`: per-comm buffering and the signalling between a comm and
//!   its background worker
//! - `context`: shared state (configuration, registry, transport pools)
//!   for one cooperating group of comms
//! - `registry`: keeps every created transport reachable by key until it
//!   is deliberately released
//! - `admin`: `ipcs`/`ipcrm` based inspection and cleanup of System V
//!   queues
//!
//! Every open comm runs one background worker that shuttles messages
//! between the transport and an in-memory backlog, so callers never stall
//! on a full or slow transport unless they ask to.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use ipc_channels::{Comm, CommContext, CommOptions, Direction, RecvResult, Timeout, TransportKind};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ctx = CommContext::new();
//!
//!     let tx = Comm::new(
//!         ctx.clone(),
//!         CommOptions::new("tx", Direction::Send, TransportKind::Memory),
//!     );
//!     tx.open().await?;
//!     let address = tx.address().unwrap();
//!
//!     let rx = Comm::new(
//!         ctx.clone(),
//!         CommOptions::new("rx", Direction::Recv, TransportKind::Memory).with_address(&address),
//!     );
//!     rx.open().await?;
//!
//!     tx.send(b"hello").await?;
//!     if let RecvResult::Payload(msg) = rx.recv(Timeout::Forever).await? {
//!         println!("got {} byte(s)", msg.len());
//!     }
//!
//!     rx.close(false).await?;
//!     tx.close(true).await?;
//!     ctx.shutdown().await;
//!     Ok(())
//! }
//! ```

/// System V queue administration
///
/// Shells out to `ipcs` and `ipcrm` to list and remove kernel message
/// queues, including ones left behind by processes that never closed.
pub mod admin;

/// Backlog buffers and worker signalling
///
/// The per-comm receive and send buffers, the ready/pending signals that
/// let callers wait on them, and the cancellation token that stops a
/// backlog worker.
pub mod backlog;

/// Command-line interface definitions for the utility binary
pub mod cli;

/// The channel type and its lifecycle
///
/// `Comm` ties a direction, a role and a transport together and carries
/// the open/bind/close(linger)/purge lifecycle plus the send and recv
/// operations.
pub mod comm;

/// Process-wide configuration with environment overrides
pub mod config;

/// Shared state for a cooperating group of comms
///
/// A `CommContext` owns the configuration, the transport registry and the
/// per-backend shared infrastructure (in-process broker, AMQP connection
/// pool). Independent contexts are fully isolated from each other.
pub mod context;

/// Error types shared across the crate
pub mod error;

/// The transport registry
///
/// Keeps one handle per transport key alive for the lifetime of the
/// context, so a resource can always be re-resolved and removed even if
/// the comm that created it is long gone.
pub mod registry;

/// Transport abstraction and backends
///
/// The `Transport` trait plus the System V queue, AMQP and in-process
/// implementations, and the typed outcomes (`Sent`/`Full`/`Gone`) they
/// report instead of errors.
pub mod transport;

// Re-export key types for convenient library usage

/// The channel itself and everything needed to construct and drive one
pub use comm::{Comm, CommOptions, Direction, RecvResult, Role, Timeout, EOF_MSG};

/// Process-wide configuration
pub use config::CommConfig;

/// Shared context for a group of comms
pub use context::CommContext;

/// Crate-wide error type
pub use error::CommError;

/// Registry keeping transports reachable by key
pub use registry::TransportRegistry;

/// Transport abstraction types
pub use transport::{RecvOutcome, RemoveOutcome, SendOutcome, Transport, TransportKind};

/// The current version of the library
///
/// Populated from Cargo.toml, reported by the utility binary's
/// `--version` flag.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
///
/// Defaults for every configurable parameter. All of them can be
/// overridden per context via [`CommConfig`], and most also via
/// `IPC_CHANNELS_*` environment variables.
pub mod defaults {
    use std::time::Duration;

    /// Default maximum payload size in bytes
    ///
    /// Sized for control-plane messages rather than bulk data, and safely
    /// below the kernel's per-message ceiling for System V queues on
    /// common configurations.
    pub const MAX_PAYLOAD: usize = 2048;

    /// Default polling interval for backlog workers
    ///
    /// How long an idle worker sleeps between transport polls. Lower
    /// values cut message latency at the cost of more wakeups.
    pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

    /// Default receive timeout
    ///
    /// Zero makes `recv` with [`Timeout::Default`](crate::Timeout) a
    /// non-blocking poll of the backlog; callers opt into waiting
    /// explicitly.
    pub const RECV_TIMEOUT: Duration = Duration::ZERO;

    /// Default drain timeout for lingering closes
    ///
    /// How long a close with `linger` waits for the send backlog to reach
    /// the transport before abandoning what is left.
    pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

    /// Default capacity of an in-process queue, in messages
    ///
    /// Kept small so tests exercise the transport-full path without
    /// having to push thousands of messages.
    pub const MEM_CAPACITY: usize = 64;

    /// Default AMQP broker URL
    ///
    /// A broker on localhost with the default vhost, matching a stock
    /// RabbitMQ installation.
    pub const AMQP_URL: &str = "amqp://127.0.0.1:5672/%2f";

    /// Default message count for the utility binary's self test
    pub const SELF_TEST_COUNT: usize = 100;

    /// Default payload size in bytes for the self test
    pub const SELF_TEST_MESSAGE_SIZE: usize = 64;
}
