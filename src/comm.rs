use crate::backlog::{Backlog, CancelToken};
use crate::context::CommContext;
use crate::error::{CommError, Result};
use crate::transport::{RecvOutcome, RemoveOutcome, SendOutcome, Transport, TransportKind};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// End-of-stream sentinel payload. It travels the same backlog and
/// transport path as any other message; receivers test for it with
/// [`RecvResult::is_eof`].
pub const EOF_MSG: &[u8] = b"EOF!!!";

/// Message direction a comm is constructed for. Fixed for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Recv,
}

/// Who owns the comm: a direct caller inside model code, or internal
/// plumbing.
///
/// Interface comms favor immediate blocking delivery because their process
/// has nothing better to do until the message is accepted; driver comms
/// favor buffering so the owning component never stalls on transport
/// capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Interface,
    Driver,
}

/// Outcome of a receive attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvResult {
    /// A message arrived.
    Payload(Vec<u8>),
    /// Nothing was available before the timeout; poll again.
    Empty,
    /// The comm or its transport is closed; no more messages will come.
    Closed,
}

impl RecvResult {
    /// True when the payload is the end-of-stream sentinel.
    pub fn is_eof(&self) -> bool {
        matches!(self, RecvResult::Payload(payload) if payload.as_slice() == EOF_MSG)
    }
}

/// How long `recv` may wait for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Use the configured `recv_timeout` (zero by default, i.e. poll).
    Default,
    /// Wait until a message arrives or the comm closes.
    Forever,
    /// Wait at most this long.
    Bounded(Duration),
}

/// Construction parameters for a [`Comm`].
#[derive(Debug, Clone)]
pub struct CommOptions {
    /// Identifier used in logs and diagnostics.
    pub name: String,
    /// Existing resource key to attach to. `None` asks `bind` to create a
    /// fresh resource and adopt its key as the address.
    pub address: Option<String>,
    pub direction: Direction,
    pub role: Role,
    pub kind: TransportKind,
}

impl CommOptions {
    pub fn new(name: impl Into<String>, direction: Direction, kind: TransportKind) -> Self {
        Self {
            name: name.into(),
            address: None,
            direction,
            role: Role::Driver,
            kind,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }
}

struct CommState {
    address: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    /// The comm created its own resource via a generated bind and owns it.
    bound: bool,
    /// A backlog worker is running for this comm.
    backlog_open: bool,
    /// `open` was performed, successfully or degraded; the comm is past
    /// construction.
    opened: bool,
    worker: Option<JoinHandle<()>>,
    /// Break flag for the worker loop. Cancelled on close; reopening
    /// installs a fresh one so the next worker starts with a live flag.
    cancel: CancelToken,
}

/// Everything the comm and its backlog worker share. The worker holds its
/// own `Arc`, so it can outlive the caller-facing handle and finish the
/// close on its own.
struct CommShared {
    name: String,
    direction: Direction,
    role: Role,
    kind: TransportKind,
    ctx: Arc<CommContext>,
    backlog: Backlog,
    /// Raised when the caller-facing handle is dropped.
    owner_gone: CancelToken,
    state: Mutex<CommState>,
}

enum FlushStep {
    Flushed,
    Idle,
    Stop,
}

/// A single-direction message channel over a pluggable transport.
///
/// Every open comm carries one background worker that moves messages
/// between the transport and an in-memory backlog, decoupling the caller's
/// pace from the transport's capacity. Dropping the handle without closing
/// hands the shutdown to the worker: interface senders drain what was
/// accepted, everything else closes immediately.
pub struct Comm {
    shared: Arc<CommShared>,
}

impl Comm {
    /// Construct an unopened comm. No transport I/O happens here.
    pub fn new(ctx: Arc<CommContext>, options: CommOptions) -> Self {
        Self {
            shared: Arc::new(CommShared {
                name: options.name,
                direction: options.direction,
                role: options.role,
                kind: options.kind,
                ctx,
                backlog: Backlog::new(),
                owner_gone: CancelToken::new(),
                state: Mutex::new(CommState {
                    address: options.address,
                    transport: None,
                    bound: false,
                    backlog_open: false,
                    opened: false,
                    worker: None,
                    cancel: CancelToken::new(),
                }),
            }),
        }
    }

    /// Ensure a concrete transport resource exists behind the address.
    ///
    /// With no preset address this creates a fresh resource and adopts its
    /// key; with an explicit address it is a no-op (the resource is
    /// attached lazily by [`open`](Self::open)).
    pub async fn bind(&self) -> Result<()> {
        if self.shared.state.lock().address.is_some() {
            return Ok(());
        }
        let transport = self.shared.ctx.create_transport(self.shared.kind).await?;
        let key = transport.key().to_string();
        debug!(
            "Comm '{}' bound a new {} at '{}'",
            self.shared.name, self.shared.kind, key
        );
        let mut state = self.shared.state.lock();
        state.address = Some(key);
        state.bound = true;
        Ok(())
    }

    /// Open the comm: bind if needed, attach the transport behind the
    /// address, then start the backlog worker. Idempotent when already
    /// open.
    ///
    /// A closed comm that still has an address can go back into service
    /// the same way, provided the resource survived the close; anything
    /// left in its buffers stays consumable.
    pub async fn open(&self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        self.bind().await?;

        let (address, bound) = {
            let state = self.shared.state.lock();
            (state.address.clone(), state.bound)
        };
        let Some(address) = address else {
            return Err(CommError::ContractViolation("open on a comm with no address"));
        };

        match self
            .shared
            .ctx
            .attach_transport(self.shared.kind, &address)
            .await?
        {
            Some(transport) => {
                let mut state = self.shared.state.lock();
                if state.cancel.is_cancelled() {
                    // Reopening after a close. The latched break flag and
                    // the raised wake-up signals from the teardown would
                    // stop the fresh worker before its first poll.
                    state.cancel = CancelToken::new();
                    self.shared.backlog.resync();
                }
                state.transport = Some(transport);
                state.opened = true;
            }
            None if bound => {
                // The resource this comm created vanished before open. Not
                // an error: the comm just degrades to unbound and closed.
                warn!(
                    "Comm '{}' lost its bound resource '{}' before opening",
                    self.shared.name, address
                );
                let mut state = self.shared.state.lock();
                state.address = None;
                state.bound = false;
                state.opened = true;
                return Ok(());
            }
            None => return Err(CommError::TransportGone { key: address }),
        }

        self.start_worker();
        debug!(
            "Comm '{}' ({:?}/{:?}) open at '{}'",
            self.shared.name, self.shared.direction, self.shared.role, address
        );
        Ok(())
    }

    fn start_worker(&self) {
        let mut state = self.shared.state.lock();
        if state.backlog_open {
            return;
        }
        state.backlog_open = true;
        let shared = Arc::clone(&self.shared);
        state.worker = Some(tokio::spawn(async move {
            match shared.direction {
                Direction::Recv => shared.run_backlog_recv().await,
                Direction::Send => shared.run_backlog_send().await,
            }
        }));
    }

    /// Close the comm, stopping the backlog worker and releasing the
    /// transport. Idempotent.
    ///
    /// With `linger` the send backlog is first given `drain_timeout` to
    /// flush, and the transport resource is left in place for a peer that
    /// may still be draining it. Without `linger` the resource is removed
    /// and whatever is still buffered may be discarded.
    pub async fn close(&self, linger: bool) -> Result<()> {
        self.shared.close_inner(linger).await
    }

    /// Drop everything buffered locally and everything physically queued in
    /// the transport, leaving the comm open and quiet.
    pub async fn purge(&self) -> Result<()> {
        self.shared.purge_inner().await
    }

    /// Send one message. `Ok(true)` means the message was accepted (into
    /// the transport or the send backlog); `Ok(false)` means the comm or
    /// its transport is closed.
    pub async fn send(&self, payload: &[u8]) -> Result<bool> {
        self.shared.send_inner(payload, false).await
    }

    /// Send directly to the transport, bypassing the backlog. A full
    /// transport surfaces as [`CommError::TransportFull`] instead of being
    /// absorbed.
    pub async fn send_nowait(&self, payload: &[u8]) -> Result<bool> {
        self.shared.send_inner(payload, true).await
    }

    /// Send the end-of-stream sentinel through the ordinary path.
    pub async fn send_eof(&self) -> Result<bool> {
        self.send(EOF_MSG).await
    }

    /// Receive one message, waiting up to the given timeout for the backlog
    /// worker to produce one.
    pub async fn recv(&self, timeout: Timeout) -> Result<RecvResult> {
        self.shared.recv_inner(timeout).await
    }

    /// One direct look at the transport, bypassing the backlog and never
    /// waiting.
    pub async fn recv_nowait(&self) -> Result<RecvResult> {
        if self.shared.direction != Direction::Recv {
            return Err(CommError::ContractViolation("recv on a send comm"));
        }
        if !self.shared.state.lock().opened {
            return Err(CommError::ContractViolation(
                "recv on a comm that was never opened",
            ));
        }
        self.shared.recv_direct().await
    }

    /// Messages physically queued in the transport right now. Zero when the
    /// comm holds no live transport.
    pub async fn pending_in_transport(&self) -> Result<usize> {
        let transport = self.shared.state.lock().transport.clone();
        match transport {
            Some(transport) => Ok(transport.pending().await?.unwrap_or(0)),
            None => Ok(0),
        }
    }

    /// Advisory per-message payload ceiling of the attached transport,
    /// `None` when the comm holds no live transport. Oversized sends are
    /// rejected by the backend rather than split.
    pub fn max_payload(&self) -> Option<usize> {
        let state = self.shared.state.lock();
        state
            .transport
            .as_ref()
            .map(|transport| transport.max_payload())
    }

    pub fn send_backlog_len(&self) -> usize {
        self.shared.backlog.send_len()
    }

    pub fn recv_backlog_len(&self) -> usize {
        self.shared.backlog.recv_len()
    }

    /// Open means the transport is attached or the backlog worker is still
    /// running.
    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// True when this comm created (and owns) its transport resource.
    pub fn is_bound(&self) -> bool {
        self.shared.state.lock().bound
    }

    /// True once an opened comm has fully shut down.
    pub fn is_closed(&self) -> bool {
        let state = self.shared.state.lock();
        state.opened && state.transport.is_none() && !state.backlog_open
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn address(&self) -> Option<String> {
        self.shared.state.lock().address.clone()
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }
}

impl Drop for Comm {
    fn drop(&mut self) {
        // Wake the worker; it finishes the shutdown on its own schedule.
        self.shared.owner_gone.cancel();
    }
}

impl CommShared {
    fn is_open(&self) -> bool {
        let state = self.state.lock();
        state.transport.is_some() || state.backlog_open
    }

    /// Break flag of the current open generation. Read fresh at each use
    /// because a reopen replaces it.
    fn cancel_token(&self) -> CancelToken {
        self.state.lock().cancel.clone()
    }

    fn backlog_worker_alive(&self) -> bool {
        self.state.lock().backlog_open
    }

    async fn send_inner(&self, payload: &[u8], no_backlog: bool) -> Result<bool> {
        if self.direction != Direction::Send {
            return Err(CommError::ContractViolation("send on a receive comm"));
        }
        let (transport, opened) = {
            let state = self.state.lock();
            (state.transport.clone(), state.opened)
        };
        if !opened {
            return Err(CommError::ContractViolation(
                "send on a comm that was never opened",
            ));
        }
        let Some(transport) = transport else {
            debug!("Comm '{}' dropped a send: comm is closed", self.name);
            return Ok(false);
        };

        // Ordinary driver sends must not overtake what is already
        // backlogged.
        if self.role == Role::Driver && !no_backlog && self.backlog.send_len() > 0 {
            trace!(
                "Comm '{}' queued a {} byte(s) send behind the backlog",
                self.name,
                payload.len()
            );
            self.backlog.push_send(payload.to_vec());
            return Ok(true);
        }

        let outcome = if self.role == Role::Interface {
            transport.send_wait(payload).await
        } else {
            transport.try_send(payload).await
        };

        match outcome {
            Ok(SendOutcome::Sent) => {
                trace!("Comm '{}' sent {} byte(s)", self.name, payload.len());
                Ok(true)
            }
            Ok(SendOutcome::Full) => {
                if no_backlog {
                    return Err(CommError::TransportFull);
                }
                trace!(
                    "Comm '{}' absorbed a {} byte(s) send into the backlog",
                    self.name,
                    payload.len()
                );
                self.backlog.push_send(payload.to_vec());
                Ok(true)
            }
            Ok(SendOutcome::Gone) => {
                self.note_transport_gone("send").await;
                Ok(false)
            }
            Err(e) => {
                if self.is_open() {
                    return Err(e);
                }
                debug!("Comm '{}' send failed after close: {}", self.name, e);
                Ok(false)
            }
        }
    }

    async fn recv_inner(&self, timeout: Timeout) -> Result<RecvResult> {
        if self.direction != Direction::Recv {
            return Err(CommError::ContractViolation("recv on a send comm"));
        }
        if !self.state.lock().opened {
            return Err(CommError::ContractViolation(
                "recv on a comm that was never opened",
            ));
        }

        let limit = match timeout {
            Timeout::Default => Some(self.ctx.config().recv_timeout),
            Timeout::Bounded(duration) => Some(duration),
            Timeout::Forever => None,
        };
        self.backlog.recv_ready().wait(limit).await;

        // Order matters: a cancelled worker means close won the race, even
        // if messages are still buffered.
        if !self.is_open() || self.cancel_token().is_cancelled() {
            return Ok(RecvResult::Closed);
        }
        match self.backlog.pop_recv() {
            Some(payload) => {
                trace!("Comm '{}' received {} byte(s)", self.name, payload.len());
                Ok(RecvResult::Payload(payload))
            }
            None => Ok(RecvResult::Empty),
        }
    }

    /// One direct transport read used by the receive worker and
    /// `recv_nowait`.
    async fn recv_direct(&self) -> Result<RecvResult> {
        let transport = self.state.lock().transport.clone();
        let Some(transport) = transport else {
            return Ok(RecvResult::Closed);
        };

        let pending = match transport.pending().await {
            Ok(pending) => pending,
            Err(e) => {
                if self.is_open() {
                    return Err(e);
                }
                debug!("Comm '{}' transport poll failed after close: {}", self.name, e);
                return Ok(RecvResult::Closed);
            }
        };
        match pending {
            None => {
                self.note_transport_gone("recv").await;
                return Ok(RecvResult::Closed);
            }
            Some(0) => return Ok(RecvResult::Empty),
            Some(_) => {}
        }

        match transport.try_recv().await {
            Ok(RecvOutcome::Received(payload)) => Ok(RecvResult::Payload(payload)),
            Ok(RecvOutcome::Empty) => Ok(RecvResult::Empty),
            Ok(RecvOutcome::Gone) => {
                self.note_transport_gone("recv").await;
                Ok(RecvResult::Closed)
            }
            Err(e) => {
                if self.is_open() {
                    return Err(e);
                }
                debug!("Comm '{}' receive failed after close: {}", self.name, e);
                Ok(RecvResult::Closed)
            }
        }
    }

    /// Poll the transport into the receive backlog until told to stop.
    async fn run_backlog_recv(&self) {
        debug!("Receive backlog worker for '{}' started", self.name);
        loop {
            if self.cancel_token().is_cancelled() {
                break;
            }
            if self.owner_gone.is_cancelled() {
                // Nobody is left to consume buffered messages.
                debug!("Owner of receive comm '{}' went away; closing it", self.name);
                self.close_from_worker(false).await;
                break;
            }
            match self.recv_direct().await {
                Ok(RecvResult::Payload(payload)) => {
                    trace!(
                        "Worker for '{}' backlogged {} byte(s)",
                        self.name,
                        payload.len()
                    );
                    self.backlog.push_recv(payload);
                }
                Ok(RecvResult::Empty) => self.idle().await,
                Ok(RecvResult::Closed) => {
                    // The transport is gone. Wake receivers and leave the
                    // rest of the teardown to whoever closes the comm.
                    self.cancel_token().cancel();
                    self.backlog.recv_ready().set();
                    break;
                }
                Err(e) => {
                    warn!("Receive worker for '{}' stopping on error: {}", self.name, e);
                    self.fail_backlog();
                    break;
                }
            }
        }
        trace!("Receive backlog worker for '{}' exited", self.name);
    }

    /// Flush the send backlog into the transport until told to stop.
    async fn run_backlog_send(&self) {
        debug!("Send backlog worker for '{}' started", self.name);
        loop {
            if self.cancel_token().is_cancelled() {
                break;
            }
            if self.owner_gone.is_cancelled() {
                self.finish_owner_gone_send().await;
                break;
            }
            match self.flush_one().await {
                FlushStep::Flushed => {}
                FlushStep::Idle => self.idle().await,
                FlushStep::Stop => break,
            }
        }
        trace!("Send backlog worker for '{}' exited", self.name);
    }

    /// Try to push the oldest backlog entry into the transport. `Full` is
    /// not an error: the entry stays queued for the next pass.
    async fn flush_one(&self) -> FlushStep {
        let Some(payload) = self.backlog.front_send() else {
            return FlushStep::Idle;
        };
        let transport = self.state.lock().transport.clone();
        let Some(transport) = transport else {
            debug!("Send worker for '{}' has no transport left", self.name);
            self.fail_backlog();
            return FlushStep::Stop;
        };
        match transport.try_send(&payload).await {
            Ok(SendOutcome::Sent) => {
                self.backlog.pop_send();
                trace!(
                    "Worker for '{}' flushed {} byte(s) from the backlog",
                    self.name,
                    payload.len()
                );
                FlushStep::Flushed
            }
            Ok(SendOutcome::Full) => FlushStep::Idle,
            Ok(SendOutcome::Gone) => {
                warn!("Send worker for '{}' found the transport gone", self.name);
                self.fail_backlog();
                FlushStep::Stop
            }
            Err(e) => {
                warn!("Send worker for '{}' stopping on error: {}", self.name, e);
                self.fail_backlog();
                FlushStep::Stop
            }
        }
    }

    /// The caller-facing handle is gone. Interface senders flush what was
    /// already accepted, then linger-close so the peer can keep draining;
    /// driver senders close immediately.
    async fn finish_owner_gone_send(&self) {
        if self.role == Role::Interface {
            let remaining = self.backlog.send_len();
            if remaining > 0 {
                debug!(
                    "Owner of interface comm '{}' went away; draining {} message(s)",
                    self.name, remaining
                );
            }
            let deadline = tokio::time::Instant::now() + self.ctx.config().drain_timeout;
            while self.backlog.send_len() > 0 && !self.cancel_token().is_cancelled() {
                if tokio::time::Instant::now() >= deadline {
                    warn!(
                        "Comm '{}' abandoned {} message(s) at owner exit",
                        self.name,
                        self.backlog.send_len()
                    );
                    break;
                }
                match self.flush_one().await {
                    FlushStep::Flushed => {}
                    FlushStep::Idle => {
                        tokio::time::sleep(self.ctx.config().poll_interval).await
                    }
                    FlushStep::Stop => break,
                }
            }
            self.close_from_worker(true).await;
        } else {
            debug!("Owner of comm '{}' went away; closing it", self.name);
            self.close_from_worker(false).await;
        }
    }

    /// Sleep one poll interval, waking early on cancellation or owner
    /// exit.
    async fn idle(&self) {
        let cancel = self.cancel_token();
        tokio::select! {
            _ = tokio::time::sleep(self.ctx.config().poll_interval) => {}
            _ = cancel.cancelled() => {}
            _ = self.owner_gone.cancelled() => {}
        }
    }

    /// Unrecoverable worker exit: mark the backlog closed and wake
    /// everything blocked on the comm.
    fn fail_backlog(&self) {
        {
            let mut state = self.state.lock();
            state.cancel.cancel();
            state.backlog_open = false;
        }
        self.backlog.recv_ready().set();
        self.backlog.send_pending().set();
    }

    /// Drop a handle whose backing resource disappeared underneath us.
    async fn note_transport_gone(&self, during: &str) {
        warn!("Comm '{}' lost its transport during {}", self.name, during);
        if let Err(e) = self.close_transport(false).await {
            debug!(
                "Comm '{}' cleanup after a lost transport failed: {}",
                self.name, e
            );
        }
    }

    async fn close_inner(&self, linger: bool) -> Result<()> {
        if linger {
            self.drain_send_backlog(self.ctx.config().drain_timeout).await;
        }
        let worker = {
            let mut state = self.state.lock();
            state.cancel.cancel();
            state.backlog_open = false;
            state.worker.take()
        };
        // Wake anything still blocked so it can observe the closed state.
        self.backlog.recv_ready().set();
        self.backlog.send_pending().set();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Backlog worker for '{}' ended abnormally: {}", self.name, e);
            }
        }
        self.close_transport(linger).await
    }

    /// Close initiated from inside the worker task itself: identical to
    /// [`close_inner`](Self::close_inner) except nobody joins the worker
    /// (that would be joining ourselves) and draining already happened.
    async fn close_from_worker(&self, linger: bool) {
        {
            let mut state = self.state.lock();
            state.cancel.cancel();
            state.backlog_open = false;
            state.worker.take();
        }
        self.backlog.recv_ready().set();
        self.backlog.send_pending().set();
        if let Err(e) = self.close_transport(linger).await {
            warn!(
                "Comm '{}' transport close failed at worker exit: {}",
                self.name, e
            );
        }
    }

    /// Wait for the worker to flush the send backlog, bounded by `limit`.
    async fn drain_send_backlog(&self, limit: Duration) {
        if self.direction != Direction::Send {
            return;
        }
        let deadline = tokio::time::Instant::now() + limit;
        while self.backlog.send_len() > 0 {
            if !self.backlog_worker_alive() || tokio::time::Instant::now() >= deadline {
                warn!(
                    "Comm '{}' closing with {} unsent backlog message(s)",
                    self.name,
                    self.backlog.send_len()
                );
                break;
            }
            tokio::time::sleep(self.ctx.config().poll_interval).await;
        }
    }

    /// Release the transport handle. Unless `linger` asks to abandon the
    /// resource for a peer still draining it, the resource is removed.
    async fn close_transport(&self, linger: bool) -> Result<()> {
        let (mut transport, address, bound) = {
            let mut state = self.state.lock();
            (state.transport.take(), state.address.clone(), state.bound)
        };

        // A bound comm that never attached, or lost its handle, still owns
        // the resource; re-resolve it by key so removal can proceed.
        if transport.is_none() && bound {
            if let Some(address) = address.as_deref() {
                match self.ctx.attach_transport(self.kind, address).await {
                    Ok(found) => transport = found,
                    Err(e) => warn!(
                        "Comm '{}' could not re-resolve '{}' while closing: {}",
                        self.name, address, e
                    ),
                }
            }
        }

        let Some(transport) = transport else {
            let mut state = self.state.lock();
            if bound {
                // The owned resource is gone; nothing left to point at.
                state.address = None;
            }
            state.bound = false;
            return Ok(());
        };

        let key = transport.key().to_string();
        if linger {
            debug!(
                "Comm '{}' abandoning transport '{}' for peers still draining",
                self.name, key
            );
        } else {
            match transport.remove().await {
                Ok(RemoveOutcome::Removed) => {
                    debug!("Comm '{}' removed transport '{}'", self.name, key)
                }
                Ok(RemoveOutcome::AlreadyGone) => debug!(
                    "Transport '{}' was already gone when comm '{}' closed",
                    key, self.name
                ),
                Err(e) => warn!(
                    "Comm '{}' failed to remove transport '{}': {}",
                    self.name, key, e
                ),
            }
        }

        // Close ordering can race other closers here; a missing
        // registration is normal.
        if self.ctx.registry().unregister(&key).is_err() {
            trace!("Transport '{}' was not registered at close", key);
        }

        self.state.lock().bound = false;
        Ok(())
    }

    async fn purge_inner(&self) -> Result<()> {
        self.backlog.clear();
        let transport = self.state.lock().transport.clone();
        let Some(transport) = transport else {
            return Ok(());
        };
        loop {
            match transport.pending().await? {
                None | Some(0) => break,
                Some(_) => match transport.try_recv().await? {
                    RecvOutcome::Received(_) => continue,
                    RecvOutcome::Empty | RecvOutcome::Gone => break,
                },
            }
        }
        debug!("Comm '{}' purged", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommConfig;

    fn quick_ctx() -> Arc<CommContext> {
        CommContext::with_config(CommConfig {
            poll_interval: Duration::from_millis(2),
            ..CommConfig::default()
        })
    }

    #[tokio::test]
    async fn test_lifecycle_flags() {
        let ctx = quick_ctx();
        let comm = Comm::new(
            Arc::clone(&ctx),
            CommOptions::new("flags", Direction::Send, TransportKind::Memory),
        );
        assert!(!comm.is_open());
        assert!(!comm.is_bound());
        assert!(!comm.is_closed());
        assert!(comm.address().is_none());

        comm.open().await.unwrap();
        assert!(comm.is_open());
        assert!(comm.is_bound());
        assert!(comm.address().is_some());
        assert_eq!(ctx.registry().len(), 1);

        comm.close(false).await.unwrap();
        assert!(!comm.is_open());
        assert!(comm.is_closed());
        assert!(ctx.registry().is_empty());
    }

    #[tokio::test]
    async fn test_direction_contract_is_enforced() {
        let ctx = quick_ctx();
        let sender = Comm::new(
            Arc::clone(&ctx),
            CommOptions::new("out", Direction::Send, TransportKind::Memory),
        );
        sender.open().await.unwrap();

        let err = sender.recv(Timeout::Default).await.unwrap_err();
        assert!(matches!(err, CommError::ContractViolation(_)));

        let receiver = Comm::new(
            Arc::clone(&ctx),
            CommOptions::new("in", Direction::Recv, TransportKind::Memory)
                .with_address(sender.address().unwrap()),
        );
        receiver.open().await.unwrap();
        let err = receiver.send(b"nope").await.unwrap_err();
        assert!(matches!(err, CommError::ContractViolation(_)));

        receiver.close(false).await.unwrap();
        sender.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_operations_require_open() {
        let ctx = quick_ctx();
        let comm = Comm::new(
            ctx,
            CommOptions::new("unopened", Direction::Send, TransportKind::Memory),
        );
        let err = comm.send(b"early").await.unwrap_err();
        assert!(matches!(err, CommError::ContractViolation(_)));
    }

    #[tokio::test]
    async fn test_send_after_close_reports_failure() {
        let ctx = quick_ctx();
        let comm = Comm::new(
            ctx,
            CommOptions::new("late", Direction::Send, TransportKind::Memory),
        );
        comm.open().await.unwrap();
        comm.close(false).await.unwrap();

        assert!(!comm.send(b"too late").await.unwrap());
    }

    #[tokio::test]
    async fn test_double_close_is_idempotent() {
        let ctx = quick_ctx();
        let comm = Comm::new(
            Arc::clone(&ctx),
            CommOptions::new("twice", Direction::Recv, TransportKind::Memory),
        );
        comm.open().await.unwrap();
        comm.close(false).await.unwrap();
        comm.close(false).await.unwrap();
        assert!(comm.is_closed());
        assert!(ctx.registry().is_empty());
    }

    #[tokio::test]
    async fn test_explicit_address_must_exist() {
        let ctx = quick_ctx();
        let comm = Comm::new(
            ctx,
            CommOptions::new("ghost", Direction::Recv, TransportKind::Memory)
                .with_address("mem-never-created"),
        );
        let err = comm.open().await.unwrap_err();
        assert!(matches!(err, CommError::TransportGone { .. }));
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let ctx = quick_ctx();
        let comm = Comm::new(
            Arc::clone(&ctx),
            CommOptions::new("again", Direction::Send, TransportKind::Memory),
        );
        comm.open().await.unwrap();
        let address = comm.address();
        comm.open().await.unwrap();
        assert_eq!(comm.address(), address);
        assert_eq!(ctx.registry().len(), 1);
        comm.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_after_linger_close() {
        let ctx = quick_ctx();
        let comm = Comm::new(
            Arc::clone(&ctx),
            CommOptions::new("revived", Direction::Recv, TransportKind::Memory),
        );
        comm.open().await.unwrap();
        comm.close(true).await.unwrap();
        assert!(comm.is_closed());

        comm.open().await.unwrap();
        assert!(comm.is_open());
        assert!(!comm.is_closed());
        // The restarted worker serves the comm again: an empty queue reads
        // as empty, not closed.
        assert_eq!(
            comm.recv(Timeout::Default).await.unwrap(),
            RecvResult::Empty
        );
        comm.close(false).await.unwrap();
    }

    #[test]
    fn test_eof_detection() {
        assert!(RecvResult::Payload(EOF_MSG.to_vec()).is_eof());
        assert!(!RecvResult::Payload(b"EOF!".to_vec()).is_eof());
        assert!(!RecvResult::Empty.is_eof());
        assert!(!RecvResult::Closed.is_eof());
    }
}
