use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Cooperative stop flag shared between a comm and its backlog worker.
///
/// Built on a watch channel: worker loops poll it between iterations and
/// selects await it. Once cancelled it stays cancelled.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called. Returns
    /// immediately if it already was.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Level-triggered readiness flag built on a watch channel.
///
/// `set`/`clear` move the level; `wait` blocks until the level is high or
/// the timeout runs out, whichever comes first.
pub struct ReadySignal {
    tx: watch::Sender<bool>,
}

impl ReadySignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal is set, up to `timeout`; `None` waits without
    /// bound. Returns the level observed when the wait ended, so a zero
    /// timeout acts as a plain poll.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.tx.subscribe();
        if *rx.borrow_and_update() {
            return true;
        }
        let raised = async {
            loop {
                if rx.changed().await.is_err() {
                    break;
                }
                if *rx.borrow_and_update() {
                    break;
                }
            }
        };
        match timeout {
            None => raised.await,
            Some(limit) => {
                let _ = tokio::time::timeout(limit, raised).await;
            }
        }
        *self.tx.borrow()
    }
}

impl Default for ReadySignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct BacklogBuffers {
    recv: VecDeque<Vec<u8>>,
    send: VecDeque<Vec<u8>>,
}

/// The per-direction FIFO buffers a backlog worker services, plus the two
/// readiness signals that let the comm and its worker wake each other.
///
/// The buffer lock is only ever held for O(1) mutations, never across
/// transport I/O.
pub struct Backlog {
    buffers: Mutex<BacklogBuffers>,
    recv_ready: ReadySignal,
    send_pending: ReadySignal,
}

impl Backlog {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(BacklogBuffers::default()),
            recv_ready: ReadySignal::new(),
            send_pending: ReadySignal::new(),
        }
    }

    /// Signal raised while received messages are buffered (and on close, to
    /// wake blocked receivers).
    pub fn recv_ready(&self) -> &ReadySignal {
        &self.recv_ready
    }

    /// Signal raised while outbound messages are waiting to be flushed.
    pub fn send_pending(&self) -> &ReadySignal {
        &self.send_pending
    }

    /// Append a received payload and raise `recv_ready`.
    pub fn push_recv(&self, payload: Vec<u8>) {
        let mut buffers = self.buffers.lock();
        buffers.recv.push_back(payload);
        self.recv_ready.set();
    }

    /// Pop the oldest received payload, lowering `recv_ready` when the
    /// buffer empties.
    pub fn pop_recv(&self) -> Option<Vec<u8>> {
        let mut buffers = self.buffers.lock();
        let payload = buffers.recv.pop_front();
        if buffers.recv.is_empty() {
            self.recv_ready.clear();
        }
        payload
    }

    /// Append an outbound payload and raise `send_pending`.
    pub fn push_send(&self, payload: Vec<u8>) {
        let mut buffers = self.buffers.lock();
        buffers.send.push_back(payload);
        self.send_pending.set();
    }

    /// Clone of the oldest outbound payload. The entry stays queued until
    /// [`pop_send`](Self::pop_send) confirms it was flushed.
    pub fn front_send(&self) -> Option<Vec<u8>> {
        self.buffers.lock().send.front().cloned()
    }

    /// Drop the oldest outbound payload after a successful flush, lowering
    /// `send_pending` when the buffer empties.
    pub fn pop_send(&self) -> Option<Vec<u8>> {
        let mut buffers = self.buffers.lock();
        let payload = buffers.send.pop_front();
        if buffers.send.is_empty() {
            self.send_pending.clear();
        }
        payload
    }

    pub fn recv_len(&self) -> usize {
        self.buffers.lock().recv.len()
    }

    pub fn send_len(&self) -> usize {
        self.buffers.lock().send.len()
    }

    /// Empty both buffers and lower both signals in one critical section.
    pub fn clear(&self) {
        let mut buffers = self.buffers.lock();
        buffers.recv.clear();
        buffers.send.clear();
        self.recv_ready.clear();
        self.send_pending.clear();
    }

    /// Put both signals back in line with buffer occupancy.
    ///
    /// A close raises them unconditionally to wake blocked callers; a comm
    /// going back into service needs them level-accurate again.
    pub fn resync(&self) {
        let buffers = self.buffers.lock();
        if buffers.recv.is_empty() {
            self.recv_ready.clear();
        } else {
            self.recv_ready.set();
        }
        if buffers.send.is_empty() {
            self.send_pending.clear();
        } else {
            self.send_pending.set();
        }
    }
}

impl Default for Backlog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backlog_is_fifo_per_direction() {
        let backlog = Backlog::new();
        backlog.push_recv(b"r1".to_vec());
        backlog.push_recv(b"r2".to_vec());
        backlog.push_send(b"s1".to_vec());

        assert_eq!(backlog.recv_len(), 2);
        assert_eq!(backlog.send_len(), 1);
        assert_eq!(backlog.pop_recv(), Some(b"r1".to_vec()));
        assert_eq!(backlog.pop_recv(), Some(b"r2".to_vec()));
        assert_eq!(backlog.pop_recv(), None);
        assert_eq!(backlog.front_send(), Some(b"s1".to_vec()));
        assert_eq!(backlog.pop_send(), Some(b"s1".to_vec()));
    }

    #[test]
    fn test_signals_track_buffer_levels() {
        let backlog = Backlog::new();
        assert!(!backlog.recv_ready().is_set());
        assert!(!backlog.send_pending().is_set());

        backlog.push_recv(b"x".to_vec());
        backlog.push_send(b"y".to_vec());
        assert!(backlog.recv_ready().is_set());
        assert!(backlog.send_pending().is_set());

        backlog.pop_recv();
        backlog.pop_send();
        assert!(!backlog.recv_ready().is_set());
        assert!(!backlog.send_pending().is_set());
    }

    #[test]
    fn test_clear_empties_buffers_and_signals() {
        let backlog = Backlog::new();
        backlog.push_recv(b"a".to_vec());
        backlog.push_send(b"b".to_vec());

        backlog.clear();
        assert_eq!(backlog.recv_len(), 0);
        assert_eq!(backlog.send_len(), 0);
        assert!(!backlog.recv_ready().is_set());
        assert!(!backlog.send_pending().is_set());
    }

    #[test]
    fn test_resync_matches_signals_to_occupancy() {
        let backlog = Backlog::new();
        backlog.push_recv(b"held over".to_vec());
        // Both signals end up raised after a close, whatever is buffered.
        backlog.recv_ready().set();
        backlog.send_pending().set();

        backlog.resync();
        assert!(backlog.recv_ready().is_set());
        assert!(!backlog.send_pending().is_set());

        backlog.pop_recv();
        backlog.recv_ready().set();
        backlog.resync();
        assert!(!backlog.recv_ready().is_set());
    }

    #[tokio::test]
    async fn test_wait_sees_a_set_from_another_task() {
        let backlog = std::sync::Arc::new(Backlog::new());
        let setter = std::sync::Arc::clone(&backlog);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            setter.push_recv(b"wake".to_vec());
        });

        assert!(backlog.recv_ready().wait(Some(Duration::from_secs(2))).await);
    }

    #[tokio::test]
    async fn test_wait_with_zero_timeout_is_a_poll() {
        let signal = ReadySignal::new();
        assert!(!signal.wait(Some(Duration::ZERO)).await);
        signal.set();
        assert!(signal.wait(Some(Duration::ZERO)).await);
    }

    #[tokio::test]
    async fn test_cancel_token_wakes_waiters() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        assert!(handle.await.unwrap());
        assert!(token.is_cancelled());

        // Awaiting after the fact returns immediately.
        token.cancelled().await;
    }
}
