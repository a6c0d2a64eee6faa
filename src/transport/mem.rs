use crate::error::Result;
use crate::transport::{RecvOutcome, RemoveOutcome, SendOutcome, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Named in-process queues backing the memory transport.
///
/// The broker lives in the comm context, so queues survive individual
/// handle drops (the way an external broker outlives any one client) but
/// never leak past the context that owns them.
#[derive(Default)]
pub struct MemBroker {
    queues: Mutex<HashMap<String, Arc<MemQueue>>>,
}

impl MemBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queues currently known to the broker.
    pub fn queue_count(&self) -> usize {
        self.queues.lock().len()
    }
}

struct MemQueue {
    state: Mutex<MemQueueState>,
    capacity: usize,
}

struct MemQueueState {
    messages: VecDeque<Vec<u8>>,
    removed: bool,
}

impl MemQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(MemQueueState {
                messages: VecDeque::new(),
                removed: false,
            }),
            capacity,
        }
    }
}

/// Handle onto one named in-process queue.
pub struct MemTransport {
    key: String,
    broker: Arc<MemBroker>,
    queue: Arc<MemQueue>,
    max_payload: usize,
    poll_interval: Duration,
}

impl MemTransport {
    /// Create a queue under a fresh generated name.
    pub fn create_new(
        broker: Arc<MemBroker>,
        capacity: usize,
        max_payload: usize,
        poll_interval: Duration,
    ) -> Self {
        let key = format!("mem-{}", Uuid::new_v4());
        let queue = Arc::new(MemQueue::new(capacity));
        broker.queues.lock().insert(key.clone(), Arc::clone(&queue));
        debug!("Created in-process queue '{}'", key);
        Self {
            key,
            broker,
            queue,
            max_payload,
            poll_interval,
        }
    }

    /// Look up an existing queue by name. `None` when it was never created
    /// or has been removed.
    pub fn attach(
        broker: Arc<MemBroker>,
        key: &str,
        max_payload: usize,
        poll_interval: Duration,
    ) -> Option<Self> {
        let queue = broker.queues.lock().get(key).cloned()?;
        if queue.state.lock().removed {
            return None;
        }
        Some(Self {
            key: key.to_string(),
            broker,
            queue,
            max_payload,
            poll_interval,
        })
    }
}

#[async_trait]
impl Transport for MemTransport {
    fn key(&self) -> &str {
        &self.key
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }

    async fn pending(&self) -> Result<Option<usize>> {
        let state = self.queue.state.lock();
        if state.removed {
            return Ok(None);
        }
        Ok(Some(state.messages.len()))
    }

    async fn try_send(&self, payload: &[u8]) -> Result<SendOutcome> {
        let mut state = self.queue.state.lock();
        if state.removed {
            return Ok(SendOutcome::Gone);
        }
        if state.messages.len() >= self.queue.capacity {
            return Ok(SendOutcome::Full);
        }
        state.messages.push_back(payload.to_vec());
        Ok(SendOutcome::Sent)
    }

    async fn send_wait(&self, payload: &[u8]) -> Result<SendOutcome> {
        loop {
            match self.try_send(payload).await? {
                SendOutcome::Full => tokio::time::sleep(self.poll_interval).await,
                outcome => return Ok(outcome),
            }
        }
    }

    async fn try_recv(&self) -> Result<RecvOutcome> {
        let mut state = self.queue.state.lock();
        if state.removed {
            return Ok(RecvOutcome::Gone);
        }
        match state.messages.pop_front() {
            Some(payload) => Ok(RecvOutcome::Received(payload)),
            None => Ok(RecvOutcome::Empty),
        }
    }

    async fn remove(&self) -> Result<RemoveOutcome> {
        let already_gone = {
            let mut state = self.queue.state.lock();
            let already = state.removed;
            state.removed = true;
            state.messages.clear();
            already
        };
        self.broker.queues.lock().remove(&self.key);
        debug!(
            "Removed in-process queue '{}' (already gone: {})",
            self.key, already_gone
        );
        Ok(if already_gone {
            RemoveOutcome::AlreadyGone
        } else {
            RemoveOutcome::Removed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(capacity: usize) -> (Arc<MemBroker>, MemTransport) {
        let broker = Arc::new(MemBroker::new());
        let transport = MemTransport::create_new(
            Arc::clone(&broker),
            capacity,
            2048,
            Duration::from_millis(1),
        );
        (broker, transport)
    }

    #[tokio::test]
    async fn test_fifo_round_trip() {
        let (_broker, t) = transport(8);
        assert_eq!(t.try_send(b"one").await.unwrap(), SendOutcome::Sent);
        assert_eq!(t.try_send(b"two").await.unwrap(), SendOutcome::Sent);
        assert_eq!(t.pending().await.unwrap(), Some(2));

        assert_eq!(
            t.try_recv().await.unwrap(),
            RecvOutcome::Received(b"one".to_vec())
        );
        assert_eq!(
            t.try_recv().await.unwrap(),
            RecvOutcome::Received(b"two".to_vec())
        );
        assert_eq!(t.try_recv().await.unwrap(), RecvOutcome::Empty);
    }

    #[tokio::test]
    async fn test_capacity_reports_full() {
        let (_broker, t) = transport(1);
        assert_eq!(t.try_send(b"a").await.unwrap(), SendOutcome::Sent);
        assert_eq!(t.try_send(b"b").await.unwrap(), SendOutcome::Full);

        // Draining frees capacity again.
        t.try_recv().await.unwrap();
        assert_eq!(t.try_send(b"b").await.unwrap(), SendOutcome::Sent);
    }

    #[tokio::test]
    async fn test_send_wait_blocks_until_capacity_frees() {
        let (broker, t) = transport(1);
        t.try_send(b"occupied").await.unwrap();

        let reader = MemTransport::attach(
            Arc::clone(&broker),
            t.key(),
            2048,
            Duration::from_millis(1),
        )
        .expect("queue exists");
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            reader.try_recv().await.unwrap()
        });

        assert_eq!(t.send_wait(b"late").await.unwrap(), SendOutcome::Sent);
        assert_eq!(
            handle.await.unwrap(),
            RecvOutcome::Received(b"occupied".to_vec())
        );
    }

    #[tokio::test]
    async fn test_remove_is_idempotent_and_detaches_key() {
        let (broker, t) = transport(4);
        let key = t.key().to_string();
        t.try_send(b"doomed").await.unwrap();

        assert_eq!(t.remove().await.unwrap(), RemoveOutcome::Removed);
        assert_eq!(t.remove().await.unwrap(), RemoveOutcome::AlreadyGone);

        assert_eq!(t.try_send(b"x").await.unwrap(), SendOutcome::Gone);
        assert_eq!(t.try_recv().await.unwrap(), RecvOutcome::Gone);
        assert_eq!(t.pending().await.unwrap(), None);
        assert!(
            MemTransport::attach(broker, &key, 2048, Duration::from_millis(1)).is_none()
        );
    }

    #[tokio::test]
    async fn test_attach_shares_the_queue() {
        let (broker, t) = transport(4);
        let peer = MemTransport::attach(
            Arc::clone(&broker),
            t.key(),
            2048,
            Duration::from_millis(1),
        )
        .expect("queue exists");

        t.try_send(b"ping").await.unwrap();
        assert_eq!(
            peer.try_recv().await.unwrap(),
            RecvOutcome::Received(b"ping".to_vec())
        );
        assert_eq!(broker.queue_count(), 1);
    }
}
