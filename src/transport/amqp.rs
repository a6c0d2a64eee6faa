use crate::error::{CommError, Result};
use crate::transport::{RecvOutcome, RemoveOutcome, SendOutcome, Transport};
use anyhow::anyhow;
use async_trait::async_trait;
use lapin::options::{
    BasicGetOptions, BasicPublishOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Lazily-established broker connection shared by every AMQP transport in
/// one context.
pub struct AmqpPool {
    url: String,
    connection: Mutex<Option<Connection>>,
}

impl AmqpPool {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            connection: Mutex::new(None),
        }
    }

    /// A fresh channel on the shared connection, reconnecting when the
    /// previous connection died. Broker soft errors close the channel they
    /// arrive on, so operations take a new one each time.
    async fn channel(&self) -> Result<Channel> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            if connection.status().connected() {
                return connection
                    .create_channel()
                    .await
                    .map_err(|e| CommError::Backend(anyhow!("AMQP channel open failed: {}", e)));
            }
        }
        debug!("Connecting to AMQP broker at {}", self.url);
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| {
                CommError::Backend(anyhow!("AMQP connect to {} failed: {}", self.url, e))
            })?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| CommError::Backend(anyhow!("AMQP channel open failed: {}", e)))?;
        *slot = Some(connection);
        Ok(channel)
    }
}

/// Handle onto one broker queue. The queue name doubles as the key.
///
/// Queues are declared non-durable and non-exclusive: peers in other
/// processes attach by name, and nothing survives a broker restart.
pub struct AmqpTransport {
    key: String,
    pool: Arc<AmqpPool>,
    max_payload: usize,
}

impl AmqpTransport {
    /// Declare a fresh server-named queue.
    pub async fn create_new(pool: Arc<AmqpPool>, max_payload: usize) -> Result<Self> {
        let channel = pool.channel().await?;
        let queue = channel
            .queue_declare("", QueueDeclareOptions::default(), FieldTable::default())
            .await
            .map_err(|e| backend("queue declare", e))?;
        let key = queue.name().as_str().to_string();
        debug!("Declared AMQP queue '{}'", key);
        Ok(Self {
            key,
            pool,
            max_payload,
        })
    }

    /// Attach to a queue by name. Declaring is the natural AMQP attach, so
    /// this creates the queue when it does not exist yet.
    pub async fn attach(pool: Arc<AmqpPool>, key: &str, max_payload: usize) -> Result<Self> {
        let channel = pool.channel().await?;
        channel
            .queue_declare(key, QueueDeclareOptions::default(), FieldTable::default())
            .await
            .map_err(|e| backend("queue declare", e))?;
        Ok(Self {
            key: key.to_string(),
            pool,
            max_payload,
        })
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    fn key(&self) -> &str {
        &self.key
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }

    async fn pending(&self) -> Result<Option<usize>> {
        let channel = self.pool.channel().await?;
        let options = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };
        match channel
            .queue_declare(&self.key, options, FieldTable::default())
            .await
        {
            Ok(queue) => Ok(Some(queue.message_count() as usize)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(backend("passive declare", e)),
        }
    }

    async fn try_send(&self, payload: &[u8]) -> Result<SendOutcome> {
        let channel = self.pool.channel().await?;
        let confirm = channel
            .basic_publish(
                "",
                &self.key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| backend("publish", e))?;
        confirm.await.map_err(|e| backend("publish confirm", e))?;
        Ok(SendOutcome::Sent)
    }

    async fn send_wait(&self, payload: &[u8]) -> Result<SendOutcome> {
        // The broker buffers publishes, so a waiting send is the same as a
        // direct one.
        self.try_send(payload).await
    }

    async fn try_recv(&self) -> Result<RecvOutcome> {
        let channel = self.pool.channel().await?;
        match channel
            .basic_get(&self.key, BasicGetOptions { no_ack: true })
            .await
        {
            Ok(Some(message)) => Ok(RecvOutcome::Received(message.delivery.data)),
            Ok(None) => Ok(RecvOutcome::Empty),
            Err(e) if is_not_found(&e) => Ok(RecvOutcome::Gone),
            Err(e) => Err(backend("get", e)),
        }
    }

    async fn remove(&self) -> Result<RemoveOutcome> {
        let channel = self.pool.channel().await?;
        match channel
            .queue_delete(&self.key, QueueDeleteOptions::default())
            .await
        {
            Ok(_) => {
                debug!("Deleted AMQP queue '{}'", self.key);
                Ok(RemoveOutcome::Removed)
            }
            Err(e) if is_not_found(&e) => Ok(RemoveOutcome::AlreadyGone),
            Err(e) => Err(backend("queue delete", e)),
        }
    }
}

/// True when the broker replied 404 NOT_FOUND to an operation on a queue
/// that no longer exists.
fn is_not_found(err: &lapin::Error) -> bool {
    match err {
        lapin::Error::ProtocolError(e) => {
            matches!(e.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND))
        }
        _ => false,
    }
}

fn backend(op: &str, err: lapin::Error) -> CommError {
    CommError::Backend(anyhow!("AMQP {} failed: {}", op, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn amqp_tests_enabled() -> bool {
        std::env::var("IPC_CHANNELS_RUN_AMQP")
            .map(|v| v == "1")
            .unwrap_or(false)
    }

    /// Needs a reachable broker; auto-skips unless explicitly enabled.
    #[tokio::test]
    async fn test_broker_round_trip() {
        if !amqp_tests_enabled() {
            eprintln!("Skipping AMQP test: set IPC_CHANNELS_RUN_AMQP=1 to enable in this env");
            return;
        }
        let url = std::env::var("IPC_CHANNELS_AMQP_URL")
            .unwrap_or_else(|_| "amqp://127.0.0.1:5672/%2f".to_string());
        let pool = Arc::new(AmqpPool::new(&url));
        let t = AmqpTransport::create_new(Arc::clone(&pool), 2048)
            .await
            .unwrap();

        assert_eq!(t.try_send(b"hello").await.unwrap(), SendOutcome::Sent);

        // The broker may take a moment to route the publish.
        let mut received = None;
        for _ in 0..50 {
            match t.try_recv().await.unwrap() {
                RecvOutcome::Received(data) => {
                    received = Some(data);
                    break;
                }
                RecvOutcome::Empty => tokio::time::sleep(Duration::from_millis(20)).await,
                RecvOutcome::Gone => panic!("queue vanished mid-test"),
            }
        }
        assert_eq!(received.as_deref(), Some(&b"hello"[..]));

        assert_eq!(t.remove().await.unwrap(), RemoveOutcome::Removed);
        assert_eq!(t.pending().await.unwrap(), None);
    }
}
