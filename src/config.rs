use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::defaults;

/// Process-wide tuning consulted when comms are constructed.
///
/// A config is captured by the [`crate::context::CommContext`] it is handed
/// to; changing it afterwards does not affect comms already built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommConfig {
    /// Largest payload a single message may carry, in bytes. This is a
    /// documented ceiling for callers, not something this layer enforces;
    /// oversized payloads fail in the backend.
    pub max_payload: usize,

    /// How long the backlog worker sleeps between polling iterations.
    pub poll_interval: Duration,

    /// How long `recv` waits when no explicit timeout is given. Zero means
    /// a non-blocking poll.
    pub recv_timeout: Duration,

    /// Upper bound on waiting for the send backlog to flush during a
    /// lingering close.
    pub drain_timeout: Duration,

    /// In-process queue depth before senders observe a full transport.
    pub mem_capacity: usize,

    /// Broker URL used by the AMQP backend.
    pub amqp_url: String,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            max_payload: defaults::MAX_PAYLOAD,
            poll_interval: defaults::POLL_INTERVAL,
            recv_timeout: defaults::RECV_TIMEOUT,
            drain_timeout: defaults::DRAIN_TIMEOUT,
            mem_capacity: defaults::MEM_CAPACITY,
            amqp_url: defaults::AMQP_URL.to_string(),
        }
    }
}

impl CommConfig {
    /// Defaults with `IPC_CHANNELS_*` environment overrides applied.
    ///
    /// Unparseable values are ignored with a warning rather than failing
    /// startup.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_usize("IPC_CHANNELS_MAX_PAYLOAD") {
            config.max_payload = v;
        }
        if let Some(v) = env_millis("IPC_CHANNELS_POLL_INTERVAL_MS") {
            config.poll_interval = v;
        }
        if let Some(v) = env_millis("IPC_CHANNELS_RECV_TIMEOUT_MS") {
            config.recv_timeout = v;
        }
        if let Some(v) = env_millis("IPC_CHANNELS_DRAIN_TIMEOUT_MS") {
            config.drain_timeout = v;
        }
        if let Some(v) = env_usize("IPC_CHANNELS_MEM_CAPACITY") {
            config.mem_capacity = v;
        }
        if let Ok(v) = std::env::var("IPC_CHANNELS_AMQP_URL") {
            if !v.is_empty() {
                config.amqp_url = v;
            }
        }
        config
    }
}

fn env_usize(name: &str) -> Option<usize> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring unparseable {}={:?}", name, raw);
            None
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    env_usize(name).map(|ms| Duration::from_millis(ms as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = CommConfig::default();

        assert_eq!(config.max_payload, 2048);
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert_eq!(config.recv_timeout, Duration::ZERO);
        assert_eq!(config.drain_timeout, Duration::from_secs(10));
        assert_eq!(config.mem_capacity, 64);
        assert_eq!(config.amqp_url, "amqp://127.0.0.1:5672/%2f");
    }

    #[test]
    fn test_env_overrides() {
        // These variables are only read here; other tests never set them.
        std::env::set_var("IPC_CHANNELS_MAX_PAYLOAD", "4096");
        std::env::set_var("IPC_CHANNELS_POLL_INTERVAL_MS", "25");
        std::env::set_var("IPC_CHANNELS_MEM_CAPACITY", "not-a-number");

        let config = CommConfig::from_env();
        assert_eq!(config.max_payload, 4096);
        assert_eq!(config.poll_interval, Duration::from_millis(25));
        // The malformed override falls back to the default.
        assert_eq!(config.mem_capacity, 64);

        std::env::remove_var("IPC_CHANNELS_MAX_PAYLOAD");
        std::env::remove_var("IPC_CHANNELS_POLL_INTERVAL_MS");
        std::env::remove_var("IPC_CHANNELS_MEM_CAPACITY");
    }

    #[test]
    fn test_config_serializes() {
        let config = CommConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("max_payload"));
        assert!(json.contains("amqp_url"));
    }
}
