//! Client configuration.

use std::time::Duration;

use rand::Rng;
use url::Url;

use crate::error::SyncError;

/// Exponential backoff for reconnection attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay unit; the first retry waits `2 × base`.
    pub base_delay: Duration,
    /// Cap before jitter is added.
    pub max_delay: Duration,
    /// Upper bound of the uniform random jitter.
    pub max_jitter: Duration,
    /// Attempts allowed before the client gives up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(60_000),
            max_jitter: Duration::from_millis(2000),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// `min(base · 2^(attempt−1) · 2, max) + jitter`, attempts counted from 1.
    pub fn delay_for(&self, attempt: u32, jitter: Duration) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let scaled = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .saturating_mul(2);
        scaled.min(self.max_delay) + jitter
    }

    /// Delay for `attempt` with a fresh random jitter.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };
        self.delay_for(attempt, jitter)
    }
}

/// Configuration for a [`crate::SyncClient`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// WebSocket endpoint, e.g. `ws://localhost:8080/sync`.
    pub server_url: String,
    pub room: String,
    pub heartbeat_interval: Duration,
    /// Missed heartbeat intervals before the link is considered dead.
    pub heartbeat_miss_limit: u32,
    pub reconnect: ReconnectPolicy,
    /// Pause between queued updates while draining after a reconnect.
    pub flush_delay: Duration,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub presence_sweep_interval: Duration,
    pub presence_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8080".to_string(),
            room: "default".to_string(),
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_miss_limit: 5,
            reconnect: ReconnectPolicy::default(),
            flush_delay: Duration::from_millis(10),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            presence_sweep_interval: Duration::from_secs(10),
            presence_timeout: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = room.into();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_flush_delay(mut self, delay: Duration) -> Self {
        self.flush_delay = delay;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_presence_timing(mut self, sweep_interval: Duration, timeout: Duration) -> Self {
        self.presence_sweep_interval = sweep_interval;
        self.presence_timeout = timeout;
        self
    }

    /// Silence longer than this means the link is dead.
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_miss_limit.max(1)
    }

    /// `server_url?room=<room>&token=<token>`, preserving any existing query.
    pub fn build_url(&self, token: Option<&str>) -> Result<Url, SyncError> {
        let mut url = Url::parse(&self.server_url)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("room", &self.room);
            if let Some(token) = token {
                query.append_pair("token", token);
            }
        }
        Ok(url)
    }
}
