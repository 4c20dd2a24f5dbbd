use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the coordinator walks connected peers for one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanOutMode {
    /// One peer after another, in configured order.
    #[default]
    Sequential,
    /// All peers at once; latency is the slowest peer's.
    Concurrent,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Base delay; attempt `n` waits `reconnect_delay * n`.
    pub reconnect_delay: Duration,
    /// Reconnect attempts after which a peer is left alone.
    pub max_retries: u32,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
    /// Consecutive publish failures that disable a peer.
    pub max_publish_errors: u32,
    pub fanout: FanOutMode,
    /// Capacity of the channel carrying subscription matches.
    pub inbound_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            max_retries: 3,
            connect_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(5),
            max_publish_errors: 3,
            fanout: FanOutMode::Sequential,
            inbound_capacity: 1024,
        }
    }
}

impl PoolConfig {
    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn reconnect_delay_for(&self, attempt: u32) -> Duration {
        self.reconnect_delay.saturating_mul(attempt)
    }
}
