use std::sync::Arc;
use std::time::Duration;

use feedcast_core::Event;
use feedcast_transport::PeerTransport;
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::config::FanOutMode;
use crate::supervisor::{FanOutTarget, Supervisor};

/// Result of one publish attempt against one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub address: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Aggregate of one fan-out. `success` is true iff any peer accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub success: bool,
    pub outcomes: Vec<PublishOutcome>,
}

impl PublishReport {
    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes.len() - self.success_count()
    }
}

/// Fans signed events out to every connected peer of a [`Supervisor`].
#[derive(Clone)]
pub struct Coordinator {
    supervisor: Supervisor,
    publish_timeout: Duration,
    mode: FanOutMode,
}

impl Coordinator {
    pub fn new(supervisor: Supervisor) -> Self {
        let config = supervisor.config();
        let publish_timeout = config.publish_timeout;
        let mode = config.fanout;
        Self {
            supervisor,
            publish_timeout,
            mode,
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Publishes `event` to each connected peer, racing every attempt
    /// against the publish timeout. Never fails; inspect the report.
    pub async fn publish(&self, event: &Event) -> PublishReport {
        let mut ready = Vec::new();
        for target in self.supervisor.fanout_targets() {
            match target {
                FanOutTarget::Ready { address, transport } => ready.push((address, transport)),
                FanOutTarget::Skipped { address, status } => {
                    debug!(relay = %address, %status, "skipping relay, not connected");
                }
            }
        }
        if ready.is_empty() {
            warn!(event = %event.short_id(), "no peers available for publish");
            return PublishReport::default();
        }

        let outcomes = match self.mode {
            FanOutMode::Sequential => {
                let mut outcomes = Vec::with_capacity(ready.len());
                for (address, transport) in ready {
                    outcomes.push(self.attempt(address, transport, event).await);
                }
                outcomes
            }
            FanOutMode::Concurrent => {
                join_all(
                    ready
                        .into_iter()
                        .map(|(address, transport)| self.attempt(address, transport, event)),
                )
                .await
            }
        };

        let report = PublishReport {
            success: outcomes.iter().any(|o| o.success),
            outcomes,
        };
        info!(
            event = %event.short_id(),
            "published to {}/{} relays",
            report.success_count(),
            report.outcomes.len()
        );
        report
    }

    async fn attempt(
        &self,
        address: String,
        transport: Arc<dyn PeerTransport>,
        event: &Event,
    ) -> PublishOutcome {
        let result = match tokio::time::timeout(self.publish_timeout, transport.publish_once(event))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!(
                "publish timed out after {}ms",
                self.publish_timeout.as_millis()
            )),
        };
        match result {
            Ok(()) => {
                self.supervisor.record_publish_success(&address);
                debug!(relay = %address, event = %event.short_id(), "published");
                PublishOutcome {
                    address,
                    success: true,
                    error: None,
                }
            }
            Err(message) => {
                warn!(relay = %address, event = %event.short_id(), "publish failed: {message}");
                if self.supervisor.record_publish_failure(&address) {
                    warn!(
                        relay = %address,
                        "relay disabled after {} consecutive publish errors, excluded until the relay set is reinitialized",
                        self.supervisor.config().max_publish_errors
                    );
                }
                PublishOutcome {
                    address,
                    success: false,
                    error: Some(message),
                }
            }
        }
    }
}
