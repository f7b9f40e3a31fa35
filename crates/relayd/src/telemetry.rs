//! Listener count reporting.
//!
//! Once per interval the reporter reads the registry size and publishes a
//! `websocket-count` event to the hub, stamped with the identity of the
//! system the relay runs on. Nothing here is fatal: a missing identity
//! skips the send (and is retried next tick), a failed publish is logged.
//!
//! # Panic-Free Guarantees
//!
//! All code follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Uses pattern matching for every fallible lookup

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use relay_core::{Event, IdentityProvider, SystemIdentity, DETAIL_STATE_TAG, WEBSOCKET_COUNT_KEY};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::hub::EventPublisher;
use crate::registry::ConnectionRegistry;

/// How often the listener count is reported.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// What happened on one reporting tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    /// The count event was handed to the publisher
    Sent { count: usize },
    /// No identity available; nothing was sent
    SkippedNoIdentity,
    /// The publisher rejected the event
    PublishFailed,
}

/// Builds the telemetry event carrying the listener count.
pub fn count_event(identity: &SystemIdentity, count: usize) -> Event {
    let mut event = Event::new(WEBSOCKET_COUNT_KEY, count.to_string())
        .with_tag(DETAIL_STATE_TAG)
        .with_target_device(identity.device().clone())
        .with_affected_room(identity.room());
    event.generating_system = identity.id().to_string();
    event.timestamp = Utc::now();
    event
}

/// Periodic reporter of the registry size.
pub struct TelemetryReporter {
    registry: ConnectionRegistry,
    publisher: Arc<dyn EventPublisher>,
    identity: Arc<dyn IdentityProvider>,
    interval: Duration,
    resolved: Option<SystemIdentity>,
}

impl TelemetryReporter {
    /// Creates a reporter with the default interval.
    pub fn new(
        registry: ConnectionRegistry,
        publisher: Arc<dyn EventPublisher>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            registry,
            publisher,
            identity,
            interval: REPORT_INTERVAL,
            resolved: None,
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Performs one reporting tick.
    ///
    /// The identity is looked up until it resolves once, then reused.
    pub async fn report_once(&mut self) -> ReportOutcome {
        let identity = match &self.resolved {
            Some(identity) => identity.clone(),
            None => match self.identity.system_identity() {
                Ok(identity) => {
                    info!(system_id = %identity, "Telemetry identity resolved");
                    self.resolved = Some(identity.clone());
                    identity
                }
                Err(e) => {
                    error!(error = %e, "Unable to determine system identity, skipping listener count");
                    return ReportOutcome::SkippedNoIdentity;
                }
            },
        };

        let count = self.registry.size().await;
        debug!(count, "Sending listener count");

        match self.publisher.publish(count_event(&identity, count)).await {
            Ok(()) => ReportOutcome::Sent { count },
            Err(e) => {
                warn!(error = %e, "Failed to publish listener count");
                ReportOutcome::PublishFailed
            }
        }
    }

    /// Spawns the reporting loop.
    ///
    /// The first report is sent immediately; the loop stops when `cancel`
    /// fires.
    pub fn spawn(mut self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = interval(self.interval);

            info!(interval_secs = self.interval.as_secs(), "Telemetry reporter started");

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        info!("Telemetry reporter shutting down");
                        break;
                    }

                    _ = tick.tick() => {
                        self.report_once().await;
                    }
                }
            }

            debug!("Telemetry reporter task completed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_event_shape() {
        let identity = SystemIdentity::parse("ITB-1101-CP1").unwrap();
        let event = count_event(&identity, 3);

        assert_eq!(event.key, "websocket-count");
        assert_eq!(event.value, "3");
        assert_eq!(event.generating_system, "ITB-1101-CP1");
        assert_eq!(event.event_tags, vec!["detail-state".to_string()]);
        assert_eq!(event.target_device.device_id, "ITB-1101-CP1");
        assert_eq!(event.affected_room.room_id, "ITB-1101");
        assert_eq!(event.affected_room.building_id, "ITB");
    }

    #[test]
    fn test_report_interval() {
        assert_eq!(REPORT_INTERVAL, Duration::from_secs(60));
    }
}
