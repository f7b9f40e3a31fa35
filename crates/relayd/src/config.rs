//! Daemon configuration.

use std::net::SocketAddr;
use std::time::Duration;

use relay_core::KeyFilter;
use relay_protocol::MAX_LISTENER_MESSAGE_SIZE;

use crate::hub::{HubConfig, DEFAULT_HUB_PATH, DEFAULT_PUBLISH_BUFFER};
use crate::supervisor::LivenessConfig;
use crate::telemetry::REPORT_INTERVAL;

/// Default address of the listener endpoint.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8888";

/// Complete runtime configuration of the relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the HTTP/WebSocket server binds to
    pub listen_addr: SocketAddr,
    /// Hub address; `None` runs the relay without an upstream
    pub hub_address: Option<String>,
    /// Path of the hub's messenger endpoint
    pub hub_path: String,
    /// Outbound telemetry buffer toward the hub
    pub hub_publish_buffer: usize,
    /// Event keys forwarded to listeners
    pub filter: KeyFilter,
    /// Heartbeat and deadline timing
    pub liveness: LivenessConfig,
    /// Interval of the listener count report
    pub report_interval: Duration,
    /// Largest frame accepted from a listener (bytes)
    pub max_message_size: usize,
}

impl RelayConfig {
    /// Checks the timing invariants.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a duration is zero, the ping period is not
    /// shorter than the read deadline, or the message size is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("ping period", self.liveness.ping_period),
            ("read deadline", self.liveness.read_deadline),
            ("write timeout", self.liveness.write_timeout),
            ("report interval", self.report_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { name });
            }
        }

        if self.liveness.ping_period >= self.liveness.read_deadline {
            return Err(ConfigError::PingNotBeforeDeadline {
                ping_period: self.liveness.ping_period,
                read_deadline: self.liveness.read_deadline,
            });
        }

        if self.max_message_size == 0 {
            return Err(ConfigError::ZeroMessageSize);
        }

        Ok(())
    }

    /// Returns the hub settings, if a hub is configured.
    pub fn hub(&self) -> Option<HubConfig> {
        self.hub_address.as_ref().map(|address| HubConfig {
            address: address.clone(),
            path: self.hub_path.clone(),
            publish_buffer: self.hub_publish_buffer,
        })
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8888)),
            hub_address: None,
            hub_path: DEFAULT_HUB_PATH.to_string(),
            hub_publish_buffer: DEFAULT_PUBLISH_BUFFER,
            filter: KeyFilter::default(),
            liveness: LivenessConfig::default(),
            report_interval: REPORT_INTERVAL,
            max_message_size: MAX_LISTENER_MESSAGE_SIZE,
        }
    }
}

/// Invalid configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be greater than zero")]
    ZeroDuration { name: &'static str },

    #[error("Ping period ({ping_period:?}) must be shorter than the read deadline ({read_deadline:?})")]
    PingNotBeforeDeadline {
        ping_period: Duration,
        read_deadline: Duration,
    },

    #[error("Maximum message size must be greater than zero")]
    ZeroMessageSize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_addr.to_string(), DEFAULT_LISTEN_ADDR);
        assert_eq!(config.max_message_size, 512);
        assert!(config.hub().is_none());
    }

    #[test]
    fn test_ping_must_precede_deadline() {
        let mut config = RelayConfig::default();
        config.liveness.ping_period = config.liveness.read_deadline;

        assert!(matches!(
            config.validate(),
            Err(ConfigError::PingNotBeforeDeadline { .. })
        ));
    }

    #[test]
    fn test_zero_duration_rejected() {
        let mut config = RelayConfig::default();
        config.liveness.write_timeout = Duration::ZERO;

        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroDuration {
                name: "write timeout"
            })
        );
    }

    #[test]
    fn test_hub_settings() {
        let config = RelayConfig {
            hub_address: Some("hub:7100".to_string()),
            ..RelayConfig::default()
        };

        let hub = config.hub().unwrap();
        assert_eq!(hub.url(), "ws://hub:7100/connect/messenger");
        assert_eq!(hub.publish_buffer, DEFAULT_PUBLISH_BUFFER);
    }
}
