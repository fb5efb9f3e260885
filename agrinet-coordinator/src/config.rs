// AgriNet Coordinator - Cross-link orchestration layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Configuration types for AgriNet Coordinator
//!
//! Every field has a default matching the deployed firmware, so a JSON file
//! only needs the values it changes.

use crate::coap::COAP_PORT;
use crate::error::{CoordinatorError, Result};
use agrinet::RetryStrategy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Service advertised by sensor peers (6a796d28-a1f1-11ec-b909-0242ac120002)
pub const MEASUREMENT_SERVICE_UUID: u128 = 0x6a79_6d28_a1f1_11ec_b909_0242_ac12_0002;

/// Coordinator-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Maximum number of concurrently connected peers
    pub max_peers: usize,

    /// Advertised service a peer must carry to be connected
    pub service_uuid: u128,

    /// Seconds between measurement sweeps
    pub measurement_period_secs: u64,

    /// Seconds between relays toward the cloud
    pub relay_period_secs: u64,

    /// Timeout of one characteristic read
    pub read_timeout_ms: u64,

    /// Timeout of one characteristic discovery step
    pub discovery_timeout_ms: u64,

    /// Time a connect attempt may stay unanswered
    pub connect_timeout_ms: u64,

    /// Time to wait for an operation result on the internal link
    pub ack_timeout_ms: u64,

    /// Wide-area session settings
    pub session: SessionConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_peers: 20,
            service_uuid: MEASUREMENT_SERVICE_UUID,
            measurement_period_secs: 30,
            relay_period_secs: 5400,
            read_timeout_ms: 1500,
            discovery_timeout_ms: 5000,
            connect_timeout_ms: 5000,
            ack_timeout_ms: 1500,
            session: SessionConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Create a configuration with custom measurement and relay periods
    pub fn with_periods(measurement_period_secs: u64, relay_period_secs: u64) -> Self {
        Self {
            measurement_period_secs,
            relay_period_secs,
            ..Default::default()
        }
    }

    /// Configuration that relays after every sweep
    pub fn relay_every_sweep() -> Self {
        Self::with_periods(30, 30)
    }

    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            CoordinatorError::InvalidConfig(format!("{}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| CoordinatorError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants between fields
    pub fn validate(&self) -> Result<()> {
        if self.max_peers == 0 {
            return Err(CoordinatorError::InvalidConfig(
                "max_peers must be at least 1".to_string(),
            ));
        }
        if self.measurement_period_secs == 0 {
            return Err(CoordinatorError::InvalidConfig(
                "measurement_period_secs must be positive".to_string(),
            ));
        }
        if self.relay_period_secs < self.measurement_period_secs {
            return Err(CoordinatorError::InvalidConfig(format!(
                "relay period {}s is shorter than measurement period {}s",
                self.relay_period_secs, self.measurement_period_secs
            )));
        }
        self.session.validate()
    }

    /// Number of sweeps between two relays
    pub fn relay_every_cycles(&self) -> u32 {
        (self.relay_period_secs / self.measurement_period_secs.max(1)).max(1) as u32
    }

    /// Measurement period
    pub fn measurement_period(&self) -> Duration {
        Duration::from_secs(self.measurement_period_secs)
    }

    /// Characteristic read timeout
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Characteristic discovery timeout
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    /// Connect attempt timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Internal link ack timeout
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Wide-area session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Collector address, `host:port`
    pub server: String,

    /// Resource observed for user updates
    pub observe_resource: String,

    /// Resource receiving aggregate records
    pub data_resource: String,

    /// Correlation token of the observe registration
    pub observe_token: u16,

    /// Delay before retrying an unavailable transport
    pub init_backoff_secs: u64,

    /// Period of observe re-registration
    pub observe_renew_secs: u64,

    /// Period of the inbound receive loop
    pub inbound_poll_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server: format!("127.0.0.1:{}", COAP_PORT),
            observe_resource: "userpayload".to_string(),
            data_resource: "rowmeandata".to_string(),
            observe_token: 0x9889,
            init_backoff_secs: 5,
            observe_renew_secs: 600,
            inbound_poll_ms: 100,
        }
    }
}

impl SessionConfig {
    /// Check the session settings
    pub fn validate(&self) -> Result<()> {
        if self.observe_resource.is_empty() || self.data_resource.is_empty() {
            return Err(CoordinatorError::InvalidConfig(
                "resource names must not be empty".to_string(),
            ));
        }
        if self.observe_renew_secs == 0 || self.inbound_poll_ms == 0 {
            return Err(CoordinatorError::InvalidConfig(
                "session periods must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Backoff before retrying `Init`
    pub fn init_backoff(&self) -> Duration {
        Duration::from_secs(self.init_backoff_secs)
    }

    /// Retry policy of session initialisation: every `init_backoff`, forever
    pub fn init_retry(&self) -> RetryStrategy {
        RetryStrategy::forever(self.init_backoff())
    }

    /// Observe renewal period
    pub fn observe_renew(&self) -> Duration {
        Duration::from_secs(self.observe_renew_secs)
    }

    /// Inbound loop period
    pub fn inbound_poll(&self) -> Duration {
        Duration::from_millis(self.inbound_poll_ms)
    }
}
