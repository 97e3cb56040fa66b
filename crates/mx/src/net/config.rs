use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::MxError;
use super::flow::FlowConfig;
use super::fragment::{FRAGMENT_HEADER_SIZE, SAFE_FRAGMENT_SIZE};
use super::protocol::{DEFAULT_RELIABLE_PORT, DEFAULT_REALTIME_PORT, PROTOCOL_ID};
use super::stats::PacketLossSimulation;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub packet_loss_timeout_ms: u64,
    pub disconnect_warning_ticks: i32,
    pub disconnect_ticks: i32,
    pub flow: FlowConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            packet_loss_timeout_ms: 1000,
            disconnect_warning_ticks: 30,
            disconnect_ticks: 900,
            flow: FlowConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn packet_loss_timeout(&self) -> Duration {
        Duration::from_millis(self.packet_loss_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// Upper bound on one fragment including its sub-header.
    pub fragment_size: usize,
    /// Fragments accepted ahead of their header before further ones are refused.
    pub max_unordered_fragments: usize,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            fragment_size: SAFE_FRAGMENT_SIZE,
            max_unordered_fragments: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MxConfig {
    pub bind: IpAddr,
    pub realtime_port: u16,
    pub reliable_port: u16,
    pub protocol_id: u32,
    pub max_pending_events: usize,
    pub client: ClientConfig,
    pub reliability: ReliabilityConfig,
    pub packet_loss: PacketLossSimulation,
}

impl Default for MxConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            realtime_port: DEFAULT_REALTIME_PORT,
            reliable_port: DEFAULT_RELIABLE_PORT,
            protocol_id: PROTOCOL_ID,
            max_pending_events: 4096,
            client: ClientConfig::default(),
            reliability: ReliabilityConfig::default(),
            packet_loss: PacketLossSimulation::default(),
        }
    }
}

impl MxConfig {
    /// Loopback config on ephemeral ports, mostly for tests.
    pub fn loopback() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            realtime_port: 0,
            reliable_port: 0,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), MxError> {
        if self.reliability.fragment_size <= FRAGMENT_HEADER_SIZE {
            return Err(MxError::InvalidConfig(format!(
                "fragment_size must exceed the {FRAGMENT_HEADER_SIZE} byte fragment header"
            )));
        }
        if self.client.disconnect_warning_ticks > self.client.disconnect_ticks {
            return Err(MxError::InvalidConfig(
                "disconnect_warning_ticks must not exceed disconnect_ticks".into(),
            ));
        }
        let flow = &self.client.flow;
        if flow.good_send_rate <= 0.0 || flow.bad_send_rate <= 0.0 {
            return Err(MxError::InvalidConfig("send rates must be positive".into()));
        }
        if flow.min_penalty_secs > flow.max_penalty_secs {
            return Err(MxError::InvalidConfig(
                "min_penalty_secs must not exceed max_penalty_secs".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.packet_loss.loss_percent) {
            return Err(MxError::InvalidConfig(
                "loss_percent must be within 0..=100".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(MxConfig::default().validate().is_ok());
        assert!(MxConfig::loopback().validate().is_ok());
    }

    #[test]
    fn test_rejects_tiny_fragments() {
        let mut config = MxConfig::default();
        config.reliability.fragment_size = FRAGMENT_HEADER_SIZE;
        assert!(matches!(config.validate(), Err(MxError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let mut config = MxConfig::default();
        config.client.disconnect_warning_ticks = 1000;
        assert!(config.validate().is_err());
    }
}
