use serde::{Deserialize, Serialize};

/// Drops a share of outbound datagrams before they reach the socket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PacketLossSimulation {
    pub enabled: bool,
    /// Percentage of datagrams to drop, 0 to 100.
    pub loss_percent: f32,
}

impl PacketLossSimulation {
    pub fn with_loss(loss_percent: f32) -> Self {
        Self {
            enabled: loss_percent > 0.0,
            loss_percent,
        }
    }

    pub fn should_drop(&self) -> bool {
        if !self.enabled || self.loss_percent <= 0.0 {
            return false;
        }
        rand::random::<f32>() * 100.0 < self.loss_percent
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub datagrams_dropped: u64,
    pub datagrams_rejected: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_simulation_never_drops() {
        let sim = PacketLossSimulation {
            enabled: false,
            loss_percent: 100.0,
        };
        assert!((0..100).all(|_| !sim.should_drop()));
    }

    #[test]
    fn test_full_loss_always_drops() {
        let sim = PacketLossSimulation::with_loss(100.0);
        assert!((0..100).all(|_| sim.should_drop()));
    }
}
