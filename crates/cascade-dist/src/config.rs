use serde::{Deserialize, Serialize};

use crate::error::DistError;

// Validation constants
/// Room for one triple record: a kind byte, a column count byte and three
/// `u64` columns.
const MIN_PACKET_SIZE: usize = 2 + 3 * 8;
const MAX_PACKET_SIZE: usize = 1 << 20;
const MAX_NUM_REQUESTS: usize = 1 << 16;

/// Settings for the distribution substrate.
///
/// All ranks in a cluster must use the same values; packets are fixed-size
/// and collectives are only matched up if every rank checks for quiescence
/// on the same schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistConfig {
    /// Size of every packet in bytes.
    pub packet_size: usize,

    /// Send slots per distributor, and receive slots per rank.
    pub num_requests: usize,

    /// `done()` only runs its collective every this many calls.
    pub check_every: usize,

    /// Polls allowed while waiting for in-flight sends once the cluster
    /// is quiescent.
    pub drain_spin_limit: usize,
}

impl Default for DistConfig {
    fn default() -> Self {
        Self {
            packet_size: 256,
            num_requests: 64,
            check_every: 16,
            drain_spin_limit: 1 << 20,
        }
    }
}

impl DistConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), DistError> {
        if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&self.packet_size) {
            return Err(DistError::Config(format!(
                "packet size must be between {MIN_PACKET_SIZE} and {MAX_PACKET_SIZE} (got {})",
                self.packet_size
            )));
        }

        if self.num_requests == 0 || self.num_requests > MAX_NUM_REQUESTS {
            return Err(DistError::Config(format!(
                "num_requests must be between 1 and {MAX_NUM_REQUESTS} (got {})",
                self.num_requests
            )));
        }

        if self.check_every == 0 {
            return Err(DistError::Config("check_every must be at least 1".to_string()));
        }

        if self.drain_spin_limit == 0 {
            return Err(DistError::Config("drain_spin_limit must be at least 1".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(DistConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_tiny_packets() {
        let config = DistConfig {
            packet_size: 4,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DistError::Config(_))));
    }

    #[test]
    fn test_packet_must_hold_a_triple_record() {
        for packet_size in 16..MIN_PACKET_SIZE {
            let config = DistConfig {
                packet_size,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "accepted {packet_size}-byte packets");
        }
        let config = DistConfig {
            packet_size: 26,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_requests() {
        let config = DistConfig {
            num_requests: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_check_interval() {
        let config = DistConfig {
            check_every: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
