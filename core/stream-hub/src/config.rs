//! Hub configuration and construction-time validation.
//!
//! [`HubConfig`] collects the buffer sizes of all three hub variants so they
//! can be loaded from a TOML file alongside the rest of a service's settings.
//!
//! # Example
//! ```
//! use stream_hub::HubConfig;
//!
//! let cfg = HubConfig::from_toml_str("broadcast_buffer_size = 64").unwrap();
//! assert_eq!(cfg.broadcast_buffer_size, 64);
//! assert_eq!(cfg.partition_buffer_size, 256);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::HubError;

/// Default per-producer buffer of a merge hub.
pub const DEFAULT_PER_PRODUCER_BUFFER_SIZE: usize = 16;

/// Default ring size of a broadcast hub.
pub const DEFAULT_BROADCAST_BUFFER_SIZE: usize = 256;

/// Default total buffer of a partition hub.
pub const DEFAULT_PARTITION_BUFFER_SIZE: usize = 256;

/// Largest accepted broadcast ring size.
pub const MAX_BROADCAST_BUFFER_SIZE: usize = 4095;

/// Buffer and start-up settings for every hub variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Credit window of each merge-hub producer.
    pub per_producer_buffer_size: usize,
    /// Ring size of a broadcast hub (power of two, at most 4095).
    pub broadcast_buffer_size: usize,
    /// Consumers that must attach before a broadcast hub pulls upstream.
    pub broadcast_start_after_nr_of_consumers: usize,
    /// Total buffered elements across all partition-hub consumer queues.
    pub partition_buffer_size: usize,
    /// Consumers that must attach before a partition hub routes anything.
    pub partition_start_after_nr_of_consumers: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            per_producer_buffer_size: DEFAULT_PER_PRODUCER_BUFFER_SIZE,
            broadcast_buffer_size: DEFAULT_BROADCAST_BUFFER_SIZE,
            broadcast_start_after_nr_of_consumers: 0,
            partition_buffer_size: DEFAULT_PARTITION_BUFFER_SIZE,
            partition_start_after_nr_of_consumers: 0,
        }
    }
}

impl HubConfig {
    /// Parses a TOML document; missing keys fall back to the defaults.
    pub fn from_toml_str(input: &str) -> Result<Self, HubError> {
        let cfg: HubConfig = toml::from_str(input).map_err(|e| HubError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Applies the same checks the hub constructors perform.
    pub fn validate(&self) -> Result<(), HubError> {
        validate_positive("per_producer_buffer_size", self.per_producer_buffer_size)?;
        validate_broadcast_buffer_size(self.broadcast_buffer_size)?;
        validate_positive("partition_buffer_size", self.partition_buffer_size)?;
        Ok(())
    }
}

/// Rejects zero.
pub(crate) fn validate_positive(name: &'static str, value: usize) -> Result<usize, HubError> {
    if value == 0 {
        return Err(HubError::InvalidBufferSize { name, size: value, reason: "must be positive" });
    }
    Ok(value)
}

/// Broadcast rings are indexed with a mask, so the size must be a power of two.
pub(crate) fn validate_broadcast_buffer_size(value: usize) -> Result<usize, HubError> {
    let name = "broadcast_buffer_size";
    validate_positive(name, value)?;
    if value > MAX_BROADCAST_BUFFER_SIZE {
        return Err(HubError::InvalidBufferSize { name, size: value, reason: "must be at most 4095" });
    }
    if !value.is_power_of_two() {
        return Err(HubError::InvalidBufferSize { name, size: value, reason: "must be a power of two" });
    }
    Ok(value)
}

/// Batch size for demand/offset signalling: half the buffer, rounded up.
pub(crate) fn demand_threshold(buffer_size: usize) -> usize {
    buffer_size / 2 + buffer_size % 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = HubConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.per_producer_buffer_size, 16);
    }

    #[test]
    fn test_from_toml_partial() {
        let cfg = HubConfig::from_toml_str(
            r#"
            per_producer_buffer_size = 4
            partition_start_after_nr_of_consumers = 2
            "#,
        )
        .unwrap();

        assert_eq!(cfg.per_producer_buffer_size, 4);
        assert_eq!(cfg.partition_start_after_nr_of_consumers, 2);
        assert_eq!(cfg.broadcast_buffer_size, DEFAULT_BROADCAST_BUFFER_SIZE);
    }

    #[test]
    fn test_from_toml_rejects_invalid_sizes() {
        let err = HubConfig::from_toml_str("broadcast_buffer_size = 100").unwrap_err();
        assert!(matches!(err, HubError::InvalidBufferSize { size: 100, .. }));

        let err = HubConfig::from_toml_str("per_producer_buffer_size = 0").unwrap_err();
        assert!(matches!(err, HubError::InvalidBufferSize { name: "per_producer_buffer_size", .. }));

        let err = HubConfig::from_toml_str("broadcast_buffer_size = \"big\"").unwrap_err();
        assert!(matches!(err, HubError::Config(_)));
    }

    #[test]
    fn test_broadcast_size_bounds() {
        assert!(validate_broadcast_buffer_size(1).is_ok());
        assert!(validate_broadcast_buffer_size(2048).is_ok());
        assert!(validate_broadcast_buffer_size(4096).is_err());
        assert!(validate_broadcast_buffer_size(0).is_err());
        assert!(validate_broadcast_buffer_size(12).is_err());
    }

    #[test]
    fn test_demand_threshold_rounds_up() {
        assert_eq!(demand_threshold(1), 1);
        assert_eq!(demand_threshold(2), 1);
        assert_eq!(demand_threshold(4), 2);
        assert_eq!(demand_threshold(5), 3);
    }
}
