//! Lock-domain and element configuration.

use serde::{Deserialize, Serialize};
use twinlock_cmi::{ObjectId, MEMORY_UPDATE_MAX, NONPAGED_PAYLOAD_MAX};

use crate::error::{MetadataError, MetadataResult};

/// Configuration for a [`LockDomain`](crate::domain::LockDomain).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Number of CPUs the shadow pool is sized for.
    pub cpu_count: usize,
    /// Shadow requests reserved per CPU.
    pub max_peer_sl_per_cpu: usize,
    /// Number of independently locked slice shards per element.
    pub slice_table_size: usize,
    /// Stripes covered by one slice.
    pub stripes_per_slice: u64,
    /// Upper bound on a non-paged record.
    pub max_nonpaged_size: usize,
    /// Size of the mirrored metadata memory block.
    pub memory_update_size: usize,
    /// Worker wake-up interval when idle, in milliseconds.
    pub worker_idle_timeout_ms: u64,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            cpu_count: 4,
            max_peer_sl_per_cpu: 256,
            slice_table_size: 64,
            stripes_per_slice: 0x800,
            max_nonpaged_size: NONPAGED_PAYLOAD_MAX,
            memory_update_size: MEMORY_UPDATE_MAX,
            worker_idle_timeout_ms: 100,
        }
    }
}

impl DomainConfig {
    /// Total shadow requests in the pool.
    pub fn shadow_pool_size(&self) -> usize {
        self.cpu_count * self.max_peer_sl_per_cpu
    }

    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> MetadataResult<()> {
        if self.cpu_count == 0 || self.max_peer_sl_per_cpu == 0 {
            return Err(MetadataError::InvalidConfig(
                "shadow pool must not be empty".into(),
            ));
        }
        if self.slice_table_size == 0 {
            return Err(MetadataError::InvalidConfig(
                "slice table needs at least one shard".into(),
            ));
        }
        if self.stripes_per_slice == 0 {
            return Err(MetadataError::InvalidConfig(
                "stripes_per_slice must be non-zero".into(),
            ));
        }
        if self.max_nonpaged_size == 0 || self.max_nonpaged_size > NONPAGED_PAYLOAD_MAX {
            return Err(MetadataError::InvalidConfig(format!(
                "max_nonpaged_size must be in 1..={}",
                NONPAGED_PAYLOAD_MAX
            )));
        }
        if self.memory_update_size > MEMORY_UPDATE_MAX {
            return Err(MetadataError::InvalidConfig(format!(
                "memory_update_size must be at most {}",
                MEMORY_UPDATE_MAX
            )));
        }
        Ok(())
    }

    /// Parses a JSON configuration and validates it.
    pub fn from_json(text: &str) -> MetadataResult<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| MetadataError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

/// Configuration for one metadata element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementConfig {
    /// Object the element guards.
    pub object_id: ObjectId,
    /// Declared size of the non-paged record in bytes.
    pub nonpaged_size: usize,
    /// Size of the mirrored metadata memory block.
    pub memory_size: usize,
    /// System objects stamp non-paged updates with sequence numbers.
    pub is_system_object: bool,
}

impl ElementConfig {
    /// Config for `object_id` with a 256-byte record and memory block.
    pub fn new(object_id: ObjectId) -> Self {
        Self {
            object_id,
            nonpaged_size: 256,
            memory_size: MEMORY_UPDATE_MAX,
            is_system_object: false,
        }
    }

    /// Replaces the non-paged record size.
    pub fn with_nonpaged_size(mut self, size: usize) -> Self {
        self.nonpaged_size = size;
        self
    }

    /// Marks the element as guarding a system object.
    pub fn system_object(mut self) -> Self {
        self.is_system_object = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = DomainConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.shadow_pool_size(), 1024);
    }

    #[test]
    fn test_zero_pool_rejected() {
        let config = DomainConfig {
            max_peer_sl_per_cpu: 0,
            ..DomainConfig::default()
        };
        assert!(matches!(config.validate(), Err(MetadataError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_slice_rejected() {
        let config = DomainConfig {
            stripes_per_slice: 0,
            ..DomainConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let config = DomainConfig {
            cpu_count: 2,
            ..DomainConfig::default()
        };
        let text = serde_json::to_string(&config).unwrap();
        assert_eq!(DomainConfig::from_json(&text).unwrap(), config);
    }

    #[test]
    fn test_json_invalid() {
        assert!(DomainConfig::from_json("{\"cpu_count\": 1}").is_err());
    }

    #[test]
    fn test_element_config_builders() {
        let config = ElementConfig::new(7).with_nonpaged_size(64).system_object();
        assert_eq!(config.nonpaged_size, 64);
        assert!(config.is_system_object);
    }
}
