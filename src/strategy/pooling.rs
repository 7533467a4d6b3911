//! Assignment of devices to pools.

use serde::{Deserialize, Serialize};

use crate::device::{DeviceInfo, DevicePoolId};

/// Pool name used when the deciding attribute is empty.
const UNKNOWN_POOL: &str = "unknown";

/// Decides which pool a newly connected device joins.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PoolingStrategy {
    /// Every device joins one pool named `omni`.
    #[default]
    Omni,
    /// One pool per OS version.
    OperatingSystem,
    /// One pool per ABI.
    Abi,
    /// One pool per device model.
    Model,
    /// One pool per manufacturer.
    Manufacturer,
}

impl PoolingStrategy {
    pub fn associate(&self, device: &DeviceInfo) -> DevicePoolId {
        let attribute = match self {
            PoolingStrategy::Omni => return DevicePoolId::new("omni"),
            PoolingStrategy::OperatingSystem => &device.os_version,
            PoolingStrategy::Abi => &device.abi,
            PoolingStrategy::Model => &device.model,
            PoolingStrategy::Manufacturer => &device.manufacturer,
        };
        if attribute.trim().is_empty() {
            DevicePoolId::new(UNKNOWN_POOL)
        } else {
            DevicePoolId::new(attribute.trim())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(os: &str, model: &str) -> DeviceInfo {
        DeviceInfo {
            os_version: os.to_string(),
            model: model.to_string(),
            ..DeviceInfo::new("serial")
        }
    }

    #[test]
    fn test_omni_puts_everything_in_one_pool() {
        let strategy = PoolingStrategy::Omni;
        assert_eq!(
            strategy.associate(&device("28", "a")),
            strategy.associate(&device("29", "b"))
        );
    }

    #[test]
    fn test_operating_system_pools() {
        let strategy = PoolingStrategy::OperatingSystem;
        assert_eq!(strategy.associate(&device("28", "a")), DevicePoolId::new("28"));
        assert_ne!(
            strategy.associate(&device("28", "a")),
            strategy.associate(&device("29", "a"))
        );
    }

    #[test]
    fn test_missing_attribute_goes_to_unknown() {
        let strategy = PoolingStrategy::Model;
        assert_eq!(strategy.associate(&device("28", "")), DevicePoolId::new("unknown"));
    }

    #[test]
    fn test_deserialize_pooling() {
        let strategy: PoolingStrategy = toml::from_str("type = \"operating-system\"").unwrap();
        assert_eq!(strategy, PoolingStrategy::OperatingSystem);
    }
}
