//! Configuration types for spandisk
//!
//! `DeviceSpec` is the declarative form of one logical device: the
//! ordered component list plus interleave and flags. The ctl binary
//! deserializes these from TOML; the library consumes them directly.

use crate::types::{DeviceFlags, TransferMode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Declarative configuration for one logical device
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Unit number
    pub unit: u32,
    /// Ordered component paths (block devices or regular files)
    pub components: Vec<PathBuf>,
    /// Interleave unit in blocks; 0 means pure concatenation
    #[serde(default)]
    pub interleave: u64,
    /// Duplicate writes across two equal component halves
    #[serde(default)]
    pub mirrored: bool,
    /// Truncate every component to the size of the smallest
    #[serde(default)]
    pub uniform: bool,
    /// Preferred transfer mode; forced to direct when the geometry or
    /// mirroring requires it
    #[serde(default)]
    pub transfer_mode: TransferMode,
    /// Open components with direct I/O (bypassing the page cache)
    #[serde(default)]
    pub direct_io: bool,
}

impl DeviceSpec {
    /// Behavior flags implied by this spec
    #[must_use]
    pub const fn flags(&self) -> DeviceFlags {
        DeviceFlags {
            mirrored: self.mirrored,
            uniform: self.uniform,
        }
    }
}

/// Root configuration for the ctl binary
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CtlConfig {
    /// Devices to manage
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
    /// Remap pool capacity in bytes; None uses the built-in default
    #[serde(default)]
    pub remap_pool_bytes: Option<usize>,
}

impl CtlConfig {
    /// Find the spec for a unit number
    #[must_use]
    pub fn device(&self, unit: u32) -> Option<&DeviceSpec> {
        self.devices.iter().find(|d| d.unit == unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults() {
        let json = r#"{"unit": 0, "components": ["/dev/sd1c", "/dev/sd2c"]}"#;
        let spec: DeviceSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.interleave, 0);
        assert!(!spec.mirrored);
        assert!(!spec.uniform);
        assert_eq!(spec.transfer_mode, TransferMode::ScatterGather);
        assert_eq!(spec.components.len(), 2);
    }

    #[test]
    fn test_config_lookup() {
        let config = CtlConfig {
            devices: vec![DeviceSpec {
                unit: 2,
                components: vec![PathBuf::from("/tmp/a")],
                interleave: 16,
                mirrored: false,
                uniform: false,
                transfer_mode: TransferMode::Direct,
                direct_io: false,
            }],
            remap_pool_bytes: None,
        };
        assert!(config.device(2).is_some());
        assert!(config.device(0).is_none());
    }
}
