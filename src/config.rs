// Copyright © 2026 The pKVM IOMMU Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Platform description consumed at boot.
//!
//! The host hands over the device table once, together with what each
//! protected guest gets: devices to claim, device pages to map and the
//! pvIOMMU instances it sees. The whole thing is a single JSON document.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vm_device::DeviceConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read platform description {0}")]
    Read(PathBuf, #[source] io::Error),
    #[error("Failed to parse platform description")]
    Parse(#[source] serde_json::Error),
    #[error("Guest vm{0} is declared twice")]
    DuplicateGuest(u32),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PlatformConfig {
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub guests: Vec<GuestConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct GuestConfig {
    pub vm: u32,
    /// Physical addresses of devices whose group the guest claims.
    #[serde(default)]
    pub devices: Vec<u64>,
    #[serde(default)]
    pub mmio: Vec<MmioMapConfig>,
    #[serde(default)]
    pub pviommus: Vec<PvIommuConfig>,
}

/// Device page mapped into the guest stage-2.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct MmioMapConfig {
    pub phys: u64,
    pub ipa: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PvIommuConfig {
    pub id: u32,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RouteConfig {
    pub iommu: u64,
    pub sid: u32,
    pub vsid: u32,
}

impl PlatformConfig {
    pub fn parse(json: &str) -> Result<Self, ConfigError> {
        let config: PlatformConfig = serde_json::from_str(json).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json =
            fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        Self::parse(&json)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (i, guest) in self.guests.iter().enumerate() {
            if self.guests[..i].iter().any(|g| g.vm == guest.vm) {
                return Err(ConfigError::DuplicateGuest(guest.vm));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use vm_device::{IommuEndpoint, MmioResource};

    use super::*;

    #[test]
    fn test_parse_platform() {
        let config = PlatformConfig::parse(
            r#"{
                "devices": [
                    {
                        "resources": [{ "base": 4096, "size": 8192 }],
                        "iommus": [{ "iommu": 1, "endpoint": 7 }],
                        "group": 1
                    }
                ],
                "guests": [
                    {
                        "vm": 3,
                        "devices": [4096],
                        "pviommus": [
                            { "id": 0, "routes": [{ "iommu": 1, "sid": 7, "vsid": 0 }] }
                        ]
                    }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(
            config.devices,
            vec![DeviceConfig {
                resources: vec![MmioResource::new(0x1000, 0x2000)],
                iommus: vec![IommuEndpoint {
                    iommu: 1,
                    endpoint: 7
                }],
                group: 1,
            }]
        );
        assert_eq!(config.guests[0].vm, 3);
        assert!(config.guests[0].mmio.is_empty());
        assert_eq!(
            config.guests[0].pviommus[0].routes,
            vec![RouteConfig {
                iommu: 1,
                sid: 7,
                vsid: 0
            }]
        );
    }

    #[test]
    fn test_guests_are_optional() {
        let config = PlatformConfig::parse(r#"{ "devices": [] }"#).unwrap();
        assert!(config.guests.is_empty());
    }

    #[test]
    fn test_invalid_platform() {
        assert!(matches!(
            PlatformConfig::parse("{ devices: [] }"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            PlatformConfig::parse(r#"{ "devices": [], "guests": [{ "vm": 1 }, { "vm": 1 }] }"#),
            Err(ConfigError::DuplicateGuest(1))
        ));
        assert!(matches!(
            PlatformConfig::from_file(Path::new("/nonexistent/platform.json")),
            Err(ConfigError::Read(_, _))
        ));
    }
}
