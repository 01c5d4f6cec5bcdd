// Copyright © 2026 The pKVM IOMMU Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Boot of a platform description: the device table is handed to the
//! registry, every guest gets its devices and its pvIOMMU routes, and the
//! resulting state can be reported back.

use std::collections::BTreeMap;
use std::result;
use std::sync::Arc;

use pviommu::{PvIommuRouter, RouteError, VsidTable};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vm_device::{DeviceRegistry, MmioResource, Owner, PageOwnership, VmHandle};
use vm_memory::GuestAddress;

use crate::config::{GuestConfig, PlatformConfig};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid device table")]
    Devices(#[source] vm_device::Error),
    #[error("Failed to donate device at {0:#x}")]
    Donate(u64, #[source] vm_device::Error),
    #[error("Failed to assign device at {1:#x} to {0}")]
    Claim(VmHandle, u64, #[source] vm_device::Error),
    #[error("Failed to map device page {1:#x} into {0}")]
    MapMmio(VmHandle, u64, #[source] vm_device::Error),
    #[error("Failed to set up the pvIOMMU routes of {0}")]
    Route(VmHandle, #[source] RouteError),
    #[error("No guest {0} on this platform")]
    UnknownGuest(VmHandle),
}

pub type Result<T> = result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceReport {
    pub index: usize,
    pub group: u32,
    pub owner: Owner,
    pub resources: Vec<MmioResource>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RouteReport {
    pub vsid: u32,
    pub iommu: u64,
    pub sid: u32,
    /// The guest owns the device issuing DMA on this stream.
    pub reachable: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PvIommuReport {
    pub id: u32,
    pub routes: Vec<RouteReport>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct GuestReport {
    pub vm: u32,
    pub pviommus: Vec<PvIommuReport>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PlatformReport {
    pub devices: Vec<DeviceReport>,
    pub guests: Vec<GuestReport>,
}

pub struct Platform {
    devices: Arc<DeviceRegistry>,
    mem: Arc<PageOwnership>,
    router: PvIommuRouter,
    guests: BTreeMap<VmHandle, VsidTable>,
}

impl Platform {
    pub fn boot(config: PlatformConfig) -> Result<Self> {
        let mem = Arc::new(PageOwnership::new());
        let devices =
            DeviceRegistry::new(config.devices, mem.clone()).map_err(Error::Devices)?;
        info!("Registered {} assignable device(s)", devices.len());

        let mut platform = Platform {
            devices: Arc::new(devices),
            mem,
            router: PvIommuRouter::new(),
            guests: BTreeMap::new(),
        };

        for guest in &config.guests {
            platform.boot_guest(guest)?;
        }

        Ok(platform)
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    pub fn memory(&self) -> &Arc<PageOwnership> {
        &self.mem
    }

    pub fn vsids(&self, vm: VmHandle) -> Option<&VsidTable> {
        self.guests.get(&vm)
    }

    // Donate every host-owned device sharing a group with the one at `phys`.
    fn donate_group(&self, vm: VmHandle, phys: u64) -> Result<()> {
        let idx = self
            .devices
            .find(phys)
            .ok_or(Error::Claim(vm, phys, vm_device::Error::NotFound(phys)))?;
        let group = self.devices.device(idx).map(|d| d.group);

        for i in 0..self.devices.len() {
            let Some(dev) = self.devices.device(i) else {
                continue;
            };
            if Some(dev.group) != group || self.devices.owner(i) != Some(Owner::Host) {
                continue;
            }
            let base = dev.resources[0].base;
            self.devices
                .donate(base)
                .map_err(|e| Error::Donate(base, e))?;
        }

        Ok(())
    }

    fn boot_guest(&mut self, guest: &GuestConfig) -> Result<()> {
        let vm = VmHandle(guest.vm);

        for pviommu in &guest.pviommus {
            self.router
                .attach(vm, pviommu.id)
                .map_err(|e| Error::Route(vm, e))?;
            for route in &pviommu.routes {
                self.router
                    .add_vsid(vm, pviommu.id, route.iommu, route.sid, route.vsid)
                    .map_err(|e| Error::Route(vm, e))?;
            }
        }

        for &phys in &guest.devices {
            self.donate_group(vm, phys)?;
            self.devices
                .claim(phys, vm)
                .map_err(|e| Error::Claim(vm, phys, e))?;
        }

        for map in &guest.mmio {
            self.donate_group(vm, map.phys)?;
            self.devices
                .map_guest_mmio(vm, map.phys, GuestAddress(map.ipa))
                .map_err(|e| Error::MapMmio(vm, map.phys, e))?;
        }

        let vsids = self.router.finalize(vm).map_err(|e| Error::Route(vm, e))?;
        for (id, entries) in vsids.pviommus() {
            for e in entries {
                if !self.reachable(vm, e.iommu, e.sid) {
                    warn!(
                        "{} pvIOMMU {} vsid {} routes to IOMMU {:#x} stream {} it does not own",
                        vm, id, e.vsid, e.iommu, e.sid
                    );
                }
            }
        }

        info!("Guest {} booted", vm);
        self.guests.insert(vm, vsids);
        Ok(())
    }

    fn reachable(&self, vm: VmHandle, iommu: u64, sid: u32) -> bool {
        self.devices.iommu_lock(iommu, sid, Some(vm)).is_ok()
    }

    /// Destroy guest `vm`: its devices go back to the host and its streams
    /// can be routed again.
    pub fn teardown(&mut self, vm: VmHandle) -> Result<()> {
        if self.guests.remove(&vm).is_none() {
            return Err(Error::UnknownGuest(vm));
        }

        self.devices.teardown(vm);
        self.router.teardown(vm);
        info!("Guest {} torn down", vm);
        Ok(())
    }

    pub fn report(&self) -> PlatformReport {
        let devices = self
            .devices
            .owners()
            .into_iter()
            .enumerate()
            .filter_map(|(index, owner)| {
                let dev = self.devices.device(index)?;
                Some(DeviceReport {
                    index,
                    group: dev.group,
                    owner,
                    resources: dev.resources.clone(),
                })
            })
            .collect();

        let guests = self
            .guests
            .iter()
            .map(|(vm, vsids)| GuestReport {
                vm: vm.0,
                pviommus: vsids
                    .pviommus()
                    .map(|(id, entries)| PvIommuReport {
                        id,
                        routes: entries
                            .iter()
                            .map(|e| RouteReport {
                                vsid: e.vsid,
                                iommu: e.iommu,
                                sid: e.sid,
                                reachable: self.reachable(*vm, e.iommu, e.sid),
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();

        PlatformReport { devices, guests }
    }
}

#[cfg(test)]
mod tests {
    use vm_device::{DeviceConfig, IommuEndpoint, MemProtect};

    use super::*;
    use crate::config::{MmioMapConfig, PvIommuConfig, RouteConfig};

    fn device(base: u64, group: u32, endpoint: u32) -> DeviceConfig {
        DeviceConfig {
            resources: vec![MmioResource::new(base, 0x1000)],
            iommus: vec![IommuEndpoint { iommu: 1, endpoint }],
            group,
        }
    }

    fn config() -> PlatformConfig {
        PlatformConfig {
            devices: vec![
                device(0x1000_0000, 1, 10),
                device(0x1001_0000, 1, 11),
                device(0x2000_0000, 2, 20),
            ],
            guests: vec![GuestConfig {
                vm: 1,
                devices: vec![0x1000_0000],
                mmio: vec![],
                pviommus: vec![PvIommuConfig {
                    id: 0,
                    routes: vec![
                        RouteConfig {
                            iommu: 1,
                            sid: 10,
                            vsid: 0,
                        },
                        RouteConfig {
                            iommu: 1,
                            sid: 20,
                            vsid: 1,
                        },
                    ],
                }],
            }],
        }
    }

    #[test]
    fn test_boot_claims_whole_group() {
        let platform = Platform::boot(config()).unwrap();

        assert_eq!(
            platform.devices().owners(),
            vec![
                Owner::Guest(VmHandle(1)),
                Owner::Guest(VmHandle(1)),
                Owner::Host
            ]
        );
        assert_eq!(
            platform.vsids(VmHandle(1)).unwrap().route(0, 1).unwrap().sid,
            20
        );

        let report = platform.report();
        let routes = &report.guests[0].pviommus[0].routes;
        assert!(routes[0].reachable);
        assert!(!routes[1].reachable);
    }

    #[test]
    fn test_boot_maps_mmio() {
        let mut config = config();
        config.guests[0].devices.clear();
        config.guests[0].mmio.push(MmioMapConfig {
            phys: 0x2000_0000,
            ipa: 0x4000_0000,
        });

        let platform = Platform::boot(config).unwrap();
        assert_eq!(platform.devices().owner(2), Some(Owner::Guest(VmHandle(1))));
        assert_eq!(
            platform
                .memory()
                .guest_mapping(VmHandle(1), GuestAddress(0x4000_0000)),
            Some(0x2000_0000)
        );
    }

    #[test]
    fn test_boot_rejects_shared_group() {
        let mut config = config();
        config.guests.push(GuestConfig {
            vm: 2,
            devices: vec![0x1001_0000],
            ..Default::default()
        });

        assert!(matches!(
            Platform::boot(config),
            Err(Error::Claim(VmHandle(2), 0x1001_0000, _))
        ));
    }

    #[test]
    fn test_boot_rejects_route_of_other_guest() {
        let mut config = config();
        config.guests.push(GuestConfig {
            vm: 2,
            pviommus: vec![PvIommuConfig {
                id: 0,
                routes: vec![RouteConfig {
                    iommu: 1,
                    sid: 10,
                    vsid: 0,
                }],
            }],
            ..Default::default()
        });

        assert!(matches!(
            Platform::boot(config),
            Err(Error::Route(VmHandle(2), RouteError::RouteClaimed(1, 10, VmHandle(1))))
        ));
    }

    #[test]
    fn test_teardown_returns_devices() {
        let mut platform = Platform::boot(config()).unwrap();
        platform.teardown(VmHandle(1)).unwrap();

        assert_eq!(platform.devices().owners(), vec![Owner::Host; 3]);
        assert!(platform
            .memory()
            .is_owned_by(Owner::Host, 0x1000_0000, 0x1000));
        assert!(platform.report().guests.is_empty());
        assert!(matches!(
            platform.teardown(VmHandle(1)),
            Err(Error::UnknownGuest(VmHandle(1)))
        ));
    }
}
