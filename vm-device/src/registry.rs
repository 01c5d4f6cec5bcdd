// Copyright © 2026 The pKVM IOMMU Authors
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Ownership registry of the assignable devices.
//!
//! [DeviceRegistry](struct.DeviceRegistry.html) keeps track of which
//! principal owns each device of the static table and drives the
//! transitions between them:
//!
//! ```text
//!   HOST --donate--> HYP --claim/map_guest_mmio--> GUEST(vm)
//!     ^               |                               |
//!     +----reclaim----+                               |
//!     +-------------------teardown(vm)----------------+
//! ```
//!
//! A single lock covers the state of every device. It is held across the
//! whole check/reset/assign sequence of a transition, and it is handed to
//! IOMMU code through [IommuGuard](struct.IommuGuard.html) so that a device
//! cannot change hands while its stream is being programmed.

use std::io;
use std::result;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use vm_memory::GuestAddress;

use crate::device::{DeviceConfig, DeviceReset, Owner, VmHandle, MAX_NR_DEVICES, PAGE_SIZE};
use crate::mem_protect::{MemError, MemProtect};

/// Errors for device ownership transitions.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Device table holds {0} devices, more than supported")]
    TooManyDevices(usize),
    #[error("Device {0} has an invalid description")]
    InvalidDevice(usize),
    #[error("Address {0:#x} does not belong to an assignable device")]
    NotFound(u64),
    #[error("Device {0} is owned by {1}")]
    Busy(usize, Owner),
    #[error("Access to device {0} denied")]
    PermissionDenied(usize),
    #[error("IOMMU {0:#x} endpoint {1} is reserved to the host")]
    HostEndpoint(u64, u32),
    #[error("Failed to reset device {0}")]
    Reset(usize, #[source] io::Error),
    #[error("Failed to transfer memory of device {0}")]
    Memory(usize, #[source] MemError),
}

pub type Result<T> = result::Result<T, Error>;

struct DeviceState {
    owner: Owner,
    reset: Option<Arc<dyn DeviceReset>>,
}

/// Registry lock handed out by [`DeviceRegistry::iommu_lock`].
///
/// Holding it keeps the owner of every device stable. Host-only endpoints
/// yield an empty guard that holds nothing.
pub struct IommuGuard<'a> {
    states: Option<MutexGuard<'a, Vec<DeviceState>>>,
}

impl IommuGuard<'_> {
    /// Returns true if the guard holds the registry lock.
    pub fn is_locked(&self) -> bool {
        self.states.is_some()
    }

    /// Release the registry lock.
    pub fn unlock(self) {}
}

/// Tracks the owner of each device of the static table.
pub struct DeviceRegistry {
    devices: Vec<DeviceConfig>,
    states: Mutex<Vec<DeviceState>>,
    mem: Arc<dyn MemProtect>,
}

impl DeviceRegistry {
    /// Create the registry from the table handed off by the host. Every
    /// device starts owned by the host.
    pub fn new(devices: Vec<DeviceConfig>, mem: Arc<dyn MemProtect>) -> Result<Self> {
        if devices.len() > MAX_NR_DEVICES {
            return Err(Error::TooManyDevices(devices.len()));
        }
        if let Some(idx) = devices.iter().position(|dev| !dev.is_valid()) {
            return Err(Error::InvalidDevice(idx));
        }

        let states = devices
            .iter()
            .map(|_| DeviceState {
                owner: Owner::Host,
                reset: None,
            })
            .collect();

        Ok(DeviceRegistry {
            devices,
            states: Mutex::new(states),
            mem,
        })
    }

    /// Number of devices in the table.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn device(&self, idx: usize) -> Option<&DeviceConfig> {
        self.devices.get(idx)
    }

    /// Index of the device with a resource containing `phys`.
    pub fn find(&self, phys: u64) -> Option<usize> {
        self.devices.iter().position(|dev| dev.contains(phys))
    }

    fn find_by_endpoint(&self, iommu: u64, endpoint: u32) -> Option<usize> {
        self.devices
            .iter()
            .position(|dev| dev.uses_endpoint(iommu, endpoint))
    }

    fn lookup(&self, phys: u64) -> Result<usize> {
        self.find(phys).ok_or(Error::NotFound(phys))
    }

    /// Returns true if `phys` belongs to a device of the table.
    pub fn is_assignable(&self, phys: u64) -> bool {
        self.find(phys).is_some()
    }

    /// Current owner of device `idx`.
    pub fn owner(&self, idx: usize) -> Option<Owner> {
        self.states.lock().unwrap().get(idx).map(|s| s.owner)
    }

    /// Snapshot of the owner of every device, in table order.
    pub fn owners(&self) -> Vec<Owner> {
        self.states.lock().unwrap().iter().map(|s| s.owner).collect()
    }

    /// Install or replace the reset handler of the device containing `phys`.
    pub fn register_reset(&self, phys: u64, handler: Arc<dyn DeviceReset>) -> Result<()> {
        let idx = self.lookup(phys)?;
        self.states.lock().unwrap()[idx].reset = Some(handler);
        Ok(())
    }

    /// Host donates the device containing `phys` to the hypervisor, the
    /// first step before a guest can claim it.
    pub fn donate(&self, phys: u64) -> Result<()> {
        let idx = self.lookup(phys)?;
        let mut states = self.states.lock().unwrap();

        let owner = states[idx].owner;
        if owner != Owner::Host {
            return Err(Error::Busy(idx, owner));
        }

        let resources = &self.devices[idx].resources;
        for (done, res) in resources.iter().enumerate() {
            if let Err(e) = self.mem.host_donate_hyp(res.base, res.size) {
                for res in &resources[..done] {
                    if let Err(e) = self.mem.hyp_donate_host(res.base, res.size) {
                        error!("Failed to return {:#x} to the host: {}", res.base, e);
                    }
                }
                return Err(Error::Memory(idx, e));
            }
        }

        states[idx].owner = Owner::Hyp;
        debug!("Device {} donated to the hypervisor", idx);
        Ok(())
    }

    /// Host takes back a device it donated but no guest claimed.
    pub fn reclaim(&self, phys: u64) -> Result<()> {
        let idx = self.lookup(phys)?;
        let mut states = self.states.lock().unwrap();

        match states[idx].owner {
            Owner::Hyp => (),
            Owner::Host => return Err(Error::PermissionDenied(idx)),
            owner @ Owner::Guest(_) => return Err(Error::Busy(idx, owner)),
        }

        let resources = &self.devices[idx].resources;
        for (done, res) in resources.iter().enumerate() {
            if let Err(e) = self.mem.hyp_donate_host(res.base, res.size) {
                for res in &resources[..done] {
                    if let Err(e) = self.mem.host_donate_hyp(res.base, res.size) {
                        error!("Failed to return {:#x} to the hypervisor: {}", res.base, e);
                    }
                }
                return Err(Error::Memory(idx, e));
            }
        }

        states[idx].owner = Owner::Host;
        debug!("Device {} reclaimed by the host", idx);
        Ok(())
    }

    fn assign_device(&self, states: &mut [DeviceState], idx: usize, vm: VmHandle) -> Result<()> {
        let dev = &self.devices[idx];
        if dev
            .resources
            .iter()
            .any(|res| !self.mem.is_owned_by(Owner::Hyp, res.base, res.size))
        {
            return Err(Error::PermissionDenied(idx));
        }

        if let Some(reset) = &states[idx].reset {
            reset.reset(dev).map_err(|e| Error::Reset(idx, e))?;
        }

        states[idx].owner = Owner::Guest(vm);
        Ok(())
    }

    // Hand every device of `group` to `vm`, or none of them.
    fn assign_group(&self, states: &mut [DeviceState], group: u32, vm: VmHandle) -> Result<()> {
        let mut assigned: Vec<usize> = Vec::new();

        for idx in (0..self.devices.len()).filter(|idx| self.devices[*idx].group == group) {
            let res = match states[idx].owner {
                Owner::Guest(_) => Err(Error::PermissionDenied(idx)),
                _ => self.assign_device(states, idx, vm),
            };

            if let Err(e) = res {
                for idx in assigned {
                    states[idx].owner = Owner::Hyp;
                }
                return Err(e);
            }
            assigned.push(idx);
        }

        info!("Device group {} assigned to {}", group, vm);
        Ok(())
    }

    fn claim_locked(&self, states: &mut [DeviceState], idx: usize, vm: VmHandle) -> Result<()> {
        match states[idx].owner {
            Owner::Guest(owner) if owner == vm => Ok(()),
            Owner::Guest(_) => Err(Error::PermissionDenied(idx)),
            _ => self.assign_group(states, self.devices[idx].group, vm),
        }
    }

    /// Assign the group of the device containing `phys` to `vm`.
    pub fn claim(&self, phys: u64, vm: VmHandle) -> Result<()> {
        let idx = self.lookup(phys)?;
        let mut states = self.states.lock().unwrap();
        self.claim_locked(&mut states, idx, vm)
    }

    /// Map the device page at `phys` into `vm` at `ipa`. The first mapping
    /// of a device claims its whole group.
    pub fn map_guest_mmio(&self, vm: VmHandle, phys: u64, ipa: GuestAddress) -> Result<()> {
        let idx = self.lookup(phys)?;
        let mut states = self.states.lock().unwrap();

        self.claim_locked(&mut states, idx, vm)?;
        self.mem
            .hyp_donate_guest(vm, phys, ipa)
            .map_err(|e| Error::Memory(idx, e))
    }

    /// Returns true if the page at `phys` lies inside a resource of a device
    /// owned by `vm`.
    pub fn guest_owns_mmio(&self, vm: VmHandle, phys: u64) -> bool {
        let states = self.states.lock().unwrap();
        self.devices
            .iter()
            .zip(states.iter())
            .filter(|(_, state)| state.owner == Owner::Guest(vm))
            .flat_map(|(dev, _)| dev.resources.iter())
            .any(|res| res.contains_range(phys, PAGE_SIZE))
    }

    /// Return every device owned by `vm` to the host. Used when the guest
    /// dies, nothing here can fail.
    pub fn teardown(&self, vm: VmHandle) {
        let mut states = self.states.lock().unwrap();

        for (idx, (dev, state)) in self.devices.iter().zip(states.iter_mut()).enumerate() {
            if state.owner != Owner::Guest(vm) {
                continue;
            }

            if let Some(reset) = &state.reset {
                if let Err(e) = reset.reset(dev) {
                    warn!("Failed to reset device {} on {} teardown: {}", idx, vm, e);
                }
            }

            state.owner = Owner::Host;
            for res in &dev.resources {
                self.mem.set_host_owner(res.base, res.size);
            }
            debug!("Device {} returned to the host", idx);
        }
    }

    /// Check that `principal` (`None` being the host) may program the stream
    /// `endpoint` of `iommu`, and keep the registry locked while it does.
    pub fn iommu_lock(
        &self,
        iommu: u64,
        endpoint: u32,
        principal: Option<VmHandle>,
    ) -> Result<IommuGuard<'_>> {
        let Some(idx) = self.find_by_endpoint(iommu, endpoint) else {
            return match principal {
                Some(_) => Err(Error::HostEndpoint(iommu, endpoint)),
                None => Ok(IommuGuard { states: None }),
            };
        };

        let expected = match principal {
            Some(vm) => Owner::Guest(vm),
            None => Owner::Host,
        };

        let states = self.states.lock().unwrap();
        if states[idx].owner != expected {
            return Err(Error::PermissionDenied(idx));
        }

        Ok(IommuGuard {
            states: Some(states),
        })
    }
}
