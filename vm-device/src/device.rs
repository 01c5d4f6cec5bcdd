// Copyright © 2026 The pKVM IOMMU Authors
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Static description of assignable devices and of the principals owning them.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

/// Granule used for every ownership transfer.
pub const PAGE_SIZE: u64 = 4096;
pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

/// Maximum number of devices in the static table.
pub const MAX_NR_DEVICES: usize = 64;
/// Maximum number of MMIO resources per device.
pub const MAX_NR_RESOURCES: usize = 8;
/// Maximum number of IOMMU endpoints per device.
pub const MAX_NR_IOMMUS: usize = 8;

/// Handle of a protected guest VM.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VmHandle(pub u32);

impl fmt::Display for VmHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "vm{}", self.0)
    }
}

/// Principal owning a device or a page of memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Owner {
    /// The untrusted host. This is where every device starts.
    Host,
    /// The hypervisor itself. For devices this is the transit state between
    /// the host donating it and a guest claiming it.
    Hyp,
    /// A protected guest.
    Guest(VmHandle),
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Owner::Host => write!(f, "host"),
            Owner::Hyp => write!(f, "hyp"),
            Owner::Guest(vm) => write!(f, "{vm}"),
        }
    }
}

/// Physical MMIO range of a device.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmioResource {
    pub base: u64,
    pub size: u64,
}

impl MmioResource {
    pub fn new(base: u64, size: u64) -> Self {
        MmioResource { base, size }
    }

    /// Returns true if `addr` falls inside the resource.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr - self.base < self.size
    }

    /// Returns true if `[addr, addr + size)` is fully inside the resource.
    pub fn contains_range(&self, addr: u64, size: u64) -> bool {
        self.contains(addr) && size <= self.size - (addr - self.base)
    }

    fn is_valid(&self) -> bool {
        self.size != 0
            && self.base & !PAGE_MASK == 0
            && self.size & !PAGE_MASK == 0
            && self.base.checked_add(self.size).is_some()
    }
}

/// Stream the device issues DMA through: an IOMMU instance and the stream
/// ID (endpoint) the device uses on it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IommuEndpoint {
    pub iommu: u64,
    pub endpoint: u32,
}

/// Boot-time description of an assignable device, as handed off by the host.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// MMIO ranges, page aligned.
    pub resources: Vec<MmioResource>,
    /// IOMMU streams of the device.
    #[serde(default)]
    pub iommus: Vec<IommuEndpoint>,
    /// Devices sharing a group are assigned together.
    pub group: u32,
}

impl DeviceConfig {
    pub(crate) fn is_valid(&self) -> bool {
        !self.resources.is_empty()
            && self.resources.len() <= MAX_NR_RESOURCES
            && self.iommus.len() <= MAX_NR_IOMMUS
            && self.resources.iter().all(MmioResource::is_valid)
    }

    /// Returns true if `addr` is inside one of the device resources.
    pub fn contains(&self, addr: u64) -> bool {
        self.resources.iter().any(|res| res.contains(addr))
    }

    /// Returns true if the device issues DMA as `endpoint` on `iommu`.
    pub fn uses_endpoint(&self, iommu: u64, endpoint: u32) -> bool {
        self.iommus
            .iter()
            .any(|e| e.iommu == iommu && e.endpoint == endpoint)
    }
}

/// Reset capability of a device.
///
/// The handler runs with the registry lock held, it must not call back into
/// the registry.
pub trait DeviceReset: Send + Sync {
    /// Bring the device back to a state where it holds no data from its
    /// previous owner.
    fn reset(&self, device: &DeviceConfig) -> std::result::Result<(), io::Error>;
}
