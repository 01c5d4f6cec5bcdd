// Copyright © 2019 Intel Corporation. All Rights Reserved.
// Copyright © 2026 The pKVM IOMMU Authors
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Assignable device table and the ownership rules guarding it.

#[macro_use]
extern crate log;

mod device;
mod mem_protect;
mod registry;

pub use self::device::{
    DeviceConfig, DeviceReset, IommuEndpoint, MmioResource, Owner, VmHandle, MAX_NR_DEVICES,
    MAX_NR_IOMMUS, MAX_NR_RESOURCES, PAGE_MASK, PAGE_SIZE,
};
pub use self::mem_protect::{MemError, MemProtect, PageOwnership};
pub use self::registry::{DeviceRegistry, Error, IommuGuard, Result};
