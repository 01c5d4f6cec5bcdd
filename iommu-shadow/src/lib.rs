// Copyright © 2026 The pKVM IOMMU Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Client side of the pvIOMMU hypercalls.
//!
//! The page tables of a pvIOMMU domain live in the hypervisor, out of reach
//! of the guest kernel. [PvIommuDomain](struct.PvIommuDomain.html) keeps a
//! [ShadowMap](struct.ShadowMap.html) of the ranges the hypervisor accepted
//! so that `iova -> phys` lookups never need a hypercall.

#[macro_use]
extern crate log;

mod domain;
mod shadow;

pub use self::domain::{Error, Hypercall, Mapped, PvIommuDomain, PvIommuInstance, Result};
pub use self::shadow::ShadowMap;
