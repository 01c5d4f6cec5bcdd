// Copyright © 2026 The pKVM IOMMU Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Paravirtualized IOMMU for protected guests.
//!
//! Guests program DMA translation through a small set of hypercalls. The
//! hypervisor checks every request against what the guest owns (memory,
//! domains, devices) and forwards it to the physical IOMMU backend.

#[macro_use]
extern crate log;

pub mod abi;
mod backend;
mod handler;
mod mmio;
mod route;
mod vm;

pub use self::backend::{BackendError, IommuBackend, IommuPool, IommuProt, Progress};
pub use self::handler::{Error, HvcOutcome, PvIommu, Result};
pub use self::route::{
    PvIommuRoute, PvIommuRouter, RouteError, VsidEntry, VsidTable, MAX_NR_PVIOMMU,
    MAX_NR_SID_PER_PVIOMMU,
};
pub use self::vm::{
    Attachment, GuestStage2, GuestVm, HypRequest, HypVcpu, Leaf, VcpuExit, MAX_HYP_REQS,
};
