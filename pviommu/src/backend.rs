// Copyright © 2026 The pKVM IOMMU Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::result;

use bitflags::bitflags;
use thiserror::Error;

use crate::abi::PvIommuProt;

bitflags! {
    /// Protection of an IOMMU page table entry.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct IommuProt: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const CACHE = 1 << 2;
        const NOEXEC = 1 << 3;
        const MMIO = 1 << 4;
        const PRIV = 1 << 5;
    }
}

impl From<PvIommuProt> for IommuProt {
    fn from(prot: PvIommuProt) -> Self {
        let mut out = IommuProt::empty();
        for (pv, iommu) in [
            (PvIommuProt::READ, IommuProt::READ),
            (PvIommuProt::WRITE, IommuProt::WRITE),
            (PvIommuProt::CACHE, IommuProt::CACHE),
            (PvIommuProt::NOEXEC, IommuProt::NOEXEC),
            (PvIommuProt::MMIO, IommuProt::MMIO),
            (PvIommuProt::PRIV, IommuProt::PRIV),
        ] {
            if prot.contains(pv) {
                out |= iommu;
            }
        }
        out
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BackendError {
    #[error("Out of page table memory, {0} more pages needed")]
    NoMemory(usize),
    #[error("Unknown domain {0}")]
    NoDomain(u32),
    #[error("Domain {0} is in use")]
    DomainBusy(u32),
    #[error("Invalid IOMMU request")]
    Invalid,
}

pub type Result<T> = result::Result<T, BackendError>;

/// Pages the backend may use for page tables of one guest.
///
/// Filled from the host donated memcache before each pvIOMMU hypercall so
/// that the backend never has to reach the donation path while holding IOMMU
/// locks.
#[derive(Debug, Default)]
pub struct IommuPool {
    pages: Vec<u64>,
}

impl IommuPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn push(&mut self, page: u64) {
        self.pages.push(page);
    }

    pub fn pop(&mut self) -> Option<u64> {
        self.pages.pop()
    }

    /// Move every page of `memcache` into the pool.
    pub fn refill(&mut self, memcache: &mut Vec<u64>) {
        self.pages.append(memcache);
    }
}

/// Outcome of a multi-page operation: the bytes processed before the
/// backend stopped, and why it stopped.
#[derive(Debug, PartialEq, Eq)]
pub struct Progress {
    pub size: u64,
    pub result: Result<()>,
}

impl Progress {
    pub fn done(size: u64) -> Self {
        Progress {
            size,
            result: Ok(()),
        }
    }
}

/// Physical IOMMU driver living in the hypervisor.
///
/// Domains are named by IDs the caller chose. Calls that need page table
/// memory take it from `pool` and fail with `NoMemory` when it runs dry,
/// leaving the domain as it was.
pub trait IommuBackend: Send + Sync {
    fn alloc_domain(&self, domain: u32, pool: &mut IommuPool) -> Result<()>;

    fn free_domain(&self, domain: u32) -> Result<()>;

    fn attach_dev(
        &self,
        iommu: u64,
        domain: u32,
        sid: u32,
        pasid: u32,
        pasid_bits: u32,
        pool: &mut IommuPool,
    ) -> Result<()>;

    fn detach_dev(&self, iommu: u64, domain: u32, sid: u32, pasid: u32) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn map_pages(
        &self,
        domain: u32,
        iova: u64,
        paddr: u64,
        pgsize: u64,
        pgcount: u64,
        prot: IommuProt,
        pool: &mut IommuPool,
    ) -> Progress;

    fn unmap_pages(&self, domain: u32, iova: u64, pgsize: u64, pgcount: u64) -> Progress;
}
