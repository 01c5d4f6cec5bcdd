// Copyright © 2026 The pKVM IOMMU Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Guest driver side of the pvIOMMU: issues the hypercalls and keeps a
//! shadow of what each domain maps.

use std::result;

use pviommu::abi::{
    HvcCall, PvIommuProt, SmcccStatus, PVIOMMU_ALLOC_DOMAIN_FUNC_ID, PVIOMMU_ATTACH_DEV_FUNC_ID,
    PVIOMMU_DETACH_DEV_FUNC_ID, PVIOMMU_FREE_DOMAIN_FUNC_ID, PVIOMMU_GET_FEATURE_FUNC_ID,
    PVIOMMU_MAP_FUNC_ID, PVIOMMU_REQUEST_FEATURE_PGSZ_BITMAP, PVIOMMU_UNMAP_FUNC_ID,
    PVIOMMU_VERSION, PVIOMMU_VERSION_FUNC_ID,
};
use thiserror::Error;

use crate::shadow::ShadowMap;

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Operation not supported by the hypervisor")]
    NotSupported,
    #[error("Operation not required")]
    NotRequired,
    #[error("Invalid parameter")]
    InvalidParameter,
    #[error("Unknown hypervisor status {0:#x}")]
    Unknown(u64),
}

pub type Result<T> = result::Result<T, Error>;

/// Way of issuing a hypercall, returning `x0` and `x1`.
pub trait Hypercall {
    fn hvc(&mut self, call: &HvcCall) -> [u64; 2];
}

fn call<H: Hypercall + ?Sized>(hvc: &mut H, func: u32, args: &[u64]) -> Result<u64> {
    let [status, value] = hvc.hvc(&HvcCall::new(func, args));
    match SmcccStatus::from_reg(status) {
        Some(SmcccStatus::Success) => Ok(value),
        Some(SmcccStatus::NotSupported) => Err(Error::NotSupported),
        Some(SmcccStatus::NotRequired) => Err(Error::NotRequired),
        Some(SmcccStatus::InvalidParameter) => Err(Error::InvalidParameter),
        None => Err(Error::Unknown(status)),
    }
}

/// A probed pvIOMMU instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PvIommuInstance {
    pub id: u32,
    pub pgsize_bitmap: u64,
}

impl PvIommuInstance {
    /// Check the hypervisor speaks the pvIOMMU protocol and read the page
    /// sizes instance `id` accepts.
    pub fn probe<H: Hypercall + ?Sized>(hvc: &mut H, id: u32) -> Result<Self> {
        let version = call(hvc, PVIOMMU_VERSION_FUNC_ID, &[])?;
        if version != PVIOMMU_VERSION {
            warn!(
                "pvIOMMU driver expects version {:#x} but found {:#x}",
                PVIOMMU_VERSION, version
            );
        }

        let pgsize_bitmap = call(
            hvc,
            PVIOMMU_GET_FEATURE_FUNC_ID,
            &[id as u64, PVIOMMU_REQUEST_FEATURE_PGSZ_BITMAP],
        )?;

        Ok(PvIommuInstance { id, pgsize_bitmap })
    }
}

/// Bytes mapped by `map_pages` and the error that stopped it early, if any.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Mapped {
    pub size: u64,
    pub error: Option<Error>,
}

/// A domain allocated in the hypervisor.
#[derive(Debug)]
pub struct PvIommuDomain {
    id: u32,
    mappings: ShadowMap,
}

impl PvIommuDomain {
    pub fn alloc<H: Hypercall + ?Sized>(hvc: &mut H) -> Result<Self> {
        let id = call(hvc, PVIOMMU_ALLOC_DOMAIN_FUNC_ID, &[])?;
        // Domain IDs are 32-bit on the wire.
        let id = u32::try_from(id).map_err(|_| Error::Unknown(id))?;
        Ok(PvIommuDomain {
            id,
            mappings: ShadowMap::new(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn mappings(&self) -> &ShadowMap {
        &self.mappings
    }

    /// Map `pgcount` pages from `iova` to `paddr`, issuing as many
    /// hypercalls as the hypervisor needs.
    pub fn map_pages<H: Hypercall + ?Sized>(
        &mut self,
        hvc: &mut H,
        iova: u64,
        paddr: u64,
        pgsize: u64,
        pgcount: u64,
        prot: PvIommuProt,
    ) -> Mapped {
        let requested = pgsize.saturating_mul(pgcount);
        let mut mapped = 0;
        let mut error = None;

        while mapped < requested {
            let remaining = (requested - mapped) / pgsize;
            match call(
                hvc,
                PVIOMMU_MAP_FUNC_ID,
                &[
                    self.id as u64,
                    iova + mapped,
                    paddr + mapped,
                    pgsize,
                    remaining,
                    prot.bits(),
                ],
            ) {
                Ok(0) => break,
                Ok(size) => mapped += size,
                Err(e) => {
                    error = Some(e);
                    break;
                }
            }
        }

        if mapped > 0 {
            self.mappings.insert(iova, iova + mapped - 1, paddr);
        }

        Mapped {
            size: mapped,
            error,
        }
    }

    /// Unmap `pgcount` pages from `iova`. Returns the bytes unmapped.
    pub fn unmap_pages<H: Hypercall + ?Sized>(
        &mut self,
        hvc: &mut H,
        iova: u64,
        pgsize: u64,
        pgcount: u64,
    ) -> u64 {
        let requested = pgsize.saturating_mul(pgcount);
        let mut unmapped = 0;

        while unmapped < requested {
            let remaining = (requested - unmapped) / pgsize;
            match call(
                hvc,
                PVIOMMU_UNMAP_FUNC_ID,
                &[self.id as u64, iova + unmapped, pgsize, remaining],
            ) {
                Ok(0) | Err(_) => break,
                Ok(size) => unmapped += size,
            }
        }

        if unmapped > 0 {
            self.mappings.remove(iova, iova + unmapped - 1);
        }
        unmapped
    }

    pub fn iova_to_phys(&self, iova: u64) -> Option<u64> {
        self.mappings.find(iova)
    }

    /// Attach every stream of a device. On failure the streams already
    /// attached are detached again.
    pub fn attach<H: Hypercall + ?Sized>(
        &self,
        hvc: &mut H,
        pviommu: &PvIommuInstance,
        sids: &[u32],
        pasid: u32,
        pasid_bits: u32,
    ) -> Result<()> {
        for (i, sid) in sids.iter().enumerate() {
            let ret = call(
                hvc,
                PVIOMMU_ATTACH_DEV_FUNC_ID,
                &[
                    pviommu.id as u64,
                    *sid as u64,
                    pasid as u64,
                    self.id as u64,
                    pasid_bits as u64,
                ],
            );

            if let Err(e) = ret {
                for sid in &sids[..i] {
                    if let Err(e) = self.detach_one(hvc, pviommu, *sid, pasid) {
                        error!("Failed to detach sid {} on rollback: {}", sid, e);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn detach_one<H: Hypercall + ?Sized>(
        &self,
        hvc: &mut H,
        pviommu: &PvIommuInstance,
        sid: u32,
        pasid: u32,
    ) -> Result<()> {
        call(
            hvc,
            PVIOMMU_DETACH_DEV_FUNC_ID,
            &[pviommu.id as u64, sid as u64, pasid as u64, self.id as u64],
        )
        .map(|_| ())
    }

    /// Detach every stream of a device, carrying on past failures. Returns
    /// the first failure.
    pub fn detach<H: Hypercall + ?Sized>(
        &self,
        hvc: &mut H,
        pviommu: &PvIommuInstance,
        sids: &[u32],
        pasid: u32,
    ) -> Result<()> {
        let mut ret = Ok(());
        for sid in sids {
            if let Err(e) = self.detach_one(hvc, pviommu, *sid, pasid) {
                error!("Failed to detach sid {}: {}", sid, e);
                if ret.is_ok() {
                    ret = Err(e);
                }
            }
        }
        ret
    }

    /// Release the domain in the hypervisor.
    pub fn free<H: Hypercall + ?Sized>(self, hvc: &mut H) -> Result<()> {
        call(hvc, PVIOMMU_FREE_DOMAIN_FUNC_ID, &[self.id as u64]).map(|_| ())
    }
}
