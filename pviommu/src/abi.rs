// Copyright © 2026 The pKVM IOMMU Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Register level ABI of the paravirtualized IOMMU hypercalls.
//!
//! Every call is an SMCCC 1.1 fast call in the vendor-hypervisor service
//! range. Arguments travel in `x1..x6`, the status comes back in `x0` and
//! the single return value in `x1`.

use std::convert::TryFrom;

use bitflags::bitflags;

/// Fast call, SMC64, vendor-specific hypervisor service owner.
const SMCCC_VENDOR_HYP_FAST_CALL: u32 = 0xc600_0000;

const fn vendor_hyp_func(num: u32) -> u32 {
    SMCCC_VENDOR_HYP_FAST_CALL | num
}

pub const PVIOMMU_VERSION_FUNC_ID: u32 = vendor_hyp_func(0x40);
pub const PVIOMMU_GET_FEATURE_FUNC_ID: u32 = vendor_hyp_func(0x41);
pub const PVIOMMU_ALLOC_DOMAIN_FUNC_ID: u32 = vendor_hyp_func(0x42);
pub const PVIOMMU_FREE_DOMAIN_FUNC_ID: u32 = vendor_hyp_func(0x43);
pub const PVIOMMU_ATTACH_DEV_FUNC_ID: u32 = vendor_hyp_func(0x44);
pub const PVIOMMU_DETACH_DEV_FUNC_ID: u32 = vendor_hyp_func(0x45);
pub const PVIOMMU_MAP_FUNC_ID: u32 = vendor_hyp_func(0x46);
pub const PVIOMMU_UNMAP_FUNC_ID: u32 = vendor_hyp_func(0x47);
pub const DEV_REQUEST_MMIO_FUNC_ID: u32 = vendor_hyp_func(0x48);

/// Implemented version of the API.
pub const PVIOMMU_VERSION: u64 = 0x1000;

/// GET_FEATURE: bitmap of the page sizes MAP and UNMAP accept.
pub const PVIOMMU_REQUEST_FEATURE_PGSZ_BITMAP: u64 = 0x1;

/// Hypercall handled by the pvIOMMU dispatcher.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PvIommuFunc {
    Version,
    GetFeature,
    AllocDomain,
    FreeDomain,
    AttachDev,
    DetachDev,
    Map,
    Unmap,
}

impl TryFrom<u32> for PvIommuFunc {
    type Error = u32;

    fn try_from(func: u32) -> Result<Self, Self::Error> {
        Ok(match func {
            PVIOMMU_VERSION_FUNC_ID => PvIommuFunc::Version,
            PVIOMMU_GET_FEATURE_FUNC_ID => PvIommuFunc::GetFeature,
            PVIOMMU_ALLOC_DOMAIN_FUNC_ID => PvIommuFunc::AllocDomain,
            PVIOMMU_FREE_DOMAIN_FUNC_ID => PvIommuFunc::FreeDomain,
            PVIOMMU_ATTACH_DEV_FUNC_ID => PvIommuFunc::AttachDev,
            PVIOMMU_DETACH_DEV_FUNC_ID => PvIommuFunc::DetachDev,
            PVIOMMU_MAP_FUNC_ID => PvIommuFunc::Map,
            PVIOMMU_UNMAP_FUNC_ID => PvIommuFunc::Unmap,
            _ => return Err(func),
        })
    }
}

/// SMCCC status returned in `x0`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i64)]
pub enum SmcccStatus {
    Success = 0,
    NotSupported = -1,
    NotRequired = -2,
    InvalidParameter = -3,
}

impl SmcccStatus {
    pub fn to_reg(self) -> u64 {
        self as i64 as u64
    }

    pub fn from_reg(reg: u64) -> Option<Self> {
        match reg as i64 {
            0 => Some(SmcccStatus::Success),
            -1 => Some(SmcccStatus::NotSupported),
            -2 => Some(SmcccStatus::NotRequired),
            -3 => Some(SmcccStatus::InvalidParameter),
            _ => None,
        }
    }
}

bitflags! {
    /// Protection bits of a MAP hypercall.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct PvIommuProt: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const CACHE = 1 << 2;
        const NOEXEC = 1 << 3;
        const MMIO = 1 << 4;
        const PRIV = 1 << 5;
    }
}

/// Function ID and arguments of a trapped hypercall.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HvcCall {
    pub func: u32,
    pub args: [u64; 6],
}

impl HvcCall {
    pub fn new(func: u32, args: &[u64]) -> Self {
        let mut call = HvcCall {
            func,
            ..Default::default()
        };
        for (reg, arg) in call.args.iter_mut().zip(args) {
            *reg = *arg;
        }
        call
    }

    /// Argument register `x<n>`, `n` in `1..=6`.
    pub fn arg(&self, n: usize) -> u64 {
        self.args[n - 1]
    }
}

/// Values written back to `x0` and `x1`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HvcReturn {
    pub status: SmcccStatus,
    pub value: u64,
}

impl HvcReturn {
    pub fn success(value: u64) -> Self {
        HvcReturn {
            status: SmcccStatus::Success,
            value,
        }
    }

    pub fn invalid() -> Self {
        HvcReturn {
            status: SmcccStatus::InvalidParameter,
            value: 0,
        }
    }

    pub fn regs(&self) -> [u64; 2] {
        [self.status.to_reg(), self.value]
    }
}
