// Copyright © 2026 The pKVM IOMMU Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Hypervisor side of the paravirtualized IOMMU.
//!
//! Guests never see a physical address, a physical stream ID or a domain
//! they did not allocate: every hypercall goes through the guest stage-2,
//! the finalized VSID table of the guest and the set of domains it owns
//! before reaching the IOMMU backend.
//!
//! Operations which need the host to act first (map guest memory, donate
//! page table memory) queue a [HypRequest](../vm/enum.HypRequest.html) on
//! the vCPU. When nothing was done yet the hypercall is retried after the
//! host serviced the requests, otherwise the partial result is returned and
//! the guest issues a new call for the remainder.
//!
//! Lock order: domain IDs, guest domains, guest attachments, device
//! registry, guest page pool.

use std::convert::TryFrom;
use std::result;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use vm_allocator::DomainIdAllocator;
use vm_device::{DeviceRegistry, VmHandle, PAGE_MASK, PAGE_SIZE};

use crate::abi::{
    HvcCall, HvcReturn, PvIommuFunc, PvIommuProt, PVIOMMU_REQUEST_FEATURE_PGSZ_BITMAP,
    PVIOMMU_VERSION,
};
use crate::backend::{BackendError, IommuBackend, IommuProt};
use crate::route::{PvIommuRouter, RouteError};
use crate::vm::{Attachment, GuestVm, HypRequest, HypVcpu};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to finalize the pvIOMMU routes of {0}")]
    Route(VmHandle, #[source] RouteError),
    #[error("{0} is already finalized")]
    AlreadyFinalized(VmHandle),
}

pub type Result<T> = result::Result<T, Error>;

/// How a handled hypercall completes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HvcOutcome {
    /// Write the values back and move past the hypercall.
    Done(HvcReturn),
    /// Nothing changed, the guest must issue the same hypercall again once
    /// the queued requests are serviced.
    Retry,
}

fn reg_u32(reg: u64) -> Option<u32> {
    u32::try_from(reg).ok()
}

macro_rules! arg_u32 {
    ($call:expr, $n:expr) => {
        match reg_u32($call.arg($n)) {
            Some(v) => v,
            None => return HvcOutcome::Done(HvcReturn::invalid()),
        }
    };
}

/// The pvIOMMU hypercall handler shared by all guests.
pub struct PvIommu {
    devices: Arc<DeviceRegistry>,
    router: PvIommuRouter,
    domains: Mutex<DomainIdAllocator>,
    backend: Arc<dyn IommuBackend>,
}

impl PvIommu {
    pub fn new(devices: Arc<DeviceRegistry>, backend: Arc<dyn IommuBackend>) -> Self {
        PvIommu {
            devices,
            router: PvIommuRouter::new(),
            domains: Mutex::new(DomainIdAllocator::new()),
            backend,
        }
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    /// Host side declarations of pvIOMMU instances and their streams.
    pub fn router(&self) -> &PvIommuRouter {
        &self.router
    }

    /// Number of guest domain IDs in use across all guests.
    pub fn domains_in_use(&self) -> u32 {
        self.domains.lock().unwrap().used()
    }

    /// Install the VSID table of `vm` from the router declarations. Done
    /// once, before the guest runs.
    pub fn finalize_vm(&self, vm: &GuestVm) -> Result<()> {
        let handle = vm.handle();
        if vm.vsids().is_some() {
            return Err(Error::AlreadyFinalized(handle));
        }

        let table = self
            .router
            .finalize(handle)
            .map_err(|e| Error::Route(handle, e))?;
        if !vm.install_vsids(table) {
            return Err(Error::AlreadyFinalized(handle));
        }
        Ok(())
    }

    /// Release everything `vm` holds: attachments, domains and their IDs,
    /// devices and stream reservations. The vCPUs of the guest must no
    /// longer run.
    pub fn teardown_vm(&self, vm: &GuestVm) {
        let handle = vm.handle();
        let mut ids = self.domains.lock().unwrap();
        let mut owned = vm.domains.lock().unwrap();
        let mut attached = vm.attached.lock().unwrap();

        for a in std::mem::take(&mut *attached) {
            if let Err(e) = self.backend.detach_dev(a.iommu, a.domain, a.sid, a.pasid) {
                warn!(
                    "{}: failed to detach stream {} of IOMMU {:#x}: {}",
                    handle, a.sid, a.iommu, e
                );
            }
        }

        for id in std::mem::take(&mut *owned) {
            match self.backend.free_domain(id) {
                Ok(()) => ids.free(id),
                Err(e) => error!("{}: leaking domain {}: {}", handle, id, e),
            }
        }

        drop(attached);
        drop(owned);
        drop(ids);

        self.devices.teardown(handle);
        self.router.teardown(handle);
        info!("{}: pvIOMMU state released", handle);
    }

    /// Handle a pvIOMMU hypercall. Returns `None` if `call` is not one.
    pub fn handle_hvc(&self, vcpu: &mut HypVcpu, call: &HvcCall) -> Option<HvcOutcome> {
        let func = PvIommuFunc::try_from(call.func).ok()?;

        // Page table memory is taken from the pool only, never from the
        // donation path while IOMMU locks are held.
        vcpu.refill_pool();

        Some(match func {
            PvIommuFunc::Version => HvcOutcome::Done(HvcReturn::success(PVIOMMU_VERSION)),
            PvIommuFunc::GetFeature => self.get_feature(call),
            PvIommuFunc::AllocDomain => self.alloc_domain(vcpu),
            PvIommuFunc::FreeDomain => self.free_domain(vcpu, call),
            PvIommuFunc::AttachDev => self.attach_dev(vcpu, call),
            PvIommuFunc::DetachDev => self.detach_dev(vcpu, call),
            PvIommuFunc::Map => self.map(vcpu, call),
            PvIommuFunc::Unmap => self.unmap(vcpu, call),
        })
    }

    fn get_feature(&self, call: &HvcCall) -> HvcOutcome {
        match call.arg(2) {
            PVIOMMU_REQUEST_FEATURE_PGSZ_BITMAP => HvcOutcome::Done(HvcReturn::success(PAGE_SIZE)),
            _ => HvcOutcome::Done(HvcReturn::invalid()),
        }
    }

    fn request_memory(vcpu: &mut HypVcpu, nr_pages: usize) -> HvcOutcome {
        if vcpu.request(HypRequest::Memory { nr_pages }) {
            HvcOutcome::Retry
        } else {
            HvcOutcome::Done(HvcReturn::invalid())
        }
    }

    // Outcome of a map or unmap that processed `size` bytes.
    fn progress(vcpu: &HypVcpu, size: u64) -> HvcOutcome {
        if size > 0 {
            HvcOutcome::Done(HvcReturn::success(size))
        } else if vcpu.has_requests() {
            HvcOutcome::Retry
        } else {
            HvcOutcome::Done(HvcReturn::invalid())
        }
    }

    fn alloc_domain(&self, vcpu: &mut HypVcpu) -> HvcOutcome {
        let vm = vcpu.vm().clone();
        let mut ids = self.domains.lock().unwrap();

        let id = match ids.allocate() {
            Ok(id) => id,
            Err(e) => {
                warn!("{}: {}", vm.handle(), e);
                return HvcOutcome::Done(HvcReturn::invalid());
            }
        };

        let ret = self
            .backend
            .alloc_domain(id, &mut vm.pool.lock().unwrap());
        match ret {
            Ok(()) => {
                vm.domains.lock().unwrap().insert(id);
                debug!("{}: allocated domain {}", vm.handle(), id);
                HvcOutcome::Done(HvcReturn::success(id as u64))
            }
            Err(BackendError::NoMemory(nr_pages)) => {
                ids.free(id);
                Self::request_memory(vcpu, nr_pages)
            }
            Err(e) => {
                ids.free(id);
                debug!("{}: failed to allocate domain: {}", vm.handle(), e);
                HvcOutcome::Done(HvcReturn::invalid())
            }
        }
    }

    fn free_domain(&self, vcpu: &mut HypVcpu, call: &HvcCall) -> HvcOutcome {
        let domain = arg_u32!(call, 1);
        let vm = vcpu.vm();
        let mut ids = self.domains.lock().unwrap();
        let mut owned = vm.domains.lock().unwrap();

        if !owned.contains(&domain) {
            return HvcOutcome::Done(HvcReturn::invalid());
        }
        if let Err(e) = self.backend.free_domain(domain) {
            debug!("{}: failed to free domain {}: {}", vm.handle(), domain, e);
            return HvcOutcome::Done(HvcReturn::invalid());
        }

        ids.free(domain);
        owned.remove(&domain);
        debug!("{}: freed domain {}", vm.handle(), domain);
        HvcOutcome::Done(HvcReturn::success(0))
    }

    fn attach_dev(&self, vcpu: &mut HypVcpu, call: &HvcCall) -> HvcOutcome {
        let pviommu = arg_u32!(call, 1);
        let vsid = arg_u32!(call, 2);
        let pasid = arg_u32!(call, 3);
        let domain = arg_u32!(call, 4);
        let pasid_bits = arg_u32!(call, 5);

        let vm = vcpu.vm().clone();
        let owned = vm.domains.lock().unwrap();
        if !owned.contains(&domain) {
            return HvcOutcome::Done(HvcReturn::invalid());
        }
        let Some(route) = vm.route(pviommu, vsid) else {
            return HvcOutcome::Done(HvcReturn::invalid());
        };

        let mut attached = vm.attached.lock().unwrap();
        let guard = match self
            .devices
            .iommu_lock(route.iommu, route.sid, Some(vm.handle()))
        {
            Ok(guard) => guard,
            Err(e) => {
                debug!("{}: attach denied: {}", vm.handle(), e);
                return HvcOutcome::Done(HvcReturn::invalid());
            }
        };
        let ret = self.backend.attach_dev(
            route.iommu,
            domain,
            route.sid,
            pasid,
            pasid_bits,
            &mut vm.pool.lock().unwrap(),
        );
        guard.unlock();

        match ret {
            Ok(()) => {
                // The stream moved to `domain`, drop any previous record of it.
                attached.retain(|a| {
                    !(a.iommu == route.iommu && a.sid == route.sid && a.pasid == pasid)
                });
                attached.insert(Attachment {
                    iommu: route.iommu,
                    sid: route.sid,
                    pasid,
                    domain,
                });
                HvcOutcome::Done(HvcReturn::success(0))
            }
            Err(BackendError::NoMemory(nr_pages)) => {
                drop(attached);
                drop(owned);
                Self::request_memory(vcpu, nr_pages)
            }
            Err(e) => {
                debug!("{}: failed to attach vsid {}: {}", vm.handle(), vsid, e);
                HvcOutcome::Done(HvcReturn::invalid())
            }
        }
    }

    fn detach_dev(&self, vcpu: &mut HypVcpu, call: &HvcCall) -> HvcOutcome {
        let pviommu = arg_u32!(call, 1);
        let vsid = arg_u32!(call, 2);
        let pasid = arg_u32!(call, 3);
        let domain = arg_u32!(call, 4);

        let vm = vcpu.vm();
        let owned = vm.domains.lock().unwrap();
        if !owned.contains(&domain) {
            return HvcOutcome::Done(HvcReturn::invalid());
        }
        let Some(route) = vm.route(pviommu, vsid) else {
            return HvcOutcome::Done(HvcReturn::invalid());
        };

        let mut attached = vm.attached.lock().unwrap();
        let guard = match self
            .devices
            .iommu_lock(route.iommu, route.sid, Some(vm.handle()))
        {
            Ok(guard) => guard,
            Err(e) => {
                debug!("{}: detach denied: {}", vm.handle(), e);
                return HvcOutcome::Done(HvcReturn::invalid());
            }
        };
        let ret = self
            .backend
            .detach_dev(route.iommu, domain, route.sid, pasid);
        guard.unlock();

        match ret {
            Ok(()) => {
                attached.remove(&Attachment {
                    iommu: route.iommu,
                    sid: route.sid,
                    pasid,
                    domain,
                });
                HvcOutcome::Done(HvcReturn::success(0))
            }
            Err(e) => {
                debug!("{}: failed to detach vsid {}: {}", vm.handle(), vsid, e);
                HvcOutcome::Done(HvcReturn::invalid())
            }
        }
    }

    // Checks shared by map and unmap, returns the size of the request.
    // Every address must be page aligned and the range must not wrap.
    fn range_size(pgsize: u64, pgcount: u64, addrs: &[u64]) -> Option<u64> {
        if pgsize != PAGE_SIZE {
            return None;
        }
        let size = pgcount.checked_mul(pgsize)?;
        if addrs
            .iter()
            .any(|addr| addr & !PAGE_MASK != 0 || addr.checked_add(size).is_none())
        {
            return None;
        }
        Some(size)
    }

    fn map(&self, vcpu: &mut HypVcpu, call: &HvcCall) -> HvcOutcome {
        let domain = arg_u32!(call, 1);
        let iova = call.arg(2);
        let ipa = call.arg(3);

        let Some(size) = Self::range_size(call.arg(4), call.arg(5), &[iova, ipa]) else {
            return HvcOutcome::Done(HvcReturn::invalid());
        };
        let Some(prot) = PvIommuProt::from_bits(call.arg(6)) else {
            return HvcOutcome::Done(HvcReturn::invalid());
        };
        let prot = IommuProt::from(prot);

        let vm = vcpu.vm().clone();
        let owned = vm.domains.lock().unwrap();
        if !owned.contains(&domain) {
            return HvcOutcome::Done(HvcReturn::invalid());
        }

        let mut mapped = 0;
        while mapped < size {
            // An unmapped page stops the walk before the backend sees it.
            let Some(paddr) = vcpu.guest_pa(ipa + mapped) else {
                break;
            };

            let progress = self.backend.map_pages(
                domain,
                iova + mapped,
                paddr,
                PAGE_SIZE,
                1,
                prot,
                &mut vm.pool.lock().unwrap(),
            );
            mapped += progress.size;

            match progress.result {
                Ok(()) if progress.size > 0 => (),
                Ok(()) => break,
                Err(BackendError::NoMemory(nr_pages)) => {
                    vcpu.request(HypRequest::Memory { nr_pages });
                    break;
                }
                Err(e) => {
                    debug!(
                        "{}: map of iova {:#x} in domain {} failed: {}",
                        vm.handle(),
                        iova + mapped,
                        domain,
                        e
                    );
                    break;
                }
            }
        }
        drop(owned);

        Self::progress(vcpu, mapped)
    }

    fn unmap(&self, vcpu: &mut HypVcpu, call: &HvcCall) -> HvcOutcome {
        if vcpu.has_requests() {
            return HvcOutcome::Retry;
        }

        let domain = arg_u32!(call, 1);
        let iova = call.arg(2);

        let Some(size) = Self::range_size(call.arg(3), call.arg(4), &[iova]) else {
            return HvcOutcome::Done(HvcReturn::invalid());
        };

        let vm = vcpu.vm().clone();
        let owned = vm.domains.lock().unwrap();
        if !owned.contains(&domain) {
            return HvcOutcome::Done(HvcReturn::invalid());
        }

        let mut unmapped = 0;
        while unmapped < size {
            let progress = self
                .backend
                .unmap_pages(domain, iova + unmapped, PAGE_SIZE, 1);
            unmapped += progress.size;

            match progress.result {
                Ok(()) if progress.size > 0 => (),
                Ok(()) => break,
                Err(BackendError::NoMemory(nr_pages)) => {
                    vcpu.request(HypRequest::Memory { nr_pages });
                    break;
                }
                Err(e) => {
                    debug!(
                        "{}: unmap of iova {:#x} in domain {} failed: {}",
                        vm.handle(),
                        iova + unmapped,
                        domain,
                        e
                    );
                    break;
                }
            }
        }
        drop(owned);

        Self::progress(vcpu, unmapped)
    }
}
