// Copyright © 2026 The pKVM IOMMU Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Hypervisor view of a protected guest and of its vCPUs.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, OnceLock};

use vm_device::{VmHandle, PAGE_MASK, PAGE_SIZE};
use vm_memory::GuestAddress;

use crate::abi::{HvcCall, HvcReturn, DEV_REQUEST_MMIO_FUNC_ID};
use crate::backend::IommuPool;
use crate::handler::{HvcOutcome, PvIommu};
use crate::mmio;
use crate::route::{PvIommuRoute, VsidTable};

/// Maximum number of requests a vCPU can queue for the host.
pub const MAX_HYP_REQS: usize = 8;

/// Size of the hypercall instruction.
const HVC_INSN_SIZE: u64 = 4;

/// Level of a page entry in a 4K granule stage-2.
const LEAF_PAGE_LEVEL: u32 = 3;

/// Work the host must do before the vCPU can make progress.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HypRequest {
    /// Map guest memory at `ipa` in the guest stage-2.
    Map { ipa: u64, size: u64 },
    /// Donate pages to the vCPU IOMMU memcache.
    Memory { nr_pages: usize },
}

/// Last level entry of a guest stage-2 walk.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Leaf {
    /// Output address of the block or page.
    pub phys: u64,
    /// Level of the entry, 3 being a page.
    pub level: u32,
}

impl Leaf {
    /// Bytes covered by the entry, `None` past the last level.
    pub fn granule(&self) -> Option<u64> {
        LEAF_PAGE_LEVEL
            .checked_sub(self.level)
            .map(|up| 1 << (12 + 9 * up))
    }

    /// Physical page backing `ipa` inside this entry.
    pub fn page_of(&self, ipa: u64) -> Option<u64> {
        let granule = self.granule()?;
        Some(self.phys | ((ipa & (granule - 1)) & PAGE_MASK))
    }
}

/// Guest second stage translation.
pub trait GuestStage2: Send + Sync {
    /// Leaf entry mapping `ipa`, or `None` if nothing valid maps it.
    fn leaf(&self, ipa: GuestAddress) -> Option<Leaf>;
}

/// Stream of a guest device attached to one of its domains.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Attachment {
    pub iommu: u64,
    pub sid: u32,
    pub pasid: u32,
    pub domain: u32,
}

/// State the hypervisor keeps for one guest.
pub struct GuestVm {
    handle: VmHandle,
    stage2: Arc<dyn GuestStage2>,
    vsids: OnceLock<VsidTable>,
    pub(crate) pool: Mutex<IommuPool>,
    pub(crate) domains: Mutex<BTreeSet<u32>>,
    pub(crate) attached: Mutex<BTreeSet<Attachment>>,
}

impl GuestVm {
    pub fn new(handle: VmHandle, stage2: Arc<dyn GuestStage2>) -> Self {
        GuestVm {
            handle,
            stage2,
            vsids: OnceLock::new(),
            pool: Mutex::new(IommuPool::new()),
            domains: Mutex::new(BTreeSet::new()),
            attached: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn handle(&self) -> VmHandle {
        self.handle
    }

    pub fn vsids(&self) -> Option<&VsidTable> {
        self.vsids.get()
    }

    pub(crate) fn install_vsids(&self, table: VsidTable) -> bool {
        self.vsids.set(table).is_ok()
    }

    /// Physical stream behind `vsid` of the guest pvIOMMU `pviommu`.
    pub fn route(&self, pviommu: u32, vsid: u32) -> Option<PvIommuRoute> {
        self.vsids.get()?.route(pviommu, vsid)
    }

    /// Domain IDs currently owned by the guest.
    pub fn domains(&self) -> Vec<u32> {
        self.domains.lock().unwrap().iter().copied().collect()
    }

    pub fn owns_domain(&self, domain: u32) -> bool {
        self.domains.lock().unwrap().contains(&domain)
    }

    /// Streams currently attached to the guest domains.
    pub fn attachments(&self) -> Vec<Attachment> {
        self.attached.lock().unwrap().iter().copied().collect()
    }

    /// Pages available to the IOMMU backend for this guest.
    pub fn pool_pages(&self) -> usize {
        self.pool.lock().unwrap().len()
    }
}

/// What the vCPU run loop does after a hypercall.
#[derive(Debug, PartialEq, Eq)]
pub enum VcpuExit {
    /// Return to the guest with these values.
    Resume(HvcReturn),
    /// Exit to the host to service `requests` first. `ret` is `None` when
    /// the hypercall must be issued again once the guest resumes.
    HypRequest {
        ret: Option<HvcReturn>,
        requests: Vec<HypRequest>,
    },
    /// The hypercall is not handled here.
    Unhandled,
}

/// One vCPU of a protected guest.
pub struct HypVcpu {
    vm: Arc<GuestVm>,
    pc: u64,
    memcache: Vec<u64>,
    requests: Vec<HypRequest>,
}

impl HypVcpu {
    pub fn new(vm: Arc<GuestVm>) -> Self {
        HypVcpu {
            vm,
            pc: 0,
            memcache: Vec::new(),
            requests: Vec::with_capacity(MAX_HYP_REQS),
        }
    }

    pub fn vm(&self) -> &Arc<GuestVm> {
        &self.vm
    }

    /// Address of the next guest instruction.
    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    /// Host side: donate pages to the IOMMU memcache of this vCPU.
    pub fn topup_memcache<I: IntoIterator<Item = u64>>(&mut self, pages: I) {
        self.memcache.extend(pages);
    }

    pub fn memcache_pages(&self) -> usize {
        self.memcache.len()
    }

    /// Requests queued since the last exit.
    pub fn requests(&self) -> &[HypRequest] {
        &self.requests
    }

    pub fn has_requests(&self) -> bool {
        !self.requests.is_empty()
    }

    /// Queue a request for the host. Returns false if the queue is full.
    pub(crate) fn request(&mut self, req: HypRequest) -> bool {
        if self.requests.len() >= MAX_HYP_REQS {
            warn!("{}: request queue full, dropping {:?}", self.vm.handle, req);
            return false;
        }
        self.requests.push(req);
        true
    }

    pub(crate) fn refill_pool(&mut self) {
        self.vm.pool.lock().unwrap().refill(&mut self.memcache);
    }

    /// Physical page backing `ipa`. When the guest stage-2 has nothing there
    /// a map request is queued for the host and `None` returned. A malformed
    /// leaf is reported as unmapped without a request.
    pub(crate) fn guest_pa(&mut self, ipa: u64) -> Option<u64> {
        if let Some(leaf) = self.vm.stage2.leaf(GuestAddress(ipa)) {
            let page = leaf.page_of(ipa);
            if page.is_none() {
                warn!(
                    "{}: stage-2 leaf for {:#x} at invalid level {}",
                    self.vm.handle, ipa, leaf.level
                );
            }
            return page;
        }

        self.request(HypRequest::Map {
            ipa: ipa & PAGE_MASK,
            size: PAGE_SIZE,
        });
        None
    }

    /// Run a trapped hypercall and decide how the vCPU leaves the hypervisor.
    pub fn handle_hvc(&mut self, hyp: &PvIommu, call: &HvcCall) -> VcpuExit {
        let outcome = match call.func {
            DEV_REQUEST_MMIO_FUNC_ID => Some(mmio::request_mmio(hyp.devices(), self, call)),
            _ => hyp.handle_hvc(self, call),
        };

        let ret = match outcome {
            Some(HvcOutcome::Done(ret)) => {
                self.pc += HVC_INSN_SIZE;
                Some(ret)
            }
            // The PC stays on the hypercall so the guest issues it again.
            Some(HvcOutcome::Retry) => None,
            None => return VcpuExit::Unhandled,
        };

        match (ret, self.requests.is_empty()) {
            (Some(ret), true) => VcpuExit::Resume(ret),
            (ret, _) => VcpuExit::HypRequest {
                ret,
                requests: std::mem::take(&mut self.requests),
            },
        }
    }
}
