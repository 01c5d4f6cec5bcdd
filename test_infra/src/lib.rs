// Copyright © 2026 The pKVM IOMMU Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Fake collaborators and harnesses shared by the integration tests.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::Path;
use std::process::{Command, Output};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use iommu_shadow::Hypercall;
use pviommu::abi::{HvcCall, SmcccStatus};
use pviommu::{
    BackendError, GuestStage2, GuestVm, HypRequest, HypVcpu, IommuBackend, IommuPool, IommuProt,
    Leaf, Progress, PvIommu, VcpuExit,
};
use serde_json::Value;
use thiserror::Error;
use vm_device::{DeviceConfig, DeviceReset, PAGE_MASK, PAGE_SIZE};
use vm_memory::GuestAddress;
use vmm_sys_util::tempdir::TempDir;

/// Base of the fake host physical memory backing guest RAM.
pub const GUEST_RAM_BASE: u64 = 0x8_0000_0000;

/// First page handed out when the host tops up a memcache.
const MEMCACHE_BASE: u64 = 0x9_0000_0000;

/// Size of the IOVA region covered by one page table page.
const TABLE_SPAN: u64 = 0x20_0000;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to prepare the platform file")]
    Platform(#[source] io::Error),
    #[error("Spawning process failed")]
    Spawn(#[source] io::Error),
    #[error("Parsing the report failed")]
    Report(#[source] serde_json::Error),
}

/// Guest stage-2 the tests populate by hand or through host requests.
#[derive(Default)]
pub struct FakeStage2 {
    pages: Mutex<BTreeMap<u64, u64>>,
}

impl FakeStage2 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `[ipa, ipa + size)` to `[phys, phys + size)`.
    pub fn map(&self, ipa: u64, phys: u64, size: u64) {
        let mut pages = self.pages.lock().unwrap();
        for off in (0..size).step_by(PAGE_SIZE as usize) {
            pages.insert((ipa + off) & PAGE_MASK, (phys + off) & PAGE_MASK);
        }
    }

    /// Map guest RAM the way the host does when servicing a request.
    pub fn map_ram(&self, ipa: u64, size: u64) {
        self.map(ipa, GUEST_RAM_BASE + ipa, size);
    }

    pub fn unmap(&self, ipa: u64) {
        self.pages.lock().unwrap().remove(&(ipa & PAGE_MASK));
    }

    pub fn is_mapped(&self, ipa: u64) -> bool {
        self.pages.lock().unwrap().contains_key(&(ipa & PAGE_MASK))
    }
}

impl GuestStage2 for FakeStage2 {
    fn leaf(&self, ipa: GuestAddress) -> Option<Leaf> {
        self.pages
            .lock()
            .unwrap()
            .get(&(ipa.0 & PAGE_MASK))
            .map(|phys| Leaf {
                phys: *phys,
                level: 3,
            })
    }
}

#[derive(Default)]
struct FakeDomain {
    mappings: BTreeMap<u64, (u64, IommuProt)>,
    tables: BTreeSet<u64>,
}

#[derive(Default)]
struct BackendState {
    domains: BTreeMap<u32, FakeDomain>,
    // (iommu, sid, pasid) -> domain
    streams: BTreeMap<(u64, u32, u32), u32>,
}

/// IOMMU backend keeping its page tables in memory.
///
/// Allocating a domain, attaching a new stream and touching a new 2MiB IOVA
/// region each consume pool pages, so the memory retry paths are exercised
/// by default.
pub struct FakeBackend {
    state: Mutex<BackendState>,
    domain_pages: usize,
    stream_pages: usize,
    table_pages: usize,
    map_calls: AtomicUsize,
    unmap_calls: AtomicUsize,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::with_costs(1, 1, 1)
    }

    /// Backend needing the given number of pool pages per domain, per new
    /// stream and per new page table.
    pub fn with_costs(domain_pages: usize, stream_pages: usize, table_pages: usize) -> Self {
        FakeBackend {
            state: Mutex::new(BackendState::default()),
            domain_pages,
            stream_pages,
            table_pages,
            map_calls: AtomicUsize::new(0),
            unmap_calls: AtomicUsize::new(0),
        }
    }

    fn take_pages(pool: &mut IommuPool, nr: usize) -> Result<(), BackendError> {
        if pool.len() < nr {
            return Err(BackendError::NoMemory(nr - pool.len()));
        }
        for _ in 0..nr {
            pool.pop();
        }
        Ok(())
    }

    pub fn has_domain(&self, domain: u32) -> bool {
        self.state.lock().unwrap().domains.contains_key(&domain)
    }

    pub fn domains(&self) -> Vec<u32> {
        self.state.lock().unwrap().domains.keys().copied().collect()
    }

    /// Translation of `iova` in `domain`.
    pub fn translate(&self, domain: u32, iova: u64) -> Option<(u64, IommuProt)> {
        let state = self.state.lock().unwrap();
        let (phys, prot) = state.domains.get(&domain)?.mappings.get(&(iova & PAGE_MASK))?;
        Some((phys | (iova & !PAGE_MASK), *prot))
    }

    pub fn mapped_pages(&self, domain: u32) -> usize {
        self.state
            .lock()
            .unwrap()
            .domains
            .get(&domain)
            .map_or(0, |d| d.mappings.len())
    }

    pub fn stream_domain(&self, iommu: u64, sid: u32, pasid: u32) -> Option<u32> {
        self.state
            .lock()
            .unwrap()
            .streams
            .get(&(iommu, sid, pasid))
            .copied()
    }

    pub fn map_calls(&self) -> usize {
        self.map_calls.load(Ordering::SeqCst)
    }

    pub fn unmap_calls(&self) -> usize {
        self.unmap_calls.load(Ordering::SeqCst)
    }
}

impl IommuBackend for FakeBackend {
    fn alloc_domain(&self, domain: u32, pool: &mut IommuPool) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        if state.domains.contains_key(&domain) {
            return Err(BackendError::DomainBusy(domain));
        }
        Self::take_pages(pool, self.domain_pages)?;
        state.domains.insert(domain, FakeDomain::default());
        Ok(())
    }

    fn free_domain(&self, domain: u32) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        if state.streams.values().any(|d| *d == domain) {
            return Err(BackendError::DomainBusy(domain));
        }
        state
            .domains
            .remove(&domain)
            .map(|_| ())
            .ok_or(BackendError::NoDomain(domain))
    }

    fn attach_dev(
        &self,
        iommu: u64,
        domain: u32,
        sid: u32,
        pasid: u32,
        _pasid_bits: u32,
        pool: &mut IommuPool,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        if !state.domains.contains_key(&domain) {
            return Err(BackendError::NoDomain(domain));
        }
        if !state.streams.contains_key(&(iommu, sid, pasid)) {
            Self::take_pages(pool, self.stream_pages)?;
        }
        state.streams.insert((iommu, sid, pasid), domain);
        Ok(())
    }

    fn detach_dev(&self, iommu: u64, domain: u32, sid: u32, pasid: u32) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        match state.streams.get(&(iommu, sid, pasid)) {
            Some(d) if *d == domain => {
                state.streams.remove(&(iommu, sid, pasid));
                Ok(())
            }
            _ => Err(BackendError::Invalid),
        }
    }

    fn map_pages(
        &self,
        domain: u32,
        iova: u64,
        paddr: u64,
        pgsize: u64,
        pgcount: u64,
        prot: IommuProt,
        pool: &mut IommuPool,
    ) -> Progress {
        self.map_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let Some(dom) = state.domains.get_mut(&domain) else {
            return Progress {
                size: 0,
                result: Err(BackendError::NoDomain(domain)),
            };
        };

        let mut size = 0;
        for i in 0..pgcount {
            let va = iova + i * pgsize;
            if dom.mappings.contains_key(&va) {
                return Progress {
                    size,
                    result: Err(BackendError::Invalid),
                };
            }
            let table = va / TABLE_SPAN;
            if !dom.tables.contains(&table) {
                if let Err(e) = Self::take_pages(pool, self.table_pages) {
                    return Progress { size, result: Err(e) };
                }
                dom.tables.insert(table);
            }
            dom.mappings.insert(va, (paddr + i * pgsize, prot));
            size += pgsize;
        }
        Progress::done(size)
    }

    fn unmap_pages(&self, domain: u32, iova: u64, pgsize: u64, pgcount: u64) -> Progress {
        self.unmap_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let Some(dom) = state.domains.get_mut(&domain) else {
            return Progress {
                size: 0,
                result: Err(BackendError::NoDomain(domain)),
            };
        };

        let mut size = 0;
        for i in 0..pgcount {
            if dom.mappings.remove(&(iova + i * pgsize)).is_none() {
                break;
            }
            size += pgsize;
        }
        Progress::done(size)
    }
}

/// Reset handler counting its invocations.
#[derive(Default)]
pub struct FakeReset {
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl FakeReset {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let reset = Self::new();
        reset.set_failing(true);
        reset
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DeviceReset for FakeReset {
    fn reset(&self, _device: &DeviceConfig) -> Result<(), io::Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(io::Error::other("device did not come out of reset"))
        } else {
            Ok(())
        }
    }
}

/// Runs guest hypercalls on a vCPU and plays the host part of the protocol:
/// every request the vCPU exits with is serviced before the guest resumes,
/// and retried hypercalls are issued again.
pub struct HypercallLoop {
    hyp: Arc<PvIommu>,
    vcpu: HypVcpu,
    stage2: Arc<FakeStage2>,
    next_page: u64,
    serviced: Vec<HypRequest>,
    retries: usize,
}

impl HypercallLoop {
    const MAX_RETRIES: usize = 64;

    pub fn new(hyp: Arc<PvIommu>, vm: Arc<GuestVm>, stage2: Arc<FakeStage2>) -> Self {
        HypercallLoop {
            hyp,
            vcpu: HypVcpu::new(vm),
            stage2,
            next_page: MEMCACHE_BASE,
            serviced: Vec::new(),
            retries: 0,
        }
    }

    pub fn vcpu(&self) -> &HypVcpu {
        &self.vcpu
    }

    /// Requests serviced on behalf of the guest so far.
    pub fn serviced(&self) -> &[HypRequest] {
        &self.serviced
    }

    /// Number of hypercalls that had to be issued again.
    pub fn retries(&self) -> usize {
        self.retries
    }

    fn service(&mut self, req: HypRequest) {
        match req {
            HypRequest::Map { ipa, size } => self.stage2.map_ram(ipa, size),
            HypRequest::Memory { nr_pages } => {
                let first = self.next_page;
                self.next_page += nr_pages as u64 * PAGE_SIZE;
                self.vcpu
                    .topup_memcache((0..nr_pages as u64).map(|i| first + i * PAGE_SIZE));
            }
        }
        self.serviced.push(req);
    }
}

impl Hypercall for HypercallLoop {
    fn hvc(&mut self, call: &HvcCall) -> [u64; 2] {
        for _ in 0..Self::MAX_RETRIES {
            match self.vcpu.handle_hvc(&self.hyp, call) {
                VcpuExit::Resume(ret) => return ret.regs(),
                VcpuExit::HypRequest { ret, requests } => {
                    for req in requests {
                        self.service(req);
                    }
                    match ret {
                        Some(ret) => return ret.regs(),
                        None => self.retries += 1,
                    }
                }
                VcpuExit::Unhandled => return [SmcccStatus::NotSupported.to_reg(), 0],
            }
        }
        panic!("hypercall {:#x} never completed", call.func);
    }
}

/// Run the `pkvm-iommu` binary at `bin` on `platform` and parse the JSON
/// report it prints.
pub fn run_platform(bin: &Path, platform: &Value) -> Result<(Output, Option<Value>), Error> {
    let tmp_dir = TempDir::new_with_prefix("/tmp/pkvm")
        .map_err(|e| Error::Platform(io::Error::from_raw_os_error(e.errno())))?;
    let path = tmp_dir.as_path().join("platform.json");
    std::fs::write(&path, platform.to_string()).map_err(Error::Platform)?;

    let output = Command::new(bin)
        .arg("--platform")
        .arg(&path)
        .output()
        .map_err(Error::Spawn)?;

    let report = if output.status.success() {
        Some(serde_json::from_slice(&output.stdout).map_err(Error::Report)?)
    } else {
        None
    };
    Ok((output, report))
}
