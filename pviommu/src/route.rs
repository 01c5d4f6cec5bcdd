// Copyright © 2026 The pKVM IOMMU Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Translation of the stream IDs a guest sees into physical ones.
//!
//! The host declares, per guest, the pvIOMMU instances it exposes and the
//! `vsid -> (iommu, sid)` pairs behind them. Once the guest is finalized the
//! declarations become an immutable [VsidTable](struct.VsidTable.html) and
//! every physical pair is reserved to that guest.

use std::collections::{BTreeMap, BTreeSet};
use std::result;
use std::sync::Mutex;

use thiserror::Error;
use vm_device::VmHandle;

/// Maximum number of pvIOMMU instances waiting for finalization.
pub const MAX_NR_PVIOMMU: usize = 32;
/// Maximum number of virtual stream IDs behind one pvIOMMU.
pub const MAX_NR_SID_PER_PVIOMMU: usize = 16;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RouteError {
    #[error("No room for another pvIOMMU")]
    TooManyPvIommus,
    #[error("pvIOMMU {1} already exists for {0}")]
    PvIommuExists(VmHandle, u32),
    #[error("pvIOMMU {1} does not exist for {0}")]
    NoPvIommu(VmHandle, u32),
    #[error("pvIOMMU {0} has no room for another stream ID")]
    TooManySids(u32),
    #[error("Virtual stream ID {1} declared twice on pvIOMMU {0}")]
    DuplicateVsid(u32, u32),
    #[error("IOMMU {0:#x} stream {1} routed twice")]
    DuplicateRoute(u64, u32),
    #[error("IOMMU {0:#x} stream {1} is already routed to {2}")]
    RouteClaimed(u64, u32, VmHandle),
    #[error("Routes of {0} are already finalized")]
    Finalized(VmHandle),
}

pub type Result<T> = result::Result<T, RouteError>;

/// Physical stream behind a virtual one.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PvIommuRoute {
    pub iommu: u64,
    pub sid: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VsidEntry {
    pub iommu: u64,
    pub sid: u32,
    pub vsid: u32,
}

/// Finalized routes of one guest.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct VsidTable {
    pviommus: BTreeMap<u32, Vec<VsidEntry>>,
}

impl VsidTable {
    /// Physical stream behind `vsid` of instance `pviommu`.
    pub fn route(&self, pviommu: u32, vsid: u32) -> Option<PvIommuRoute> {
        self.pviommus
            .get(&pviommu)?
            .iter()
            .find(|e| e.vsid == vsid)
            .map(|e| PvIommuRoute {
                iommu: e.iommu,
                sid: e.sid,
            })
    }

    pub fn pviommus(&self) -> impl Iterator<Item = (u32, &[VsidEntry])> {
        self.pviommus.iter().map(|(id, e)| (*id, e.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.pviommus.is_empty()
    }
}

struct PendingPvIommu {
    vm: VmHandle,
    id: u32,
    entries: Vec<VsidEntry>,
}

#[derive(Default)]
struct RouterState {
    pending: Vec<PendingPvIommu>,
    claimed: BTreeMap<(u64, u32), VmHandle>,
    // Guests whose declarations are closed until teardown.
    finalized: BTreeSet<VmHandle>,
}

/// Collects the host declarations and hands out finalized tables.
#[derive(Default)]
pub struct PvIommuRouter {
    state: Mutex<RouterState>,
}

impl PvIommuRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create pvIOMMU instance `pviommu` for `vm`.
    pub fn attach(&self, vm: VmHandle, pviommu: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        if state.finalized.contains(&vm) {
            return Err(RouteError::Finalized(vm));
        }
        if state.pending.iter().any(|p| p.vm == vm && p.id == pviommu) {
            return Err(RouteError::PvIommuExists(vm, pviommu));
        }
        if state.pending.len() >= MAX_NR_PVIOMMU {
            return Err(RouteError::TooManyPvIommus);
        }

        state.pending.push(PendingPvIommu {
            vm,
            id: pviommu,
            entries: Vec::new(),
        });
        Ok(())
    }

    /// Route `vsid` of instance `pviommu` to stream `sid` of `iommu`.
    pub fn add_vsid(&self, vm: VmHandle, pviommu: u32, iommu: u64, sid: u32, vsid: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        if state.finalized.contains(&vm) {
            return Err(RouteError::Finalized(vm));
        }
        let pending = state
            .pending
            .iter_mut()
            .find(|p| p.vm == vm && p.id == pviommu)
            .ok_or(RouteError::NoPvIommu(vm, pviommu))?;

        if pending.entries.len() >= MAX_NR_SID_PER_PVIOMMU {
            return Err(RouteError::TooManySids(pviommu));
        }
        if pending.entries.iter().any(|e| e.vsid == vsid) {
            return Err(RouteError::DuplicateVsid(pviommu, vsid));
        }

        pending.entries.push(VsidEntry { iommu, sid, vsid });
        Ok(())
    }

    /// Turn the declarations of `vm` into its route table and reserve every
    /// physical stream it names.
    pub fn finalize(&self, vm: VmHandle) -> Result<VsidTable> {
        let mut state = self.state.lock().unwrap();

        if state.finalized.contains(&vm) {
            return Err(RouteError::Finalized(vm));
        }
        let mut seen = BTreeSet::new();
        for e in state
            .pending
            .iter()
            .filter(|p| p.vm == vm)
            .flat_map(|p| p.entries.iter())
        {
            if !seen.insert((e.iommu, e.sid)) {
                return Err(RouteError::DuplicateRoute(e.iommu, e.sid));
            }
            if let Some(owner) = state.claimed.get(&(e.iommu, e.sid)) {
                return Err(RouteError::RouteClaimed(e.iommu, e.sid, *owner));
            }
        }

        let mut table = VsidTable::default();
        let (mine, others): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending)
            .into_iter()
            .partition(|p| p.vm == vm);
        state.pending = others;

        for pending in mine {
            for e in &pending.entries {
                state.claimed.insert((e.iommu, e.sid), vm);
            }
            table.pviommus.insert(pending.id, pending.entries);
        }
        state.finalized.insert(vm);

        info!("Finalized {} pvIOMMU routes for {}", seen.len(), vm);
        Ok(table)
    }

    /// Forget every declaration and reservation of `vm`.
    pub fn teardown(&self, vm: VmHandle) {
        let mut state = self.state.lock().unwrap();
        state.pending.retain(|p| p.vm != vm);
        state.claimed.retain(|_, owner| *owner != vm);
        state.finalized.remove(&vm);
    }

    /// Guest the physical stream is reserved to.
    pub fn owner_of(&self, iommu: u64, sid: u32) -> Option<VmHandle> {
        self.state.lock().unwrap().claimed.get(&(iommu, sid)).copied()
    }
}
