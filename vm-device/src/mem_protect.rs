// Copyright © 2026 The pKVM IOMMU Authors
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Page ownership transfers between the host, the hypervisor and guests.

use std::collections::BTreeMap;
use std::result;
use std::sync::Mutex;

use thiserror::Error;
use vm_memory::GuestAddress;

use crate::device::{Owner, VmHandle, PAGE_MASK, PAGE_SIZE};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MemError {
    #[error("Page {0:#x} is not owned by {1}")]
    NotOwned(u64, Owner),
    #[error("Range {0:#x}+{1:#x} is not page aligned")]
    Unaligned(u64, u64),
    #[error("IPA {1:#x} of {0} is already mapped")]
    IpaInUse(VmHandle, u64),
}

pub type Result<T> = result::Result<T, MemError>;

/// Stage-2 ownership primitives the device registry builds on.
///
/// Every call either applies to the whole range or leaves it untouched.
pub trait MemProtect: Send + Sync {
    /// Transfer `[base, base + size)` from the host to the hypervisor.
    fn host_donate_hyp(&self, base: u64, size: u64) -> Result<()>;

    /// Transfer `[base, base + size)` from the hypervisor back to the host.
    fn hyp_donate_host(&self, base: u64, size: u64) -> Result<()>;

    /// Transfer the page at `phys` from the hypervisor to `vm`, mapped at `ipa`.
    fn hyp_donate_guest(&self, vm: VmHandle, phys: u64, ipa: GuestAddress) -> Result<()>;

    /// Returns true if every page of `[base, base + size)` belongs to `owner`.
    fn is_owned_by(&self, owner: Owner, base: u64, size: u64) -> bool;

    /// Force `[base, base + size)` back to the host, whoever owns it.
    fn set_host_owner(&self, base: u64, size: u64);
}

fn pages(base: u64, size: u64) -> Result<impl Iterator<Item = u64>> {
    if base & !PAGE_MASK != 0 || size & !PAGE_MASK != 0 || base.checked_add(size).is_none() {
        return Err(MemError::Unaligned(base, size));
    }
    Ok((base..base + size).step_by(PAGE_SIZE as usize))
}

#[derive(Default)]
struct OwnershipState {
    // Pages absent from the map belong to the host.
    owners: BTreeMap<u64, Owner>,
    guest_maps: BTreeMap<(VmHandle, u64), u64>,
}

impl OwnershipState {
    fn owner_of(&self, page: u64) -> Owner {
        self.owners.get(&page).copied().unwrap_or(Owner::Host)
    }

    fn set_owner(&mut self, page: u64, owner: Owner) {
        if owner == Owner::Host {
            self.owners.remove(&page);
        } else {
            self.owners.insert(page, owner);
        }
    }

    fn transfer(&mut self, base: u64, size: u64, from: Owner, to: Owner) -> Result<()> {
        if let Some(page) = pages(base, size)?.find(|page| self.owner_of(*page) != from) {
            return Err(MemError::NotOwned(page, from));
        }
        for page in pages(base, size)? {
            self.set_owner(page, to);
        }
        Ok(())
    }
}

/// Software page-ownership tracker.
///
/// Stands in for the stage-2 page tables when no real hardware is
/// involved: pages default to the host and every donation checks that the
/// source owns the whole range before changing anything.
#[derive(Default)]
pub struct PageOwnership {
    state: Mutex<OwnershipState>,
}

impl PageOwnership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current owner of the page containing `addr`.
    pub fn owner_of(&self, addr: u64) -> Owner {
        self.state.lock().unwrap().owner_of(addr & PAGE_MASK)
    }

    /// Physical page mapped at `ipa` in `vm`, if any.
    pub fn guest_mapping(&self, vm: VmHandle, ipa: GuestAddress) -> Option<u64> {
        self.state
            .lock()
            .unwrap()
            .guest_maps
            .get(&(vm, ipa.0 & PAGE_MASK))
            .copied()
    }
}

impl MemProtect for PageOwnership {
    fn host_donate_hyp(&self, base: u64, size: u64) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .transfer(base, size, Owner::Host, Owner::Hyp)
    }

    fn hyp_donate_host(&self, base: u64, size: u64) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .transfer(base, size, Owner::Hyp, Owner::Host)
    }

    fn hyp_donate_guest(&self, vm: VmHandle, phys: u64, ipa: GuestAddress) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let ipa = ipa.0;
        if ipa & !PAGE_MASK != 0 {
            return Err(MemError::Unaligned(ipa, PAGE_SIZE));
        }
        if state.guest_maps.contains_key(&(vm, ipa)) {
            return Err(MemError::IpaInUse(vm, ipa));
        }
        state.transfer(phys, PAGE_SIZE, Owner::Hyp, Owner::Guest(vm))?;
        state.guest_maps.insert((vm, ipa), phys);
        Ok(())
    }

    fn is_owned_by(&self, owner: Owner, base: u64, size: u64) -> bool {
        let state = self.state.lock().unwrap();
        match pages(base, size) {
            Ok(mut pages) => pages.all(|page| state.owner_of(page) == owner),
            Err(_) => false,
        }
    }

    fn set_host_owner(&self, base: u64, size: u64) {
        let mut state = self.state.lock().unwrap();
        let end = base.saturating_add(size);
        let pages: Vec<u64> = state.owners.range(base..end).map(|(p, _)| *p).collect();
        for page in pages {
            state.owners.remove(&page);
        }
        state
            .guest_maps
            .retain(|_, phys| *phys < base || *phys >= end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VM: VmHandle = VmHandle(1);

    #[test]
    fn pages_start_with_host() {
        let mem = PageOwnership::new();
        assert_eq!(mem.owner_of(0x1234), Owner::Host);
        assert!(mem.is_owned_by(Owner::Host, 0x1000, 0x4000));
        assert!(!mem.is_owned_by(Owner::Hyp, 0x1000, 0x1000));
    }

    #[test]
    fn donation_is_all_or_nothing() {
        let mem = PageOwnership::new();
        mem.host_donate_hyp(0x2000, 0x1000).unwrap();

        // The second page is no longer the host's, nothing moves.
        assert_eq!(
            mem.host_donate_hyp(0x1000, 0x3000),
            Err(MemError::NotOwned(0x2000, Owner::Host))
        );
        assert_eq!(mem.owner_of(0x1000), Owner::Host);
        assert_eq!(mem.owner_of(0x3000), Owner::Host);

        mem.hyp_donate_host(0x2000, 0x1000).unwrap();
        assert_eq!(mem.owner_of(0x2000), Owner::Host);
    }

    #[test]
    fn unaligned_ranges_are_rejected() {
        let mem = PageOwnership::new();
        assert_eq!(
            mem.host_donate_hyp(0x1800, 0x1000),
            Err(MemError::Unaligned(0x1800, 0x1000))
        );
        assert!(!mem.is_owned_by(Owner::Host, 0x1000, 0x800));
    }

    #[test]
    fn guest_donation_records_mapping() {
        let mem = PageOwnership::new();
        mem.host_donate_hyp(0x10000, 0x2000).unwrap();
        mem.hyp_donate_guest(VM, 0x11000, GuestAddress(0x8000))
            .unwrap();

        assert_eq!(mem.owner_of(0x11000), Owner::Guest(VM));
        assert_eq!(mem.owner_of(0x10000), Owner::Hyp);
        assert_eq!(mem.guest_mapping(VM, GuestAddress(0x8010)), Some(0x11000));

        assert_eq!(
            mem.hyp_donate_guest(VM, 0x10000, GuestAddress(0x8000)),
            Err(MemError::IpaInUse(VM, 0x8000))
        );
        assert_eq!(
            mem.hyp_donate_guest(VM, 0x11000, GuestAddress(0x9000)),
            Err(MemError::NotOwned(0x11000, Owner::Hyp))
        );
    }

    #[test]
    fn set_host_owner_overrides_everyone() {
        let mem = PageOwnership::new();
        mem.host_donate_hyp(0x10000, 0x2000).unwrap();
        mem.hyp_donate_guest(VM, 0x11000, GuestAddress(0x8000))
            .unwrap();

        mem.set_host_owner(0x10000, 0x2000);
        assert!(mem.is_owned_by(Owner::Host, 0x10000, 0x2000));
        assert_eq!(mem.guest_mapping(VM, GuestAddress(0x8000)), None);
    }
}
