// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Copyright © 2019 Intel Corporation
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::result;

use thiserror::Error;

/// Size of the global IOMMU domain-ID space.
pub const KVM_IOMMU_MAX_DOMAINS: u32 = 1 << 16;

/// First domain ID reserved for guests. The lower half of the space belongs
/// to the host and is never handed out here.
pub const KVM_IOMMU_GUEST_DOMAIN_BASE: u32 = KVM_IOMMU_MAX_DOMAINS / 2;

const BITS_PER_WORD: u32 = u64::BITS;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("All guest domain IDs are in use")]
    Exhausted,
    #[error("Invalid domain ID range [{0}, {1})")]
    InvalidRange(u32, u32),
}

pub type Result<T> = result::Result<T, Error>;

/// Manages the guest-reserved half of the IOMMU domain-ID space.
///
/// The bitmap is the only record of which IDs are in use. Callers are
/// expected to serialize access, usually by wrapping the allocator in a
/// `Mutex` that also covers the backend call creating or destroying the
/// domain.
///
/// # Examples
///
/// ```
/// # use vm_allocator::{DomainIdAllocator, KVM_IOMMU_GUEST_DOMAIN_BASE};
/// let mut ids = DomainIdAllocator::new();
/// let id = ids.allocate().unwrap();
/// assert_eq!(id, KVM_IOMMU_GUEST_DOMAIN_BASE);
/// ids.free(id);
/// ```
#[derive(Debug)]
pub struct DomainIdAllocator {
    start: u32,
    end: u32,
    bitmap: Box<[u64]>,
}

impl Default for DomainIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl DomainIdAllocator {
    /// Creates an allocator over `[KVM_IOMMU_GUEST_DOMAIN_BASE, KVM_IOMMU_MAX_DOMAINS)`.
    pub fn new() -> Self {
        // The guest half is a non-empty multiple of the word size.
        Self::with_range(KVM_IOMMU_GUEST_DOMAIN_BASE, KVM_IOMMU_MAX_DOMAINS).unwrap()
    }

    /// Creates an allocator handing out IDs in `[start, end)`.
    pub fn with_range(start: u32, end: u32) -> Result<Self> {
        if start >= end {
            return Err(Error::InvalidRange(start, end));
        }

        let nr_ids = end - start;
        let nr_words = nr_ids.div_ceil(BITS_PER_WORD) as usize;
        let mut bitmap = vec![0u64; nr_words].into_boxed_slice();

        // Bits past the end of the range in the last word are marked as used
        // so the scan never returns them.
        let tail = nr_ids % BITS_PER_WORD;
        if tail != 0 {
            bitmap[nr_words - 1] = !((1u64 << tail) - 1);
        }

        Ok(DomainIdAllocator { start, end, bitmap })
    }

    fn position(&self, id: u32) -> (usize, u64) {
        let offset = id - self.start;
        (
            (offset / BITS_PER_WORD) as usize,
            1u64 << (offset % BITS_PER_WORD),
        )
    }

    /// Returns true if `id` belongs to the range managed by this allocator.
    pub fn contains(&self, id: u32) -> bool {
        id >= self.start && id < self.end
    }

    /// Returns true if `id` is in range and currently allocated.
    pub fn is_allocated(&self, id: u32) -> bool {
        if !self.contains(id) {
            return false;
        }
        let (word, mask) = self.position(id);
        self.bitmap[word] & mask != 0
    }

    /// Allocates the lowest free ID.
    pub fn allocate(&mut self) -> Result<u32> {
        for (idx, word) in self.bitmap.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }

            let bit = (!*word).trailing_zeros();
            *word |= 1u64 << bit;
            return Ok(self.start + idx as u32 * BITS_PER_WORD + bit);
        }

        Err(Error::Exhausted)
    }

    /// Releases `id`.
    ///
    /// Only IDs returned by `allocate()` may be freed. Anything else means
    /// the caller's bookkeeping is corrupt, which is fatal.
    pub fn free(&mut self, id: u32) {
        assert!(
            self.contains(id),
            "domain ID {id} is outside of the guest range [{}, {})",
            self.start,
            self.end
        );

        let (word, mask) = self.position(id);
        assert!(
            self.bitmap[word] & mask != 0,
            "domain ID {id} is not allocated"
        );
        self.bitmap[word] &= !mask;
    }

    /// Number of IDs currently allocated.
    pub fn used(&self) -> u32 {
        let padding = self.bitmap.len() as u32 * BITS_PER_WORD - (self.end - self.start);
        self.bitmap.iter().map(|w| w.count_ones()).sum::<u32>() - padding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_covers_guest_half() {
        let ids = DomainIdAllocator::new();
        assert!(!ids.contains(KVM_IOMMU_GUEST_DOMAIN_BASE - 1));
        assert!(ids.contains(KVM_IOMMU_GUEST_DOMAIN_BASE));
        assert!(ids.contains(KVM_IOMMU_MAX_DOMAINS - 1));
        assert!(!ids.contains(KVM_IOMMU_MAX_DOMAINS));
        assert_eq!(ids.used(), 0);
    }

    #[test]
    fn new_fails_empty_range() {
        assert_eq!(
            DomainIdAllocator::with_range(10, 10).unwrap_err(),
            Error::InvalidRange(10, 10)
        );
    }

    #[test]
    fn allocate_lowest_first() {
        let mut ids = DomainIdAllocator::new();
        let base = KVM_IOMMU_GUEST_DOMAIN_BASE;
        assert_eq!(ids.allocate(), Ok(base));
        assert_eq!(ids.allocate(), Ok(base + 1));
        assert_eq!(ids.allocate(), Ok(base + 2));
        assert_eq!(ids.used(), 3);
    }

    #[test]
    fn allocate_crosses_words() {
        let mut ids = DomainIdAllocator::with_range(100, 300).unwrap();
        for expected in 100..165 {
            assert_eq!(ids.allocate(), Ok(expected));
        }
        assert!(ids.is_allocated(164));
        assert!(!ids.is_allocated(165));
    }

    #[test]
    fn free_makes_id_reusable() {
        let mut ids = DomainIdAllocator::with_range(0, 128).unwrap();
        for _ in 0..70 {
            ids.allocate().unwrap();
        }
        ids.free(3);
        ids.free(66);
        assert_eq!(ids.allocate(), Ok(3));
        assert_eq!(ids.allocate(), Ok(66));
        assert_eq!(ids.allocate(), Ok(70));
    }

    #[test]
    fn allocate_exhausted() {
        let mut ids = DomainIdAllocator::with_range(8, 13).unwrap();
        for expected in 8..13 {
            assert_eq!(ids.allocate(), Ok(expected));
        }
        assert_eq!(ids.allocate(), Err(Error::Exhausted));
        assert_eq!(ids.used(), 5);

        ids.free(10);
        assert_eq!(ids.allocate(), Ok(10));
    }

    #[test]
    fn ids_are_never_handed_out_twice() {
        let mut ids = DomainIdAllocator::with_range(0, 256).unwrap();
        let mut seen = std::collections::BTreeSet::new();
        while let Ok(id) = ids.allocate() {
            assert!(seen.insert(id));
        }
        assert_eq!(seen.len(), 256);
    }

    #[test]
    #[should_panic(expected = "outside of the guest range")]
    fn free_host_id_is_fatal() {
        let mut ids = DomainIdAllocator::new();
        ids.free(KVM_IOMMU_GUEST_DOMAIN_BASE - 1);
    }

    #[test]
    #[should_panic(expected = "is not allocated")]
    fn double_free_is_fatal() {
        let mut ids = DomainIdAllocator::new();
        let id = ids.allocate().unwrap();
        ids.free(id);
        ids.free(id);
    }
}
