// Copyright © 2026 The pKVM IOMMU Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::collections::BTreeMap;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Interval {
    end: u64,
    phys: u64,
}

/// Record of the IOVA ranges mapped in a domain whose page tables are
/// out of reach.
///
/// Ranges are inclusive and never overlap. The record is advisory: it is
/// only updated after the hypervisor accepted an operation and is used to
/// answer `iova -> phys` queries.
#[derive(Debug, Default)]
pub struct ShadowMap {
    // Keyed by the first IOVA of each range.
    ranges: BTreeMap<u64, Interval>,
}

impl ShadowMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Iterate over `(start, end, phys)` in IOVA order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64, u64)> + '_ {
        self.ranges.iter().map(|(start, i)| (*start, i.end, i.phys))
    }

    /// Record `[start, end]` as mapped to `phys`, replacing whatever was
    /// recorded there.
    pub fn insert(&mut self, start: u64, end: u64, phys: u64) {
        if end < start {
            return;
        }
        self.remove(start, end);
        self.ranges.insert(start, Interval { end, phys });
    }

    /// Forget `[start, end]`. Ranges straddling a boundary keep the part
    /// outside, with the physical base moved along.
    pub fn remove(&mut self, start: u64, end: u64) {
        if end < start {
            return;
        }

        let overlapping: Vec<(u64, Interval)> = self
            .ranges
            .range(..=end)
            .rev()
            .take_while(|(_, i)| i.end >= start)
            .map(|(s, i)| (*s, *i))
            .collect();

        for (s, i) in overlapping {
            self.ranges.remove(&s);
            if s < start {
                self.ranges.insert(
                    s,
                    Interval {
                        end: start - 1,
                        phys: i.phys,
                    },
                );
            }
            if i.end > end {
                self.ranges.insert(
                    end + 1,
                    Interval {
                        end: i.end,
                        phys: i.phys + (end + 1 - s),
                    },
                );
            }
        }
    }

    /// Physical address recorded for `iova`.
    pub fn find(&self, iova: u64) -> Option<u64> {
        let (start, i) = self.ranges.range(..=iova).next_back()?;
        (i.end >= iova).then(|| i.phys + (iova - start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_inside_ranges() {
        let mut map = ShadowMap::new();
        map.insert(0x1000, 0x1fff, 0x8000);
        map.insert(0x4000, 0x5fff, 0x20000);

        assert_eq!(map.find(0x0fff), None);
        assert_eq!(map.find(0x1000), Some(0x8000));
        assert_eq!(map.find(0x1fff), Some(0x8fff));
        assert_eq!(map.find(0x2000), None);
        assert_eq!(map.find(0x5123), Some(0x21123));
    }

    #[test]
    fn remove_middle_splits() {
        let mut map = ShadowMap::new();
        map.insert(0x1000, 0x4fff, 0x10000);
        map.remove(0x2000, 0x2fff);

        assert_eq!(
            map.iter().collect::<Vec<_>>(),
            vec![(0x1000, 0x1fff, 0x10000), (0x3000, 0x4fff, 0x12000)]
        );
        assert_eq!(map.find(0x2800), None);
        assert_eq!(map.find(0x3004), Some(0x12004));
    }

    #[test]
    fn remove_spanning_several_ranges() {
        let mut map = ShadowMap::new();
        map.insert(0x1000, 0x1fff, 0xa000);
        map.insert(0x2000, 0x2fff, 0xb000);
        map.insert(0x3000, 0x3fff, 0xc000);
        map.remove(0x1800, 0x37ff);

        assert_eq!(
            map.iter().collect::<Vec<_>>(),
            vec![(0x1000, 0x17ff, 0xa000), (0x3800, 0x3fff, 0xc800)]
        );
    }

    #[test]
    fn insert_overwrites_overlap() {
        let mut map = ShadowMap::new();
        map.insert(0x1000, 0x3fff, 0x10000);
        map.insert(0x2000, 0x2fff, 0x50000);

        assert_eq!(map.len(), 3);
        assert_eq!(map.find(0x1000), Some(0x10000));
        assert_eq!(map.find(0x2010), Some(0x50010));
        assert_eq!(map.find(0x3010), Some(0x12010));
    }

    #[test]
    fn insert_then_remove_leaves_nothing() {
        let mut map = ShadowMap::new();
        map.insert(0x1000, 0x1fff, 0x8000);
        map.insert(0x2000, 0x2fff, 0x9000);
        map.remove(0x1000, 0x2fff);
        assert!(map.is_empty());

        map.insert(5, 4, 0);
        assert!(map.is_empty());
    }

    #[test]
    fn range_reaching_end_of_space() {
        let mut map = ShadowMap::new();
        map.insert(u64::MAX - 0xfff, u64::MAX, 0x1000);
        assert_eq!(map.find(u64::MAX), Some(0x1fff));
        map.remove(u64::MAX - 0xfff, u64::MAX);
        assert!(map.is_empty());
    }
}
