// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Page tables.
//!
//! User address spaces use a two-level structure: a segment table whose slots lazily own leaf
//! pages of [`PageTableEntry`]s. The kernel range is covered by one flat, fully pre-allocated
//! table instead, so kernel lookups never allocate and never fail.

use alloc::boxed::Box;
use alloc::sync::Arc;
use wasmtime_slab::Slab;

use crate::error::AllocError;
use crate::pmap::{PmapId, PmapShared};
use crate::pte::PageTableEntry;
use crate::shootdown::Space;
use crate::{PmapConfig, VirtualAddress};

/// One page worth of leaf entries.
#[derive(Debug)]
pub(crate) struct LeafTable {
    entries: Box<[PageTableEntry]>,
}

impl LeafTable {
    /// Returns `true` when no entry in this table is valid.
    pub(crate) fn is_empty(&self) -> bool {
        !self.entries.iter().any(|entry| entry.is_valid())
    }
}

/// Hands out leaf table pages, optionally capped at a fixed number of pages.
#[derive(Debug)]
pub(crate) struct TablePool {
    limit: Option<usize>,
    allocated: usize,
    entries: usize,
}

impl TablePool {
    pub(crate) fn new(config: &PmapConfig) -> Self {
        Self {
            limit: config.table_page_limit(),
            allocated: 0,
            entries: config.leaf_entries(),
        }
    }

    /// Number of leaf pages currently handed out.
    #[cfg(test)]
    pub(crate) fn allocated(&self) -> usize {
        self.allocated
    }

    fn alloc(&mut self) -> Result<LeafTable, AllocError> {
        if self.limit.is_some_and(|limit| self.allocated >= limit) {
            log::trace!("page-table pool exhausted at {} pages", self.allocated);
            return Err(AllocError);
        }
        self.allocated += 1;

        Ok(LeafTable {
            entries: alloc::vec![PageTableEntry::INVALID; self.entries].into_boxed_slice(),
        })
    }

    fn free(&mut self, table: LeafTable) {
        assert!(
            table.is_empty(),
            "freeing a page-table page that still holds valid entries"
        );
        self.allocated -= 1;
    }
}

/// The root of a user address space.
#[derive(Debug)]
pub(crate) struct SegmentTable {
    slots: Box<[Option<LeafTable>]>,
    page_size: usize,
    leaf_entries: usize,
}

impl SegmentTable {
    pub(crate) fn new(config: &PmapConfig) -> Self {
        Self {
            slots: (0..config.segment_count()).map(|_| None).collect(),
            page_size: config.page_size(),
            leaf_entries: config.leaf_entries(),
        }
    }

    fn segment_size(&self) -> usize {
        self.page_size * self.leaf_entries
    }

    fn indices(&self, va: VirtualAddress) -> (usize, usize) {
        let segment = va.get() / self.segment_size();
        assert!(
            segment < self.slots.len(),
            "user address {va} is outside of the user range"
        );
        let entry = (va.get() / self.page_size) % self.leaf_entries;
        (segment, entry)
    }

    pub(crate) fn get(&self, va: VirtualAddress) -> Option<PageTableEntry> {
        let (segment, entry) = self.indices(va);
        self.slots[segment]
            .as_ref()
            .map(|table| table.entries[entry])
    }

    pub(crate) fn get_mut(&mut self, va: VirtualAddress) -> Option<&mut PageTableEntry> {
        let (segment, entry) = self.indices(va);
        self.slots[segment]
            .as_mut()
            .map(|table| &mut table.entries[entry])
    }

    pub(crate) fn get_or_create(
        &mut self,
        va: VirtualAddress,
        pool: &mut TablePool,
    ) -> Result<&mut PageTableEntry, AllocError> {
        let (segment, entry) = self.indices(va);
        let table = match &mut self.slots[segment] {
            Some(table) => table,
            slot @ None => slot.insert(pool.alloc()?),
        };
        Ok(&mut table.entries[entry])
    }

    /// Returns the first page-aligned address in `va..end` that is backed by a leaf table,
    /// skipping unpopulated segments entirely.
    pub(crate) fn next_populated(
        &self,
        mut va: VirtualAddress,
        end: VirtualAddress,
    ) -> Option<VirtualAddress> {
        let segment_size = self.segment_size();
        while va < end {
            let (segment, _) = self.indices(va);
            if self.slots[segment].is_some() {
                return Some(va);
            }
            va = va.align_down(segment_size).add(segment_size);
        }
        None
    }

    /// Returns every leaf page without valid entries to `pool`.
    pub(crate) fn collect(&mut self, pool: &mut TablePool) -> usize {
        let mut freed = 0;
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(LeafTable::is_empty)
                && let Some(table) = slot.take()
            {
                pool.free(table);
                freed += 1;
            }
        }
        freed
    }

    /// Tears the table down, returning all leaf pages to `pool`.
    ///
    /// # Panics
    ///
    /// Panics if any leaf entry is still valid.
    pub(crate) fn release(self, pool: &mut TablePool) {
        for table in self.slots.into_iter().flatten() {
            pool.free(table);
        }
    }

    #[cfg(test)]
    pub(crate) fn iter_valid(&self) -> impl Iterator<Item = (VirtualAddress, PageTableEntry)> + '_ {
        let segment_size = self.segment_size();
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(segment, slot)| Some((segment, slot.as_ref()?)))
            .flat_map(move |(segment, table)| {
                table
                    .entries
                    .iter()
                    .enumerate()
                    .filter(|(_, entry)| entry.is_valid())
                    .map(move |(index, entry)| {
                        let va = segment * segment_size + index * self.page_size;
                        (VirtualAddress::new(va), *entry)
                    })
            })
    }
}

/// The flat table backing the kernel range.
#[derive(Debug)]
pub(crate) struct KernelTable {
    base: VirtualAddress,
    page_size: usize,
    entries: Box<[PageTableEntry]>,
}

impl KernelTable {
    pub(crate) fn new(config: &PmapConfig) -> Self {
        let invalid = PageTableEntry::invalid_kernel(config.paired_tlb());
        Self {
            base: config.kernel_range().start,
            page_size: config.page_size(),
            entries: alloc::vec![invalid; config.kernel_entries()].into_boxed_slice(),
        }
    }

    fn index(&self, va: VirtualAddress) -> usize {
        let index = va
            .get()
            .checked_sub(self.base.get())
            .map(|offset| offset / self.page_size);
        match index {
            Some(index) if index < self.entries.len() => index,
            _ => panic!("kernel address {va} is outside of the kernel range"),
        }
    }

    pub(crate) fn get(&self, va: VirtualAddress) -> PageTableEntry {
        self.entries[self.index(va)]
    }

    pub(crate) fn get_mut(&mut self, va: VirtualAddress) -> &mut PageTableEntry {
        let index = self.index(va);
        &mut self.entries[index]
    }

    #[cfg(test)]
    pub(crate) fn iter_valid(&self) -> impl Iterator<Item = (VirtualAddress, PageTableEntry)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_valid())
            .map(|(index, entry)| (self.base.add(index * self.page_size), *entry))
    }
}

#[derive(Debug)]
struct PmapEntry {
    shared: Arc<PmapShared>,
    segments: Option<SegmentTable>,
}

/// Every page table of the system, keyed by pmap.
#[derive(Debug)]
pub(crate) struct Tables {
    pmaps: Slab<PmapEntry>,
    kernel: KernelTable,
    kernel_id: PmapId,
}

impl Tables {
    pub(crate) fn new(config: &PmapConfig, kernel: Arc<PmapShared>) -> Self {
        let mut pmaps = Slab::new();
        let kernel_id = PmapId(pmaps.alloc(PmapEntry {
            shared: kernel,
            segments: None,
        }));

        Self {
            pmaps,
            kernel: KernelTable::new(config),
            kernel_id,
        }
    }

    pub(crate) fn kernel_id(&self) -> PmapId {
        self.kernel_id
    }

    pub(crate) fn insert(&mut self, shared: Arc<PmapShared>, segments: SegmentTable) -> PmapId {
        PmapId(self.pmaps.alloc(PmapEntry {
            shared,
            segments: Some(segments),
        }))
    }

    /// Unregisters a user pmap, handing back its segment table.
    pub(crate) fn remove(&mut self, id: PmapId) -> SegmentTable {
        assert_ne!(id, self.kernel_id, "the kernel pmap cannot be removed");
        let entry = self.pmaps.dealloc(id.0);
        let Some(segments) = entry.segments else {
            unreachable!("user pmaps always own a segment table")
        };
        segments
    }

    pub(crate) fn space(&self, id: PmapId) -> Space<'_> {
        if id == self.kernel_id {
            Space::Kernel
        } else {
            Space::User(id, &self.pmaps[id.0].shared)
        }
    }

    pub(crate) fn shared(&self, id: PmapId) -> &PmapShared {
        &self.pmaps[id.0].shared
    }

    pub(crate) fn segments_mut(&mut self, id: PmapId) -> Option<&mut SegmentTable> {
        self.pmaps[id.0].segments.as_mut()
    }

    /// Returns the leaf entry of `va`, or `None` if no leaf table covers it.
    pub(crate) fn get(&self, id: PmapId, va: VirtualAddress) -> Option<PageTableEntry> {
        match &self.pmaps.get(id.0)?.segments {
            None => Some(self.kernel.get(va)),
            Some(segments) => segments.get(va),
        }
    }

    pub(crate) fn get_mut(&mut self, id: PmapId, va: VirtualAddress) -> Option<&mut PageTableEntry> {
        match &mut self.pmaps.get_mut(id.0)?.segments {
            None => Some(self.kernel.get_mut(va)),
            Some(segments) => segments.get_mut(va),
        }
    }

    pub(crate) fn get_or_create(
        &mut self,
        id: PmapId,
        va: VirtualAddress,
        pool: &mut TablePool,
    ) -> Result<&mut PageTableEntry, AllocError> {
        match &mut self.pmaps[id.0].segments {
            None => Ok(self.kernel.get_mut(va)),
            Some(segments) => segments.get_or_create(va, pool),
        }
    }

    /// Returns the first address in `va..end` that may hold a mapping in `id`.
    pub(crate) fn next_mapped(
        &self,
        id: PmapId,
        va: VirtualAddress,
        end: VirtualAddress,
    ) -> Option<VirtualAddress> {
        match &self.pmaps[id.0].segments {
            None => (va < end).then_some(va),
            Some(segments) => segments.next_populated(va, end),
        }
    }

    /// Overwrites an entry that is known to exist.
    pub(crate) fn set(&mut self, id: PmapId, va: VirtualAddress, entry: PageTableEntry) {
        let Some(slot) = self.get_mut(id, va) else {
            panic!("no page table covers {va} in {id:?}")
        };
        *slot = entry;
    }

    #[cfg(test)]
    pub(crate) fn ids(&self) -> impl Iterator<Item = PmapId> + '_ {
        self.pmaps.iter().map(|(id, _)| PmapId(id))
    }

    /// Every valid leaf entry of every pmap.
    #[cfg(test)]
    pub(crate) fn iter_valid(
        &self,
    ) -> impl Iterator<Item = (PmapId, VirtualAddress, PageTableEntry)> + '_ {
        self.pmaps.iter().flat_map(move |(id, entry)| {
            let id = PmapId(id);
            let entries: alloc::vec::Vec<_> = match &entry.segments {
                None => self.kernel.iter_valid().collect(),
                Some(segments) => segments.iter_valid().collect(),
            };
            entries.into_iter().map(move |(va, pte)| (id, va, pte))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PhysicalAddress;

    fn config() -> PmapConfig {
        PmapConfig::new("test").with_table_page_limit(Some(2))
    }

    #[test]
    fn leaf_tables_are_created_lazily() {
        let config = config();
        let mut pool = TablePool::new(&config);
        let mut segments = SegmentTable::new(&config);

        let va = VirtualAddress::new(0x1000);
        assert!(segments.get(va).is_none());

        *segments.get_or_create(va, &mut pool).unwrap() = PageTableEntry::read_write_page();
        assert_eq!(pool.allocated(), 1);
        assert!(segments.get(va).unwrap().is_valid());
        assert!(!segments.get(VirtualAddress::new(0x2000)).unwrap().is_valid());

        // a second segment needs a second page, a third exhausts the pool
        segments
            .get_or_create(VirtualAddress::new(config.segment_size()), &mut pool)
            .unwrap();
        assert_eq!(
            segments
                .get_or_create(VirtualAddress::new(2 * config.segment_size()), &mut pool)
                .unwrap_err(),
            AllocError
        );
    }

    #[test]
    fn next_populated_skips_empty_segments() {
        let config = config();
        let mut pool = TablePool::new(&config);
        let mut segments = SegmentTable::new(&config);

        let far = VirtualAddress::new(3 * config.segment_size());
        segments.get_or_create(far, &mut pool).unwrap();

        let end = far.add(2 * 4096);
        assert_eq!(
            segments.next_populated(VirtualAddress::new(0x1000), end),
            Some(far)
        );
        assert_eq!(
            segments.next_populated(far.add(4096), end),
            Some(far.add(4096))
        );
        assert_eq!(segments.next_populated(end, end), None);
        assert_eq!(
            segments.next_populated(VirtualAddress::new(0x1000), far),
            None
        );
    }

    #[test]
    fn collect_frees_only_empty_tables() {
        let config = config();
        let mut pool = TablePool::new(&config);
        let mut segments = SegmentTable::new(&config);

        *segments
            .get_or_create(VirtualAddress::new(0x1000), &mut pool)
            .unwrap() = PageTableEntry::read_only_page().with_address(PhysicalAddress::new(0x7000));
        segments
            .get_or_create(VirtualAddress::new(config.segment_size()), &mut pool)
            .unwrap();

        assert_eq!(segments.collect(&mut pool), 1);
        assert_eq!(pool.allocated(), 1);
        assert_eq!(segments.iter_valid().count(), 1);
    }

    #[test]
    #[should_panic(expected = "still holds valid entries")]
    fn releasing_live_table_panics() {
        let config = config();
        let mut pool = TablePool::new(&config);
        let mut segments = SegmentTable::new(&config);
        *segments
            .get_or_create(VirtualAddress::new(0x1000), &mut pool)
            .unwrap() = PageTableEntry::read_only_page();
        segments.release(&mut pool);
    }

    #[test]
    fn kernel_table_starts_invalid_and_global() {
        let config = PmapConfig::new("test");
        let table = KernelTable::new(&config);
        let entry = table.get(config.kernel_range().start);
        assert!(!entry.is_valid());
        assert!(entry.is_global());
        assert_eq!(table.iter_valid().count(), 0);
    }

    #[test]
    #[should_panic(expected = "outside of the kernel range")]
    fn kernel_table_rejects_user_addresses() {
        let config = PmapConfig::new("test");
        let table = KernelTable::new(&config);
        table.get(VirtualAddress::new(0x1000));
    }
}
