// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ops::Range;

use lock_api::RawMutex;

use super::{PhysMap, State};
use crate::arch::Arch;
use crate::page::PageFlags;
use crate::pmap::{Pmap, PmapId};
use crate::pte::PageTableEntry;
use crate::{Page, PhysicalAddress, VirtualAddress};

impl<A: Arch, R: RawMutex> PhysMap<A, R> {
    /// Removes every mapping in `range` from `pmap`.
    pub fn remove(&self, pmap: &Pmap, range: Range<VirtualAddress>) {
        log::trace!("remove({:?}, {range:?})", pmap.id);

        let page_size = self.config.page_size();
        let range = range.start.align_down(page_size)..range.end.align_up(page_size);
        self.check_range(pmap, range.clone());

        let mut state = self.lock();
        self.do_remove(&mut state, pmap.id, range);
    }

    /// Removes the unmanaged kernel mappings of `va..va + len` established by [`Self::kenter`].
    pub fn kremove(&self, va: VirtualAddress, len: usize) {
        log::trace!("kremove({va}, {len:#x})");

        let page_size = self.config.page_size();
        let range = va.align_down(page_size)..va.add(len).align_up(page_size);
        let kernel = self.kernel();
        self.check_range(kernel, range.clone());
        let space = self.space(kernel);

        let mut state = self.lock();
        let mut va = range.start;
        while va < range.end {
            let entry = state.tables.get(kernel.id, va).unwrap_or(PageTableEntry::INVALID);
            if entry.is_valid() {
                if entry.is_cached() {
                    self.arch.hit_sync_dcache_page(va, entry.address());
                }
                state
                    .tables
                    .set(kernel.id, va, PageTableEntry::invalid_kernel(self.config.paired_tlb()));
                self.invalidate_local(space, va);
                self.shootdown(space, va..va.add(page_size));

                if entry.is_wired() {
                    kernel.shared.dec_wired();
                }
                kernel.shared.dec_resident();
            }
            va = va.add(page_size);
        }
    }

    pub(super) fn do_remove(&self, state: &mut State, pmap: PmapId, range: Range<VirtualAddress>) {
        let page_size = self.config.page_size();
        let kernel = pmap == state.tables.kernel_id();
        let invalid = if kernel {
            PageTableEntry::invalid_kernel(self.config.paired_tlb())
        } else {
            PageTableEntry::INVALID
        };

        let mut removed: Option<Range<VirtualAddress>> = None;
        let mut next = range.start;
        while let Some(va) = state.tables.next_mapped(pmap, next, range.end) {
            next = va.add(page_size);

            let Some(entry) = state.tables.get(pmap, va) else {
                continue;
            };
            if !entry.is_valid() {
                continue;
            }

            let shared = state.tables.shared(pmap);
            if entry.is_wired() {
                shared.dec_wired();
            }
            shared.dec_resident();

            let pa = entry.address();
            if entry.is_cached() {
                if kernel {
                    self.arch.hit_sync_dcache_page(va, pa);
                } else {
                    self.arch.sync_dcache_page(va, pa);
                }
            }

            self.pv_remove(state, pmap, va, pa);
            state.tables.set(pmap, va, invalid);
            self.invalidate_local(state.tables.space(pmap), va);

            removed = Some(removed.map_or(va..next, |removed| removed.start..next));
        }

        if let Some(removed) = removed {
            self.shootdown(state.tables.space(pmap), removed);
        }
    }

    /// Removes every mapping of `page`.
    pub(super) fn page_remove(&self, state: &mut State, page: Page) {
        let page_size = self.config.page_size();
        while let Some(head) = state.pages[page].pv.first() {
            self.do_remove(state, head.pmap, head.va..head.va.add(page_size));
            assert_ne!(
                state.pages[page].pv.first(),
                Some(head),
                "reverse map of {} does not match its page tables",
                page.address()
            );
        }
    }

    /// Drops the reverse-map entry of the mapping of `pa` at `va`, re-enabling caching of the
    /// page if its remaining mappings no longer alias.
    fn pv_remove(&self, state: &mut State, pmap: PmapId, va: VirtualAddress, pa: PhysicalAddress) {
        let Some(page) = state.pages.lookup(pa) else {
            return;
        };

        let descriptor = &mut state.pages[page];
        let removed = descriptor.pv.remove(&mut state.pv, pmap, va);
        assert!(removed, "no pv entry for {pa} at {va} in {pmap:?}");

        let Some(head) = descriptor.pv.first() else {
            descriptor.flags.remove(PageFlags::all() - PageFlags::PRESERVE);
            return;
        };

        if self.config.cache_alias_mask() != 0
            && !descriptor
                .flags
                .intersects(PageFlags::CACHED | PageFlags::UNCACHED)
            && !self.is_aliased(state, page, head.va)
        {
            log::debug!("{pa} no longer aliases, re-enabling caching");
            self.do_page_cache(state, page, PageFlags::CACHED);
        }
    }
}
