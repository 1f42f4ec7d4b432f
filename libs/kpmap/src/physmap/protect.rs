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
use crate::pmap::Pmap;
use crate::pte::PageTableEntry;
use crate::{Page, Protection, VirtualAddress};

impl<A: Arch, R: RawMutex> PhysMap<A, R> {
    /// Changes the protection of every mapping in `range` of `pmap` to `prot`.
    ///
    /// Revoking read access removes the mappings altogether.
    pub fn protect(&self, pmap: &Pmap, range: Range<VirtualAddress>, prot: Protection) {
        if !prot.contains(Protection::READ) {
            self.remove(pmap, range);
            return;
        }
        log::trace!("protect({:?}, {range:?}, {prot:?})", pmap.id);

        let page_size = self.config.page_size();
        let range = range.start.align_down(page_size)..range.end.align_up(page_size);
        self.check_range(pmap, range.clone());

        let kernel = self.is_kernel(pmap);
        let space = self.space(pmap);
        let writable = prot.contains(Protection::WRITE);
        let exec_inhibit = !prot.contains(Protection::EXECUTE) && self.config.exec_inhibit();

        let mut guard = self.lock();
        let state = &mut *guard;

        let mut changed: Option<Range<VirtualAddress>> = None;
        let mut next = range.start;
        while let Some(va) = state.tables.next_mapped(pmap.id, next, range.end) {
            next = va.add(page_size);

            let Some(entry) = state.tables.get(pmap.id, va) else {
                continue;
            };
            if !entry.is_valid() {
                continue;
            }

            if !writable && entry.is_dirty() && entry.is_cached() {
                if kernel {
                    self.arch.hit_sync_dcache_page(va, entry.address());
                } else if prot.contains(Protection::EXECUTE) {
                    self.invalidate_icache(space, va, entry);
                } else {
                    self.arch.sync_dcache_page(va, entry.address());
                }
            }

            // writes keep trapping until the page is known to be modified
            let dirty = writable
                && (kernel
                    || entry.is_dirty()
                    || state
                        .pages
                        .lookup(entry.address())
                        .is_none_or(|page| state.pages[page].flags.contains(PageFlags::MODIFIED)));

            let entry = entry
                .with(PageTableEntry::DIRTY, dirty)
                .with(PageTableEntry::READ_ONLY, !writable)
                .with(PageTableEntry::EXEC_INHIBIT, exec_inhibit);
            state.tables.set(pmap.id, va, entry);
            self.update_local(space, va, entry);

            changed = Some(changed.map_or(va..next, |changed| changed.start..next));
        }

        if let Some(changed) = changed {
            self.shootdown(space, changed);
        }
    }

    /// Lowers the protection of every mapping of `page` to `prot`.
    ///
    /// Granting read and write access leaves the mappings alone, read-only access (with or
    /// without execute) write-protects them, anything else removes them.
    pub fn page_protect(&self, page: Page, prot: Protection) {
        log::trace!("page_protect({}, {prot:?})", page.address());

        if prot.contains(Protection::READ | Protection::WRITE) {
            return;
        }

        let mut state = self.lock();
        if prot == Protection::READ || prot == Protection::READ | Protection::EXECUTE {
            self.page_wrprotect(&mut state, page, prot);
        } else {
            self.page_remove(&mut state, page);
        }
    }

    fn page_wrprotect(&self, state: &mut State, page: Page, prot: Protection) {
        let page_size = self.config.page_size();
        let kernel = state.tables.kernel_id();
        let exec_inhibit = !prot.contains(Protection::EXECUTE) && self.config.exec_inhibit();

        for mapping in state.pages[page].pv.iter(&state.pv) {
            let Some(entry) = state.tables.get(mapping.pmap, mapping.va) else {
                continue;
            };
            if !entry.is_valid() {
                continue;
            }

            if entry.is_dirty() && entry.is_cached() {
                if mapping.pmap == kernel {
                    self.arch.hit_sync_dcache_page(mapping.va, entry.address());
                } else {
                    self.arch.sync_dcache_page(mapping.va, entry.address());
                }
            }

            let entry = entry
                .with(PageTableEntry::DIRTY, false)
                .with(PageTableEntry::READ_ONLY, true)
                .with(PageTableEntry::EXEC_INHIBIT, exec_inhibit);
            state.tables.set(mapping.pmap, mapping.va, entry);

            let space = state.tables.space(mapping.pmap);
            self.update_local(space, mapping.va, entry);
            self.shootdown(space, mapping.va..mapping.va.add(page_size));
        }
    }
}
