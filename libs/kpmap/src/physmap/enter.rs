// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use lock_api::RawMutex;

use super::{PhysMap, State};
use crate::arch::Arch;
use crate::error::AllocError;
use crate::page::PageFlags;
use crate::pmap::{Pmap, PmapId};
use crate::pte::{CacheMode, PageTableEntry};
use crate::pv::PvEntry;
use crate::{EnterFlags, Error, Page, PhysicalAddress, Protection, VirtualAddress};

impl<A: Arch, R: RawMutex> PhysMap<A, R> {
    /// Maps the page at `pa` at `va` in `pmap`, replacing any previous mapping of `va`.
    ///
    /// # Panics
    ///
    /// Panics if the mapping cannot be established because page-table pages or reverse-map
    /// entries are exhausted. Use [`Self::try_enter`] where that can be handled.
    #[track_caller]
    pub fn enter(
        &self,
        pmap: &Pmap,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: Protection,
        flags: EnterFlags,
    ) {
        if let Err(err) = self.try_enter(pmap, va, pa, prot, flags) {
            panic!("failed to map {pa} at {va} in {:?}: {err}", pmap.id);
        }
    }

    /// Maps the page at `pa` at `va` in `pmap`, replacing any previous mapping of `va`.
    ///
    /// `prot` is the maximum access the mapping allows, `flags` carries the access that caused
    /// the mapping to be established (which seeds the modified and referenced attributes of
    /// managed pages) plus the `WIRED` and `NOCACHE` modifiers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoMemory`] if a page-table page or reverse-map entry could not be
    /// allocated. No mapping is installed in that case, but a leaf table allocated for `va`
    /// stays in place and the page's modified and referenced attributes keep the update from
    /// `flags`.
    pub fn try_enter(
        &self,
        pmap: &Pmap,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: Protection,
        flags: EnterFlags,
    ) -> Result<(), Error> {
        log::trace!("enter({:?}, {va}, {pa}, {prot:?}, {flags:?})", pmap.id);

        let page_size = self.config.page_size();
        assert!(
            va.is_aligned_to(page_size) && pa.is_aligned_to(page_size),
            "unaligned mapping of {pa} at {va}"
        );
        self.check_range(pmap, va..va.add(page_size));
        let kernel = self.is_kernel(pmap);

        let mut guard = self.lock();
        let state = &mut *guard;

        let page = state.pages.lookup(pa);
        let mut npte = match page {
            Some(page) => {
                let attrs = &mut state.pages[page].flags;
                if flags.contains(EnterFlags::WRITE) {
                    attrs.insert(PageFlags::MODIFIED | PageFlags::REFERENCED);
                } else if !flags.access().is_empty() {
                    attrs.insert(PageFlags::REFERENCED);
                }

                let npte = if !prot.contains(Protection::WRITE) {
                    PageTableEntry::read_only_page()
                } else if kernel || attrs.contains(PageFlags::MODIFIED) {
                    PageTableEntry::read_write_page()
                } else {
                    PageTableEntry::clean_writable_page()
                };

                if flags.contains(EnterFlags::NOCACHE) {
                    npte.with_cache_mode(CacheMode::Uncached)
                } else {
                    npte
                }
            }
            None if prot.contains(Protection::WRITE) => PageTableEntry::io_page(),
            None => PageTableEntry::io_page()
                .with(PageTableEntry::READ_ONLY, true)
                .with(PageTableEntry::DIRTY, false),
        };
        if !prot.contains(Protection::EXECUTE) && self.config.exec_inhibit() {
            npte = npte.with(PageTableEntry::EXEC_INHIBIT, true);
        }

        if !kernel {
            state
                .tables
                .get_or_create(pmap.id, va, &mut state.pool)
                .inspect_err(|_| log::warn!("out of page-table pages mapping {va} in {:?}", pmap.id))?;
        }
        if let Some(page) = page {
            self.pv_enter(state, pmap.id, va, page, &mut npte)
                .inspect_err(|_| log::warn!("out of pv entries mapping {pa} at {va}"))?;
        }

        let old = state.tables.get(pmap.id, va).unwrap_or(PageTableEntry::INVALID);
        if old.is_valid() && old.address() != pa {
            log::trace!("enter: replacing mapping of {} at {va}", old.address());
            self.do_remove(state, pmap.id, va..va.add(page_size));
        }

        // re-read, the removal above invalidated the entry
        let old = state.tables.get(pmap.id, va).unwrap_or(PageTableEntry::INVALID);
        let wired = flags.contains(EnterFlags::WIRED);
        if !old.is_valid() {
            pmap.shared.inc_resident();
            if wired {
                pmap.shared.inc_wired();
            }
        } else if old.is_wired() && !wired {
            pmap.shared.dec_wired();
        } else if !old.is_wired() && wired {
            pmap.shared.inc_wired();
        }

        npte = npte.with_address(pa);
        if kernel {
            npte = npte.with(PageTableEntry::GLOBAL, true);
        }
        if wired {
            npte = npte.with(PageTableEntry::WIRED, true);
        }

        state.tables.set(pmap.id, va, npte);
        let space = self.space(pmap);
        self.update_local(space, va, npte);
        if old.is_valid() {
            self.shootdown(space, va..va.add(page_size));
        }

        if !kernel && page.is_some() && prot.contains(Protection::EXECUTE) {
            if npte.is_cached() {
                self.invalidate_icache(space, va, npte);
            } else {
                self.arch.invalidate_icache(va, page_size);
            }
        }

        Ok(())
    }

    /// Maps the page at `pa` at the kernel address `va` without tracking the mapping in the
    /// reverse map. Such mappings are always wired and must be removed with [`Self::kremove`].
    pub fn kenter(&self, va: VirtualAddress, pa: PhysicalAddress, prot: Protection) {
        log::trace!("kenter({va}, {pa}, {prot:?})");

        let page_size = self.config.page_size();
        let kernel = self.kernel();
        self.check_range(kernel, va..va.add(page_size));

        let mut npte = if prot.contains(Protection::WRITE) {
            PageTableEntry::read_write_page()
        } else {
            PageTableEntry::read_only_page()
        }
        .with_address(pa)
        .with(PageTableEntry::GLOBAL, true)
        .with(PageTableEntry::WIRED, true);
        if !prot.contains(Protection::EXECUTE) && self.config.exec_inhibit() {
            npte = npte.with(PageTableEntry::EXEC_INHIBIT, true);
        }

        let mut state = self.lock();
        let old = state.tables.get(kernel.id, va).unwrap_or(PageTableEntry::INVALID);
        if !old.is_valid() {
            kernel.shared.inc_resident();
            kernel.shared.inc_wired();
        } else if !old.is_wired() {
            kernel.shared.inc_wired();
        }

        state.tables.set(kernel.id, va, npte);
        self.update_local(self.space(kernel), va, npte);
        if old.is_valid() {
            self.shootdown(self.space(kernel), va..va.add(page_size));
        }
    }

    /// Records the mapping of `page` at `va` in the reverse map, adjusting the cache mode of
    /// the new entry (and of existing mappings) so that no two cached mappings alias.
    fn pv_enter(
        &self,
        state: &mut State,
        pmap: PmapId,
        va: VirtualAddress,
        page: Page,
        npte: &mut PageTableEntry,
    ) -> Result<(), AllocError> {
        let entry = PvEntry { pmap, va };
        let descriptor = &mut state.pages[page];

        let Some(head) = descriptor.pv.first() else {
            descriptor.pv.push(&mut state.pv, entry)?;
            descriptor
                .flags
                .remove(PageFlags::CACHED | PageFlags::UNCACHED);
            descriptor.flags.insert(if npte.is_cached() {
                PageFlags::CACHED
            } else {
                PageFlags::UNCACHED
            });
            return Ok(());
        };

        if !descriptor.flags.contains(PageFlags::CACHED) {
            *npte = npte.with_cache_mode(CacheMode::Uncached);
        }
        if descriptor.pv.contains(&state.pv, pmap, va) {
            return Ok(());
        }
        descriptor.pv.push(&mut state.pv, entry)?;

        let mask = self.config.cache_alias_mask();
        if mask != 0
            && npte.is_cached()
            && descriptor.flags.contains(PageFlags::CACHED)
            && head.va.aliases(va, mask)
        {
            log::debug!(
                "{va} aliases {} in the data cache, mapping {} uncached",
                head.va,
                page.address()
            );
            self.do_page_cache(state, page, PageFlags::empty());
            self.arch.sync_dcache_page(head.va, page.address());
            *npte = npte.with_cache_mode(CacheMode::Uncached);
        }

        Ok(())
    }
}
