// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use lock_api::RawMutex;

use super::{PhysMap, State};
use crate::arch::Arch;
use crate::page::PageFlags;
use crate::pte::{CacheMode, PageTableEntry};
use crate::{Page, VirtualAddress};

impl<A: Arch, R: RawMutex> PhysMap<A, R> {
    /// Fills `page` with zeroes through its direct-mapped alias.
    pub fn zero_page(&self, page: Page) {
        let page_size = self.config.page_size();
        let pa = page.address();
        let va = self.config.phys_to_direct(pa);
        log::trace!("zero_page({pa})");

        let flush = self.prepare_direct_access(page, va);
        // Safety: the direct map covers every managed page, and the caller owns `page` for the
        // duration of the call.
        unsafe {
            self.arch.zero(va, page_size);
        }
        if flush || self.config.cache_alias_mask() != 0 {
            self.arch.hit_sync_dcache_page(va, pa);
        }
    }

    /// Copies the contents of `src` to `dst` through their direct-mapped aliases.
    pub fn copy_page(&self, src: Page, dst: Page) {
        let page_size = self.config.page_size();
        let s = self.config.phys_to_direct(src.address());
        let d = self.config.phys_to_direct(dst.address());
        log::trace!("copy_page({} -> {})", src.address(), dst.address());

        let src_flush = self.prepare_direct_access(src, s);
        let dst_flush = self.prepare_direct_access(dst, d);
        // Safety: the direct map covers every managed page, `src` and `dst` are distinct pages
        // owned by the caller for the duration of the call.
        unsafe {
            self.arch.copy(s, d, page_size);
        }
        if src_flush {
            self.arch.hit_invalidate_dcache(s, page_size);
        }
        if dst_flush || self.config.cache_alias_mask() != 0 {
            self.arch.hit_sync_dcache_page(d, dst.address());
        }
    }

    /// Makes the direct-mapped alias `va` of `page` coherent with its mappings before it is
    /// accessed. Returns `true` if the alias must be written back or invalidated afterwards.
    fn prepare_direct_access(&self, page: Page, va: VirtualAddress) -> bool {
        let state = self.lock();
        let descriptor = &state.pages[page];

        if descriptor.flags.contains(PageFlags::UNCACHED) {
            return true;
        }
        if !descriptor.flags.contains(PageFlags::CACHED) {
            return false;
        }

        let mask = self.config.cache_alias_mask();
        match descriptor.pv.first() {
            Some(head) if head.va.aliases(va, mask) => {
                self.arch.sync_dcache_page(head.va, page.address());
                true
            }
            _ => false,
        }
    }

    /// Clears the modified attribute of `page`, returning whether it was set.
    ///
    /// Every writable mapping of the page is made to trap on its next write again.
    pub fn clear_modify(&self, page: Page) -> bool {
        log::trace!("clear_modify({})", page.address());

        let page_size = self.config.page_size();
        let mut guard = self.lock();
        let state = &mut *guard;

        let kernel = state.tables.kernel_id();
        let attrs = &mut state.pages[page].flags;
        let mut modified = attrs.contains(PageFlags::MODIFIED);
        attrs.remove(PageFlags::MODIFIED);
        let cached = attrs.contains(PageFlags::CACHED);

        for mapping in state.pages[page].pv.iter(&state.pv) {
            let Some(entry) = state.tables.get(mapping.pmap, mapping.va) else {
                continue;
            };
            if !entry.is_valid() || !entry.is_dirty() {
                continue;
            }

            if cached {
                if mapping.pmap == kernel {
                    self.arch.hit_sync_dcache_page(mapping.va, page.address());
                } else {
                    self.arch.sync_dcache_page(mapping.va, page.address());
                }
            }
            modified = true;

            let entry = entry.with(PageTableEntry::DIRTY, false);
            state.tables.set(mapping.pmap, mapping.va, entry);

            let space = state.tables.space(mapping.pmap);
            self.update_local(space, mapping.va, entry);
            self.shootdown(space, mapping.va..mapping.va.add(page_size));
        }

        modified
    }

    /// Clears the referenced attribute of `page`, returning whether it was set.
    pub fn clear_reference(&self, page: Page) -> bool {
        log::trace!("clear_reference({})", page.address());

        let mut state = self.lock();
        let attrs = &mut state.pages[page].flags;
        let referenced = attrs.contains(PageFlags::REFERENCED);
        attrs.remove(PageFlags::REFERENCED);
        referenced
    }

    pub fn is_modified(&self, page: Page) -> bool {
        self.page_flags(page).contains(PageFlags::MODIFIED)
    }

    pub fn is_referenced(&self, page: Page) -> bool {
        self.page_flags(page).contains(PageFlags::REFERENCED)
    }

    /// Switches every mapping of `page` to cached or uncached access.
    pub fn page_cache(&self, page: Page, cached: bool) {
        log::trace!("page_cache({}, {cached})", page.address());

        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(head) = state.pages[page].pv.first() else {
            return;
        };

        let mode = if !cached {
            PageFlags::UNCACHED
        } else if self.is_aliased(state, page, head.va) {
            log::debug!("{} has aliasing mappings, keeping it uncached", page.address());
            PageFlags::empty()
        } else {
            PageFlags::CACHED
        };
        self.do_page_cache(state, page, mode);
    }

    /// Returns `true` if any mapping of `page` selects different cache lines than `va`.
    pub(super) fn is_aliased(&self, state: &State, page: Page, va: VirtualAddress) -> bool {
        let mask = self.config.cache_alias_mask();
        mask != 0
            && state.pages[page]
                .pv
                .iter(&state.pv)
                .any(|mapping| mapping.va.aliases(va, mask))
    }

    /// Rewrites the cache mode of every mapping of `page` and records `mode` as the page's
    /// cache attribute.
    ///
    /// An empty `mode` makes the mappings uncached without marking the page as explicitly
    /// uncached, which allows caching to be re-enabled once the aliasing mappings are gone.
    pub(super) fn do_page_cache(&self, state: &mut State, page: Page, mode: PageFlags) {
        let page_size = self.config.page_size();
        let cache_mode = if mode.contains(PageFlags::CACHED) {
            CacheMode::Cached
        } else {
            CacheMode::Uncached
        };

        for mapping in state.pages[page].pv.iter(&state.pv) {
            let Some(entry) = state.tables.get(mapping.pmap, mapping.va) else {
                continue;
            };
            // the entry being entered is already on the list but not yet written
            if !entry.is_valid() || entry.address() != page.address() {
                continue;
            }

            let entry = entry.with_cache_mode(cache_mode);
            state.tables.set(mapping.pmap, mapping.va, entry);

            let space = state.tables.space(mapping.pmap);
            self.update_local(space, mapping.va, entry);
            self.shootdown(space, mapping.va..mapping.va.add(page_size));
        }

        let attrs = &mut state.pages[page].flags;
        attrs.remove(PageFlags::CACHED | PageFlags::UNCACHED);
        attrs.insert(mode);
    }
}
