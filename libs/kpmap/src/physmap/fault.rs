// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use lock_api::RawMutex;

use super::PhysMap;
use crate::arch::Arch;
use crate::error::ensure;
use crate::page::PageFlags;
use crate::pmap::Pmap;
use crate::pte::PageTableEntry;
use crate::{Asid, Error, VirtualAddress};

impl<A: Arch, R: RawMutex> PhysMap<A, R> {
    /// Handles a write to a valid but clean mapping: marks the entry dirty and the page it
    /// maps modified.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadOnly`] if the mapping does not allow writes.
    pub fn emulate_modify(&self, pmap: &Pmap, va: VirtualAddress) -> Result<(), Error> {
        let va = va.align_down(self.config.page_size());
        log::trace!("emulate_modify({:?}, {va})", pmap.id);
        self.check_range(pmap, va..va);

        let space = self.space(pmap);
        let mut state = self.lock();
        let Some(entry) = state.tables.get(pmap.id, va) else {
            panic!("write fault at {va} in {:?} without a page table", pmap.id);
        };

        if !entry.is_valid() || entry.is_dirty() {
            cfg_if::cfg_if! {
                if #[cfg(feature = "smp")] {
                    // another processor changed the entry after the fault was raised, drop the
                    // stale local copy and let the access retry
                    self.update_local(space, va, entry);
                    return Ok(());
                } else {
                    panic!("write fault at {va} on entry {entry:?}");
                }
            }
        }
        ensure!(!entry.is_read_only(), Error::ReadOnly);

        let entry = entry.with(PageTableEntry::DIRTY, true);
        state.tables.set(pmap.id, va, entry);
        self.update_local(space, va, entry);

        let Some(page) = state.pages.lookup(entry.address()) else {
            panic!("write fault at {va} on unmanaged frame {}", entry.address());
        };
        state.pages[page]
            .flags
            .insert(PageFlags::MODIFIED | PageFlags::REFERENCED);

        Ok(())
    }

    /// Loads the translation of `va` into the local TLB from the page table of the kernel or
    /// of the calling processor's active pmap.
    ///
    /// Returns the loaded entry, or `None` if `va` is not validly mapped.
    pub fn tlb_refill(&self, va: VirtualAddress) -> Option<PageTableEntry> {
        let va = va.align_down(self.config.page_size());

        if self.config.is_kernel(va) {
            let state = self.lock();
            let entry = state
                .tables
                .get(self.kernel().id, va)
                .filter(|entry| entry.is_valid())?;
            self.arch.tlb_load(va, Asid::global(), entry);
            return Some(entry);
        }

        if !self.config.is_user(va) {
            return None;
        }

        let cpu = self.arch.cpu_id();
        let active = self.cpus[cpu.get()].active()?;

        let state = self.lock();
        let entry = state.tables.get(active, va).filter(|entry| entry.is_valid())?;
        let asid = self.local_asid(state.tables.shared(active))?;
        log::trace!("tlb refill of {va} on {cpu} with asid {asid}");
        self.arch.tlb_load(va, asid, entry);

        Some(entry)
    }
}
