// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod enter;
mod fault;
mod page;
mod protect;
mod remove;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::ops::Range;

use lock_api::{Mutex, RawMutex};

use crate::arch::Arch;
use crate::cpu::CpuContext;
use crate::page::{PageArray, PageFlags};
use crate::pmap::{Pmap, PmapShared};
use crate::pte::PageTableEntry;
use crate::pv::PvArena;
use crate::shootdown::Space;
use crate::table::{SegmentTable, TablePool, Tables};
use crate::{Page, PhysicalAddress, PmapConfig, VirtualAddress};

/// The machine-dependent virtual memory layer.
///
/// Owns the page tables of every address space, the reverse map from managed physical pages to
/// their mappings, and the per-processor address-space tag state. All structural state is guarded
/// by a single lock; the TLB and cache maintenance that follows a change runs while it is held.
pub struct PhysMap<A, R: RawMutex> {
    pub(crate) arch: A,
    pub(crate) config: PmapConfig,
    pub(crate) cpus: Box<[CpuContext]>,
    kernel: Pmap,
    state: Mutex<R, State>,
}

pub(crate) struct State {
    pub(crate) tables: Tables,
    pub(crate) pages: PageArray,
    pub(crate) pv: PvArena,
    pub(crate) pool: TablePool,
}

impl<A: Arch, R: RawMutex> PhysMap<A, R> {
    pub(crate) fn new(
        arch: A,
        config: PmapConfig,
        managed: impl IntoIterator<Item = Range<PhysicalAddress>>,
    ) -> Self {
        assert!(
            config.cpus() <= PmapConfig::MAX_CPUS,
            "at most {} processors are supported",
            PmapConfig::MAX_CPUS
        );

        let cpus = (0..config.cpus())
            .map(|_| CpuContext::new(u32::from(config.min_user_asid().get())))
            .collect();

        let shared = Arc::new(PmapShared::new(config.cpus()));
        let tables = Tables::new(&config, Arc::clone(&shared));
        let kernel = Pmap {
            id: tables.kernel_id(),
            shared,
        };

        let state = State {
            tables,
            pages: PageArray::new(managed, config.page_size()),
            pv: PvArena::new(config.pv_capacity()),
            pool: TablePool::new(&config),
        };

        log::debug!("{}: pmap layer initialized", config.description());

        Self {
            arch,
            config,
            cpus,
            kernel,
            state: Mutex::new(state),
        }
    }

    pub fn arch(&self) -> &A {
        &self.arch
    }

    pub fn config(&self) -> &PmapConfig {
        &self.config
    }

    /// The kernel address space.
    pub fn kernel(&self) -> &Pmap {
        &self.kernel
    }

    /// The range of kernel virtual addresses backed by the kernel page table.
    pub fn virtual_space(&self) -> Range<VirtualAddress> {
        self.config.kernel_range()
    }

    /// Resolves `pa` to the managed page containing it.
    pub fn page(&self, pa: PhysicalAddress) -> Option<Page> {
        self.state.lock().pages.lookup(pa)
    }

    pub fn page_flags(&self, page: Page) -> PageFlags {
        self.state.lock().pages[page].flags
    }

    /// Creates a new, empty user address space.
    pub fn create(&self) -> Pmap {
        let shared = Arc::new(PmapShared::new(self.config.cpus()));
        let segments = SegmentTable::new(&self.config);
        let id = self.state.lock().tables.insert(Arc::clone(&shared), segments);

        log::trace!("create() = {id:?}");
        Pmap { id, shared }
    }

    /// Takes an additional reference to `pmap`.
    pub fn reference(&self, pmap: &Pmap) -> Pmap {
        pmap.shared.acquire();
        Pmap {
            id: pmap.id,
            shared: Arc::clone(&pmap.shared),
        }
    }

    /// Drops one reference to `pmap`, tearing it down once the last one is gone.
    ///
    /// # Panics
    ///
    /// Panics if `pmap` is the kernel pmap, and when the last reference is dropped while the
    /// address space still holds mappings or is active on any processor.
    pub fn destroy(&self, pmap: Pmap) {
        assert!(!self.is_kernel(&pmap), "the kernel pmap cannot be destroyed");
        if !pmap.shared.release() {
            return;
        }

        log::trace!("destroy({:?})", pmap.id);
        assert!(
            !self.cpus.iter().any(|cpu| cpu.is_active(pmap.id)),
            "{:?} destroyed while active",
            pmap.id
        );
        assert_eq!(
            pmap.shared.resident(),
            0,
            "{:?} destroyed with live mappings",
            pmap.id
        );

        let mut state = self.state.lock();
        let state = &mut *state;
        let segments = state.tables.remove(pmap.id);
        segments.release(&mut state.pool);
    }

    /// Returns the page-table pages of `pmap` that hold no valid entries to the pool.
    pub fn collect(&self, pmap: &Pmap) {
        if self.is_kernel(pmap) {
            return;
        }

        let mut state = self.state.lock();
        let state = &mut *state;
        if let Some(segments) = state.tables.segments_mut(pmap.id) {
            let freed = segments.collect(&mut state.pool);
            log::trace!("collect({:?}) freed {freed} page-table pages", pmap.id);
        }
    }

    /// Makes `pmap` the user address space of the calling processor.
    pub fn activate(&self, pmap: &Pmap) {
        assert!(!self.is_kernel(pmap), "the kernel pmap is always active");

        let cpu = self.arch.cpu_id();
        let context = &self.cpus[cpu.get()];
        context.set_active(Some(pmap.id));

        let asid = context.asid.allocate(
            &pmap.shared.asids[cpu.get()],
            self.config.asid_count(),
            self.config.min_user_asid(),
            || self.arch.tlb_flush_all(),
        );
        log::trace!("activate({:?}) on {cpu} with asid {asid}", pmap.id);
        self.arch.set_asid(asid);
    }

    pub fn deactivate(&self, pmap: &Pmap) {
        let cpu = self.arch.cpu_id();
        log::trace!("deactivate({:?}) on {cpu}", pmap.id);
        self.cpus[cpu.get()].set_active(None);
    }

    /// Clears the wired attribute of the mapping at `va`.
    pub fn unwire(&self, pmap: &Pmap, va: VirtualAddress) {
        let va = va.align_down(self.config.page_size());
        self.check_range(pmap, va..va);

        let mut state = self.state.lock();
        if let Some(entry) = state.tables.get_mut(pmap.id, va)
            && entry.is_valid()
            && entry.is_wired()
        {
            *entry = entry.with(PageTableEntry::WIRED, false);
            pmap.shared.dec_wired();
        }
    }

    /// Translates `va` to the physical address it is mapped to.
    pub fn extract(&self, pmap: &Pmap, va: VirtualAddress) -> Option<PhysicalAddress> {
        if self.is_kernel(pmap)
            && let Some(pa) = self.config.direct_to_phys(va)
        {
            return Some(pa);
        }

        let page_size = self.config.page_size();
        self.check_range(pmap, va..va);

        let state = self.state.lock();
        let entry = state.tables.get(pmap.id, va.align_down(page_size))?;
        entry
            .is_valid()
            .then(|| entry.address().add(va.offset_in(page_size)))
    }

    /// Picks the address closest to `va` (upwards) with the same cache color as the file offset
    /// `offset`, so mappings of the same object never alias.
    pub fn prefer(&self, offset: usize, va: VirtualAddress) -> VirtualAddress {
        let mask = self.config.cache_alias_mask();
        if mask == 0 {
            return va;
        }
        va.wrapping_add(offset.wrapping_sub(va.get()) & mask)
    }

    /// The direct-mapped alias of `page`.
    pub fn map_direct(&self, page: Page) -> VirtualAddress {
        self.config.phys_to_direct(page.address())
    }

    /// Ends a use of the direct-mapped alias `va`, writing back its cache lines if they may
    /// alias other mappings of the page.
    pub fn unmap_direct(&self, va: VirtualAddress) -> Option<Page> {
        let pa = self.config.direct_to_phys(va)?;
        if self.config.cache_alias_mask() != 0 {
            self.arch.hit_sync_dcache_page(va, pa);
        }
        self.page(pa)
    }

    /// Makes instructions written to `va..va + len` of `pmap` visible to instruction fetch.
    pub fn proc_iflush(&self, pmap: &Pmap, va: VirtualAddress, len: usize) {
        cfg_if::cfg_if! {
            if #[cfg(feature = "smp")] {
                let running = self.arch.running_cpus();
                let target = (0..self.cpus.len())
                    .map(crate::CpuId::new)
                    .find(|cpu| running.contains(*cpu) && self.cpus[cpu.get()].is_active(pmap.id));

                if let Some(cpu) = target {
                    let arch = &self.arch;
                    arch.rendezvous(crate::CpuMask::single(cpu), &|| arch.invalidate_icache(va, len));
                }
            } else {
                let _ = pmap;
                self.arch.invalidate_icache(va, len);
            }
        }
    }

    /// Completes all deferred maintenance. Instruction fetch observes every prior write
    /// afterwards.
    pub fn update(&self) {
        self.arch.sync_icache();
    }

    pub(crate) fn is_kernel(&self, pmap: &Pmap) -> bool {
        pmap.id == self.kernel.id
    }

    pub(crate) fn space<'a>(&self, pmap: &'a Pmap) -> Space<'a> {
        if self.is_kernel(pmap) {
            Space::Kernel
        } else {
            Space::User(pmap.id, &pmap.shared)
        }
    }

    /// Asserts that `range` lies within the address range `pmap` translates.
    pub(crate) fn check_range(&self, pmap: &Pmap, range: Range<VirtualAddress>) {
        if self.is_kernel(pmap) {
            let kernel = self.config.kernel_range();
            assert!(
                kernel.start <= range.start && range.end <= kernel.end,
                "{range:?} is outside of the kernel range {kernel:?}"
            );
        } else {
            assert!(
                range.end <= self.config.user_end(),
                "{range:?} is outside of the user range"
            );
        }
    }

    pub(crate) fn lock(&self) -> lock_api::MutexGuard<'_, R, State> {
        self.state.lock()
    }

    /// Checks the relation between leaf entries, the reverse map, and the mapping counters.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        use alloc::collections::BTreeMap;

        let state = self.state.lock();
        let mask = self.config.cache_alias_mask();

        for (page, descriptor) in state.pages.iter() {
            let entries: alloc::vec::Vec<_> = descriptor.pv.iter(&state.pv).collect();
            for entry in &entries {
                let Some(pte) = state.tables.get(entry.pmap, entry.va) else {
                    panic!("pv entry {entry:?} of {} has no page table", page.address());
                };
                assert!(pte.is_valid(), "pv entry {entry:?} maps an invalid entry");
                assert_eq!(pte.address(), page.address(), "pv entry {entry:?} maps another frame");
            }

            if entries.is_empty() {
                assert!(
                    !descriptor.flags.intersects(PageFlags::CACHED | PageFlags::UNCACHED),
                    "unmapped page {} has cache flags {:?}",
                    page.address(),
                    descriptor.flags
                );
            }

            if mask != 0 {
                for (n, a) in entries.iter().enumerate() {
                    for b in &entries[n + 1..] {
                        if !a.va.aliases(b.va, mask) {
                            continue;
                        }
                        for entry in [a, b] {
                            let pte = state.tables.get(entry.pmap, entry.va);
                            assert!(
                                pte.is_some_and(|pte| !pte.is_cached()),
                                "aliasing mapping {entry:?} of {} is cached",
                                page.address()
                            );
                        }
                    }
                }
            }
        }

        let kernel = state.tables.kernel_id();
        let mut counts: BTreeMap<u32, (usize, usize)> = BTreeMap::new();
        for (id, va, pte) in state.tables.iter_valid() {
            let count = counts.entry(id.into_raw()).or_default();
            count.0 += 1;
            if pte.is_wired() {
                count.1 += 1;
            }

            if id != kernel
                && let Some(page) = state.pages.lookup(pte.address())
            {
                assert!(
                    state.pages[page].pv.contains(&state.pv, id, va),
                    "managed mapping {va} in {id:?} has no pv entry"
                );
            }
        }

        for id in state.tables.ids() {
            let shared = state.tables.shared(id);
            let (resident, wired) = counts.get(&id.into_raw()).copied().unwrap_or_default();
            assert_eq!(shared.resident(), resident, "resident count of {id:?}");
            assert_eq!(shared.wired(), wired, "wired count of {id:?}");
        }
    }
}

impl<A, R: RawMutex> fmt::Debug for PhysMap<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysMap")
            .field("config", &self.config)
            .field("kernel", &self.kernel)
            .finish_non_exhaustive()
    }
}
