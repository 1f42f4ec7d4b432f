// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! TLB and instruction cache consistency.
//!
//! Every change to a leaf entry is followed by an update of the *local* TLB and, when the old
//! entry was valid, by a shootdown on every other processor that may hold a stale copy of it.
//!
//! A remote processor may hold translations of a user pmap only if its tag slot for that pmap is
//! from the processor's current generation. Such a processor is interrupted if it is running the
//! pmap right now. Otherwise its slot is invalidated instead, which forces a fresh tag (and
//! thereby orphans the stale translations) on its next activation. A processor that activates the
//! pmap while its slot is being invalidated is detected and interrupted after all.

#[cfg(feature = "smp")]
use core::cmp;
use core::num::NonZeroU16;
use core::ops::Range;

use crate::arch::Arch;
use crate::cpu::CpuContext;
use crate::physmap::PhysMap;
use crate::pmap::{PmapId, PmapShared};
use crate::pte::PageTableEntry;
#[cfg(feature = "smp")]
use crate::CpuMask;
use crate::{Asid, VirtualAddress};

/// Upper bound on the pages invalidated by a single rendezvous.
#[cfg(feature = "smp")]
pub(crate) const SHOOTDOWN_MAX: usize = 128;

/// The address space a leaf entry belongs to.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Space<'a> {
    Kernel,
    User(PmapId, &'a PmapShared),
}

/// Returns the tag `shared` holds on the calling processor, provided it is from the current
/// generation.
fn local_asid<A: Arch>(arch: &A, cpus: &[CpuContext], shared: &PmapShared) -> Option<Asid> {
    let cpu = arch.cpu_id().get();
    let (generation, tag) = shared.asids[cpu].load();
    if generation == cpus[cpu].asid.current() {
        NonZeroU16::new(tag).map(Asid::new)
    } else {
        None
    }
}

fn invalidate_local<A: Arch>(arch: &A, cpus: &[CpuContext], space: Space<'_>, va: VirtualAddress) {
    match space {
        Space::Kernel => arch.tlb_invalidate(va, Asid::global()),
        Space::User(_, shared) => {
            if let Some(asid) = local_asid(arch, cpus, shared) {
                arch.tlb_invalidate(va, asid);
            }
        }
    }
}

// ===== impl PhysMap =====

impl<A: Arch, R: lock_api::RawMutex> PhysMap<A, R> {
    pub(crate) fn local_asid(&self, shared: &PmapShared) -> Option<Asid> {
        local_asid(&self.arch, &self.cpus, shared)
    }

    /// Drops the local translation of `va`.
    pub(crate) fn invalidate_local(&self, space: Space<'_>, va: VirtualAddress) {
        invalidate_local(&self.arch, &self.cpus, space, va);
    }

    /// Rewrites the local translation of `va` to `entry`, if the local TLB holds one.
    pub(crate) fn update_local(&self, space: Space<'_>, va: VirtualAddress, entry: PageTableEntry) {
        match space {
            Space::Kernel => self.arch.tlb_update(va, Asid::global(), entry),
            Space::User(_, shared) => {
                if let Some(asid) = self.local_asid(shared) {
                    self.arch.tlb_update(va, asid, entry);
                }
            }
        }
    }

    /// Computes the remote processors that must invalidate their translations of `space`.
    #[cfg(feature = "smp")]
    fn shootdown_targets(&self, space: Space<'_>) -> CpuMask {
        let me = self.arch.cpu_id();

        self.arch
            .running_cpus()
            .iter()
            .filter(|cpu| *cpu != me && cpu.get() < self.cpus.len())
            .filter(|cpu| {
                let Space::User(id, shared) = space else {
                    return true;
                };

                let context = &self.cpus[cpu.get()];
                let slot = &shared.asids[cpu.get()];
                let (generation, tag) = slot.load();
                if generation != context.asid.current() {
                    return false;
                }
                if context.is_active(id) {
                    return true;
                }
                if !slot.invalidate(generation, tag) {
                    // the processor allocated a new tag in the meantime
                    return true;
                }
                if context.is_active(id) {
                    slot.restore(generation, tag);
                    return true;
                }
                false
            })
            .collect()
    }

    /// Makes every other processor drop its translations of `range` in `space`.
    pub(crate) fn shootdown(&self, space: Space<'_>, range: Range<VirtualAddress>) {
        cfg_if::cfg_if! {
            if #[cfg(feature = "smp")] {
                if range.is_empty() {
                    return;
                }

                let targets = self.shootdown_targets(space);
                if targets.is_empty() {
                    return;
                }
                log::trace!("shootdown {range:?} on {targets:?}");

                let page_size = self.config.page_size();
                let (arch, cpus) = (&self.arch, &*self.cpus);

                let mut start = range.start;
                while start < range.end {
                    let end = cmp::min(start.add(SHOOTDOWN_MAX * page_size), range.end);
                    arch.rendezvous(targets, &|| {
                        let mut va = start;
                        while va < end {
                            invalidate_local(arch, cpus, space, va);
                            va = va.add(page_size);
                        }
                    });
                    start = end;
                }
            } else {
                let _ = (space, range);
            }
        }
    }

    /// Writes back the data cache of the page mapped at `va` and invalidates the instruction
    /// cache for it on every processor that may execute from it, the calling one included.
    pub(crate) fn invalidate_icache(&self, space: Space<'_>, va: VirtualAddress, entry: PageTableEntry) {
        let page_size = self.config.page_size();
        let pa = entry.address();
        let arch = &self.arch;

        cfg_if::cfg_if! {
            if #[cfg(feature = "smp")] {
                let me = arch.cpu_id();
                let mut targets: CpuMask = arch
                    .running_cpus()
                    .iter()
                    .filter(|cpu| cpu.get() < self.cpus.len())
                    .filter(|cpu| match space {
                        Space::Kernel => true,
                        Space::User(_, shared) => shared.asids[cpu.get()].generation() != 0,
                    })
                    .collect();
                targets.insert(me);
                log::trace!("icache invalidation of {va} on {targets:?}");

                arch.rendezvous(targets, &|| {
                    arch.sync_dcache_page(va, pa);
                    arch.invalidate_icache(va, page_size);
                });
            } else {
                let _ = space;
                arch.sync_dcache_page(va, pa);
                arch.invalidate_icache(va, page_size);
            }
        }
    }
}

#[cfg(all(test, feature = "smp"))]
mod tests {
    use super::*;
    use crate::test_utils::{setup, write_bytes};
    use crate::{CpuId, EnterFlags, Protection};

    #[test_log::test]
    fn idle_processors_get_their_slot_invalidated() {
        let (machine, physmap) = setup(crate::test_utils::config().with_cpus(2));
        let pmap = physmap.create();
        let va = VirtualAddress::new(0x4000);
        let pa = crate::test_utils::managed_page(&physmap, 0);

        // cpu 1 runs the pmap once and then switches away from it
        crate::arch::emulate::run_on(CpuId::new(1), || {
            physmap.activate(&pmap);
            physmap.enter(&pmap, va, pa.address(), Protection::READ | Protection::WRITE, EnterFlags::WRITE);
            write_bytes(&machine, &physmap, &pmap, va, b"hi");
            physmap.deactivate(&pmap);
        });
        let (generation, _) = pmap.shared.asids[1].load();
        assert_ne!(generation, 0);

        let before = machine.rendezvous_count();
        physmap.remove(&pmap, va..va.add(4096));

        assert_eq!(machine.rendezvous_count(), before);
        assert_eq!(pmap.shared.asids[1].generation(), 0);
        physmap.destroy(pmap);
    }

    #[test_log::test]
    fn active_processors_are_interrupted() {
        let (machine, physmap) = setup(crate::test_utils::config().with_cpus(2));
        let pmap = physmap.create();
        let va = VirtualAddress::new(0x4000);
        let pa = crate::test_utils::managed_page(&physmap, 0);

        crate::arch::emulate::run_on(CpuId::new(1), || {
            physmap.activate(&pmap);
            physmap.enter(&pmap, va, pa.address(), Protection::READ | Protection::WRITE, EnterFlags::WRITE);
            write_bytes(&machine, &physmap, &pmap, va, b"hi");
        });
        let asid = machine.current_asid(CpuId::new(1));
        assert!(machine.tlb_entry(CpuId::new(1), va, asid).is_some());

        let before = machine.rendezvous_count();
        physmap.remove(&pmap, va..va.add(4096));

        assert_eq!(machine.rendezvous_count(), before + 1);
        assert!(machine.tlb_entry(CpuId::new(1), va, asid).is_none());

        crate::arch::emulate::run_on(CpuId::new(1), || physmap.deactivate(&pmap));
        physmap.destroy(pmap);
    }

    #[test_log::test]
    fn large_ranges_are_chunked() {
        let (machine, physmap) = setup(crate::test_utils::config().with_cpus(2));
        let pmap = physmap.create();
        let start = VirtualAddress::new(0x10_0000);
        let pages = SHOOTDOWN_MAX + 4;

        crate::arch::emulate::run_on(CpuId::new(1), || physmap.activate(&pmap));
        for n in 0..pages {
            let pa = crate::test_utils::managed_page(&physmap, n);
            physmap.enter(
                &pmap,
                start.add(n * 4096),
                pa.address(),
                Protection::READ,
                EnterFlags::READ,
            );
        }

        let before = machine.rendezvous_count();
        physmap.remove(&pmap, start..start.add(pages * 4096));
        assert_eq!(machine.rendezvous_count(), before + 2);

        crate::arch::emulate::run_on(CpuId::new(1), || physmap.deactivate(&pmap));
        physmap.destroy(pmap);
    }
}
