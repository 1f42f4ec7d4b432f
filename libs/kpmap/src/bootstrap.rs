// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::vec::Vec;
use core::ops::Range;

use lock_api::RawMutex;

use crate::arch::Arch;
use crate::physmap::PhysMap;
use crate::{PhysicalAddress, PmapConfig, VirtualAddress};

/// Early-boot state of the pmap layer.
///
/// Hands out permanently allocated, direct-mapped memory before the page descriptors exist.
/// Whatever is left of the physical segments becomes managed memory once [`Self::finish`] is
/// called.
pub struct Bootstrap<A> {
    arch: A,
    config: PmapConfig,
    segments: Vec<Range<PhysicalAddress>>,
}

impl<A: Arch> Bootstrap<A> {
    pub fn new(
        arch: A,
        config: PmapConfig,
        segments: impl IntoIterator<Item = Range<PhysicalAddress>>,
    ) -> Self {
        let page_size = config.page_size();
        let segments: Vec<_> = segments
            .into_iter()
            .map(|range| range.start.align_up(page_size)..range.end.align_down(page_size))
            .filter(|range| !range.is_empty())
            .collect();
        log::debug!("{}: bootstrapping with {segments:?}", config.description());

        Self {
            arch,
            config,
            segments,
        }
    }

    /// Permanently removes `size` bytes (rounded up to whole pages) from the first physical
    /// segment large enough to hold them and returns their zeroed, direct-mapped alias.
    ///
    /// # Panics
    ///
    /// Panics if no segment is large enough, or if the allocation would consume the last
    /// remaining segment.
    pub fn steal_memory(&mut self, size: usize) -> VirtualAddress {
        let page_size = self.config.page_size();
        let size = size.next_multiple_of(page_size);

        let Some(index) = self
            .segments
            .iter()
            .position(|range| range.end.offset_from_unsigned(range.start) >= size)
        else {
            panic!("no memory to steal {size:#x} bytes from");
        };

        let segment = &mut self.segments[index];
        let pa = segment.start;
        segment.start = segment.start.add(size);
        if segment.is_empty() {
            assert!(self.segments.len() > 1, "stealing {size:#x} bytes consumes all memory");
            self.segments.remove(index);
        }

        let va = self.config.phys_to_direct(pa);
        log::trace!("steal_memory({size:#x}) = {va} ({pa})");
        // Safety: the range was just removed from the free segments, nothing else refers to it.
        unsafe {
            self.arch.zero(va, size);
        }

        va
    }

    /// The physical memory that has not been stolen.
    pub fn segments(&self) -> &[Range<PhysicalAddress>] {
        &self.segments
    }

    /// Ends the bootstrap phase.
    ///
    /// Reserves the physical memory of the kernel page table, then hands the remaining segments
    /// to the page descriptors as managed memory.
    ///
    /// # Panics
    ///
    /// Panics if the kernel page table does not fit into any segment.
    pub fn finish<R: RawMutex>(mut self) -> PhysMap<A, R> {
        let sysmap = self.steal_memory(self.config.kernel_table_size());
        log::debug!(
            "kernel page table at {sysmap}, {} entries",
            self.config.kernel_entries()
        );

        PhysMap::new(self.arch, self.config, self.segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{Machine, config};

    fn range(start: usize, end: usize) -> Range<PhysicalAddress> {
        PhysicalAddress::new(start)..PhysicalAddress::new(end)
    }

    #[test]
    fn steal_takes_from_first_fitting_segment() {
        let config = config();
        let machine = Machine::new(&config);
        let mut bootstrap = Bootstrap::new(
            machine.clone(),
            config.clone(),
            [range(0x1000, 0x3000), range(0x10_0000, 0x20_0000)],
        );

        let va = bootstrap.steal_memory(0x2800);
        assert_eq!(config.direct_to_phys(va), Some(PhysicalAddress::new(0x10_0000)));
        assert_eq!(
            bootstrap.segments(),
            [range(0x1000, 0x3000), range(0x10_3000, 0x20_0000)]
        );

        let va = bootstrap.steal_memory(0x2000);
        assert_eq!(config.direct_to_phys(va), Some(PhysicalAddress::new(0x1000)));
        assert_eq!(bootstrap.segments(), [range(0x10_3000, 0x20_0000)]);
    }

    #[test]
    fn stolen_memory_is_zeroed() {
        let config = config();
        let machine = Machine::new(&config);
        machine.write_physical(PhysicalAddress::new(0x10_0000), &[0xaa; 64]);

        let mut bootstrap = Bootstrap::new(machine.clone(), config, [range(0x10_0000, 0x20_0000)]);
        let va = bootstrap.steal_memory(64);
        machine.sync_dcache_page(va, PhysicalAddress::new(0x10_0000));

        let mut buf = [0xff; 64];
        machine.read_physical(PhysicalAddress::new(0x10_0000), &mut buf);
        assert_eq!(buf, [0; 64]);
    }

    #[test]
    #[should_panic(expected = "no memory to steal")]
    fn steal_too_much() {
        let config = config();
        let mut bootstrap = Bootstrap::new(Machine::new(&config), config, [range(0x1000, 0x3000)]);
        bootstrap.steal_memory(0x4000);
    }

    #[test]
    #[should_panic(expected = "consumes all memory")]
    fn steal_everything() {
        let config = config();
        let mut bootstrap = Bootstrap::new(Machine::new(&config), config, [range(0x1000, 0x3000)]);
        bootstrap.steal_memory(0x2000);
    }

    #[test]
    fn finish_manages_remaining_memory() {
        let config = config();
        let table = config.kernel_table_size();
        let mut bootstrap = Bootstrap::new(Machine::new(&config), config, [range(0x10_0000, 0x20_0000)]);
        bootstrap.steal_memory(0x1000);

        let physmap = bootstrap.finish::<parking_lot::RawMutex>();
        assert!(physmap.page(PhysicalAddress::new(0x10_0000)).is_none());
        assert!(physmap.page(PhysicalAddress::new(0x10_1000 + table)).is_some());
    }

    #[test_log::test]
    fn finish_reserves_the_kernel_table() {
        let config = config();
        let table = config.kernel_table_size();
        assert!(table > 0);

        let bootstrap = Bootstrap::new(Machine::new(&config), config, [range(0x10_0000, 0x80_0000)]);
        let physmap = bootstrap.finish::<parking_lot::RawMutex>();

        let mut pa = PhysicalAddress::new(0x10_0000);
        while pa < PhysicalAddress::new(0x10_0000 + table) {
            assert!(physmap.page(pa).is_none(), "kernel table frame {pa} is managed");
            pa = pa.add(0x1000);
        }
        assert!(physmap.page(PhysicalAddress::new(0x10_0000 + table)).is_some());
    }
}
