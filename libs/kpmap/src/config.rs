// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

// ===== Pmap Configuration =====
// ===== The shape of the address spaces, the TLB and the caches the pmap layer manages =====

use core::num::NonZeroU16;
use core::ops::Range;

use crate::pte::PageTableEntry;
use crate::{GIB, MIB, PhysicalAddress, VirtualAddress};

/// Static description of the machine and the address space layout.
///
/// Built with `const fn` setters so a platform can declare its configuration as a constant:
///
/// ```
/// # use kpmap::PmapConfig;
/// const CONFIG: PmapConfig = PmapConfig::new("octeon")
///     .with_asid_count(256)
///     .with_cache_alias_mask(0x3000)
///     .with_cpus(4);
/// ```
#[derive(Debug, Clone)]
pub struct PmapConfig {
    description: &'static str,
    page_size: usize,
    asid_count: u32,
    min_user_asid: NonZeroU16,
    user_end: VirtualAddress,
    kernel_start: VirtualAddress,
    kernel_end: VirtualAddress,
    direct_map_base: VirtualAddress,
    direct_map_size: usize,
    cache_alias_mask: usize,
    paired_tlb: bool,
    exec_inhibit: bool,
    cpus: usize,
    pv_capacity: usize,
    table_page_limit: Option<usize>,
}

impl PmapConfig {
    /// Highest number of processors a [`CpuMask`](crate::CpuMask) can describe.
    pub const MAX_CPUS: usize = 64;

    pub const fn new(description: &'static str) -> Self {
        Self {
            description,
            page_size: 4096,
            asid_count: 256,
            min_user_asid: NonZeroU16::MIN,
            user_end: VirtualAddress::new(2 * GIB),
            kernel_start: VirtualAddress::new(0xc000_0000_0000_0000),
            kernel_end: VirtualAddress::new(0xc000_0000_0000_0000 + 64 * MIB),
            direct_map_base: VirtualAddress::new(0x9800_0000_0000_0000),
            direct_map_size: 1 << 40,
            cache_alias_mask: 0,
            paired_tlb: true,
            exec_inhibit: true,
            cpus: 1,
            pv_capacity: 4096,
            table_page_limit: None,
        }
    }

    pub const fn with_page_size(mut self, page_size: usize) -> Self {
        assert!(page_size.is_power_of_two());
        assert!(page_size >= size_of::<PageTableEntry>());
        self.page_size = page_size;
        self
    }

    /// Sets the number of hardware address-space tags. Tags at or above this value are never
    /// handed out.
    pub const fn with_asid_count(mut self, asid_count: u32) -> Self {
        assert!(asid_count <= 1 << 16);
        self.asid_count = asid_count;
        self
    }

    /// Sets the lowest tag handed to user address spaces. Everything below it is reserved for
    /// the kernel.
    pub const fn with_min_user_asid(mut self, min_user_asid: NonZeroU16) -> Self {
        self.min_user_asid = min_user_asid;
        self
    }

    pub const fn with_user_end(mut self, user_end: VirtualAddress) -> Self {
        self.user_end = user_end;
        self
    }

    pub const fn with_kernel_range(mut self, range: Range<VirtualAddress>) -> Self {
        assert!(range.start.get() < range.end.get());
        self.kernel_start = range.start;
        self.kernel_end = range.end;
        self
    }

    pub const fn with_direct_map(mut self, base: VirtualAddress, size: usize) -> Self {
        self.direct_map_base = base;
        self.direct_map_size = size;
        self
    }

    /// Sets the virtual address bits that select a line in the virtually indexed data cache
    /// beyond the page offset. Zero means the cache cannot alias.
    pub const fn with_cache_alias_mask(mut self, mask: usize) -> Self {
        self.cache_alias_mask = mask;
        self
    }

    /// Whether TLB entries map even/odd page pairs. Paired TLBs AND the global bits of both
    /// halves, so invalid kernel entries must carry the global bit.
    pub const fn with_paired_tlb(mut self, paired: bool) -> Self {
        self.paired_tlb = paired;
        self
    }

    /// Whether the processor honors the execute-inhibit bit.
    pub const fn with_exec_inhibit(mut self, exec_inhibit: bool) -> Self {
        self.exec_inhibit = exec_inhibit;
        self
    }

    pub const fn with_cpus(mut self, cpus: usize) -> Self {
        assert!(cpus > 0 && cpus <= Self::MAX_CPUS);
        self.cpus = cpus;
        self
    }

    /// Sets the number of chained PV entries that can exist at once.
    pub const fn with_pv_capacity(mut self, capacity: usize) -> Self {
        self.pv_capacity = capacity;
        self
    }

    /// Caps the number of page-table pages that may be allocated at once.
    pub const fn with_table_page_limit(mut self, limit: Option<usize>) -> Self {
        self.table_page_limit = limit;
        self
    }

    pub const fn description(&self) -> &'static str {
        self.description
    }

    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    pub const fn asid_count(&self) -> u32 {
        self.asid_count
    }

    pub const fn min_user_asid(&self) -> NonZeroU16 {
        self.min_user_asid
    }

    pub const fn user_end(&self) -> VirtualAddress {
        self.user_end
    }

    pub const fn kernel_range(&self) -> Range<VirtualAddress> {
        self.kernel_start..self.kernel_end
    }

    pub const fn cache_alias_mask(&self) -> usize {
        self.cache_alias_mask
    }

    pub const fn paired_tlb(&self) -> bool {
        self.paired_tlb
    }

    pub const fn exec_inhibit(&self) -> bool {
        self.exec_inhibit
    }

    pub const fn cpus(&self) -> usize {
        self.cpus
    }

    pub const fn pv_capacity(&self) -> usize {
        self.pv_capacity
    }

    pub const fn table_page_limit(&self) -> Option<usize> {
        self.table_page_limit
    }

    /// Number of entries in one leaf page-table page.
    pub const fn leaf_entries(&self) -> usize {
        self.page_size / size_of::<PageTableEntry>()
    }

    /// Size of the virtual range covered by one segment table slot.
    pub const fn segment_size(&self) -> usize {
        self.leaf_entries() * self.page_size
    }

    /// Number of slots in a user segment table.
    pub const fn segment_count(&self) -> usize {
        self.user_end.get().div_ceil(self.segment_size())
    }

    /// Number of entries in the flat kernel table, rounded up to an even count on processors
    /// that pair TLB entries.
    pub const fn kernel_entries(&self) -> usize {
        let entries = (self.kernel_end.get() - self.kernel_start.get()) / self.page_size;
        if self.paired_tlb && entries % 2 != 0 {
            entries + 1
        } else {
            entries
        }
    }

    /// Bytes of physical memory backing the flat kernel table.
    pub const fn kernel_table_size(&self) -> usize {
        (self.kernel_entries() * size_of::<PageTableEntry>()).next_multiple_of(self.page_size)
    }

    pub(crate) const fn is_user(&self, va: VirtualAddress) -> bool {
        va.get() < self.user_end.get()
    }

    pub(crate) const fn is_kernel(&self, va: VirtualAddress) -> bool {
        va.get() >= self.kernel_start.get() && va.get() < self.kernel_end.get()
    }

    /// Returns the direct-mapped (cached) alias of `pa`.
    pub const fn phys_to_direct(&self, pa: PhysicalAddress) -> VirtualAddress {
        self.direct_map_base.add(pa.get())
    }

    /// Returns the physical address behind a direct-mapped address, if `va` is one.
    pub const fn direct_to_phys(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let base = self.direct_map_base.get();
        if va.get() >= base && va.get() - base < self.direct_map_size {
            Some(PhysicalAddress::new(va.get() - base))
        } else {
            None
        }
    }
}

impl Default for PmapConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_layout() {
        let config = PmapConfig::new("test");
        assert_eq!(config.leaf_entries(), 512);
        assert_eq!(config.segment_size(), 2 * MIB);
        assert_eq!(config.segment_count(), 1024);
        assert_eq!(config.kernel_entries(), 64 * MIB / 4096);
    }

    #[test]
    fn kernel_table_is_rounded_to_pairs() {
        let start = VirtualAddress::new(0xc000_0000_0000_0000);
        let config = PmapConfig::new("test").with_kernel_range(start..start.add(3 * 4096));
        assert_eq!(config.kernel_entries(), 4);

        let config = config.with_paired_tlb(false);
        assert_eq!(config.kernel_entries(), 3);
    }

    #[test]
    fn direct_map_translation() {
        let config = PmapConfig::new("test");
        let va = config.phys_to_direct(PhysicalAddress::new(0x7000));
        assert_eq!(config.direct_to_phys(va), Some(PhysicalAddress::new(0x7000)));
        assert_eq!(config.direct_to_phys(VirtualAddress::new(0x7000)), None);
    }
}
