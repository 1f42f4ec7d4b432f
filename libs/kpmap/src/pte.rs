// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The leaf page-table entry.
//!
//! This is the only place that knows the hardware bit layout. Everything else goes through the
//! accessors and the page templates below.

use crate::PhysicalAddress;

/// Frame numbers are always counted in 4 KiB units, independent of the configured page size.
pub const FRAME_SHIFT: u32 = 12;

mycelium_bitfield::bitfield! {
    /// A leaf page-table entry.
    ///
    /// The same value is written to the page table and loaded into the TLB, so the hardware
    /// bits (`VALID`, `DIRTY`, `GLOBAL`, `CACHE_MODE`, `EXEC_INHIBIT`, `FRAME`) follow the
    /// processor's `EntryLo` layout. `WIRED` and `READ_ONLY` live in bits the hardware ignores.
    #[derive(PartialEq, Eq)]
    pub struct PageTableEntry<usize> {
        /// The translation may be used.
        pub const VALID: bool;
        /// Writes are allowed. Clear on a valid entry means the first write raises a
        /// TLB-modified exception, which is how page dirtiness is tracked.
        pub const DIRTY: bool;
        /// The translation matches every address-space tag.
        pub const GLOBAL: bool;
        /// Cacheability of accesses through this translation.
        pub const CACHE_MODE: CacheMode;
        /// Software: the mapping is excluded from reclamation.
        pub const WIRED: bool;
        /// Software: write-faults on this mapping must be refused.
        pub const READ_ONLY: bool;
        /// Instruction fetches through this translation fault.
        pub const EXEC_INHIBIT: bool;
        const _RESERVED = 4;
        /// The physical frame number, in 4 KiB units.
        pub const FRAME = 36;
    }
}

mycelium_bitfield::enum_from_bits! {
    #[derive(Debug, Eq, PartialEq)]
    pub enum CacheMode<u8> {
        Uncached = 0b00,
        Cached = 0b01,
        CachedCoherent = 0b10,
        UncachedAccelerated = 0b11,
    }
}

static_assertions::assert_eq_size!(PageTableEntry, u64);

impl PageTableEntry {
    /// An invalid user entry.
    pub const INVALID: Self = Self::new();

    /// An invalid kernel entry.
    ///
    /// Processors that pair TLB entries AND the global bits of both halves of a pair, so an
    /// invalid kernel entry next to a valid one must still carry the global bit.
    pub fn invalid_kernel(paired_tlb: bool) -> Self {
        Self::new().with(Self::GLOBAL, paired_tlb)
    }

    /// A valid, cached, read-only page.
    pub fn read_only_page() -> Self {
        Self::new()
            .with(Self::VALID, true)
            .with(Self::READ_ONLY, true)
            .with(Self::CACHE_MODE, CacheMode::Cached)
    }

    /// A valid, cached, writable page whose first write traps so the page can be marked
    /// modified.
    pub fn clean_writable_page() -> Self {
        Self::new()
            .with(Self::VALID, true)
            .with(Self::CACHE_MODE, CacheMode::Cached)
    }

    /// A valid, cached, writable page that is already considered modified.
    pub fn read_write_page() -> Self {
        Self::new()
            .with(Self::VALID, true)
            .with(Self::DIRTY, true)
            .with(Self::CACHE_MODE, CacheMode::Cached)
    }

    /// A valid, uncached, writable device page.
    pub fn io_page() -> Self {
        Self::new()
            .with(Self::VALID, true)
            .with(Self::DIRTY, true)
            .with(Self::CACHE_MODE, CacheMode::Uncached)
    }

    #[must_use]
    pub fn with_address(self, address: PhysicalAddress) -> Self {
        self.with(Self::FRAME, address.get() >> FRAME_SHIFT)
    }

    #[must_use]
    pub fn with_cache_mode(self, mode: CacheMode) -> Self {
        self.with(Self::CACHE_MODE, mode)
    }

    pub fn is_valid(self) -> bool {
        self.get(Self::VALID)
    }

    pub fn is_dirty(self) -> bool {
        self.get(Self::DIRTY)
    }

    pub fn is_global(self) -> bool {
        self.get(Self::GLOBAL)
    }

    pub fn is_wired(self) -> bool {
        self.get(Self::WIRED)
    }

    pub fn is_read_only(self) -> bool {
        self.get(Self::READ_ONLY)
    }

    pub fn is_cached(self) -> bool {
        self.cache_mode() == CacheMode::Cached
    }

    pub fn cache_mode(self) -> CacheMode {
        self.get(Self::CACHE_MODE)
    }

    /// The page-aligned physical address this entry translates to.
    pub fn address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.get(Self::FRAME) << FRAME_SHIFT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates() {
        let ro = PageTableEntry::read_only_page();
        assert!(ro.is_valid() && ro.is_read_only() && !ro.is_dirty() && ro.is_cached());

        let cw = PageTableEntry::clean_writable_page();
        assert!(cw.is_valid() && !cw.is_read_only() && !cw.is_dirty());

        let rw = PageTableEntry::read_write_page();
        assert!(rw.is_valid() && rw.is_dirty());

        let io = PageTableEntry::io_page();
        assert!(io.is_valid() && !io.is_cached() && !io.is_global());
    }

    #[test]
    fn invalid_entries() {
        assert!(!PageTableEntry::INVALID.is_valid());
        assert_eq!(PageTableEntry::INVALID.cache_mode(), CacheMode::Uncached);

        let kernel = PageTableEntry::invalid_kernel(true);
        assert!(!kernel.is_valid());
        assert!(kernel.is_global());
        assert_eq!(PageTableEntry::invalid_kernel(false), PageTableEntry::INVALID);
    }

    #[test]
    fn frame_round_trips_through_address() {
        let pte = PageTableEntry::read_write_page().with_address(PhysicalAddress::new(0x7_ffff_f000));
        assert_eq!(pte.address(), PhysicalAddress::new(0x7_ffff_f000));
        assert!(pte.is_valid());
        assert!(pte.is_dirty());
    }
}
