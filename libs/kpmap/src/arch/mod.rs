// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#[cfg(any(test, feature = "emulate"))]
pub mod emulate;

use crate::pte::PageTableEntry;
use crate::{Asid, CpuId, CpuMask, PhysicalAddress, VirtualAddress};

/// Processor primitives the pmap layer is built on.
///
/// All methods act on the *calling* processor unless stated otherwise.
pub trait Arch: Send + Sync {
    /// Returns the id of the calling processor.
    fn cpu_id(&self) -> CpuId;

    /// Returns the set of processors that are up and able to take rendezvous requests.
    fn running_cpus(&self) -> CpuMask;

    /// Programs the address-space tag used for translations of user addresses.
    fn set_asid(&self, asid: Asid);

    /// Drops the translation of `va` tagged `asid` from the local TLB, if present.
    ///
    /// Global translations of `va` are dropped regardless of `asid`.
    fn tlb_invalidate(&self, va: VirtualAddress, asid: Asid);

    /// Rewrites the translation of `va` tagged `asid` to `entry`, but only if the local TLB
    /// currently holds one.
    fn tlb_update(&self, va: VirtualAddress, asid: Asid, entry: PageTableEntry);

    /// Loads `entry` as the translation of `va` tagged `asid` into the local TLB.
    fn tlb_load(&self, va: VirtualAddress, asid: Asid, entry: PageTableEntry);

    /// Drops every translation from the local TLB.
    fn tlb_flush_all(&self);

    /// Writes back and invalidates the data cache lines of the page at `va`, selected by index.
    fn sync_dcache_page(&self, va: VirtualAddress, pa: PhysicalAddress);

    /// Writes back and invalidates the data cache lines that hit the page at `va`.
    fn hit_sync_dcache_page(&self, va: VirtualAddress, pa: PhysicalAddress);

    /// Invalidates, without writing back, the data cache lines hit by `va..va + len`.
    fn hit_invalidate_dcache(&self, va: VirtualAddress, len: usize);

    /// Invalidates the instruction cache lines of `va..va + len`.
    fn invalidate_icache(&self, va: VirtualAddress, len: usize);

    /// Makes all prior data cache writes visible to instruction fetch.
    fn sync_icache(&self);

    /// Fills `len` bytes at `va` with zeroes.
    ///
    /// # Safety
    ///
    /// `va..va + len` must be mapped writable and must not be accessed concurrently.
    unsafe fn zero(&self, va: VirtualAddress, len: usize);

    /// Copies `len` bytes from `src` to `dst`.
    ///
    /// # Safety
    ///
    /// Both ranges must be mapped, `dst` writable, and the two must not overlap. Neither range
    /// may be written concurrently.
    unsafe fn copy(&self, src: VirtualAddress, dst: VirtualAddress, len: usize);

    /// Runs `action` on every processor in `targets` and returns once all of them completed it.
    ///
    /// Targets that are not running are skipped.
    fn rendezvous(&self, targets: CpuMask, action: &(dyn Fn() + Sync));
}
