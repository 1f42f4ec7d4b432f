// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ops::Range;

use crate::arch::emulate::{self, Fault};
use crate::{Bootstrap, Error, Page, PhysMap, PhysicalAddress, Pmap, PmapConfig, VirtualAddress};

pub(crate) type Machine = emulate::Machine<parking_lot::RawMutex>;
pub(crate) type TestMap = PhysMap<Machine, parking_lot::RawMutex>;

/// Physical memory handed to the pmap layer in tests.
pub(crate) const MEMORY: Range<PhysicalAddress> =
    PhysicalAddress::new(0x10_0000)..PhysicalAddress::new(0x50_0000);

pub(crate) fn config() -> PmapConfig {
    PmapConfig::new("test").with_pv_capacity(2048)
}

pub(crate) fn setup(config: PmapConfig) -> (Machine, TestMap) {
    let machine = Machine::new(&config);
    let physmap = Bootstrap::new(machine.clone(), config, [MEMORY]).finish();
    (machine, physmap)
}

/// The `n`th managed page. The kernel page table occupies the start of [`MEMORY`].
pub(crate) fn managed_page(physmap: &TestMap, n: usize) -> Page {
    let config = physmap.config();
    let pa = MEMORY
        .start
        .add(config.kernel_table_size() + n * config.page_size());
    physmap.page(pa).unwrap()
}

/// Stores `data` at `va` as the current processor, servicing TLB refills and write faults the
/// way the trap handler would.
pub(crate) fn try_write(
    machine: &Machine,
    physmap: &TestMap,
    pmap: &Pmap,
    va: VirtualAddress,
    data: &[u8],
) -> Result<(), Error> {
    for _ in 0..4 {
        match machine.store(va, data) {
            Ok(()) => return Ok(()),
            Err(Fault::TlbMiss | Fault::Invalid) => {
                assert!(physmap.tlb_refill(va).is_some(), "store to unmapped {va}");
            }
            Err(Fault::Modified) => physmap.emulate_modify(pmap, va)?,
        }
    }
    panic!("store to {va} did not make progress");
}

pub(crate) fn write_bytes(
    machine: &Machine,
    physmap: &TestMap,
    pmap: &Pmap,
    va: VirtualAddress,
    data: &[u8],
) {
    try_write(machine, physmap, pmap, va, data).unwrap();
}

/// Loads `buf.len()` bytes from `va` as the current processor, servicing TLB refills.
pub(crate) fn read_bytes(machine: &Machine, physmap: &TestMap, va: VirtualAddress, buf: &mut [u8]) {
    for _ in 0..4 {
        match machine.load(va, buf) {
            Ok(()) => return,
            Err(_) => assert!(physmap.tlb_refill(va).is_some(), "load from unmapped {va}"),
        }
    }
    panic!("load from {va} did not make progress");
}
