// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::asid::AsidSlot;

/// Identifies a pmap within its [`PhysMap`](crate::PhysMap).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PmapId(pub(crate) wasmtime_slab::Id);

impl PmapId {
    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(wasmtime_slab::Id::from_raw(raw))
    }

    pub(crate) fn into_raw(self) -> u32 {
        self.0.into_raw()
    }
}

impl fmt::Debug for PmapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pmap#{}", self.into_raw())
    }
}

/// The parts of a pmap that are read without holding the map lock.
#[derive(Debug)]
pub(crate) struct PmapShared {
    refs: AtomicUsize,
    /// Per-processor {generation, tag} pairs, indexed by processor id.
    pub(crate) asids: Box<[AsidSlot]>,
    resident: AtomicUsize,
    wired: AtomicUsize,
}

impl PmapShared {
    pub(crate) fn new(cpus: usize) -> Self {
        Self {
            refs: AtomicUsize::new(1),
            asids: (0..cpus).map(|_| AsidSlot::default()).collect(),
            resident: AtomicUsize::new(0),
            wired: AtomicUsize::new(0),
        }
    }

    pub(crate) fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops one reference, returning `true` if it was the last.
    pub(crate) fn release(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub(crate) fn resident(&self) -> usize {
        self.resident.load(Ordering::Relaxed)
    }

    pub(crate) fn wired(&self) -> usize {
        self.wired.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_resident(&self) {
        self.resident.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_resident(&self) {
        let prev = self.resident.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "resident count underflow");
    }

    pub(crate) fn inc_wired(&self) {
        self.wired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_wired(&self) {
        let prev = self.wired.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "wired count underflow");
    }
}

/// A handle to one address space.
///
/// Every handle returned by [`PhysMap::create`](crate::PhysMap::create) or
/// [`PhysMap::reference`](crate::PhysMap::reference) accounts for one reference and must be
/// given back through [`PhysMap::destroy`](crate::PhysMap::destroy).
pub struct Pmap {
    pub(crate) id: PmapId,
    pub(crate) shared: Arc<PmapShared>,
}

impl Pmap {
    /// Number of valid mappings in this address space.
    pub fn resident_count(&self) -> usize {
        self.shared.resident()
    }

    /// Number of wired mappings in this address space.
    pub fn wired_count(&self) -> usize {
        self.shared.wired()
    }
}

impl fmt::Debug for Pmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pmap")
            .field("id", &self.id)
            .field("resident", &self.shared.resident())
            .field("wired", &self.shared.wired())
            .finish_non_exhaustive()
    }
}
