// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::asid::AsidGeneration;
use crate::pmap::PmapId;

#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CpuId(usize);

impl CpuId {
    pub const fn new(inner: usize) -> Self {
        Self(inner)
    }
    pub const fn get(self) -> usize {
        self.0
    }
}

impl fmt::Debug for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[cpu #{}]", self.0)
    }
}
impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A set of processors, used to target rendezvous requests.
#[derive(Clone, Copy, Default, Eq, PartialEq, Hash)]
pub struct CpuMask(u64);

impl CpuMask {
    pub const EMPTY: Self = Self(0);

    /// Returns the mask containing processors `0..count`.
    pub const fn first(count: usize) -> Self {
        if count >= 64 {
            Self(u64::MAX)
        } else {
            Self((1 << count) - 1)
        }
    }

    pub const fn single(cpu: CpuId) -> Self {
        Self(1 << cpu.0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, cpu: CpuId) -> bool {
        self.0 & (1 << cpu.0) != 0
    }

    pub fn insert(&mut self, cpu: CpuId) {
        self.0 |= 1 << cpu.0;
    }

    pub fn remove(&mut self, cpu: CpuId) {
        self.0 &= !(1 << cpu.0);
    }

    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        let mut bits = self.0;
        core::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let cpu = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            Some(CpuId(cpu))
        })
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<CpuId> for CpuMask {
    fn from_iter<T: IntoIterator<Item = CpuId>>(iter: T) -> Self {
        let mut mask = Self::EMPTY;
        for cpu in iter {
            mask.insert(cpu);
        }
        mask
    }
}

/// Per-processor state of the pmap layer.
///
/// Exactly one exists per processor, created at bring-up. Only the owning processor writes to
/// it; other processors read it when deciding whom to send a shootdown.
#[derive(Debug)]
pub(crate) struct CpuContext {
    pub(crate) asid: AsidGeneration,
    /// Raw id of the active pmap plus one, zero when no user pmap is active.
    active: AtomicU32,
}

impl CpuContext {
    pub(crate) fn new(min_user_asid: u32) -> Self {
        Self {
            asid: AsidGeneration::new(min_user_asid),
            active: AtomicU32::new(0),
        }
    }

    pub(crate) fn active(&self) -> Option<PmapId> {
        match self.active.load(Ordering::SeqCst) {
            0 => None,
            raw => Some(PmapId::from_raw(raw - 1)),
        }
    }

    pub(crate) fn is_active(&self, pmap: PmapId) -> bool {
        self.active() == Some(pmap)
    }

    pub(crate) fn set_active(&self, pmap: Option<PmapId>) {
        let raw = pmap.map_or(0, |id| id.into_raw() + 1);
        self.active.store(raw, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_iteration() {
        let mask: CpuMask = [CpuId::new(0), CpuId::new(3), CpuId::new(63)]
            .into_iter()
            .collect();
        assert!(mask.contains(CpuId::new(3)));
        assert!(!mask.contains(CpuId::new(1)));
        assert_eq!(
            mask.iter().collect::<Vec<_>>(),
            [CpuId::new(0), CpuId::new(3), CpuId::new(63)]
        );
    }

    #[test]
    fn mask_first() {
        assert_eq!(CpuMask::first(3).bits(), 0b111);
        assert_eq!(CpuMask::first(64).bits(), u64::MAX);
        assert!(CpuMask::first(0).is_empty());

        let mut mask = CpuMask::first(2);
        mask.remove(CpuId::new(0));
        assert_eq!(mask, CpuMask::single(CpuId::new(1)));
    }
}
