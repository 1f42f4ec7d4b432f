// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Address-space tags.
//!
//! Tags are handed out per processor in increasing order. When a processor runs out of tags it
//! flushes its whole TLB and starts a new *generation*; every tag handed out during an older
//! generation becomes stale at once, without touching the pmaps that hold them.

use core::fmt;
use core::num::NonZeroU16;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// A hardware address-space tag, or the global tag used by kernel translations.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct Asid(pub(crate) Option<NonZeroU16>);

impl Asid {
    pub const fn global() -> Self {
        Self(None)
    }

    pub const fn new(id: NonZeroU16) -> Self {
        Self(Some(id))
    }

    pub fn is_global(self) -> bool {
        self.0.is_none()
    }

    /// The raw tag value, zero for the global tag.
    pub fn get(self) -> u16 {
        self.0.map_or(0, NonZeroU16::get)
    }
}

impl fmt::Display for Asid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            None => f.write_str("<global>"),
            Some(asid) => write!(f, "<{asid}>"),
        }
    }
}

/// Generation number that never matches a processor's current generation.
pub(crate) const INVALID_GENERATION: u32 = 0;

/// A pmap's {tag, generation} pair for one processor.
///
/// Both halves live in one word so readers on other processors never observe a tag from one
/// assignment paired with the generation of another.
#[derive(Debug, Default)]
pub(crate) struct AsidSlot(AtomicU64);

impl AsidSlot {
    #[expect(clippy::cast_lossless, reason = "u64::from is not const")]
    const fn pack(generation: u32, tag: u16) -> u64 {
        ((generation as u64) << 32) | tag as u64
    }

    #[expect(clippy::cast_possible_truncation, reason = "unpacking")]
    const fn unpack(raw: u64) -> (u32, u16) {
        ((raw >> 32) as u32, raw as u16)
    }

    pub(crate) fn load(&self) -> (u32, u16) {
        Self::unpack(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn generation(&self) -> u32 {
        self.load().0
    }

    fn store(&self, generation: u32, tag: u16) {
        self.0.store(Self::pack(generation, tag), Ordering::SeqCst);
    }

    /// Forces the next activation on this slot's processor to allocate a fresh tag, unless the
    /// slot changed since `(generation, tag)` was observed.
    ///
    /// Returns `true` if the slot was invalidated.
    pub(crate) fn invalidate(&self, generation: u32, tag: u16) -> bool {
        self.0
            .compare_exchange(
                Self::pack(generation, tag),
                Self::pack(INVALID_GENERATION, tag),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Undoes [`Self::invalidate`], unless the slot was reassigned in the meantime.
    pub(crate) fn restore(&self, generation: u32, tag: u16) {
        let _ = self.0.compare_exchange(
            Self::pack(INVALID_GENERATION, tag),
            Self::pack(generation, tag),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

/// A processor's tag allocator.
#[derive(Debug)]
pub(crate) struct AsidGeneration {
    generation: AtomicU32,
    next: AtomicU32,
}

impl AsidGeneration {
    pub(crate) fn new(min_user_asid: u32) -> Self {
        Self {
            generation: AtomicU32::new(1),
            next: AtomicU32::new(min_user_asid),
        }
    }

    pub(crate) fn current(&self) -> u32 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Returns the tag `slot` holds for this processor, assigning a new one if the slot is from
    /// an older generation.
    ///
    /// When the tag space is exhausted `flush_all` is called to drop every translation from the
    /// local TLB before the generation advances.
    ///
    /// Must only be called on the processor owning `self`.
    pub(crate) fn allocate(
        &self,
        slot: &AsidSlot,
        asid_count: u32,
        min_user_asid: NonZeroU16,
        flush_all: impl FnOnce(),
    ) -> Asid {
        let current = self.current();
        let (generation, tag) = slot.load();
        if generation == current
            && let Some(tag) = NonZeroU16::new(tag)
        {
            return Asid::new(tag);
        }

        let mut generation = current;
        let mut id = self.next.load(Ordering::Relaxed);
        if id >= asid_count {
            flush_all();
            generation = generation.wrapping_add(1);
            if generation == INVALID_GENERATION {
                generation = 1;
            }
            self.generation.store(generation, Ordering::SeqCst);
            id = u32::from(min_user_asid.get());
            log::debug!("asid space exhausted, starting generation {generation}");
        }
        self.next.store(id + 1, Ordering::Relaxed);

        let Some(tag) = u16::try_from(id).ok().and_then(NonZeroU16::new) else {
            unreachable!("user address-space tags are non-zero and fit 16 bits, found {id}");
        };
        slot.store(generation, tag.get());
        Asid::new(tag)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::collections::HashMap;

    use super::*;

    const MIN: NonZeroU16 = NonZeroU16::MIN;

    #[test]
    fn fast_path_reuses_tag() {
        let cpu = AsidGeneration::new(1);
        let slot = AsidSlot::default();

        let first = cpu.allocate(&slot, 8, MIN, || panic!("no flush expected"));
        let second = cpu.allocate(&slot, 8, MIN, || panic!("no flush expected"));
        assert_eq!(first, second);
        assert_eq!(first.get(), 1);
    }

    #[test]
    fn wraparound_flushes_once() {
        let cpu = AsidGeneration::new(1);
        let flushes = Cell::new(0);
        let slots: Vec<AsidSlot> = (0..15).map(|_| AsidSlot::default()).collect();

        for slot in &slots {
            cpu.allocate(slot, 8, MIN, || flushes.set(flushes.get() + 1));
        }

        // tags 1..8 fit seven address spaces per generation
        assert_eq!(flushes.get(), 2);
        assert_eq!(cpu.current(), 3);
    }

    #[test]
    fn live_tags_are_unique() {
        let cpu = AsidGeneration::new(1);
        let slots: Vec<AsidSlot> = (0..40).map(|_| AsidSlot::default()).collect();

        // activate address spaces in an irregular order
        for round in 0..5 {
            for (i, slot) in slots.iter().enumerate() {
                if (i + round) % 3 != 0 {
                    cpu.allocate(slot, 16, MIN, || {});
                }
            }
        }

        let mut live = HashMap::new();
        for (i, slot) in slots.iter().enumerate() {
            let (generation, tag) = slot.load();
            if generation == cpu.current() {
                assert!(live.insert(tag, i).is_none(), "tag {tag} is live twice");
            }
        }
    }

    #[test]
    fn invalidated_slot_gets_fresh_tag() {
        let cpu = AsidGeneration::new(1);
        let slot = AsidSlot::default();
        let first = cpu.allocate(&slot, 8, MIN, || {});

        let (generation, tag) = slot.load();
        assert!(slot.invalidate(generation, tag));
        assert!(!slot.invalidate(generation, tag));

        let second = cpu.allocate(&slot, 8, MIN, || {});
        assert_ne!(first, second);
    }

    #[test]
    fn restore_only_undoes_own_invalidation() {
        let cpu = AsidGeneration::new(1);
        let slot = AsidSlot::default();
        cpu.allocate(&slot, 8, MIN, || {});

        let (generation, tag) = slot.load();
        assert!(slot.invalidate(generation, tag));
        slot.restore(generation, tag);
        assert_eq!(slot.load(), (generation, tag));

        assert!(slot.invalidate(generation, tag));
        let fresh = cpu.allocate(&slot, 8, MIN, || {});
        slot.restore(generation, tag);
        assert_eq!(slot.load(), (cpu.current(), fresh.get()));
    }
}
