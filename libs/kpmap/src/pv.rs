// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The physical-to-virtual reverse map.
//!
//! Every managed page keeps a list of the `(pmap, va)` pairs that currently map it. The first
//! pair lives inline in the page descriptor so the common unshared page never touches the
//! arena; further pairs are chained through [`PvArena`] slots.

use wasmtime_slab::{Id, Slab};

use crate::VirtualAddress;
use crate::error::AllocError;
use crate::pmap::PmapId;

/// One `(pmap, va)` mapping of a physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PvEntry {
    pub(crate) pmap: PmapId,
    pub(crate) va: VirtualAddress,
}

#[derive(Debug)]
struct PvNode {
    entry: PvEntry,
    next: Option<Id>,
}

/// Backing storage for chained PV entries.
#[derive(Debug)]
pub(crate) struct PvArena {
    slab: Slab<PvNode>,
    capacity: usize,
}

impl PvArena {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slab: Slab::with_capacity(capacity),
            capacity,
        }
    }

    /// Number of chained entries currently allocated.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slab.len()
    }

    fn alloc(&mut self, entry: PvEntry, next: Option<Id>) -> Result<Id, AllocError> {
        if self.slab.len() >= self.capacity {
            return Err(AllocError);
        }
        Ok(self.slab.alloc(PvNode { entry, next }))
    }
}

/// The reverse-map list of one physical page.
#[derive(Debug, Default)]
pub(crate) struct PvList {
    head: Option<PvEntry>,
    chain: Option<Id>,
}

impl PvList {
    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub(crate) fn first(&self) -> Option<PvEntry> {
        self.head
    }

    pub(crate) fn iter<'a>(&self, arena: &'a PvArena) -> PvIter<'a> {
        PvIter {
            arena,
            head: self.head,
            next: self.chain,
        }
    }

    pub(crate) fn contains(&self, arena: &PvArena, pmap: PmapId, va: VirtualAddress) -> bool {
        self.iter(arena)
            .any(|entry| entry.pmap == pmap && entry.va == va)
    }

    /// Adds `entry` to the list. The first entry is stored inline; later ones are inserted
    /// right after it.
    pub(crate) fn push(&mut self, arena: &mut PvArena, entry: PvEntry) -> Result<(), AllocError> {
        if self.head.is_none() {
            debug_assert!(self.chain.is_none());
            self.head = Some(entry);
        } else {
            self.chain = Some(arena.alloc(entry, self.chain)?);
        }
        Ok(())
    }

    /// Unlinks the entry matching `(pmap, va)` exactly.
    ///
    /// Returns `false` if no such entry exists.
    pub(crate) fn remove(&mut self, arena: &mut PvArena, pmap: PmapId, va: VirtualAddress) -> bool {
        let matches = |entry: &PvEntry| entry.pmap == pmap && entry.va == va;

        if self.head.as_ref().is_some_and(matches) {
            // promote the first chained entry into the inline slot
            self.head = self.chain.map(|id| {
                let node = arena.slab.dealloc(id);
                self.chain = node.next;
                node.entry
            });
            return true;
        }

        let mut prev: Option<Id> = None;
        let mut cursor = self.chain;
        while let Some(id) = cursor {
            let node = &arena.slab[id];
            if matches(&node.entry) {
                let next = node.next;
                match prev {
                    None => self.chain = next,
                    Some(prev) => arena.slab[prev].next = next,
                }
                arena.slab.dealloc(id);
                return true;
            }
            prev = cursor;
            cursor = node.next;
        }

        false
    }
}

pub(crate) struct PvIter<'a> {
    arena: &'a PvArena,
    head: Option<PvEntry>,
    next: Option<Id>,
}

impl Iterator for PvIter<'_> {
    type Item = PvEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(head) = self.head.take() {
            return Some(head);
        }
        let node = &self.arena.slab[self.next?];
        self.next = node.next;
        Some(node.entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pmap: u32, va: usize) -> PvEntry {
        PvEntry {
            pmap: PmapId::from_raw(pmap),
            va: VirtualAddress::new(va),
        }
    }

    #[test]
    fn first_entry_is_inline() {
        let mut arena = PvArena::new(0);
        let mut list = PvList::default();

        list.push(&mut arena, entry(0, 0x1000)).unwrap();
        assert_eq!(list.first(), Some(entry(0, 0x1000)));
        assert_eq!(arena.len(), 0);

        assert_eq!(list.push(&mut arena, entry(1, 0x1000)), Err(AllocError));
        assert_eq!(list.iter(&arena).count(), 1);
    }

    #[test]
    fn removing_head_promotes_chain() {
        let mut arena = PvArena::new(8);
        let mut list = PvList::default();
        for i in 0..4 {
            list.push(&mut arena, entry(i, 0x1000 * i as usize)).unwrap();
        }
        assert_eq!(arena.len(), 3);

        assert!(list.remove(&mut arena, PmapId::from_raw(0), VirtualAddress::new(0)));
        assert_eq!(arena.len(), 2);
        assert_eq!(list.iter(&arena).count(), 3);
        assert!(list.first().is_some());
        assert!(!list.contains(&arena, PmapId::from_raw(0), VirtualAddress::new(0)));
    }

    #[test]
    fn remove_matches_exact_pair() {
        let mut arena = PvArena::new(8);
        let mut list = PvList::default();
        list.push(&mut arena, entry(0, 0x1000)).unwrap();
        list.push(&mut arena, entry(1, 0x1000)).unwrap();
        list.push(&mut arena, entry(1, 0x2000)).unwrap();

        assert!(!list.remove(&mut arena, PmapId::from_raw(0), VirtualAddress::new(0x2000)));
        assert!(list.remove(&mut arena, PmapId::from_raw(1), VirtualAddress::new(0x1000)));
        assert!(list.contains(&arena, PmapId::from_raw(1), VirtualAddress::new(0x2000)));
        assert!(list.contains(&arena, PmapId::from_raw(0), VirtualAddress::new(0x1000)));

        assert!(list.remove(&mut arena, PmapId::from_raw(0), VirtualAddress::new(0x1000)));
        assert!(list.remove(&mut arena, PmapId::from_raw(1), VirtualAddress::new(0x2000)));
        assert!(list.is_empty());
        assert_eq!(arena.len(), 0);
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut arena = PvArena::new(1);
        let mut list = PvList::default();
        list.push(&mut arena, entry(0, 0x1000)).unwrap();
        list.push(&mut arena, entry(1, 0x1000)).unwrap();
        assert!(list.remove(&mut arena, PmapId::from_raw(1), VirtualAddress::new(0x1000)));
        list.push(&mut arena, entry(2, 0x1000)).unwrap();
        assert_eq!(list.iter(&arena).count(), 2);
    }
}
