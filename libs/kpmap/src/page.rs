// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ops::{Index, IndexMut, Range};

use crate::PhysicalAddress;
use crate::pv::PvList;

bitflags::bitflags! {
    /// Attributes the pmap layer tracks for every managed physical page.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct PageFlags: u16 {
        /// The page was written to since the attribute was last cleared.
        const MODIFIED = 1 << 0;
        /// The page was accessed since the attribute was last cleared.
        const REFERENCED = 1 << 1;
        /// Every mapping of the page is cached.
        const CACHED = 1 << 2;
        /// The page was explicitly mapped uncached.
        const UNCACHED = 1 << 3;
        /// Attributes that survive the page losing its last mapping.
        const PRESERVE = Self::MODIFIED.bits() | Self::REFERENCED.bits();
    }
}

/// A managed physical page.
///
/// Obtained from [`PhysMap::page`](crate::PhysMap::page), only valid for the map that handed it
/// out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Page {
    index: usize,
    address: PhysicalAddress,
}

impl Page {
    /// The physical address of the first byte of this page.
    pub fn address(&self) -> PhysicalAddress {
        self.address
    }
}

#[derive(Debug, Default)]
pub(crate) struct PageDescriptor {
    pub(crate) flags: PageFlags,
    pub(crate) pv: PvList,
}

#[derive(Debug)]
struct PageSegment {
    range: Range<PhysicalAddress>,
    first: usize,
}

/// Descriptors for every page of the managed physical ranges.
#[derive(Debug)]
pub(crate) struct PageArray {
    segments: Box<[PageSegment]>,
    descriptors: Box<[PageDescriptor]>,
    page_size: usize,
}

impl PageArray {
    pub(crate) fn new(
        ranges: impl IntoIterator<Item = Range<PhysicalAddress>>,
        page_size: usize,
    ) -> Self {
        let mut segments = Vec::new();
        let mut count = 0;
        for range in ranges {
            assert!(
                range.start.is_aligned_to(page_size) && range.end.is_aligned_to(page_size),
                "managed range {range:?} is not page aligned"
            );
            let pages = range.end.offset_from_unsigned(range.start) / page_size;
            segments.push(PageSegment {
                range,
                first: count,
            });
            count += pages;
        }

        let descriptors = (0..count).map(|_| PageDescriptor::default()).collect();
        log::trace!("tracking {count} physical pages in {} segments", segments.len());

        Self {
            segments: segments.into_boxed_slice(),
            descriptors,
            page_size,
        }
    }

    /// Resolves a physical address to its page, or `None` if the address is not managed.
    pub(crate) fn lookup(&self, address: PhysicalAddress) -> Option<Page> {
        let segment = self
            .segments
            .iter()
            .find(|segment| segment.range.contains(&address))?;

        let address = address.align_down(self.page_size);
        let index = segment.first + address.offset_from_unsigned(segment.range.start) / self.page_size;

        Some(Page { index, address })
    }

    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = (Page, &PageDescriptor)> {
        self.segments.iter().flat_map(move |segment| {
            let pages = segment.range.end.offset_from_unsigned(segment.range.start) / self.page_size;
            (0..pages).map(move |n| {
                let page = Page {
                    index: segment.first + n,
                    address: segment.range.start.add(n * self.page_size),
                };
                (page, &self.descriptors[page.index])
            })
        })
    }
}

impl Index<Page> for PageArray {
    type Output = PageDescriptor;

    fn index(&self, page: Page) -> &Self::Output {
        &self.descriptors[page.index]
    }
}

impl IndexMut<Page> for PageArray {
    fn index_mut(&mut self, page: Page) -> &mut Self::Output {
        &mut self.descriptors[page.index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: usize, end: usize) -> Range<PhysicalAddress> {
        PhysicalAddress::new(start)..PhysicalAddress::new(end)
    }

    #[test]
    fn lookup_across_segments() {
        let pages = PageArray::new([range(0x1000, 0x3000), range(0x8000, 0x9000)], 4096);

        let page = pages.lookup(PhysicalAddress::new(0x2abc)).unwrap();
        assert_eq!(page.address(), PhysicalAddress::new(0x2000));

        let page = pages.lookup(PhysicalAddress::new(0x8000)).unwrap();
        assert_eq!(page.address(), PhysicalAddress::new(0x8000));
        assert_eq!(page.index, 2);

        assert!(pages.lookup(PhysicalAddress::new(0x3000)).is_none());
        assert!(pages.lookup(PhysicalAddress::new(0x0)).is_none());
    }

    #[test]
    fn iter_visits_every_page() {
        let pages = PageArray::new([range(0x1000, 0x3000), range(0x8000, 0x9000)], 4096);
        let addresses: Vec<_> = pages.iter().map(|(page, _)| page.address().get()).collect();
        assert_eq!(addresses, [0x1000, 0x2000, 0x8000]);
    }

    #[test]
    fn preserve_mask() {
        let flags = PageFlags::all() - PageFlags::PRESERVE;
        assert_eq!(flags, PageFlags::CACHED | PageFlags::UNCACHED);
    }
}
