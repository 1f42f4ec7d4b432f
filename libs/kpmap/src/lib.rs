// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![cfg_attr(not(any(test, feature = "emulate")), no_std)]

//! Machine-dependent virtual memory for processors with software-refilled, tag-matched TLBs
//! and virtually indexed data caches.
//!
//! ## Locking
//!
//! All page tables, the reverse map and the page attributes are guarded by one lock inside
//! [`PhysMap`]. TLB and cache maintenance, including cross-processor shootdowns, runs while it is
//! held. The only state read without the lock is the per-processor tag allocator, the active pmap
//! of each processor, and the per-processor tag slots of each pmap, all of which are atomics.
//!
//! ## Address-space tags
//!
//! Every processor hands out tags from its own generation-numbered allocator. A pmap holds one
//! {generation, tag} pair per processor and only uses the tag while its generation is the current
//! one. When a processor runs out of tags it flushes its TLB once and starts a new generation,
//! implicitly invalidating every tag it handed out before.

extern crate alloc;

mod address;
pub mod arch;
mod asid;
mod bootstrap;
mod config;
mod cpu;
mod error;
mod page;
mod physmap;
mod pmap;
mod protection;
mod pte;
mod pv;
mod shootdown;
mod table;
#[cfg(test)]
mod test_utils;

pub use address::{PhysicalAddress, VirtualAddress};
pub use arch::Arch;
pub use asid::Asid;
pub use bootstrap::Bootstrap;
pub use config::PmapConfig;
pub use cpu::{CpuId, CpuMask};
pub use error::{AllocError, Error};
pub use page::{Page, PageFlags};
pub use physmap::PhysMap;
pub use pmap::Pmap;
pub use protection::{EnterFlags, Protection};
pub use pte::{CacheMode, PageTableEntry};

pub const KIB: usize = 1024;
pub const MIB: usize = KIB * 1024;
pub const GIB: usize = MIB * 1024;
