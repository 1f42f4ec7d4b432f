// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

bitflags::bitflags! {
    /// Access permissions requested for a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Modifiers for [`PhysMap::enter`](crate::PhysMap::enter).
    ///
    /// The low bits carry the access that caused the mapping to be entered, which feeds the
    /// page's modified and referenced attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EnterFlags: u8 {
        /// The mapping is being entered for a read access.
        const READ = 1 << 0;
        /// The mapping is being entered for a write access.
        const WRITE = 1 << 1;
        /// The mapping is being entered for an instruction fetch.
        const EXECUTE = 1 << 2;
        /// The mapping is excluded from reclamation.
        const WIRED = 1 << 4;
        /// The mapping must bypass the data cache.
        const NOCACHE = 1 << 5;
    }
}

impl EnterFlags {
    /// The access type encoded in these flags.
    pub fn access(self) -> Protection {
        Protection::from_bits_truncate(self.bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_type_is_extracted() {
        let flags = EnterFlags::WRITE | EnterFlags::WIRED | EnterFlags::NOCACHE;
        assert_eq!(flags.access(), Protection::WRITE);
        assert!(EnterFlags::WIRED.access().is_empty());
    }
}
