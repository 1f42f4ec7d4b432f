// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The page-table pool or the PV entry arena was exhausted.
    NoMemory,
    /// A write was attempted through a mapping that is read-only.
    ReadOnly,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::NoMemory => write!(
                f,
                "The system was not able to allocate memory needed for the operation"
            ),
            Error::ReadOnly => write!(f, "Attempted to write through a read-only mapping"),
        }
    }
}

impl core::error::Error for Error {}

/// The error type returned when a page-table page or a PV entry cannot be allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError;

impl Display for AllocError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.write_str("pmap pool exhausted")
    }
}

impl core::error::Error for AllocError {}

impl From<AllocError> for Error {
    fn from(_: AllocError) -> Self {
        Error::NoMemory
    }
}

macro_rules! ensure {
    ($cond:expr, $error:expr) => {
        if !$cond {
            return Err($error);
        }
    };
}
pub(crate) use ensure;
