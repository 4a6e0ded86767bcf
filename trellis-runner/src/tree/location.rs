// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;

/// A source location that a node was declared at.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CodeLocation {
    /// The file, as reported by `file!()` or [`std::panic::Location`].
    pub file: SmolStr,

    /// The 1-based line number.
    pub line: u32,
}

impl CodeLocation {
    /// Creates a new location.
    pub fn new(file: impl Into<SmolStr>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }

    /// Returns the location of the caller.
    #[track_caller]
    pub fn caller() -> Self {
        Self::from(std::panic::Location::caller())
    }

    /// Shifts the reported line by `offset`, saturating at line 1.
    pub fn offset_by(&self, offset: i32) -> Self {
        let line = i64::from(self.line) + i64::from(offset);
        Self {
            file: self.file.clone(),
            line: u32::try_from(line.max(1)).unwrap_or(u32::MAX),
        }
    }
}

impl From<&std::panic::Location<'_>> for CodeLocation {
    fn from(location: &std::panic::Location<'_>) -> Self {
        Self::new(location.file(), location.line())
    }
}

impl fmt::Display for CodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Expands to the [`CodeLocation`] of the macro invocation.
#[macro_export]
macro_rules! location {
    () => {
        $crate::tree::CodeLocation::new(file!(), line!())
    };
}
