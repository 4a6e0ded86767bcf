// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Label filter expressions and semantic version constraints used to select specs in
//! trellis.
//!
//! A label filter is a boolean expression over the labels attached to a spec:
//!
//! ```
//! use trellis_filtering::LabelFilter;
//!
//! let filter = LabelFilter::parse("integration && !slow").unwrap();
//! assert!(filter.matches(["Integration", "network"]));
//! assert!(!filter.matches(["integration", "slow"]));
//! ```

pub mod errors;
mod expression;
mod parsing;
mod version;

pub use expression::{
    LabelExpr, LabelFilter, RESERVED_LABEL_CHARACTERS, SetOperation, normalize_label,
    validate_label,
};
pub use semver::Version;
pub use version::{SemVerConstraint, SemVerFilter};
