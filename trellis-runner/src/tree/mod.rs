// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Building and validating spec trees.
//!
//! A suite is registered through a [`SuiteBuilder`]: containers group leaves and hooks, and every
//! node carries a set of [`Decorator`]s. [`SuiteBuilder::build`] validates the decorators and
//! produces an immutable [`Suite`].

mod builder;
mod decorators;
mod location;
mod node;
mod validate;

pub use builder::{SuiteBuilder, TableEntry};
pub use decorators::{Decorator, Decorators};
pub use location::CodeLocation;
pub(crate) use node::{AfterSuiteNode, BeforeSuiteNode, NodeKind};
pub use node::{
    Hook, HookKind, NodeBody, NodeId, NodeType, PayloadBody, PrimaryBody, Suite, TreeNode,
};
