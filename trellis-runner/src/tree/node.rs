// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{CodeLocation, Decorators};
use crate::runner::SpecContext;
use debug_ignore::DebugIgnore;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use trellis_filtering::SemVerConstraint;

/// The body of a leaf or hook.
pub type NodeBody = Arc<dyn Fn(&SpecContext) + Send + Sync>;

/// The primary-only phase of a synchronized before-suite hook. Its return value is distributed to
/// every process.
pub type PrimaryBody = Arc<dyn Fn(&SpecContext) -> Vec<u8> + Send + Sync>;

/// The all-processes phase of a synchronized before-suite hook.
pub type PayloadBody = Arc<dyn Fn(&SpecContext, &[u8]) + Send + Sync>;

/// Identifies a node within one built suite. Identical registration code produces identical ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub(crate) u32);

/// A node in the spec tree: a container or a leaf.
#[derive(Debug)]
pub struct TreeNode {
    pub(crate) id: NodeId,
    pub(crate) text: String,
    pub(crate) location: CodeLocation,
    pub(crate) decorators: Decorators,
    // Filled in by validation.
    pub(crate) semver: Option<SemVerConstraint>,
    pub(crate) kind: NodeKind,
}

#[derive(Debug)]
pub(crate) enum NodeKind {
    Container {
        children: Vec<TreeNode>,
        hooks: Vec<Hook>,
    },
    Leaf {
        body: DebugIgnore<NodeBody>,
    },
}

impl TreeNode {
    /// Returns this node's id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Returns the display text. The implicit root container has empty text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Returns the location the node was declared at, after any `Offset`.
    pub fn location(&self) -> &CodeLocation {
        &self.location
    }

    /// Returns the decorators attached to this node.
    pub fn decorators(&self) -> &Decorators {
        &self.decorators
    }

    /// Returns true if this is a container.
    pub fn is_container(&self) -> bool {
        matches!(self.kind, NodeKind::Container { .. })
    }

    /// Returns the children of a container, or an empty slice for a leaf.
    pub fn children(&self) -> &[TreeNode] {
        match &self.kind {
            NodeKind::Container { children, .. } => children,
            NodeKind::Leaf { .. } => &[],
        }
    }

    /// Returns the hooks registered directly on a container, or an empty slice for a leaf.
    pub fn hooks(&self) -> &[Hook] {
        match &self.kind {
            NodeKind::Container { hooks, .. } => hooks,
            NodeKind::Leaf { .. } => &[],
        }
    }

    pub(crate) fn hooks_of(&self, kind: HookKind) -> impl Iterator<Item = &Hook> {
        self.hooks().iter().filter(move |hook| hook.kind == kind)
    }

    pub(crate) fn body(&self) -> Option<&NodeBody> {
        match &self.kind {
            NodeKind::Leaf { body } => Some(body),
            NodeKind::Container { .. } => None,
        }
    }
}

/// A setup or teardown hook registered on a container.
#[derive(Debug)]
pub struct Hook {
    pub(crate) id: NodeId,
    pub(crate) kind: HookKind,
    pub(crate) location: CodeLocation,
    pub(crate) decorators: Decorators,
    pub(crate) body: DebugIgnore<NodeBody>,
}

impl Hook {
    /// Returns the kind of hook.
    pub fn kind(&self) -> HookKind {
        self.kind
    }

    /// Returns the location the hook was declared at.
    pub fn location(&self) -> &CodeLocation {
        &self.location
    }

    pub(crate) fn is_once_per_ordered(&self) -> bool {
        self.decorators.is_once_per_ordered()
    }
}

/// The kind of a [`Hook`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HookKind {
    BeforeEach,
    JustBeforeEach,
    JustAfterEach,
    AfterEach,
    BeforeAll,
    AfterAll,
}

impl HookKind {
    /// Returns the node type reported for this hook.
    pub fn node_type(self) -> NodeType {
        match self {
            Self::BeforeEach => NodeType::BeforeEach,
            Self::JustBeforeEach => NodeType::JustBeforeEach,
            Self::JustAfterEach => NodeType::JustAfterEach,
            Self::AfterEach => NodeType::AfterEach,
            Self::BeforeAll => NodeType::BeforeAll,
            Self::AfterAll => NodeType::AfterAll,
        }
    }
}

/// The type of node that was running, for reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeType {
    Container,
    It,
    BeforeEach,
    JustBeforeEach,
    JustAfterEach,
    AfterEach,
    BeforeAll,
    AfterAll,
    DeferCleanup,
    BeforeSuite,
    AfterSuite,
    SynchronizedBeforeSuite,
    SynchronizedAfterSuite,
}

impl NodeType {
    /// Returns the name of the node type.
    pub fn name(self) -> &'static str {
        match self {
            Self::Container => "Container",
            Self::It => "It",
            Self::BeforeEach => "BeforeEach",
            Self::JustBeforeEach => "JustBeforeEach",
            Self::JustAfterEach => "JustAfterEach",
            Self::AfterEach => "AfterEach",
            Self::BeforeAll => "BeforeAll",
            Self::AfterAll => "AfterAll",
            Self::DeferCleanup => "DeferCleanup",
            Self::BeforeSuite => "BeforeSuite",
            Self::AfterSuite => "AfterSuite",
            Self::SynchronizedBeforeSuite => "SynchronizedBeforeSuite",
            Self::SynchronizedAfterSuite => "SynchronizedAfterSuite",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug)]
pub(crate) enum BeforeSuiteNode {
    Plain {
        location: CodeLocation,
        body: DebugIgnore<NodeBody>,
    },
    Synchronized {
        location: CodeLocation,
        primary: DebugIgnore<PrimaryBody>,
        all: DebugIgnore<PayloadBody>,
    },
}

impl BeforeSuiteNode {
    pub(crate) fn location(&self) -> &CodeLocation {
        match self {
            Self::Plain { location, .. } | Self::Synchronized { location, .. } => location,
        }
    }
}

#[derive(Debug)]
pub(crate) enum AfterSuiteNode {
    Plain {
        location: CodeLocation,
        body: DebugIgnore<NodeBody>,
    },
    Synchronized {
        location: CodeLocation,
        all: DebugIgnore<NodeBody>,
        primary: DebugIgnore<NodeBody>,
    },
}

impl AfterSuiteNode {
    pub(crate) fn location(&self) -> &CodeLocation {
        match self {
            Self::Plain { location, .. } | Self::Synchronized { location, .. } => location,
        }
    }
}

/// An immutable, validated spec tree ready to be resolved and run.
///
/// Created with [`SuiteBuilder`](super::SuiteBuilder).
#[derive(Debug)]
pub struct Suite {
    pub(crate) name: String,
    pub(crate) root: TreeNode,
    pub(crate) before_suite: Option<BeforeSuiteNode>,
    pub(crate) after_suite: Option<AfterSuiteNode>,
}

impl Suite {
    /// Returns the suite's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the implicit root container.
    pub fn root(&self) -> &TreeNode {
        &self.root
    }
}
