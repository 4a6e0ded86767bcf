// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    config::{PollProgress, RetryPolicy},
    tree::{CodeLocation, NodeId, NodeKind, Suite, TreeNode},
};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{collections::HashSet, fmt, time::Duration};
use trellis_filtering::{SemVerConstraint, normalize_label};

/// Identifies a spec by its position in depth-first declaration order.
///
/// Every process building the same suite assigns the same ids, so reports from different
/// processes can be merged by id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecId(pub usize);

impl fmt::Display for SpecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A resolved leaf: the leaf, its ancestor chain and the decorators merged across that chain.
#[derive(Clone, Debug)]
pub struct Spec<'s> {
    id: SpecId,
    // Outermost first, starting with the implicit root.
    containers: Vec<&'s TreeNode>,
    leaf: &'s TreeNode,
    labels: Vec<SmolStr>,
    semver: Option<&'s SemVerConstraint>,
    focused: bool,
    pending: bool,
    serial: bool,
    ordered_level: Option<usize>,
    retry_policy: RetryPolicy,
    poll_progress: PollProgress,
    spec_timeout: Option<Duration>,
}

impl<'s> Spec<'s> {
    fn new(
        id: SpecId,
        containers: Vec<&'s TreeNode>,
        leaf: &'s TreeNode,
        focused_nodes: &HashSet<NodeId>,
    ) -> Self {
        let chain = || containers.iter().copied().chain(std::iter::once(leaf));
        // Innermost first, for decorators that inherit from the closest declaration.
        let innermost = || chain().collect::<Vec<_>>().into_iter().rev();

        let mut seen = HashSet::new();
        let labels = chain()
            .flat_map(|node| node.decorators.labels())
            .filter(|label| seen.insert(normalize_label(label)))
            .cloned()
            .collect();

        let retry_policy = innermost()
            .find_map(|node| {
                RetryPolicy::from_decorators(
                    node.decorators.flake_attempts(),
                    node.decorators.must_pass_repeatedly(),
                )
            })
            .unwrap_or_default();

        let poll_progress = PollProgress {
            after: innermost().find_map(|node| node.decorators.poll_progress_after()),
            interval: innermost().find_map(|node| node.decorators.poll_progress_interval()),
        };

        Self {
            id,
            labels,
            semver: innermost().find_map(|node| node.semver.as_ref()),
            focused: chain().any(|node| focused_nodes.contains(&node.id)),
            pending: chain().any(|node| node.decorators.is_pending()),
            serial: chain().any(|node| node.decorators.is_serial()),
            ordered_level: containers
                .iter()
                .position(|node| node.decorators.is_ordered()),
            retry_policy,
            poll_progress,
            spec_timeout: innermost().find_map(|node| node.decorators.spec_timeout()),
            containers,
            leaf,
        }
    }

    /// Returns the spec's id.
    pub fn id(&self) -> SpecId {
        self.id
    }

    /// Returns the leaf's own text.
    pub fn text(&self) -> &str {
        &self.leaf.text
    }

    /// Returns the texts of the enclosing containers, outermost first.
    pub fn container_texts(&self) -> impl Iterator<Item = &'s str> + '_ {
        self.containers
            .iter()
            .map(|node| node.text.as_str())
            .filter(|text| !text.is_empty())
    }

    /// Returns the container texts and the leaf text joined by spaces. Text filters match against
    /// this.
    pub fn full_text(&self) -> String {
        self.container_texts()
            .chain(std::iter::once(self.text()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Returns the leaf's location.
    pub fn location(&self) -> &'s CodeLocation {
        &self.leaf.location
    }

    /// Returns the locations of the leaf and every enclosing container.
    pub fn locations(&self) -> impl Iterator<Item = &'s CodeLocation> + '_ {
        self.containers
            .iter()
            .skip(1)
            .map(|node| &node.location)
            .chain(std::iter::once(&self.leaf.location))
    }

    /// Returns the labels merged across the ancestor chain, deduplicated case-insensitively.
    pub fn labels(&self) -> &[SmolStr] {
        &self.labels
    }

    /// Returns the innermost semantic version constraint.
    pub fn semver_constraint(&self) -> Option<&'s SemVerConstraint> {
        self.semver
    }

    /// Returns true if this spec or an ancestor is focused.
    pub fn is_focused(&self) -> bool {
        self.focused
    }

    /// Returns true if this spec or an ancestor is Pending.
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Returns true if this spec or an ancestor is Serial.
    pub fn is_serial(&self) -> bool {
        self.serial
    }

    /// Returns the outermost Ordered container enclosing this spec.
    pub fn ordered_group(&self) -> Option<NodeId> {
        self.ordered_level.map(|level| self.containers[level].id)
    }

    /// Returns the retry policy declared closest to the leaf.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    /// Returns the progress polling settings declared closest to the leaf.
    pub fn poll_progress(&self) -> PollProgress {
        self.poll_progress
    }

    /// Returns the per-attempt deadline declared closest to the leaf.
    pub fn spec_timeout(&self) -> Option<Duration> {
        self.spec_timeout
    }

    pub(crate) fn containers(&self) -> &[&'s TreeNode] {
        &self.containers
    }

    pub(crate) fn leaf(&self) -> &'s TreeNode {
        self.leaf
    }

    pub(crate) fn ordered_level(&self) -> Option<usize> {
        self.ordered_level
    }
}

impl PartialEq for Spec<'_> {
    fn eq(&self, other: &Self) -> bool {
        let ids = |spec: &Spec<'_>| spec.containers.iter().map(|n| n.id).collect::<Vec<_>>();
        self.id == other.id
            && self.leaf.id == other.leaf.id
            && ids(self) == ids(other)
            && self.labels == other.labels
            && self.semver == other.semver
            && self.focused == other.focused
            && self.pending == other.pending
            && self.serial == other.serial
            && self.ordered_level == other.ordered_level
            && self.retry_policy == other.retry_policy
            && self.poll_progress == other.poll_progress
            && self.spec_timeout == other.spec_timeout
    }
}

impl Eq for Spec<'_> {}

impl PartialEq for SpecList<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.suite_name == other.suite_name
            && self.root.id == other.root.id
            && self.specs == other.specs
            && self.has_programmatic_focus == other.has_programmatic_focus
    }
}

impl Eq for SpecList<'_> {}

/// The flat, depth-first sequence of resolved specs in a suite.
///
/// Resolution is pure: resolving the same suite twice produces equal lists.
#[derive(Clone, Debug)]
pub struct SpecList<'s> {
    suite_name: &'s str,
    root: &'s TreeNode,
    specs: Vec<Spec<'s>>,
    has_programmatic_focus: bool,
}

impl<'s> SpecList<'s> {
    /// Resolves every leaf in the suite.
    pub fn resolve(suite: &'s Suite) -> Self {
        let mut focused_nodes = HashSet::new();
        let has_programmatic_focus = collect_focus(&suite.root, &mut focused_nodes);

        let mut specs = Vec::new();
        let mut chain = Vec::new();
        walk(&suite.root, &mut chain, &focused_nodes, &mut specs);

        Self {
            suite_name: &suite.name,
            root: &suite.root,
            specs,
            has_programmatic_focus,
        }
    }

    /// Returns the name of the suite.
    pub fn suite_name(&self) -> &'s str {
        self.suite_name
    }

    /// Returns true if any node in the suite carries `Focus`.
    pub fn has_programmatic_focus(&self) -> bool {
        self.has_programmatic_focus
    }

    /// Returns the number of specs.
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Returns true if the suite has no specs.
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Iterates over specs in declaration order.
    pub fn iter(&self) -> std::slice::Iter<'_, Spec<'s>> {
        self.specs.iter()
    }

    /// Returns the spec with the given id.
    pub fn get(&self, id: SpecId) -> Option<&Spec<'s>> {
        self.specs.get(id.0)
    }

    pub(crate) fn root(&self) -> &'s TreeNode {
        self.root
    }
}

/// Marks effectively focused nodes and returns true if the subtree has any focus.
///
/// A focused container with a focused descendant loses its own focus, so that focusing one spec
/// inside a focused container narrows the run to that spec.
fn collect_focus(node: &TreeNode, focused: &mut HashSet<NodeId>) -> bool {
    let mut descendant_focus = false;
    for child in node.children() {
        descendant_focus |= collect_focus(child, focused);
    }
    let own_focus = node.decorators.is_focused();
    if own_focus && !descendant_focus {
        focused.insert(node.id);
    }
    own_focus || descendant_focus
}

fn walk<'s>(
    node: &'s TreeNode,
    chain: &mut Vec<&'s TreeNode>,
    focused_nodes: &HashSet<NodeId>,
    specs: &mut Vec<Spec<'s>>,
) {
    match &node.kind {
        NodeKind::Container { children, .. } => {
            chain.push(node);
            for child in children {
                walk(child, chain, focused_nodes, specs);
            }
            chain.pop();
        }
        NodeKind::Leaf { .. } => {
            let id = SpecId(specs.len());
            specs.push(Spec::new(id, chain.clone(), node, focused_nodes));
        }
    }
}
