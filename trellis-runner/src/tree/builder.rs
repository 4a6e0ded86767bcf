// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    AfterSuiteNode, BeforeSuiteNode, CodeLocation, Decorator, Decorators, Hook, HookKind, NodeId,
    NodeKind, Suite, TreeNode, validate::validate_tree,
};
use crate::{
    errors::{DecoratorMisuse, DecoratorMisuseKind, SuiteBuildError},
    helpers::panic_message,
    runner::SpecContext,
};
use debug_ignore::DebugIgnore;
use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};
use tracing::debug;

/// Registers containers, leaves and hooks, and builds them into a [`Suite`].
///
/// Container bodies run exactly once, while they are being registered. Nothing registered here
/// executes until the suite is run.
///
/// ```
/// use trellis_runner::{location, tree::{Decorator, SuiteBuilder}};
///
/// let mut builder = SuiteBuilder::new("accounts");
/// builder.container("login", location!(), [Decorator::labels(["auth"])], |b| {
///     b.before_each(location!(), [], |_ctx| {});
///     b.leaf("accepts a valid password", location!(), [], |_ctx| {});
/// });
/// let suite = builder.build().unwrap();
/// assert_eq!(suite.root().children().len(), 1);
/// ```
#[derive(Debug)]
pub struct SuiteBuilder {
    name: String,
    root: Frame,
    stack: Vec<Frame>,
    next_id: u32,
    errors: Vec<DecoratorMisuse>,
    before_suite: Option<BeforeSuiteNode>,
    after_suite: Option<AfterSuiteNode>,
}

#[derive(Debug)]
struct Frame {
    id: NodeId,
    text: String,
    location: CodeLocation,
    decorators: Decorators,
    children: Vec<TreeNode>,
    hooks: Vec<Hook>,
}

impl Frame {
    fn into_node(self) -> TreeNode {
        TreeNode {
            id: self.id,
            text: self.text,
            location: self.location,
            decorators: self.decorators,
            semver: None,
            kind: NodeKind::Container {
                children: self.children,
                hooks: self.hooks,
            },
        }
    }
}

impl SuiteBuilder {
    /// Creates a builder for a suite with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            root: Frame {
                id: NodeId(0),
                text: String::new(),
                location: CodeLocation::new("<root>", 0),
                decorators: Decorators::default(),
                children: Vec::new(),
                hooks: Vec::new(),
            },
            stack: Vec::new(),
            next_id: 1,
            errors: Vec::new(),
            before_suite: None,
            after_suite: None,
        }
    }

    fn next_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    fn current(&mut self) -> &mut Frame {
        self.stack.last_mut().unwrap_or(&mut self.root)
    }

    /// Registers a container. `body` runs immediately to register the container's children.
    pub fn container(
        &mut self,
        text: impl Into<String>,
        location: CodeLocation,
        decorators: impl IntoIterator<Item = Decorator>,
        body: impl FnOnce(&mut SuiteBuilder),
    ) -> &mut Self {
        let decorators: Decorators = decorators.into_iter().collect();
        let location = location.offset_by(decorators.offset());
        let id = self.next_id();
        self.stack.push(Frame {
            id,
            text: text.into(),
            location,
            decorators,
            children: Vec::new(),
            hooks: Vec::new(),
        });
        let depth = self.stack.len();

        let result = panic::catch_unwind(AssertUnwindSafe(|| body(self)));

        // Nested containers pop their own frames, even when they panic.
        debug_assert_eq!(self.stack.len(), depth, "container frames are balanced");
        let Some(frame) = self.stack.pop() else {
            return self;
        };
        if let Err(payload) = result {
            self.errors.push(DecoratorMisuse::new(
                frame.text.clone(),
                frame.location.clone(),
                DecoratorMisuseKind::ContainerPanicked {
                    message: panic_message(payload.as_ref()),
                },
            ));
        }
        let node = frame.into_node();
        self.current().children.push(node);
        self
    }

    /// Registers a leaf: an executable spec.
    pub fn leaf(
        &mut self,
        text: impl Into<String>,
        location: CodeLocation,
        decorators: impl IntoIterator<Item = Decorator>,
        body: impl Fn(&SpecContext) + Send + Sync + 'static,
    ) -> &mut Self {
        let decorators: Decorators = decorators.into_iter().collect();
        let location = location.offset_by(decorators.offset());
        let id = self.next_id();
        let body: super::NodeBody = Arc::new(body);
        self.current().children.push(TreeNode {
            id,
            text: text.into(),
            location,
            decorators,
            semver: None,
            kind: NodeKind::Leaf {
                body: DebugIgnore(body),
            },
        });
        self
    }

    /// Registers a table: a container with one leaf per entry, each running `template` with the
    /// entry's arguments.
    pub fn table<A, F>(
        &mut self,
        text: impl Into<String>,
        location: CodeLocation,
        decorators: impl IntoIterator<Item = Decorator>,
        template: F,
        entries: impl IntoIterator<Item = TableEntry<A>>,
    ) -> &mut Self
    where
        A: Send + Sync + 'static,
        F: Fn(&SpecContext, &A) + Send + Sync + 'static,
    {
        let template = Arc::new(template);
        let entries: Vec<_> = entries.into_iter().collect();
        let table_location = location.clone();
        self.container(text, location, decorators, move |b| {
            for entry in entries {
                let template = Arc::clone(&template);
                let args = entry.args;
                let location = entry.location.unwrap_or_else(|| table_location.clone());
                b.leaf(entry.text, location, entry.decorators, move |ctx| {
                    template(ctx, &args)
                });
            }
        })
    }

    fn hook(
        &mut self,
        kind: HookKind,
        location: CodeLocation,
        decorators: impl IntoIterator<Item = Decorator>,
        body: impl Fn(&SpecContext) + Send + Sync + 'static,
    ) -> &mut Self {
        let decorators: Decorators = decorators.into_iter().collect();
        let location = location.offset_by(decorators.offset());
        let id = self.next_id();
        let body: super::NodeBody = Arc::new(body);
        self.current().hooks.push(Hook {
            id,
            kind,
            location,
            decorators,
            body: DebugIgnore(body),
        });
        self
    }

    /// Registers a hook that runs before each spec in the current container.
    pub fn before_each(
        &mut self,
        location: CodeLocation,
        decorators: impl IntoIterator<Item = Decorator>,
        body: impl Fn(&SpecContext) + Send + Sync + 'static,
    ) -> &mut Self {
        self.hook(HookKind::BeforeEach, location, decorators, body)
    }

    /// Registers a hook that runs after every `BeforeEach`, just before each spec body.
    pub fn just_before_each(
        &mut self,
        location: CodeLocation,
        decorators: impl IntoIterator<Item = Decorator>,
        body: impl Fn(&SpecContext) + Send + Sync + 'static,
    ) -> &mut Self {
        self.hook(HookKind::JustBeforeEach, location, decorators, body)
    }

    /// Registers a hook that runs just after each spec body, before any `AfterEach`.
    pub fn just_after_each(
        &mut self,
        location: CodeLocation,
        decorators: impl IntoIterator<Item = Decorator>,
        body: impl Fn(&SpecContext) + Send + Sync + 'static,
    ) -> &mut Self {
        self.hook(HookKind::JustAfterEach, location, decorators, body)
    }

    /// Registers a hook that runs after each spec in the current container.
    pub fn after_each(
        &mut self,
        location: CodeLocation,
        decorators: impl IntoIterator<Item = Decorator>,
        body: impl Fn(&SpecContext) + Send + Sync + 'static,
    ) -> &mut Self {
        self.hook(HookKind::AfterEach, location, decorators, body)
    }

    /// Registers a hook that runs once before the first spec of an Ordered container.
    pub fn before_all(
        &mut self,
        location: CodeLocation,
        decorators: impl IntoIterator<Item = Decorator>,
        body: impl Fn(&SpecContext) + Send + Sync + 'static,
    ) -> &mut Self {
        self.hook(HookKind::BeforeAll, location, decorators, body)
    }

    /// Registers a hook that runs once after the last spec of an Ordered container.
    pub fn after_all(
        &mut self,
        location: CodeLocation,
        decorators: impl IntoIterator<Item = Decorator>,
        body: impl Fn(&SpecContext) + Send + Sync + 'static,
    ) -> &mut Self {
        self.hook(HookKind::AfterAll, location, decorators, body)
    }

    /// Registers a hook that runs once on every process before any spec.
    pub fn before_suite(
        &mut self,
        location: CodeLocation,
        body: impl Fn(&SpecContext) + Send + Sync + 'static,
    ) -> &mut Self {
        let body: super::NodeBody = Arc::new(body);
        self.set_before_suite(BeforeSuiteNode::Plain {
            location,
            body: DebugIgnore(body),
        })
    }

    /// Registers a two-phase before-suite hook. `primary` runs only on process 1 and its return
    /// value is handed to `all`, which runs on every process once the payload is available.
    pub fn synchronized_before_suite(
        &mut self,
        location: CodeLocation,
        primary: impl Fn(&SpecContext) -> Vec<u8> + Send + Sync + 'static,
        all: impl Fn(&SpecContext, &[u8]) + Send + Sync + 'static,
    ) -> &mut Self {
        let primary: super::PrimaryBody = Arc::new(primary);
        let all: super::PayloadBody = Arc::new(all);
        self.set_before_suite(BeforeSuiteNode::Synchronized {
            location,
            primary: DebugIgnore(primary),
            all: DebugIgnore(all),
        })
    }

    /// Registers a hook that runs once on every process after every spec.
    pub fn after_suite(
        &mut self,
        location: CodeLocation,
        body: impl Fn(&SpecContext) + Send + Sync + 'static,
    ) -> &mut Self {
        let body: super::NodeBody = Arc::new(body);
        self.set_after_suite(AfterSuiteNode::Plain {
            location,
            body: DebugIgnore(body),
        })
    }

    /// Registers a two-phase after-suite hook. `all` runs on every process; `primary` runs on
    /// process 1 once every other process has finished.
    pub fn synchronized_after_suite(
        &mut self,
        location: CodeLocation,
        all: impl Fn(&SpecContext) + Send + Sync + 'static,
        primary: impl Fn(&SpecContext) + Send + Sync + 'static,
    ) -> &mut Self {
        let all: super::NodeBody = Arc::new(all);
        let primary: super::NodeBody = Arc::new(primary);
        self.set_after_suite(AfterSuiteNode::Synchronized {
            location,
            all: DebugIgnore(all),
            primary: DebugIgnore(primary),
        })
    }

    fn suite_hook_allowed(
        &mut self,
        hook: &'static str,
        location: &CodeLocation,
        previous: Option<&CodeLocation>,
    ) -> bool {
        let kind = if !self.stack.is_empty() {
            DecoratorMisuseKind::SuiteHookInContainer { hook }
        } else if let Some(previous) = previous {
            DecoratorMisuseKind::DuplicateSuiteHook {
                hook,
                previous: previous.clone(),
            }
        } else {
            return true;
        };
        self.errors
            .push(DecoratorMisuse::new(hook, location.clone(), kind));
        false
    }

    fn set_before_suite(&mut self, node: BeforeSuiteNode) -> &mut Self {
        let previous = self.before_suite.as_ref().map(|n| n.location().clone());
        if self.suite_hook_allowed("BeforeSuite", node.location(), previous.as_ref()) {
            self.before_suite = Some(node);
        }
        self
    }

    fn set_after_suite(&mut self, node: AfterSuiteNode) -> &mut Self {
        let previous = self.after_suite.as_ref().map(|n| n.location().clone());
        if self.suite_hook_allowed("AfterSuite", node.location(), previous.as_ref()) {
            self.after_suite = Some(node);
        }
        self
    }

    /// Validates the registered tree and builds it into a [`Suite`].
    ///
    /// Every problem found is reported, not just the first.
    pub fn build(self) -> Result<Suite, SuiteBuildError> {
        let Self {
            name,
            root,
            stack,
            mut errors,
            before_suite,
            after_suite,
            ..
        } = self;
        debug_assert!(stack.is_empty(), "build called with open containers");

        let mut root = root.into_node();
        validate_tree(&mut root, &mut errors);
        if !errors.is_empty() {
            debug!(suite = %name, errors = errors.len(), "suite failed to build");
            return Err(SuiteBuildError::new(name, errors));
        }

        Ok(Suite {
            name,
            root,
            before_suite,
            after_suite,
        })
    }
}

/// One entry of a [`SuiteBuilder::table`].
#[derive(Debug)]
pub struct TableEntry<A> {
    text: String,
    location: Option<CodeLocation>,
    decorators: Vec<Decorator>,
    args: A,
}

impl<A> TableEntry<A> {
    /// Creates an entry with the given text and arguments.
    pub fn new(text: impl Into<String>, args: A) -> Self {
        Self {
            text: text.into(),
            location: None,
            decorators: Vec::new(),
            args,
        }
    }

    /// Attaches decorators to the generated leaf.
    pub fn with_decorators(mut self, decorators: impl IntoIterator<Item = Decorator>) -> Self {
        self.decorators.extend(decorators);
        self
    }

    /// Reports the generated leaf at `location` instead of the table's location.
    pub fn at(mut self, location: CodeLocation) -> Self {
        self.location = Some(location);
        self
    }
}
