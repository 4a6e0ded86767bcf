// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Build-time validation of decorators.
//!
//! This is the only place decorator invariants are checked: resolution and execution assume a
//! validated tree.

use super::{CodeLocation, Decorator, Decorators, HookKind, NodeKind, TreeNode};
use crate::errors::{DecoratorMisuse, DecoratorMisuseKind};
use trellis_filtering::{SemVerConstraint, validate_label};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Target {
    Container,
    Leaf,
    Hook,
}

pub(crate) fn validate_tree(root: &mut TreeNode, errors: &mut Vec<DecoratorMisuse>) {
    let mut constraints = Vec::new();
    validate_node(root, &mut constraints, false, errors);
}

fn validate_node(
    node: &mut TreeNode,
    constraints: &mut Vec<(SemVerConstraint, String)>,
    in_ordered: bool,
    errors: &mut Vec<DecoratorMisuse>,
) {
    let target = if node.is_container() {
        Target::Container
    } else {
        Target::Leaf
    };
    check_decorators(&node.text, &node.location, &node.decorators, target, errors);

    let mut pushed = false;
    if let Some(constraint) = node_semver(node, errors) {
        for (ancestor, ancestor_text) in constraints.iter() {
            if !constraint.is_subset_of(ancestor) {
                errors.push(DecoratorMisuse::new(
                    node.text.clone(),
                    node.location.clone(),
                    DecoratorMisuseKind::SemVerNotSubset {
                        constraint: constraint.to_string(),
                        ancestor: ancestor.to_string(),
                        ancestor_text: ancestor_text.clone(),
                    },
                ));
            }
        }
        node.semver = Some(constraint.clone());
        constraints.push((constraint, node.text.clone()));
        pushed = true;
    }

    let in_ordered = in_ordered || node.decorators.is_ordered();
    if let NodeKind::Container { children, hooks } = &mut node.kind {
        for hook in hooks.iter() {
            let name = hook.kind.node_type().name();
            check_decorators(name, &hook.location, &hook.decorators, Target::Hook, errors);
            if matches!(hook.kind, HookKind::BeforeAll | HookKind::AfterAll) && !in_ordered {
                errors.push(DecoratorMisuse::new(
                    name,
                    hook.location.clone(),
                    DecoratorMisuseKind::HookOutsideOrdered { hook: name },
                ));
            }
        }
        for child in children {
            validate_node(child, constraints, in_ordered, errors);
        }
    }

    if pushed {
        constraints.pop();
    }
}

/// Parses the node's semver constraints and ANDs them into one.
fn node_semver(node: &TreeNode, errors: &mut Vec<DecoratorMisuse>) -> Option<SemVerConstraint> {
    let mut combined: Option<SemVerConstraint> = None;
    let mut valid = true;
    for expr in node.decorators.semver_constraints() {
        match SemVerConstraint::parse(expr) {
            Ok(constraint) => {
                combined = Some(match combined {
                    Some(previous) => previous.intersect(&constraint),
                    None => constraint,
                });
            }
            Err(err) => {
                valid = false;
                errors.push(DecoratorMisuse::new(
                    node.text.clone(),
                    node.location.clone(),
                    DecoratorMisuseKind::InvalidSemVer(err),
                ));
            }
        }
    }
    combined.filter(|_| valid)
}

fn check_decorators(
    text: &str,
    location: &CodeLocation,
    decorators: &Decorators,
    target: Target,
    errors: &mut Vec<DecoratorMisuse>,
) {
    let mut push = |kind| errors.push(DecoratorMisuse::new(text, location.clone(), kind));

    if decorators.is_focused() && decorators.is_pending() {
        push(DecoratorMisuseKind::FocusAndPending);
    }
    if decorators.flake_attempts().is_some() && decorators.must_pass_repeatedly().is_some() {
        push(DecoratorMisuseKind::FlakeAndRepeat);
    }

    for decorator in decorators {
        if target == Target::Hook
            && !matches!(decorator, Decorator::OncePerOrdered | Decorator::Offset(_))
        {
            push(DecoratorMisuseKind::DecoratorOnHook {
                decorator: decorator.name(),
            });
            continue;
        }

        let non_positive = match decorator {
            Decorator::FlakeAttempts(n) | Decorator::MustPassRepeatedly(n) => *n == 0,
            Decorator::PollProgressAfter(d)
            | Decorator::PollProgressInterval(d)
            | Decorator::SpecTimeout(d) => d.is_zero(),
            _ => false,
        };
        if non_positive {
            push(DecoratorMisuseKind::NonPositiveArgument {
                decorator: decorator.name(),
            });
        }

        match decorator {
            Decorator::Label(labels) => {
                for label in labels {
                    if let Err(err) = validate_label(label) {
                        push(DecoratorMisuseKind::InvalidLabel(err));
                    }
                }
            }
            Decorator::Ordered if target == Target::Leaf => {
                push(DecoratorMisuseKind::OrderedOnLeaf);
            }
            Decorator::OncePerOrdered if target != Target::Hook => {
                push(DecoratorMisuseKind::OncePerOrderedOnNonHook);
            }
            _ => {}
        }
    }
}
