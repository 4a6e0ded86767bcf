// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use smol_str::SmolStr;
use std::time::Duration;

/// Declarative metadata attached to a container, leaf or hook.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decorator {
    /// Run only focused specs when any node in the suite is focused.
    Focus,

    /// Never run this node or its descendants.
    Pending,

    /// Never run this spec concurrently with any other spec.
    Serial,

    /// Run the container's specs in declaration order, as one indivisible unit.
    Ordered,

    /// Run a setup or teardown hook once per ordered group instead of once per spec.
    OncePerOrdered,

    /// Labels used by label filters. Labels are merged across the ancestor chain.
    Label(Vec<SmolStr>),

    /// Retry a failing spec up to this many attempts in total.
    FlakeAttempts(u32),

    /// Require this many consecutive passing attempts.
    MustPassRepeatedly(u32),

    /// Emit a progress report this long after the spec starts.
    PollProgressAfter(Duration),

    /// Emit a progress report at this interval after the first one.
    PollProgressInterval(Duration),

    /// The deadline for each attempt of the spec.
    SpecTimeout(Duration),

    /// A semantic version constraint, e.g. `>=1.2.0, <2.0.0`.
    SemVerConstraint(String),

    /// Shift the reported source line of the node.
    Offset(i32),
}

impl Decorator {
    /// Convenience constructor for [`Decorator::Label`].
    pub fn labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SmolStr>,
    {
        Self::Label(labels.into_iter().map(Into::into).collect())
    }

    /// Convenience constructor for [`Decorator::SemVerConstraint`].
    pub fn semver(constraint: impl Into<String>) -> Self {
        Self::SemVerConstraint(constraint.into())
    }

    /// Returns the name of the decorator, for messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Focus => "Focus",
            Self::Pending => "Pending",
            Self::Serial => "Serial",
            Self::Ordered => "Ordered",
            Self::OncePerOrdered => "OncePerOrdered",
            Self::Label(_) => "Label",
            Self::FlakeAttempts(_) => "FlakeAttempts",
            Self::MustPassRepeatedly(_) => "MustPassRepeatedly",
            Self::PollProgressAfter(_) => "PollProgressAfter",
            Self::PollProgressInterval(_) => "PollProgressInterval",
            Self::SpecTimeout(_) => "SpecTimeout",
            Self::SemVerConstraint(_) => "SemVerConstraint",
            Self::Offset(_) => "Offset",
        }
    }
}

/// The set of decorators attached to one node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Decorators(Vec<Decorator>);

impl Decorators {
    /// Iterates over the decorators in the order they were attached.
    pub fn iter(&self) -> std::slice::Iter<'_, Decorator> {
        self.0.iter()
    }

    pub(crate) fn is_focused(&self) -> bool {
        self.0.contains(&Decorator::Focus)
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.0.contains(&Decorator::Pending)
    }

    pub(crate) fn is_serial(&self) -> bool {
        self.0.contains(&Decorator::Serial)
    }

    pub(crate) fn is_ordered(&self) -> bool {
        self.0.contains(&Decorator::Ordered)
    }

    pub(crate) fn is_once_per_ordered(&self) -> bool {
        self.0.contains(&Decorator::OncePerOrdered)
    }

    pub(crate) fn labels(&self) -> impl Iterator<Item = &SmolStr> {
        self.0.iter().flat_map(|d| match d {
            Decorator::Label(labels) => labels.as_slice(),
            _ => &[][..],
        })
    }

    // Repeated retry decorators: the last one wins.
    pub(crate) fn flake_attempts(&self) -> Option<u32> {
        self.0.iter().rev().find_map(|d| match d {
            Decorator::FlakeAttempts(n) => Some(*n),
            _ => None,
        })
    }

    pub(crate) fn must_pass_repeatedly(&self) -> Option<u32> {
        self.0.iter().rev().find_map(|d| match d {
            Decorator::MustPassRepeatedly(n) => Some(*n),
            _ => None,
        })
    }

    pub(crate) fn poll_progress_after(&self) -> Option<Duration> {
        self.0.iter().find_map(|d| match d {
            Decorator::PollProgressAfter(d) => Some(*d),
            _ => None,
        })
    }

    pub(crate) fn poll_progress_interval(&self) -> Option<Duration> {
        self.0.iter().find_map(|d| match d {
            Decorator::PollProgressInterval(d) => Some(*d),
            _ => None,
        })
    }

    pub(crate) fn spec_timeout(&self) -> Option<Duration> {
        self.0.iter().find_map(|d| match d {
            Decorator::SpecTimeout(d) => Some(*d),
            _ => None,
        })
    }

    /// Every semver constraint on the node. A spec must satisfy all of them.
    pub(crate) fn semver_constraints(&self) -> impl Iterator<Item = &str> {
        self.0.iter().filter_map(|d| match d {
            Decorator::SemVerConstraint(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub(crate) fn offset(&self) -> i32 {
        self.0
            .iter()
            .filter_map(|d| match d {
                Decorator::Offset(n) => Some(*n),
                _ => None,
            })
            .fold(0i32, i32::saturating_add)
    }
}

impl FromIterator<Decorator> for Decorators {
    fn from_iter<T: IntoIterator<Item = Decorator>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Decorators {
    type Item = &'a Decorator;
    type IntoIter = std::slice::Iter<'a, Decorator>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
