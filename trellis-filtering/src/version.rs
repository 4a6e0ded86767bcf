// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Semantic version constraints attached to specs, and the version they're filtered against.

use crate::errors::SemVerError;
use semver::{BuildMetadata, Comparator, Op, Prerelease, Version, VersionReq};
use std::{cmp::Ordering, fmt, ops::Bound};

/// A semantic version constraint such as `>1.0.0, <3.0.0`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SemVerConstraint {
    expr: String,
    req: VersionReq,
    range: VersionRange,
}

impl SemVerConstraint {
    /// Parses a constraint.
    pub fn parse(input: &str) -> Result<Self, SemVerError> {
        let expr = input.trim();
        if expr.is_empty() {
            return Err(SemVerError::EmptyConstraint);
        }
        let req = VersionReq::parse(expr).map_err(|err| SemVerError::InvalidConstraint {
            input: expr.to_owned(),
            err,
        })?;
        let range = VersionRange::from_req(&req);
        Ok(Self {
            expr: expr.to_owned(),
            req,
            range,
        })
    }

    /// Returns the constraint as written.
    pub fn as_str(&self) -> &str {
        &self.expr
    }

    /// Returns true if `version` satisfies this constraint.
    pub fn matches(&self, version: &Version) -> bool {
        self.req.matches(version)
    }

    /// Returns the constraint that admits only versions both `self` and `other` admit.
    pub fn intersect(&self, other: &SemVerConstraint) -> SemVerConstraint {
        let mut req = self.req.clone();
        req.comparators.extend(other.req.comparators.iter().cloned());
        Self {
            expr: format!("{}, {}", self.expr, other.expr),
            req,
            range: self.range.clone().intersect(other.range.clone()),
        }
    }

    /// Returns true if every version allowed by `self` is also allowed by `other`.
    pub fn is_subset_of(&self, other: &SemVerConstraint) -> bool {
        self.range.is_subset_of(&other.range)
    }
}

impl fmt::Display for SemVerConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

/// The version specs are filtered against. With no version set every spec is selected.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SemVerFilter {
    version: Option<Version>,
}

impl SemVerFilter {
    /// Parses a filter version. The empty string selects every spec.
    pub fn parse(input: &str) -> Result<Self, SemVerError> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(Self::default());
        }
        let version = Version::parse(input).map_err(|err| SemVerError::InvalidVersion {
            input: input.to_owned(),
            err,
        })?;
        Ok(Self {
            version: Some(version),
        })
    }

    /// Returns the version being filtered against, if any.
    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    /// Returns true if every constraint admits the filter version.
    pub fn matches<'a>(&self, constraints: impl IntoIterator<Item = &'a SemVerConstraint>) -> bool {
        match &self.version {
            Some(version) => constraints.into_iter().all(|c| c.matches(version)),
            None => true,
        }
    }
}

/// The single interval of versions a `VersionReq` admits. Comparators in a requirement are
/// all ANDed together, so the result is always one (possibly empty) interval.
#[derive(Clone, Debug, PartialEq, Eq)]
struct VersionRange {
    lower: Bound<Version>,
    upper: Bound<Version>,
}

impl VersionRange {
    fn full() -> Self {
        Self {
            lower: Bound::Included(Version::new(0, 0, 0)),
            upper: Bound::Unbounded,
        }
    }

    fn from_req(req: &VersionReq) -> Self {
        req.comparators
            .iter()
            .map(Self::from_comparator)
            .fold(Self::full(), |acc, range| acc.intersect(range))
    }

    fn from_comparator(c: &Comparator) -> Self {
        let floor = Version {
            major: c.major,
            minor: c.minor.unwrap_or(0),
            patch: c.patch.unwrap_or(0),
            pre: if c.patch.is_some() {
                c.pre.clone()
            } else {
                Prerelease::EMPTY
            },
            build: BuildMetadata::EMPTY,
        };
        let exact = c.minor.is_some() && c.patch.is_some();
        let zero = Version::new(0, 0, 0);
        // The first version past a partial comparator: 1.2 -> 1.3.0, 1 -> 2.0.0.
        let bump = match c.minor {
            Some(minor) if c.patch.is_none() => Version::new(c.major, minor + 1, 0),
            Some(minor) => Version::new(c.major, minor, c.patch.unwrap_or(0) + 1),
            None => Version::new(c.major + 1, 0, 0),
        };

        let (lower, upper) = match c.op {
            Op::Exact | Op::Wildcard if exact => {
                (Bound::Included(floor.clone()), Bound::Included(floor))
            }
            Op::Exact | Op::Wildcard => (Bound::Included(floor), Bound::Excluded(bump)),
            Op::Greater if exact => (Bound::Excluded(floor), Bound::Unbounded),
            Op::Greater => (Bound::Included(bump), Bound::Unbounded),
            Op::GreaterEq => (Bound::Included(floor), Bound::Unbounded),
            Op::Less => (Bound::Included(zero), Bound::Excluded(floor)),
            Op::LessEq if exact => (Bound::Included(zero), Bound::Included(floor)),
            Op::LessEq => (Bound::Included(zero), Bound::Excluded(bump)),
            Op::Tilde => {
                let upper = match c.minor {
                    Some(minor) => Version::new(c.major, minor + 1, 0),
                    None => Version::new(c.major + 1, 0, 0),
                };
                (Bound::Included(floor), Bound::Excluded(upper))
            }
            Op::Caret => {
                let upper = match (c.major, c.minor, c.patch) {
                    (major, _, _) if major > 0 => Version::new(major + 1, 0, 0),
                    (_, None, _) => Version::new(1, 0, 0),
                    (_, Some(minor), _) if minor > 0 => Version::new(0, minor + 1, 0),
                    (_, Some(_), None) => Version::new(0, 1, 0),
                    (_, Some(_), Some(patch)) => Version::new(0, 0, patch + 1),
                };
                (Bound::Included(floor), Bound::Excluded(upper))
            }
            _ => return Self::full(),
        };
        Self { lower, upper }
    }

    fn intersect(self, other: Self) -> Self {
        let lower = if cmp_lower(&self.lower, &other.lower) == Ordering::Less {
            other.lower
        } else {
            self.lower
        };
        let upper = if cmp_upper(&self.upper, &other.upper) == Ordering::Greater {
            other.upper
        } else {
            self.upper
        };
        Self { lower, upper }
    }

    fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (_, Bound::Unbounded) | (Bound::Unbounded, _) => false,
            (Bound::Included(lo), Bound::Included(hi)) => lo > hi,
            (Bound::Included(lo) | Bound::Excluded(lo), Bound::Included(hi) | Bound::Excluded(hi)) => {
                lo >= hi
            }
        }
    }

    fn is_subset_of(&self, other: &Self) -> bool {
        self.is_empty()
            || (cmp_lower(&self.lower, &other.lower) != Ordering::Less
                && cmp_upper(&self.upper, &other.upper) != Ordering::Greater)
    }
}

fn cmp_lower(a: &Bound<Version>, b: &Bound<Version>) -> Ordering {
    match (a, b) {
        (Bound::Unbounded, Bound::Unbounded) => Ordering::Equal,
        (Bound::Unbounded, _) => Ordering::Less,
        (_, Bound::Unbounded) => Ordering::Greater,
        (Bound::Included(x), Bound::Included(y)) | (Bound::Excluded(x), Bound::Excluded(y)) => {
            x.cmp(y)
        }
        (Bound::Included(x), Bound::Excluded(y)) => x.cmp(y).then(Ordering::Less),
        (Bound::Excluded(x), Bound::Included(y)) => x.cmp(y).then(Ordering::Greater),
    }
}

fn cmp_upper(a: &Bound<Version>, b: &Bound<Version>) -> Ordering {
    match (a, b) {
        (Bound::Unbounded, Bound::Unbounded) => Ordering::Equal,
        (Bound::Unbounded, _) => Ordering::Greater,
        (_, Bound::Unbounded) => Ordering::Less,
        (Bound::Included(x), Bound::Included(y)) | (Bound::Excluded(x), Bound::Excluded(y)) => {
            x.cmp(y)
        }
        (Bound::Included(x), Bound::Excluded(y)) => x.cmp(y).then(Ordering::Greater),
        (Bound::Excluded(x), Bound::Included(y)) => x.cmp(y).then(Ordering::Less),
    }
}
