// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Selecting which specs run.
//!
//! The main structure in this module is [`SpecFilterCriteria`], which is compiled from a
//! [`SuiteConfig`].

use crate::{
    config::SuiteConfig,
    errors::{FilterBuildError, LocationSelectorParseError},
    list::Spec,
    reporter::{AppliedFilters, SkipReason},
    tree::CodeLocation,
};
use regex::Regex;
use std::{fmt, str::FromStr};
use trellis_filtering::{LabelFilter, SemVerFilter};

/// Whether a spec is selected to run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilterMatch {
    /// The spec runs.
    Matches,

    /// The spec, or an ancestor, is Pending.
    Pending,

    /// The spec was filtered out.
    Mismatch {
        /// Why the spec was filtered out.
        reason: SkipReason,
    },
}

impl FilterMatch {
    /// Returns true if the spec runs.
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Matches)
    }
}

/// A selector of the form `file-regex[:line[-line]]`, matched against the declared locations of a
/// spec and its containers.
#[derive(Clone, Debug)]
pub struct LocationSelector {
    input: String,
    file: Regex,
    lines: Option<(u32, u32)>,
}

impl LocationSelector {
    /// Returns true if `location` is in the selected file and line range.
    pub fn matches(&self, location: &CodeLocation) -> bool {
        if !self.file.is_match(&location.file) {
            return false;
        }
        match self.lines {
            Some((start, end)) => (start..=end).contains(&location.line),
            None => true,
        }
    }
}

impl FromStr for LocationSelector {
    type Err = LocationSelectorParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid_range = |lines: &str| LocationSelectorParseError::InvalidLineRange {
            input: input.to_owned(),
            lines: lines.to_owned(),
        };

        // Only a suffix made of digits and at most one '-' is a line range, so that ':' may appear
        // in the file pattern.
        let (file, lines) = match input.rsplit_once(':') {
            Some((file, lines))
                if !lines.is_empty()
                    && lines.chars().all(|c| c.is_ascii_digit() || c == '-') =>
            {
                let range = match lines.split_once('-') {
                    Some((start, end)) => (start.parse(), end.parse()),
                    None => (lines.parse(), lines.parse()),
                };
                match range {
                    (Ok(start), Ok(end)) if start <= end => (file, Some((start, end))),
                    _ => return Err(invalid_range(lines)),
                }
            }
            _ => (input, None),
        };

        let file = Regex::new(file).map_err(|err| LocationSelectorParseError::InvalidFilePattern {
            input: input.to_owned(),
            err,
        })?;
        Ok(Self {
            input: input.to_owned(),
            file,
            lines,
        })
    }
}

impl fmt::Display for LocationSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.input)
    }
}

/// The compiled criteria deciding which specs run.
#[derive(Clone, Debug, Default)]
pub struct SpecFilterCriteria {
    label_filter: Option<LabelFilter>,
    semver_filter: SemVerFilter,
    focus: Vec<Regex>,
    skip: Vec<Regex>,
    focus_locations: Vec<LocationSelector>,
    skip_locations: Vec<LocationSelector>,
}

impl SpecFilterCriteria {
    /// Creates criteria that select every spec.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles the filters in `config`.
    pub fn from_config(config: &SuiteConfig) -> Result<Self, FilterBuildError> {
        let label_filter = if config.label_filter.trim().is_empty() {
            None
        } else {
            Some(LabelFilter::parse(config.label_filter.as_str())?)
        };
        let semver_filter = SemVerFilter::parse(&config.semver_filter)?;

        let patterns = |kind: &'static str, patterns: &[String]| {
            patterns
                .iter()
                .map(|pattern| {
                    Regex::new(pattern).map_err(|err| FilterBuildError::TextPattern {
                        kind,
                        pattern: pattern.clone(),
                        err,
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        };
        let selectors = |selectors: &[String]| {
            selectors
                .iter()
                .map(|s| s.parse::<LocationSelector>())
                .collect::<Result<Vec<_>, _>>()
        };

        Ok(Self {
            label_filter,
            semver_filter,
            focus: patterns("focus", &config.focus)?,
            skip: patterns("skip", &config.skip)?,
            focus_locations: selectors(&config.focus_file)?,
            skip_locations: selectors(&config.skip_file)?,
        })
    }

    /// Returns the filters as they were written, for reports.
    pub fn applied(&self) -> AppliedFilters {
        AppliedFilters {
            label_filter: self
                .label_filter
                .as_ref()
                .map(|f| f.as_str().to_owned())
                .unwrap_or_default(),
            semver_filter: self
                .semver_filter
                .version()
                .map(|v| v.to_string())
                .unwrap_or_default(),
            focus: self.focus.iter().map(|r| r.as_str().to_owned()).collect(),
            skip: self.skip.iter().map(|r| r.as_str().to_owned()).collect(),
            focus_file: self.focus_locations.iter().map(|s| s.to_string()).collect(),
            skip_file: self.skip_locations.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Decides whether `spec` runs. `has_programmatic_focus` is true if any node in the suite is
    /// focused.
    ///
    /// Pending wins over everything else; after that the first filter to reject the spec gives
    /// the reason.
    pub fn filter_match(&self, spec: &Spec<'_>, has_programmatic_focus: bool) -> FilterMatch {
        if spec.is_pending() {
            return FilterMatch::Pending;
        }

        let mismatch = |reason| FilterMatch::Mismatch { reason };

        if has_programmatic_focus && !spec.is_focused() {
            return mismatch(SkipReason::Focus);
        }

        if let Some(label_filter) = &self.label_filter
            && !label_filter.matches(spec.labels())
        {
            return mismatch(SkipReason::LabelFilter);
        }

        if !self.semver_filter.matches(spec.semver_constraint()) {
            return mismatch(SkipReason::SemVer);
        }

        if !self.focus.is_empty() || !self.skip.is_empty() {
            let full_text = spec.full_text();
            let focused = self.focus.is_empty() || self.focus.iter().any(|r| r.is_match(&full_text));
            let skipped = self.skip.iter().any(|r| r.is_match(&full_text));
            if !focused || skipped {
                return mismatch(SkipReason::TextFilter);
            }
        }

        if !self.focus_locations.is_empty() || !self.skip_locations.is_empty() {
            let any_location = |selectors: &[LocationSelector]| {
                spec.locations()
                    .any(|location| selectors.iter().any(|s| s.matches(location)))
            };
            let focused = self.focus_locations.is_empty() || any_location(&self.focus_locations);
            let skipped = any_location(&self.skip_locations);
            if !focused || skipped {
                return mismatch(SkipReason::LocationFilter);
            }
        }

        FilterMatch::Matches
    }
}
