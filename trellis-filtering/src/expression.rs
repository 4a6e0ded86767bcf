// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::{LabelFilterParseError, LabelValidationError},
    parsing::parse,
};
use regex::Regex;
use smol_str::SmolStr;
use std::{collections::BTreeSet, fmt};

/// Characters that have meaning in the label filter language and so cannot appear in labels.
pub const RESERVED_LABEL_CHARACTERS: &[char] = &['&', '|', '!', ',', '(', ')', '/'];

/// A set operation applied to the values of `key:value` labels.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SetOperation {
    /// No label with the key exists.
    IsEmpty,
    /// At least one of the given values is present.
    ContainsAny,
    /// Every given value is present.
    ContainsAll,
    /// The values present are exactly the given values.
    ConsistsOf,
    /// Every value present is one of the given values.
    IsSubsetOf,
}

impl SetOperation {
    pub(crate) fn from_name(name: &str) -> Option<Self> {
        let op = match name.to_ascii_lowercase().as_str() {
            "isempty" => Self::IsEmpty,
            "containsany" => Self::ContainsAny,
            "containsall" => Self::ContainsAll,
            "consistsof" => Self::ConsistsOf,
            "issubsetof" => Self::IsSubsetOf,
            _ => return None,
        };
        Some(op)
    }

    /// Returns the name of this operation as written in filter expressions.
    pub fn name(self) -> &'static str {
        match self {
            Self::IsEmpty => "isEmpty",
            Self::ContainsAny => "containsAny",
            Self::ContainsAll => "containsAll",
            Self::ConsistsOf => "consistsOf",
            Self::IsSubsetOf => "isSubsetOf",
        }
    }

    fn apply(self, present: &BTreeSet<&str>, given: &[SmolStr]) -> bool {
        match self {
            Self::IsEmpty => present.is_empty(),
            Self::ContainsAny => given.iter().any(|v| present.contains(v.as_str())),
            Self::ContainsAll => given.iter().all(|v| present.contains(v.as_str())),
            Self::ConsistsOf => {
                let given: BTreeSet<&str> = given.iter().map(|v| v.as_str()).collect();
                *present == given
            }
            Self::IsSubsetOf => present
                .iter()
                .all(|p| given.iter().any(|v| v.as_str() == *p)),
        }
    }
}

impl fmt::Display for SetOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A parsed label filter expression.
#[derive(Clone, Debug)]
pub enum LabelExpr {
    /// Matches a label exactly (after trimming and case folding).
    Label(SmolStr),
    /// Matches if any label matches the regular expression.
    Regex(Regex),
    /// A set operation over the values of `key:value` labels.
    Set {
        key: SmolStr,
        op: SetOperation,
        values: Vec<SmolStr>,
    },
    /// Negation.
    Not(Box<LabelExpr>),
    /// Both sides must match.
    And(Box<LabelExpr>, Box<LabelExpr>),
    /// Either side must match.
    Or(Box<LabelExpr>, Box<LabelExpr>),
}

impl PartialEq for LabelExpr {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Label(a), Self::Label(b)) => a == b,
            (Self::Regex(a), Self::Regex(b)) => a.as_str() == b.as_str(),
            (
                Self::Set { key, op, values },
                Self::Set {
                    key: key2,
                    op: op2,
                    values: values2,
                },
            ) => key == key2 && op == op2 && values == values2,
            (Self::Not(a), Self::Not(b)) => a == b,
            (Self::And(a1, a2), Self::And(b1, b2)) | (Self::Or(a1, a2), Self::Or(b1, b2)) => {
                a1 == b1 && a2 == b2
            }
            _ => false,
        }
    }
}

impl Eq for LabelExpr {}

impl LabelExpr {
    fn matches(&self, labels: &NormalizedLabels) -> bool {
        match self {
            Self::Label(label) => labels.full.iter().any(|l| l == label),
            Self::Regex(regex) => labels.raw.iter().any(|l| regex.is_match(l)),
            Self::Set { key, op, values } => {
                let present: BTreeSet<&str> = labels
                    .pairs
                    .iter()
                    .filter(|(k, _)| k == key)
                    .map(|(_, v)| v.as_str())
                    .collect();
                op.apply(&present, values)
            }
            Self::Not(expr) => !expr.matches(labels),
            Self::And(a, b) => a.matches(labels) && b.matches(labels),
            Self::Or(a, b) => a.matches(labels) || b.matches(labels),
        }
    }
}

/// A label filter: a boolean expression over the labels attached to a spec.
///
/// The empty filter matches every spec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelFilter {
    input: String,
    expr: Option<LabelExpr>,
}

impl LabelFilter {
    /// Parses a label filter expression.
    pub fn parse(input: impl Into<String>) -> Result<Self, LabelFilterParseError> {
        let input = input.into();
        let expr = parse(&input)?;
        Ok(Self { input, expr })
    }

    /// Returns a filter that matches every spec.
    pub fn match_all() -> Self {
        Self {
            input: String::new(),
            expr: None,
        }
    }

    /// Returns true if this filter matches every spec.
    pub fn is_match_all(&self) -> bool {
        self.expr.is_none()
    }

    /// Returns the expression as originally written.
    pub fn as_str(&self) -> &str {
        &self.input
    }

    /// Returns the parsed expression, or `None` for the empty filter.
    pub fn expr(&self) -> Option<&LabelExpr> {
        self.expr.as_ref()
    }

    /// Evaluates the filter against a set of labels.
    pub fn matches<I, S>(&self, labels: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        match &self.expr {
            Some(expr) => expr.matches(&NormalizedLabels::new(labels)),
            None => true,
        }
    }
}

impl fmt::Display for LabelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.input)
    }
}

struct NormalizedLabels {
    raw: Vec<String>,
    full: Vec<SmolStr>,
    pairs: Vec<(SmolStr, SmolStr)>,
}

impl NormalizedLabels {
    fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut raw = Vec::new();
        let mut full = Vec::new();
        let mut pairs = Vec::new();
        for label in labels {
            let label = label.as_ref().trim();
            raw.push(label.to_owned());
            full.push(normalize_label(label));
            if let Some((key, value)) = label.split_once(':') {
                pairs.push((
                    SmolStr::new(key.trim().to_lowercase()),
                    SmolStr::new(value.trim().to_lowercase()),
                ));
            }
        }
        Self { raw, full, pairs }
    }
}

/// Normalizes a label for comparison: trims it, trims either side of the first `:` and
/// lowercases the result.
pub fn normalize_label(label: &str) -> SmolStr {
    match label.split_once(':') {
        Some((key, value)) => {
            SmolStr::new(format!("{}:{}", key.trim(), value.trim()).to_lowercase())
        }
        None => SmolStr::new(label.trim().to_lowercase()),
    }
}

/// Checks that a label can be attached to a spec, returning its trimmed form.
pub fn validate_label(label: &str) -> Result<SmolStr, LabelValidationError> {
    let trimmed = label.trim();
    if trimmed.is_empty() {
        return Err(LabelValidationError::Empty);
    }
    if let Some(reserved) = trimmed
        .chars()
        .find(|c| RESERVED_LABEL_CHARACTERS.contains(c))
    {
        return Err(LabelValidationError::ReservedCharacter {
            label: trimmed.to_owned(),
            reserved,
        });
    }
    if let Some((key, value)) = trimmed.split_once(':') {
        if key.trim().is_empty() || value.trim().is_empty() {
            return Err(LabelValidationError::EmptyKeyOrValue {
                label: trimmed.to_owned(),
            });
        }
    }
    Ok(SmolStr::new(trimmed))
}
