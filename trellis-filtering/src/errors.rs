// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced while parsing label filters, labels and semantic version constraints.

use miette::{Diagnostic, SourceSpan};
use thiserror::Error;

/// An error that occurred while parsing a label filter expression.
#[derive(Clone, Debug, Error, Diagnostic, PartialEq, Eq)]
#[error("failed to parse label filter `{input}`: {kind}")]
#[non_exhaustive]
pub struct LabelFilterParseError {
    /// The input string.
    #[source_code]
    pub input: String,

    /// The location of the error, if one could be determined.
    ///
    /// Errors for truncated expressions (for example `A &&`) do not have a location.
    #[label("{}", kind)]
    pub span: Option<SourceSpan>,

    /// What went wrong.
    pub kind: LabelFilterParseErrorKind,
}

impl LabelFilterParseError {
    pub(crate) fn new(
        input: impl Into<String>,
        offset: Option<usize>,
        kind: LabelFilterParseErrorKind,
    ) -> Self {
        Self {
            input: input.into(),
            span: offset.map(|offset| (offset, 0).into()),
            kind,
        }
    }

    /// Returns the byte offset into the input at which the error was detected.
    pub fn offset(&self) -> Option<usize> {
        self.span.map(|span| span.offset())
    }
}

/// The kind of a [`LabelFilterParseError`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum LabelFilterParseErrorKind {
    #[error("mismatched '(': could not find matching ')'")]
    UnclosedGroup,

    #[error("mismatched ')': could not find matching '('")]
    UnopenedGroup,

    #[error("found empty '()' group")]
    EmptyGroup,

    #[error("unexpected end of expression")]
    UnexpectedEof,

    #[error("missing closing '/' for regular expression")]
    UnclosedRegex,

    #[error("invalid regular expression: {message}")]
    InvalidRegex { message: String },

    #[error(
        "invalid token '{token}'{}",
        .suggestion.map(|s| format!(". Did you mean '{s}'?")).unwrap_or_default()
    )]
    InvalidToken {
        token: char,
        suggestion: Option<&'static str>,
    },

    #[error("found two adjacent labels: you need an operator between them")]
    AdjacentLabels,

    #[error("operator '{operator}' missing left hand operand")]
    MissingLeftOperand { operator: &'static str },

    #[error("missing set operation")]
    MissingSetOperation,

    #[error("missing set key")]
    MissingSetKey,

    #[error("invalid set operation '{operation}'")]
    InvalidSetOperation { operation: String },

    #[error("found set operation '{operation}' but did not provide a set key. Did you forget the ':'?")]
    SetOperationWithoutKey { operation: String },

    #[error("{operation} does not take arguments, found '{argument}'")]
    UnexpectedSetArgument { operation: String, argument: String },

    #[error("set operation '{operation}' is missing an argument")]
    MissingSetArgument { operation: String },

    #[error("missing closing '}}' for set argument")]
    UnclosedSetArgument,

    #[error("set operations do not support regular expressions")]
    RegexInSetOperation,
}

impl LabelFilterParseErrorKind {
    pub(crate) fn invalid_regex(pattern: &str, fallback: &regex::Error) -> Self {
        // regex-syntax produces a more precise message than regex's own Display impl.
        let message = match regex_syntax::Parser::new().parse(pattern) {
            Ok(_) => fallback.to_string(),
            Err(regex_syntax::Error::Parse(err)) => err.kind().to_string(),
            Err(regex_syntax::Error::Translate(err)) => err.kind().to_string(),
            Err(err) => err.to_string(),
        };
        Self::InvalidRegex { message }
    }
}

/// An invalid label attached to a spec or container.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum LabelValidationError {
    #[error("labels cannot be empty")]
    Empty,

    #[error("label `{label}` contains reserved character '{reserved}'")]
    ReservedCharacter { label: String, reserved: char },

    #[error("label `{label}` has an empty key or value around ':'")]
    EmptyKeyOrValue { label: String },
}

/// An error that occurred while parsing a semantic version constraint or filter version.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SemVerError {
    #[error("semantic version constraint cannot be empty")]
    EmptyConstraint,

    #[error("`{input}` is not a valid semantic version constraint")]
    InvalidConstraint {
        input: String,
        #[source]
        err: semver::Error,
    },

    #[error("`{input}` is not a valid semantic version")]
    InvalidVersion {
        input: String,
        #[source]
        err: semver::Error,
    },
}
