// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lexer and precedence-climbing parser for label filters.
//!
//! Tokens are recognized with `winnow` combinators. The token stream is then parsed by
//! recursive descent, which keeps error offsets precise.
//!
//! Grammar, from lowest to highest precedence:
//!
//! ```text
//! or      := and (("||" | ",") and)*
//! and     := not ("&&" not)*
//! not     := "!" not | primary
//! primary := "(" or ")" | "/" regex "/" | label | key ":" set-op [argument]
//! ```

use crate::{
    errors::{LabelFilterParseError, LabelFilterParseErrorKind as Kind},
    expression::{LabelExpr, SetOperation, normalize_label},
};
use regex::Regex;
use smol_str::SmolStr;
use winnow::{
    LocatingSlice, Parser,
    combinator::{alt, delimited, repeat, trace},
    stream::Location,
    token::{literal, take_till, take_while},
};

type Span<'a> = LocatingSlice<&'a str>;
type Error = ();
type PResult<T> = winnow::ModalResult<T, Error>;
type ParseResult<T> = Result<T, (Option<usize>, Kind)>;

pub(crate) fn parse(input: &str) -> Result<Option<LabelExpr>, LabelFilterParseError> {
    parse_inner(input).map_err(|(offset, kind)| LabelFilterParseError::new(input, offset, kind))
}

fn parse_inner(input: &str) -> ParseResult<Option<LabelExpr>> {
    let tokens = tokenize(input)?;
    if tokens.len() == 1 {
        // Only the end-of-input token.
        return Ok(None);
    }

    let mut parser = TokenParser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    let next = parser.peek();
    match next.kind {
        TokenKind::Eof => Ok(Some(expr)),
        TokenKind::CloseParen => Err((Some(next.offset), Kind::UnopenedGroup)),
        _ => Err((Some(next.offset), Kind::AdjacentLabels)),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum TokenKind {
    And,
    Or { operator: &'static str },
    Not,
    OpenParen,
    CloseParen,
    Regex(String),
    Label(String),
    Eof,
}

#[derive(Clone, Debug)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn is_special(c: char) -> bool {
    matches!(c, '&' | '|' | '!' | ',' | '(' | ')' | '/')
}

fn whitespace(input: &mut Span<'_>) -> PResult<()> {
    take_while(0.., char::is_whitespace).void().parse_next(input)
}

fn operator(input: &mut Span<'_>) -> PResult<TokenKind> {
    trace(
        "operator",
        alt((
            literal("&&").value(TokenKind::And),
            literal("||").value(TokenKind::Or { operator: "||" }),
            ','.value(TokenKind::Or { operator: "," }),
            '!'.value(TokenKind::Not),
            '('.value(TokenKind::OpenParen),
            ')'.value(TokenKind::CloseParen),
        )),
    )
    .parse_next(input)
}

fn regex_literal(input: &mut Span<'_>) -> PResult<TokenKind> {
    trace(
        "regex_literal",
        delimited('/', take_till(0.., '/'), '/')
            .map(|pattern: &str| TokenKind::Regex(pattern.to_owned())),
    )
    .parse_next(input)
}

/// A label runs until the next special character. Set arguments in braces may contain ','
/// and are consumed whole.
fn label(input: &mut Span<'_>) -> PResult<TokenKind> {
    let set_argument = ('{', take_till(0.., '}'), '}').void();
    let text = take_till(1.., |c: char| is_special(c) || c == '{').void();
    trace(
        "label",
        repeat::<_, _, (), _, _>(1.., alt((set_argument, text)))
            .take()
            .map(|text: &str| TokenKind::Label(text.trim_end().to_owned())),
    )
    .parse_next(input)
}

fn token(input: &mut Span<'_>) -> PResult<TokenKind> {
    alt((operator, regex_literal, label)).parse_next(input)
}

/// Maps the character a token failed to start at onto the error it represents.
fn lex_error(c: char) -> Kind {
    match c {
        '&' => Kind::InvalidToken {
            token: '&',
            suggestion: Some("&&"),
        },
        '|' => Kind::InvalidToken {
            token: '|',
            suggestion: Some("||"),
        },
        '/' => Kind::UnclosedRegex,
        '{' => Kind::UnclosedSetArgument,
        token => Kind::InvalidToken {
            token,
            suggestion: None,
        },
    }
}

fn tokenize(input: &str) -> ParseResult<Vec<Token>> {
    let mut stream = Span::new(input);
    let mut tokens = Vec::new();
    loop {
        // Skipping whitespace never fails.
        let _ = whitespace.parse_next(&mut stream);
        let offset = stream.current_token_start();
        let Some(next) = input[offset..].chars().next() else {
            break;
        };
        match token.parse_next(&mut stream) {
            Ok(kind) => tokens.push(Token { kind, offset }),
            Err(_) => return Err((Some(offset), lex_error(next))),
        }
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        offset: input.len(),
    });
    Ok(tokens)
}

struct TokenParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl TokenParser {
    fn peek(&self) -> &Token {
        // The final token is always Eof, and the parser never advances past it.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> ParseResult<LabelExpr> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek().kind, TokenKind::Or { .. }) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = LabelExpr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> ParseResult<LabelExpr> {
        let mut lhs = self.parse_not()?;
        while self.peek().kind == TokenKind::And {
            self.advance();
            let rhs = self.parse_not()?;
            lhs = LabelExpr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> ParseResult<LabelExpr> {
        if self.peek().kind == TokenKind::Not {
            self.advance();
            let inner = self.parse_not()?;
            return Ok(LabelExpr::Not(Box::new(inner)));
        }
        let expr = self.parse_primary()?;
        self.check_follower()?;
        Ok(expr)
    }

    /// After an operand, only an infix operator, a closing parenthesis or the end of input
    /// may follow.
    fn check_follower(&self) -> ParseResult<()> {
        let next = self.peek();
        match &next.kind {
            TokenKind::And
            | TokenKind::Or { .. }
            | TokenKind::CloseParen
            | TokenKind::Eof => Ok(()),
            TokenKind::Label(text) if text.starts_with(':') => {
                Err((Some(next.offset), Kind::MissingSetKey))
            }
            TokenKind::Label(_) | TokenKind::Regex(_) => {
                Err((Some(next.offset), Kind::AdjacentLabels))
            }
            TokenKind::OpenParen => Err((
                Some(next.offset),
                Kind::InvalidToken {
                    token: '(',
                    suggestion: None,
                },
            )),
            TokenKind::Not => Err((
                Some(next.offset),
                Kind::InvalidToken {
                    token: '!',
                    suggestion: None,
                },
            )),
        }
    }

    fn parse_primary(&mut self) -> ParseResult<LabelExpr> {
        let token = self.advance();
        match token.kind {
            TokenKind::OpenParen => {
                let next = self.peek();
                if next.kind == TokenKind::CloseParen {
                    return Err((Some(next.offset), Kind::EmptyGroup));
                }
                let inner = self.parse_or()?;
                if self.peek().kind == TokenKind::CloseParen {
                    self.advance();
                    Ok(inner)
                } else {
                    Err((Some(token.offset), Kind::UnclosedGroup))
                }
            }
            TokenKind::CloseParen => Err((Some(token.offset), Kind::UnopenedGroup)),
            TokenKind::And => Err((
                Some(token.offset),
                Kind::MissingLeftOperand { operator: "&&" },
            )),
            TokenKind::Or { operator } => {
                Err((Some(token.offset), Kind::MissingLeftOperand { operator }))
            }
            TokenKind::Not => Err((
                Some(token.offset),
                Kind::InvalidToken {
                    token: '!',
                    suggestion: None,
                },
            )),
            TokenKind::Eof => Err((None, Kind::UnexpectedEof)),
            TokenKind::Regex(pattern) => compile_regex(&pattern)
                .map(LabelExpr::Regex)
                .map_err(|kind| (Some(token.offset), kind)),
            TokenKind::Label(text) => match parse_label(&text, token.offset) {
                Err((_, Kind::MissingSetArgument { .. }))
                    if matches!(self.peek().kind, TokenKind::Regex(_)) =>
                {
                    Err((Some(self.peek().offset), Kind::RegexInSetOperation))
                }
                other => other,
            },
        }
    }
}

fn compile_regex(pattern: &str) -> Result<Regex, Kind> {
    Regex::new(&format!("(?i){pattern}")).map_err(|err| Kind::invalid_regex(pattern, &err))
}

/// Splits `text` into whitespace-separated words along with their byte offsets.
fn words(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.split_whitespace()
        .map(move |word| (word.as_ptr() as usize - text.as_ptr() as usize, word))
}

fn parse_label(text: &str, offset: usize) -> ParseResult<LabelExpr> {
    let Some(colon) = text.find(':') else {
        // A set operation name following a plain label means the ':' was forgotten.
        if let Some((word_offset, word)) = words(text)
            .skip(1)
            .find(|(_, word)| SetOperation::from_name(word).is_some())
        {
            return Err((
                Some(offset + word_offset),
                Kind::SetOperationWithoutKey {
                    operation: word.to_owned(),
                },
            ));
        }
        return Ok(LabelExpr::Label(normalize_label(text)));
    };

    let key = text[..colon].trim();
    let rest = &text[colon + 1..];

    // `Feature:Alpha` (no whitespace after the colon) is an ordinary label.
    if rest.chars().next().is_some_and(|c| !c.is_whitespace()) {
        if key.is_empty() {
            return Err((Some(offset), Kind::MissingSetKey));
        }
        return Ok(LabelExpr::Label(normalize_label(text)));
    }

    let rest_offset = offset + colon + 1;
    let mut rest_words = words(rest);
    let Some((op_offset, op_name)) = rest_words.next() else {
        return Err((Some(offset + colon), Kind::MissingSetOperation));
    };
    if key.is_empty() {
        return Err((Some(offset), Kind::MissingSetKey));
    }
    let op_offset = rest_offset + op_offset;
    let op = SetOperation::from_name(op_name).ok_or_else(|| {
        (
            Some(op_offset),
            Kind::InvalidSetOperation {
                operation: op_name.to_owned(),
            },
        )
    })?;

    let argument_start = op_offset - rest_offset + op_name.len();
    let argument = rest[argument_start..].trim();
    let argument_offset = rest_words.next().map(|(o, _)| rest_offset + o);

    let values = if op == SetOperation::IsEmpty {
        if !argument.is_empty() {
            return Err((
                argument_offset,
                Kind::UnexpectedSetArgument {
                    operation: op.name().to_owned(),
                    argument: argument.to_owned(),
                },
            ));
        }
        Vec::new()
    } else if argument.is_empty() {
        return Err((
            Some(op_offset),
            Kind::MissingSetArgument {
                operation: op.name().to_owned(),
            },
        ));
    } else if let Some(group) = argument.strip_prefix('{') {
        let inner = group
            .strip_suffix('}')
            .ok_or((argument_offset, Kind::UnclosedSetArgument))?;
        inner
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| SmolStr::new(v.to_lowercase()))
            .collect()
    } else {
        vec![SmolStr::new(argument.to_lowercase())]
    };

    Ok(LabelExpr::Set {
        key: SmolStr::new(key.to_lowercase()),
        op,
        values,
    })
}
