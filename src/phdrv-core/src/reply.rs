// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Expected shapes of device replies.

use std::fmt;

/// What the caller of a receive expects the device to answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyShape {
    /// Anything, including an empty reply.
    FreeText,
    /// One non-empty line.
    Line,
    /// At least `n` whitespace separated fields.
    Fields(usize),
    /// A reply starting with this prefix (ASCII case-insensitive).
    Prefixed(String),
    /// Exactly this text (ASCII case-insensitive).
    Exact(String),
}

impl ReplyShape {
    pub fn prefixed(prefix: impl Into<String>) -> Self {
        Self::Prefixed(prefix.into())
    }

    pub fn exact(text: impl Into<String>) -> Self {
        Self::Exact(text.into())
    }

    /// Check `text` against the shape. `text` is already trimmed.
    pub fn parse(&self, text: &str) -> Option<Reply> {
        let reply = Reply::new(text);
        let matches = match self {
            Self::FreeText => true,
            Self::Line => !reply.text.is_empty(),
            Self::Fields(n) => reply.fields.len() >= *n,
            Self::Prefixed(prefix) => reply
                .text
                .get(..prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(prefix)),
            Self::Exact(expected) => reply.text.eq_ignore_ascii_case(expected),
        };
        matches.then_some(reply)
    }
}

impl fmt::Display for ReplyShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FreeText => write!(f, "free text"),
            Self::Line => write!(f, "non-empty line"),
            Self::Fields(n) => write!(f, "{} fields", n),
            Self::Prefixed(prefix) => write!(f, "reply starting with \"{}\"", prefix),
            Self::Exact(text) => write!(f, "\"{}\"", text),
        }
    }
}

/// A parsed reply, owned by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reply {
    pub text: String,
    pub fields: Vec<String>,
}

impl Reply {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            fields: text.split_whitespace().map(str::to_string).collect(),
        }
    }

    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }

    /// Parse field `index` as a number.
    pub fn number<T: std::str::FromStr>(&self, index: usize) -> Option<T> {
        self.field(index)?.parse().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_text_accepts_empty() {
        let reply = ReplyShape::FreeText.parse("").unwrap();
        assert!(reply.is_empty());
        assert!(reply.fields.is_empty());
    }

    #[test]
    fn test_line_rejects_empty() {
        assert!(ReplyShape::Line.parse("").is_none());
        assert_eq!(ReplyShape::Line.parse("ID 7").unwrap().text, "ID 7");
    }

    #[test]
    fn test_fields_and_numbers() {
        let reply = ReplyShape::Fields(2).parse("12  -4").unwrap();
        assert_eq!(reply.number::<i64>(0), Some(12));
        assert_eq!(reply.number::<i64>(1), Some(-4));
        assert_eq!(reply.number::<i64>(2), None);
        assert!(ReplyShape::Fields(3).parse("12 -4").is_none());
    }

    #[test]
    fn test_prefix_and_exact_ignore_case() {
        assert!(ReplyShape::prefixed("ACK").parse("ack ok").is_some());
        assert!(ReplyShape::prefixed("ACK").parse("NA").is_none());
        assert!(ReplyShape::exact("ECHOOK").parse("EchoOk").is_some());
        assert!(ReplyShape::exact("ECHOOK").parse("ECHONG").is_none());
    }
}
