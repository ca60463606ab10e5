//! Hierarchical topic matching.
//!
//! Topics and patterns are split into segments on `/`. In a pattern:
//!
//! - a literal segment matches only the identical segment,
//! - `+` matches exactly one arbitrary segment,
//! - `#` matches zero or more trailing segments and may only appear as the
//!   final segment.
//!
//! Wildcards must occupy a whole segment. Topics themselves are matched
//! literally.

use std::borrow::Borrow;
use std::fmt;

use crate::error::{Error, Result};

/// Segment separator.
pub const SEPARATOR: char = '/';

/// Single-level wildcard segment.
pub const SINGLE_LEVEL: &str = "+";

/// Multi-level wildcard segment.
pub const MULTI_LEVEL: &str = "#";

/// Check that a pattern is well formed.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(Error::invalid_pattern(pattern, "pattern is empty"));
    }

    let segments: Vec<&str> = pattern.split(SEPARATOR).collect();
    let last = segments.len() - 1;

    for (index, segment) in segments.iter().enumerate() {
        if segment.contains(MULTI_LEVEL) {
            if *segment != MULTI_LEVEL {
                return Err(Error::invalid_pattern(
                    pattern,
                    "multi-level wildcard must occupy a whole segment",
                ));
            }
            if index != last {
                return Err(Error::invalid_pattern(
                    pattern,
                    "multi-level wildcard is only valid as the final segment",
                ));
            }
        } else if segment.contains(SINGLE_LEVEL) && *segment != SINGLE_LEVEL {
            return Err(Error::invalid_pattern(
                pattern,
                "single-level wildcard must occupy a whole segment",
            ));
        }
    }

    Ok(())
}

/// Check whether `topic` matches `pattern`.
///
/// A `#` that is not the final pattern segment never matches.
pub fn matches(topic: &str, pattern: &str) -> bool {
    let mut topic_segments = topic.split(SEPARATOR);
    let mut pattern_segments = pattern.split(SEPARATOR).peekable();

    while let Some(expected) = pattern_segments.next() {
        if expected == MULTI_LEVEL {
            return pattern_segments.peek().is_none();
        }
        match topic_segments.next() {
            Some(actual) if expected == SINGLE_LEVEL || expected == actual => {}
            _ => return false,
        }
    }

    topic_segments.next().is_none()
}

/// Check whether `topic` matches any of `patterns`. Stops at the first hit.
pub fn matches_any<I, S>(topic: &str, patterns: I) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    patterns
        .into_iter()
        .any(|pattern| matches(topic, pattern.as_ref()))
}

/// A validated topic pattern.
///
/// The only way to obtain one is [`TopicPattern::parse`], so a subscription
/// set made of `TopicPattern`s never holds a malformed pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPattern(String);

impl TopicPattern {
    /// Validate and wrap a pattern.
    pub fn parse(pattern: &str) -> Result<Self> {
        validate_pattern(pattern)?;
        Ok(Self(pattern.to_string()))
    }

    /// The pattern text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether `topic` matches this pattern.
    pub fn matches(&self, topic: &str) -> bool {
        matches(topic, &self.0)
    }

    /// Whether the pattern contains any wildcard segment.
    pub fn has_wildcards(&self) -> bool {
        self.0
            .split(SEPARATOR)
            .any(|segment| segment == SINGLE_LEVEL || segment == MULTI_LEVEL)
    }
}

impl AsRef<str> for TopicPattern {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for TopicPattern {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
