//
// types.rs
//
// Shared value types: points, ranges, locations, completions, lint results
//

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

/// A point in a document.
///
/// Lines and columns are 1-based; columns count UTF-16 code units. The
/// all-zero point only appears inside [`Range::DOCUMENT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Point {
    pub line: u32,
    pub column: u32,
}

impl Point {
    pub const fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A span between two points. Both ends are compared inclusively by
/// [`Range::contains`]; `end` is the point just past the last character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Range {
    pub start: Point,
    pub end: Point,
}

impl Range {
    /// The synthetic range standing for "the whole document".
    pub const DOCUMENT: Range = Range {
        start: Point::new(0, 0),
        end: Point::new(0, 0),
    };

    pub const fn new(start: Point, end: Point) -> Self {
        Self { start, end }
    }

    /// A collapsed range at a single point.
    pub const fn at(point: Point) -> Self {
        Self {
            start: point,
            end: point,
        }
    }

    pub fn is_document(&self) -> bool {
        *self == Self::DOCUMENT
    }

    /// Whether `other` lies within this range.
    ///
    /// The document range contains everything.
    pub fn contains(&self, other: &Range) -> bool {
        if self.is_document() {
            return true;
        }

        let start_ok = self.start.line < other.start.line
            || (self.start.line == other.start.line && self.start.column <= other.start.column);
        let end_ok = self.end.line > other.end.line
            || (self.end.line == other.end.line && self.end.column >= other.end.column);

        start_ok && end_ok
    }

    pub fn contains_point(&self, point: Point) -> bool {
        self.contains(&Range::at(point))
    }
}

impl From<Point> for Range {
    fn from(point: Point) -> Self {
        Range::at(point)
    }
}

/// A query location: a document and a point or span inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationRef {
    pub uri: Url,
    pub position: Range,
}

impl LocationRef {
    pub fn new(uri: Url, position: impl Into<Range>) -> Self {
        Self {
            uri,
            position: position.into(),
        }
    }
}

/// A query answer: something located in a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Positioned {
    pub uri: Url,
    pub position: Range,
}

/// Replacement applied when a completion is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Replace {
    pub position: Range,
    pub new_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Completion {
    pub label: String,
    pub replace: Replace,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Completion {
    /// A completion whose label doubles as the inserted text.
    pub fn replacing(text: String, position: Range) -> Self {
        Self {
            label: text.clone(),
            replace: Replace {
                position,
                new_text: text,
            },
            detail: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    #[default]
    Warn,
    Info,
    Hint,
}

impl Severity {
    /// Parse a severity name, accepting the long LSP spellings too.
    pub fn parse(s: &str) -> Severity {
        match s.to_lowercase().as_str() {
            "error" => Severity::Error,
            "warn" | "warning" => Severity::Warn,
            "info" | "information" => Severity::Info,
            "hint" => Severity::Hint,
            _ => Severity::Warn,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Error => "error",
            Severity::Warn => "warn",
            Severity::Info => "info",
            Severity::Hint => "hint",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LintResult {
    pub position: Range,
    pub message: String,
    pub severity: Severity,
}

/// All lint results for one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LintReport {
    pub uri: Url,
    pub results: Vec<LintResult>,
}
