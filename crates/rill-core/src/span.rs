//! Source positions attached to instructions.
//!
//! Every annotated instruction carries a [`Span`] so diagnostics can point
//! back at the source text that produced it.

use std::fmt;

/// A region of one source line.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Span {
    /// Line number (1-indexed).
    pub line: u32,
    /// Column number (1-indexed, byte-based).
    pub col: u32,
    /// Length in bytes.
    pub len: u32,
}

impl Span {
    #[inline]
    pub fn new(line: u32, col: u32, len: u32) -> Self {
        Self { line, col, len }
    }

    /// A span covering a whole line, used when only the line is known.
    #[inline]
    pub fn line(line: u32) -> Self {
        Self { line, col: 0, len: 0 }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Extend `self` to also cover `other` when both sit on the same line.
    pub fn merge(self, other: Span) -> Span {
        if self.line != other.line || self.col == 0 {
            return self;
        }
        let start = self.col.min(other.col);
        let end = (self.col + self.len).max(other.col + other.len);
        Span::new(self.line, start, end - start)
    }

    /// Render the marker line placed under the source text of this span.
    ///
    /// `offset` is the number of columns already used by a prefix on the
    /// rendered line. Spans without a column produce an empty string.
    pub fn caret_line(&self, offset: usize) -> String {
        if self.col == 0 {
            return String::new();
        }
        let pad = offset + self.col as usize - 1;
        let marks = self.len.max(1) as usize;
        format!("{}{}", " ".repeat(pad), "^".repeat(marks))
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}
