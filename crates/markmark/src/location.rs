//
// location.rs
//
// Byte offset <-> point conversion over a text, with UTF-16 columns
//

use crate::types::Point;

/// Line table for one text.
///
/// Points use 1-based lines and 1-based UTF-16 columns, matching what the
/// parser emits and what editors send.
pub struct Location<'a> {
    text: &'a str,
    line_starts: Vec<usize>,
}

impl<'a> Location<'a> {
    pub fn new(text: &'a str) -> Self {
        let mut line_starts = vec![0];
        for (idx, byte) in text.bytes().enumerate() {
            if byte == b'\n' {
                line_starts.push(idx + 1);
            }
        }
        Self { text, line_starts }
    }

    pub fn text(&self) -> &'a str {
        self.text
    }

    /// Convert a byte offset to a point. Offsets past the end clamp to the
    /// end of the text; offsets inside a multi-byte character snap back to
    /// its start.
    pub fn to_point(&self, offset: usize) -> Point {
        let mut offset = offset.min(self.text.len());
        while !self.text.is_char_boundary(offset) {
            offset -= 1;
        }

        let line_idx = match self.line_starts.binary_search(&offset) {
            Ok(idx) => idx,
            Err(idx) => idx - 1,
        };
        let line_start = self.line_starts[line_idx];
        let column: usize = self.text[line_start..offset]
            .chars()
            .map(char::len_utf16)
            .sum();

        Point::new(line_idx as u32 + 1, column as u32 + 1)
    }

    /// Convert a point to a byte offset.
    ///
    /// Returns `None` for points outside the text. A column past the end of
    /// its line resolves to the end of that line.
    pub fn to_offset(&self, point: Point) -> Option<usize> {
        if point.line == 0 || point.column == 0 {
            return None;
        }

        let line_idx = point.line as usize - 1;
        let line_start = *self.line_starts.get(line_idx)?;
        let line_end = self
            .line_starts
            .get(line_idx + 1)
            .map(|next| next - 1)
            .unwrap_or(self.text.len());
        let line = &self.text[line_start..line_end];

        Some(line_start + utf16_column_to_byte_offset(line, point.column - 1))
    }
}

/// Convert a 0-based UTF-16 column to a byte offset within `line`.
pub fn utf16_column_to_byte_offset(line: &str, utf16_col: u32) -> usize {
    let mut utf16_count = 0;
    for (byte_idx, ch) in line.char_indices() {
        if utf16_count >= utf16_col as usize {
            return byte_idx;
        }
        utf16_count += ch.len_utf16();
    }
    line.len()
}
