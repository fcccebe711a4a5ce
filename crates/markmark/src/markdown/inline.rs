//
// markdown/inline.rs
//
// Inline scanning: code spans, links, images, references, autolinks and tags
//

use crate::location::Location;
use crate::processor::{Node, NodeKind};
use crate::types::Range;

use super::block::{normalize_label, Definitions, Line};

/// Inline content of one block, joined with `\n`, plus the way back to
/// document offsets for every byte of it.
pub(super) struct Segments {
    buf: String,
    /// (offset in `buf`, offset in the document) per line
    starts: Vec<(usize, usize)>,
}

impl Segments {
    pub fn new(lines: &[Line<'_>]) -> Self {
        let mut buf = String::new();
        let mut starts = Vec::with_capacity(lines.len());
        for (idx, line) in lines.iter().enumerate() {
            if idx > 0 {
                buf.push('\n');
            }
            starts.push((buf.len(), line.start));
            buf.push_str(line.text);
        }
        Self { buf, starts }
    }

    pub fn text(&self) -> &str {
        &self.buf
    }

    /// Map an offset in the joined buffer to a document offset. A joining
    /// newline maps to the end of the line before it.
    pub fn source_offset(&self, offset: usize) -> usize {
        let idx = match self.starts.binary_search_by(|(buf_start, _)| buf_start.cmp(&offset)) {
            Ok(idx) => idx,
            Err(0) => 0,
            Err(idx) => idx - 1,
        };
        match self.starts.get(idx) {
            Some((buf_start, src_start)) => src_start + (offset - buf_start),
            None => offset,
        }
    }
}

pub(super) struct InlineParser<'a> {
    segments: &'a Segments,
    location: &'a Location<'a>,
    definitions: &'a Definitions,
}

impl<'a> InlineParser<'a> {
    pub fn new(segments: &'a Segments, location: &'a Location<'a>, definitions: &'a Definitions) -> Self {
        Self {
            segments,
            location,
            definitions,
        }
    }

    pub fn parse_all(&self) -> Vec<Node> {
        self.parse(0, self.segments.text().len())
    }

    fn range(&self, start: usize, end: usize) -> Range {
        Range::new(
            self.location.to_point(self.segments.source_offset(start)),
            self.location.to_point(self.segments.source_offset(end)),
        )
    }

    fn parse(&self, start: usize, end: usize) -> Vec<Node> {
        let text = self.segments.text();
        let bytes = text.as_bytes();
        let mut nodes = Vec::new();
        let mut text_start = start;
        let mut i = start;

        while i < end {
            let parsed = match bytes[i] {
                b'\\' => {
                    i += if i + 1 < end && bytes[i + 1].is_ascii_punctuation() { 2 } else { 1 };
                    continue;
                }
                b'`' => self.code_span(i, end),
                b'!' if bytes.get(i + 1) == Some(&b'[') => self.link(i + 1, end, true),
                b'[' => self.link(i, end, false),
                b'<' => self.autolink(i, end),
                b'#' => self.tag(i, end),
                b'h' => self.bare_url(i, start, end),
                _ => None,
            };

            match parsed {
                Some((node_start, node, next)) => {
                    if text_start < node_start {
                        nodes.push(Node::new(NodeKind::Text, self.range(text_start, node_start)));
                    }
                    nodes.push(node);
                    i = next;
                    text_start = next;
                }
                None if bytes[i] == b'`' => {
                    // an unmatched backtick run stays literal as a whole
                    i += bytes[i..end].iter().take_while(|b| **b == b'`').count();
                }
                None => i += 1,
            }
        }

        if text_start < end {
            nodes.push(Node::new(NodeKind::Text, self.range(text_start, end)));
        }

        nodes
    }

    fn code_span(&self, open: usize, end: usize) -> Option<(usize, Node, usize)> {
        let bytes = self.segments.text().as_bytes();
        let run = bytes[open..end].iter().take_while(|b| **b == b'`').count();

        let mut i = open + run;
        while i < end {
            if bytes[i] == b'`' {
                let close_run = bytes[i..end].iter().take_while(|b| **b == b'`').count();
                if close_run == run {
                    let next = i + close_run;
                    return Some((open, Node::new(NodeKind::Code, self.range(open, next)), next));
                }
                i += close_run;
            } else {
                i += 1;
            }
        }
        None
    }

    /// Index of the `]` closing the bracket at `open`.
    fn matching_bracket(&self, open: usize, end: usize) -> Option<usize> {
        let bytes = self.segments.text().as_bytes();
        let mut depth = 0usize;
        let mut i = open;
        while i < end {
            match bytes[i] {
                b'\\' => {
                    i += 2;
                    continue;
                }
                b'[' => depth += 1,
                b']' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            }
            i += 1;
        }
        None
    }

    fn link(&self, open: usize, end: usize, image: bool) -> Option<(usize, Node, usize)> {
        let text = self.segments.text();
        let bytes = text.as_bytes();
        let close = self.matching_bracket(open, end)?;
        let node_start = if image { open - 1 } else { open };

        if bytes.get(close + 1) == Some(&b'(') && close + 1 < end {
            if let Some((url, next)) = self.destination(close + 2, end) {
                let range = self.range(node_start, next);
                let node = if image {
                    Node::new(NodeKind::Image { url }, range)
                } else {
                    Node::with_children(NodeKind::Link { url }, range, self.parse(open + 1, close))
                };
                return Some((node_start, node, next));
            }
        }

        let label = &text[open + 1..close];

        // [label][ref] and [label][]
        if bytes.get(close + 1) == Some(&b'[') && close + 1 < end {
            if let Some(ref_close) = text[close + 2..end].find(['[', ']']).map(|idx| close + 2 + idx) {
                if bytes[ref_close] == b']' {
                    let reference = &text[close + 2..ref_close];
                    let key = if reference.trim().is_empty() { label } else { reference };
                    if let Some(node) = self.reference(node_start, open, close, ref_close + 1, key, image) {
                        return Some((node_start, node, ref_close + 1));
                    }
                }
            }
        }

        // [label]
        self.reference(node_start, open, close, close + 1, label, image)
            .map(|node| (node_start, node, close + 1))
    }

    fn reference(
        &self,
        node_start: usize,
        open: usize,
        close: usize,
        next: usize,
        key: &str,
        image: bool,
    ) -> Option<Node> {
        let identifier = normalize_label(key);
        if identifier.is_empty() || !self.definitions.contains_key(&identifier) {
            return None;
        }
        let range = self.range(node_start, next);
        if image {
            return Some(Node::new(NodeKind::Other, range));
        }
        Some(Node::with_children(
            NodeKind::LinkReference { identifier },
            range,
            self.parse(open + 1, close),
        ))
    }

    /// Parse `dest "title")` starting after the `(`; returns the destination
    /// and the offset just past the `)`.
    fn destination(&self, start: usize, end: usize) -> Option<(String, usize)> {
        let text = self.segments.text();
        let bytes = text.as_bytes();
        let skip_ws = |mut i: usize| {
            while i < end && matches!(bytes[i], b' ' | b'\t' | b'\n') {
                i += 1;
            }
            i
        };

        let mut i = skip_ws(start);
        let url;

        if i < end && bytes[i] == b'<' {
            let close = text[i + 1..end].find(['>', '\n']).map(|idx| i + 1 + idx)?;
            if bytes[close] != b'>' {
                return None;
            }
            url = text[i + 1..close].to_string();
            i = close + 1;
        } else {
            let url_start = i;
            let mut depth = 0usize;
            while i < end {
                match bytes[i] {
                    b'\\' if i + 1 < end => i += 1,
                    b'(' => depth += 1,
                    b')' if depth == 0 => break,
                    b')' => depth -= 1,
                    b' ' | b'\t' | b'\n' => break,
                    b if b.is_ascii_control() => return None,
                    _ => {}
                }
                i += 1;
            }
            url = text[url_start..i].to_string();
        }

        let url_end = i;
        i = skip_ws(i);
        if i < end && i > url_end && matches!(bytes[i], b'"' | b'\'' | b'(') {
            let closing = if bytes[i] == b'(' { b')' } else { bytes[i] };
            let title_end = bytes[i + 1..end].iter().position(|b| *b == closing)?;
            i = skip_ws(i + 1 + title_end + 1);
        }

        if i < end && bytes[i] == b')' {
            Some((url, i + 1))
        } else {
            None
        }
    }

    fn autolink(&self, open: usize, end: usize) -> Option<(usize, Node, usize)> {
        let text = self.segments.text();
        let close = text[open + 1..end].find(['>', '<', ' ', '\n']).map(|idx| open + 1 + idx)?;
        if text.as_bytes()[close] != b'>' {
            return None;
        }
        let inner = &text[open + 1..close];
        let (scheme, rest) = inner.split_once(':')?;
        let valid_scheme = (2..=32).contains(&scheme.len())
            && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '-'));
        if !valid_scheme || rest.is_empty() {
            return None;
        }

        let node = Node::with_children(
            NodeKind::Link {
                url: inner.to_string(),
            },
            self.range(open, close + 1),
            vec![Node::new(NodeKind::Text, self.range(open + 1, close))],
        );
        Some((open, node, close + 1))
    }

    fn tag(&self, hash: usize, end: usize) -> Option<(usize, Node, usize)> {
        let text = self.segments.text();
        let name_len: usize = text[hash + 1..end]
            .chars()
            .take_while(|c| !is_tag_terminator(*c))
            .map(char::len_utf8)
            .sum();
        if name_len == 0 {
            return None;
        }
        let next = hash + 1 + name_len;
        let node = Node::new(
            NodeKind::Tag {
                name: text[hash + 1..next].to_string(),
            },
            self.range(hash, next),
        );
        Some((hash, node, next))
    }

    fn bare_url(&self, start: usize, block_start: usize, end: usize) -> Option<(usize, Node, usize)> {
        let text = self.segments.text();
        let rest = &text[start..end];
        if !(rest.starts_with("http://") || rest.starts_with("https://")) {
            return None;
        }
        if start > block_start {
            let prev = text.as_bytes()[start - 1];
            if !(prev.is_ascii_whitespace() || matches!(prev, b'(' | b'*' | b'_' | b'~')) {
                return None;
            }
        }

        let mut len = rest
            .find(|c: char| c.is_whitespace() || c == '<')
            .unwrap_or(rest.len());
        loop {
            let candidate = &rest[..len];
            if candidate.ends_with(['.', ',', ':', ';', '!', '?', '"', '\'', '*', '_', '~']) {
                len -= 1;
            } else if candidate.ends_with(')')
                && candidate.matches(')').count() > candidate.matches('(').count()
            {
                len -= 1;
            } else {
                break;
            }
        }

        let scheme_len = if rest.starts_with("https://") { 8 } else { 7 };
        if len <= scheme_len {
            return None;
        }

        let next = start + len;
        let node = Node::with_children(
            NodeKind::Link {
                url: text[start..next].to_string(),
            },
            self.range(start, next),
            vec![Node::new(NodeKind::Text, self.range(start, next))],
        );
        Some((start, node, next))
    }
}

fn is_tag_terminator(c: char) -> bool {
    c.is_whitespace() || matches!(c, ',' | '[' | ']' | '(' | ')')
}
