//
// markdown/block.rs
//
// Block structure: front matter, headings, code, containers, definitions, paragraphs
//

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

/// One source line, without its line ending. `start` is the byte offset of
/// `text` in the whole document, so stripped lines stay addressable.
#[derive(Debug, Clone, Copy)]
pub(super) struct Line<'a> {
    pub start: usize,
    pub text: &'a str,
}

impl<'a> Line<'a> {
    pub fn trimmed_end(&self) -> usize {
        self.start + self.text.trim_end().len()
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Leading whitespace width; a tab counts as four columns.
    pub fn indent(&self) -> usize {
        let mut width = 0;
        for b in self.text.bytes() {
            match b {
                b' ' => width += 1,
                b'\t' => width += 4,
                _ => break,
            }
        }
        width
    }

    pub fn slice(&self, from: usize) -> Line<'a> {
        let from = from.min(self.text.len());
        Line {
            start: self.start + from,
            text: &self.text[from..],
        }
    }

    pub fn trim_start(&self) -> Line<'a> {
        let skipped = self.text.len() - self.text.trim_start_matches([' ', '\t']).len();
        self.slice(skipped)
    }

    /// Strip at most `width` leading whitespace bytes.
    fn dedent(&self, width: usize) -> Line<'a> {
        let skipped = self
            .text
            .bytes()
            .take(width)
            .take_while(|b| *b == b' ' || *b == b'\t')
            .count();
        self.slice(skipped)
    }
}

pub(super) fn split_lines(text: &str) -> Vec<Line<'_>> {
    let mut lines = Vec::new();
    let mut start = 0;
    for segment in text.split('\n') {
        let content = segment.strip_suffix('\r').unwrap_or(segment);
        lines.push(Line {
            start,
            text: content,
        });
        start += segment.len() + 1;
    }
    lines
}

#[derive(Debug)]
pub(super) enum Block<'a> {
    Heading {
        depth: u8,
        start: usize,
        end: usize,
        content: Vec<Line<'a>>,
    },
    Paragraph {
        lines: Vec<Line<'a>>,
    },
    Code {
        start: usize,
        end: usize,
    },
    Definition {
        start: usize,
        end: usize,
        identifier: String,
        url: String,
    },
    /// Block quotes and list items.
    Container {
        start: usize,
        end: usize,
        children: Vec<Block<'a>>,
    },
    /// Front matter and thematic breaks.
    Other {
        start: usize,
        end: usize,
    },
}

/// Reference definitions by normalized label; the first definition wins.
pub(super) type Definitions = HashMap<String, String>;

/// Case-fold and collapse whitespace in a link label.
pub(super) fn normalize_label(label: &str) -> String {
    label
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub(super) fn parse_document<'a>(lines: &[Line<'a>], defs: &mut Definitions) -> Vec<Block<'a>> {
    let mut blocks = Vec::new();
    let mut rest = lines;

    if let Some(close) = front_matter_end(lines) {
        blocks.push(Block::Other {
            start: lines[0].start,
            end: lines[close].trimmed_end(),
        });
        rest = &lines[close + 1..];
    }

    blocks.extend(parse_blocks(rest, defs));
    blocks
}

fn front_matter_end(lines: &[Line<'_>]) -> Option<usize> {
    let first = lines.first()?;
    if first.text.trim_end() != "---" {
        return None;
    }
    lines
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, line)| matches!(line.text.trim_end(), "---" | "..."))
        .map(|(idx, _)| idx)
}

pub(super) fn parse_blocks<'a>(lines: &[Line<'a>], defs: &mut Definitions) -> Vec<Block<'a>> {
    let mut blocks = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];

        if line.is_blank() {
            i += 1;
            continue;
        }

        if line.indent() >= 4 {
            let first = i;
            let mut last = i;
            while i < lines.len() && (lines[i].is_blank() || lines[i].indent() >= 4) {
                if !lines[i].is_blank() {
                    last = i;
                }
                i += 1;
            }
            blocks.push(Block::Code {
                start: lines[first].trim_start().start,
                end: lines[last].trimmed_end(),
            });
            i = last + 1;
            continue;
        }

        let content = line.trim_start();

        if let Some((fence_char, fence_len)) = fence_open(content.text) {
            let mut end = lines[lines.len() - 1].trimmed_end();
            let mut next = lines.len();
            for (j, candidate) in lines.iter().enumerate().skip(i + 1) {
                if is_fence_close(candidate, fence_char, fence_len) {
                    end = candidate.trimmed_end();
                    next = j + 1;
                    break;
                }
            }
            blocks.push(Block::Code {
                start: content.start,
                end,
            });
            i = next;
            continue;
        }

        if let Some(heading) = atx_heading(content) {
            blocks.push(heading);
            i += 1;
            continue;
        }

        if is_thematic_break(content.text) {
            blocks.push(Block::Other {
                start: content.start,
                end: content.trimmed_end(),
            });
            i += 1;
            continue;
        }

        if content.text.starts_with('>') {
            let (block, next) = block_quote(lines, i, defs);
            blocks.push(block);
            i = next;
            continue;
        }

        if let Some(marker_end) = list_marker(content.text) {
            let (block, next) = list_item(lines, i, marker_end, defs);
            blocks.push(block);
            i = next;
            continue;
        }

        if let Some(definition) = definition(content, defs) {
            blocks.push(definition);
            i += 1;
            continue;
        }

        let mut para = vec![content];
        let mut setext = None;
        i += 1;
        while i < lines.len() {
            let next = lines[i];
            if next.is_blank() {
                break;
            }
            let next_content = next.trim_start();
            if next.indent() < 4 {
                if let Some(depth) = setext_underline(next_content.text) {
                    setext = Some((depth, next_content.trimmed_end()));
                    i += 1;
                    break;
                }
                if interrupts_paragraph(next_content.text) {
                    break;
                }
            }
            para.push(next_content);
            i += 1;
        }

        match setext {
            Some((depth, end)) => blocks.push(Block::Heading {
                depth,
                start: para[0].start,
                end,
                content: para,
            }),
            None => blocks.push(Block::Paragraph { lines: para }),
        }
    }

    blocks
}

fn fence_open(text: &str) -> Option<(u8, usize)> {
    let fence_char = *text.as_bytes().first()?;
    if fence_char != b'`' && fence_char != b'~' {
        return None;
    }
    let len = text.bytes().take_while(|b| *b == fence_char).count();
    if len < 3 {
        return None;
    }
    if fence_char == b'`' && text[len..].contains('`') {
        return None;
    }
    Some((fence_char, len))
}

fn is_fence_close(line: &Line<'_>, fence_char: u8, fence_len: usize) -> bool {
    if line.indent() >= 4 {
        return false;
    }
    let text = line.text.trim();
    let len = text.bytes().take_while(|b| *b == fence_char).count();
    len >= fence_len && len == text.len()
}

fn atx_heading<'a>(content: Line<'a>) -> Option<Block<'a>> {
    let text = content.text;
    let hashes = text.bytes().take_while(|b| *b == b'#').count();
    if !(1..=6).contains(&hashes) {
        return None;
    }
    match text.as_bytes().get(hashes) {
        None | Some(b' ') | Some(b'\t') => {}
        Some(_) => return None,
    }

    let line_end = text.trim_end().len();
    let content_start = (text.len() - text[hashes..].trim_start().len()).min(line_end.max(hashes));
    let mut content_end = line_end.max(content_start);

    let body = &text[content_start..content_end];
    let stripped = body.trim_end_matches('#');
    if stripped.is_empty() {
        content_end = content_start;
    } else if stripped.len() < body.len() && stripped.ends_with([' ', '\t']) {
        content_end = content_start + stripped.trim_end().len();
    }

    let inner = Line {
        start: content.start + content_start,
        text: &text[content_start..content_end],
    };

    Some(Block::Heading {
        depth: hashes as u8,
        start: content.start,
        end: content.start + line_end,
        content: if inner.text.is_empty() {
            Vec::new()
        } else {
            vec![inner]
        },
    })
}

fn is_thematic_break(text: &str) -> bool {
    let mut marker = None;
    let mut count = 0;
    for ch in text.trim_end().chars() {
        match ch {
            '*' | '-' | '_' => {
                if marker.is_some_and(|m| m != ch) {
                    return false;
                }
                marker = Some(ch);
                count += 1;
            }
            ' ' | '\t' => {}
            _ => return false,
        }
    }
    count >= 3
}

fn setext_underline(text: &str) -> Option<u8> {
    let text = text.trim_end();
    if text.is_empty() {
        return None;
    }
    if text.bytes().all(|b| b == b'=') {
        return Some(1);
    }
    if text.bytes().all(|b| b == b'-') {
        return Some(2);
    }
    None
}

/// Byte length of a list marker plus the whitespace after it.
fn list_marker(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let marker_len = match bytes.first()? {
        b'-' | b'*' | b'+' => 1,
        b'0'..=b'9' => {
            let digits = bytes.iter().take_while(|b| b.is_ascii_digit()).count();
            if digits > 9 || !matches!(bytes.get(digits), Some(b'.') | Some(b')')) {
                return None;
            }
            digits + 1
        }
        _ => return None,
    };

    match bytes.get(marker_len) {
        None => Some(marker_len),
        Some(b' ') | Some(b'\t') => {
            let spaces = bytes[marker_len..]
                .iter()
                .take_while(|b| **b == b' ' || **b == b'\t')
                .count();
            // Five or more spaces start indented code inside the item.
            Some(marker_len + if spaces > 4 { 1 } else { spaces })
        }
        Some(_) => None,
    }
}

fn interrupts_paragraph(text: &str) -> bool {
    fence_open(text).is_some()
        || atx_heading(Line { start: 0, text }).is_some()
        || is_thematic_break(text)
        || text.starts_with('>')
        || (list_marker(text).is_some() && !text.starts_with(|c: char| c.is_ascii_digit())
            && !text.trim_end().chars().all(|c| "-*+".contains(c)))
}

fn block_quote<'a>(lines: &[Line<'a>], first: usize, defs: &mut Definitions) -> (Block<'a>, usize) {
    let mut inner = Vec::new();
    let mut i = first;
    let mut last = first;

    while i < lines.len() {
        let line = lines[i];
        if line.is_blank() {
            break;
        }
        let content = line.trim_start();
        if line.indent() < 4 && content.text.starts_with('>') {
            let stripped = content.slice(1);
            let stripped = if stripped.text.starts_with(' ') {
                stripped.slice(1)
            } else {
                stripped
            };
            inner.push(stripped);
        } else if i > first && !interrupts_paragraph(content.text) {
            // lazy continuation
            inner.push(content);
        } else {
            break;
        }
        last = i;
        i += 1;
    }

    let block = Block::Container {
        start: lines[first].trim_start().start,
        end: lines[last].trimmed_end(),
        children: parse_blocks(&inner, defs),
    };
    (block, i)
}

fn list_item<'a>(
    lines: &[Line<'a>],
    first: usize,
    marker_end: usize,
    defs: &mut Definitions,
) -> (Block<'a>, usize) {
    let line = lines[first];
    let content = line.trim_start();
    let content_indent = (content.start - line.start) + marker_end;

    let mut inner = vec![content.slice(marker_end)];
    let mut i = first + 1;
    let mut last = first;

    while i < lines.len() {
        let next = lines[i];
        if next.is_blank() {
            let continues = lines[i + 1..]
                .iter()
                .find(|l| !l.is_blank())
                .is_some_and(|l| l.indent() >= content_indent);
            if !continues {
                break;
            }
            inner.push(next.dedent(content_indent));
            i += 1;
            continue;
        }

        if next.indent() >= content_indent {
            inner.push(next.dedent(content_indent));
        } else {
            let next_content = next.trim_start();
            let previous_blank = inner.last().is_some_and(|l| l.is_blank());
            if previous_blank
                || interrupts_paragraph(next_content.text)
                || list_marker(next_content.text).is_some()
            {
                break;
            }
            // lazy continuation
            inner.push(next_content);
        }
        last = i;
        i += 1;
    }

    let block = Block::Container {
        start: content.start,
        end: lines[last].trimmed_end(),
        children: parse_blocks(&inner, defs),
    };
    (block, last + 1)
}

fn definition_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"^\[((?:[^\[\]\\]|\\.)+)\]:[ \t]*(?:<([^<>\n]*)>|(\S+))(?:[ \t]+(?:"[^"]*"|'[^']*'|\([^()]*\)))?[ \t]*$"#)
            .unwrap()
    })
}

fn definition<'a>(content: Line<'a>, defs: &mut Definitions) -> Option<Block<'a>> {
    let captures = definition_pattern().captures(content.text)?;
    let label = captures.get(1)?.as_str();
    let identifier = normalize_label(label);
    if identifier.is_empty() {
        return None;
    }
    let url = captures
        .get(2)
        .or_else(|| captures.get(3))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();

    defs.entry(identifier.clone()).or_insert_with(|| url.clone());

    Some(Block::Definition {
        start: content.start,
        end: content.trimmed_end(),
        identifier,
        url,
    })
}
