//
// processor.rs
//
// Parser collaborator: turns document text into tags, links, anchors and a node tree
//

use url::Url;

use crate::types::{Point, Range};

/// Node kinds the parser distinguishes.
///
/// Completion routing matches on this exhaustively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    Paragraph,
    Heading { depth: u8 },
    Text,
    Tag { name: String },
    Link { url: String },
    Image { url: String },
    LinkReference { identifier: String },
    Definition { identifier: String, url: String },
    Code,
    Other,
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Root => "root",
            NodeKind::Paragraph => "paragraph",
            NodeKind::Heading { .. } => "heading",
            NodeKind::Text => "text",
            NodeKind::Tag { .. } => "tag",
            NodeKind::Link { .. } => "link",
            NodeKind::Image { .. } => "image",
            NodeKind::LinkReference { .. } => "linkReference",
            NodeKind::Definition { .. } => "definition",
            NodeKind::Code => "code",
            NodeKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub kind: NodeKind,
    pub position: Range,
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(kind: NodeKind, position: Range) -> Self {
        Self {
            kind,
            position,
            children: Vec::new(),
        }
    }

    pub fn with_children(kind: NodeKind, position: Range, children: Vec<Node>) -> Self {
        Self {
            kind,
            position,
            children,
        }
    }

    /// Concatenated text content, the way heading slugs are computed.
    pub fn text_content(&self, source: &crate::location::Location<'_>) -> String {
        match &self.kind {
            NodeKind::Text | NodeKind::Code => {
                let start = source.to_offset(self.position.start);
                let end = source.to_offset(self.position.end);
                match (start, end) {
                    (Some(start), Some(end)) if start <= end => source.text()[start..end].to_string(),
                    _ => String::new(),
                }
            }
            NodeKind::Tag { name } => name.clone(),
            _ => self
                .children
                .iter()
                .map(|child| child.text_content(source))
                .collect(),
        }
    }

    /// The innermost node containing `point` none of whose children contain
    /// it. When siblings overlap at a shared boundary the later one wins.
    pub fn find_leaf(&self, point: Point) -> Option<&Node> {
        let mut found = None;
        self.visit_leaves(point, &mut found);
        found
    }

    fn visit_leaves<'a>(&'a self, point: Point, found: &mut Option<&'a Node>) {
        if !self.position.contains_point(point) {
            return;
        }
        let child_contains = self
            .children
            .iter()
            .any(|child| child.position.contains_point(point));
        if !child_contains {
            *found = Some(self);
        }
        for child in &self.children {
            child.visit_leaves(point, found);
        }
    }
}

/// A `#name` occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagEntry {
    pub position: Range,
    pub value: String,
}

/// A link as written, target not yet resolved against the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEntry {
    pub position: Range,
    pub target_uri: String,
}

/// An anchor relative to its document: `#slug`, or empty for the document itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorEntry {
    pub position: Range,
    pub uri: String,
}

impl AnchorEntry {
    /// The synthetic anchor standing for the whole document.
    pub fn document() -> Self {
        Self {
            position: Range::DOCUMENT,
            uri: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTree {
    pub tags: Vec<TagEntry>,
    pub links: Vec<LinkEntry>,
    pub anchors: Vec<AnchorEntry>,
    pub root: Node,
}

impl ParseTree {
    /// Tree of an empty document: no tags or links, only the document anchor.
    pub fn empty() -> Self {
        let start = Point::new(1, 1);
        Self {
            tags: Vec::new(),
            links: Vec::new(),
            anchors: vec![AnchorEntry::document()],
            root: Node::new(NodeKind::Root, Range::new(start, start)),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to parse {uri}: {message}")]
    Parse { uri: Url, message: String },
}

/// Parser collaborator.
///
/// Implementations must append the document anchor
/// ([`AnchorEntry::document`]) to every tree they return.
pub trait Processor: Send + Sync {
    fn process(&self, uri: &Url, text: &str) -> Result<ParseTree, ProcessError>;
}
