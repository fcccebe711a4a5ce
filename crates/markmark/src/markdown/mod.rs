//
// markdown/mod.rs
//
// Default markdown processor: node tree plus tags, links and heading anchors
//

mod block;
mod inline;
pub mod slug;

use url::Url;

use crate::location::Location;
use crate::processor::{
    AnchorEntry, LinkEntry, Node, NodeKind, ParseTree, ProcessError, Processor, TagEntry,
};
use crate::types::{Point, Range};

use block::{Block, Definitions};
use inline::{InlineParser, Segments};
use slug::Slugger;

/// Markdown processor backing the engine by default.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkdownProcessor;

impl MarkdownProcessor {
    pub fn new() -> Self {
        Self
    }
}

impl Processor for MarkdownProcessor {
    fn process(&self, _uri: &Url, text: &str) -> Result<ParseTree, ProcessError> {
        Ok(parse(text))
    }
}

/// Parse `text` into a node tree and extract its references.
pub fn parse(text: &str) -> ParseTree {
    let location = Location::new(text);
    let lines = block::split_lines(text);
    let mut definitions = Definitions::new();
    let blocks = block::parse_document(&lines, &mut definitions);

    let builder = TreeBuilder {
        location: &location,
        definitions: &definitions,
    };
    let children = blocks.iter().map(|b| builder.node(b)).collect();
    let root = Node::with_children(
        NodeKind::Root,
        Range::new(Point::new(1, 1), location.to_point(text.len())),
        children,
    );

    let mut extracted = Extracted {
        tags: Vec::new(),
        links: Vec::new(),
        anchors: Vec::new(),
        slugger: Slugger::new(),
        location: &location,
        definitions: &definitions,
    };
    extracted.visit(&root);
    extracted.anchors.push(AnchorEntry::document());

    ParseTree {
        tags: extracted.tags,
        links: extracted.links,
        anchors: extracted.anchors,
        root,
    }
}

struct TreeBuilder<'a> {
    location: &'a Location<'a>,
    definitions: &'a Definitions,
}

impl TreeBuilder<'_> {
    fn range(&self, start: usize, end: usize) -> Range {
        Range::new(self.location.to_point(start), self.location.to_point(end))
    }

    fn inline(&self, lines: &[block::Line<'_>]) -> Vec<Node> {
        if lines.is_empty() {
            return Vec::new();
        }
        let segments = Segments::new(lines);
        InlineParser::new(&segments, self.location, self.definitions).parse_all()
    }

    fn node(&self, block: &Block<'_>) -> Node {
        match block {
            Block::Heading {
                depth,
                start,
                end,
                content,
            } => Node::with_children(
                NodeKind::Heading { depth: *depth },
                self.range(*start, *end),
                self.inline(content),
            ),
            Block::Paragraph { lines } => {
                let start = lines.first().map(|l| l.start).unwrap_or_default();
                let end = lines.last().map(|l| l.trimmed_end()).unwrap_or(start);
                let mut trimmed = lines.clone();
                if let Some(last) = trimmed.last_mut() {
                    last.text = last.text.trim_end();
                }
                Node::with_children(
                    NodeKind::Paragraph,
                    self.range(start, end),
                    self.inline(&trimmed),
                )
            }
            Block::Code { start, end } => Node::new(NodeKind::Code, self.range(*start, *end)),
            Block::Definition {
                start,
                end,
                identifier,
                url,
            } => Node::new(
                NodeKind::Definition {
                    identifier: identifier.clone(),
                    url: url.clone(),
                },
                self.range(*start, *end),
            ),
            Block::Container {
                start,
                end,
                children,
            } => Node::with_children(
                NodeKind::Other,
                self.range(*start, *end),
                children.iter().map(|child| self.node(child)).collect(),
            ),
            Block::Other { start, end } => Node::new(NodeKind::Other, self.range(*start, *end)),
        }
    }
}

struct Extracted<'a> {
    tags: Vec<TagEntry>,
    links: Vec<LinkEntry>,
    anchors: Vec<AnchorEntry>,
    slugger: Slugger,
    location: &'a Location<'a>,
    definitions: &'a Definitions,
}

impl Extracted<'_> {
    /// Preorder walk, so entries come out in document order.
    fn visit(&mut self, node: &Node) {
        match &node.kind {
            NodeKind::Tag { name } => self.tags.push(TagEntry {
                position: node.position,
                value: name.clone(),
            }),
            NodeKind::Link { url } | NodeKind::Image { url } => self.links.push(LinkEntry {
                position: node.position,
                target_uri: url.clone(),
            }),
            NodeKind::LinkReference { identifier } => {
                if let Some(url) = self.definitions.get(identifier) {
                    self.links.push(LinkEntry {
                        position: node.position,
                        target_uri: url.clone(),
                    });
                }
            }
            NodeKind::Heading { .. } => {
                let text = node.text_content(self.location);
                let slug = self.slugger.slug(&text);
                self.anchors.push(AnchorEntry {
                    position: node.position,
                    uri: format!("#{}", slug),
                });
            }
            _ => {}
        }

        for child in &node.children {
            self.visit(child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(sl: u32, sc: u32, el: u32, ec: u32) -> Range {
        Range::new(Point::new(sl, sc), Point::new(el, ec))
    }

    #[test]
    fn test_extracts_notes_document() {
        let markdown = "
  # Ideas

  #foo

  [](./NOTES.md)
  [[PUNCH_LINE]]

  ## Connect This and That

  To get super powers.


  [](./NOTES.md#deeplink)

  [local link](#ideas)

  ![img](./image.png)
  [image link](./img.svg)

  [external-uri](https://foobar.com)
  ";
        let tree = parse(markdown);

        assert_eq!(tree.links.len(), 6);
        assert_eq!(tree.anchors.len(), 3);
        assert_eq!(tree.tags.len(), 1);

        let anchors: Vec<_> = tree.anchors.iter().map(|a| a.uri.as_str()).collect();
        assert_eq!(anchors, vec!["#ideas", "#connect-this-and-that", ""]);

        let targets: Vec<_> = tree.links.iter().map(|l| l.target_uri.as_str()).collect();
        assert_eq!(
            targets,
            vec![
                "./NOTES.md",
                "./NOTES.md#deeplink",
                "#ideas",
                "./image.png",
                "./img.svg",
                "https://foobar.com"
            ]
        );
    }

    #[test]
    fn test_external_only() {
        let tree = parse("\n  [external-uri](https://foobar.com)\n  ");
        assert_eq!(tree.links.len(), 1);
        assert_eq!(tree.anchors.len(), 1);
        assert!(tree.tags.is_empty());
    }

    #[test]
    fn test_tags_and_link_fragments() {
        let markdown = "
# heading

#some-tag, #other_tag
#tag no-tag
[](./rel#link)
![](./rel.png#image)
";
        let tree = parse(markdown);
        let tags: Vec<_> = tree.tags.iter().map(|t| t.value.as_str()).collect();
        assert_eq!(tags, vec!["some-tag", "other_tag", "tag"]);
        assert_eq!(tree.tags[0].position, r(4, 1, 4, 10));

        let targets: Vec<_> = tree.links.iter().map(|l| l.target_uri.as_str()).collect();
        assert_eq!(targets, vec!["./rel#link", "./rel.png#image"]);
    }

    #[test]
    fn test_document_anchor_is_last() {
        let tree = parse("# hello world!");
        assert_eq!(tree.anchors.len(), 2);
        assert_eq!(tree.anchors[0].uri, "#hello-world");
        assert_eq!(tree.anchors[0].position, r(1, 1, 1, 15));
        assert_eq!(tree.anchors[1], AnchorEntry::document());
        assert!(tree.links.is_empty());
    }

    #[test]
    fn test_reference_links_resolve_through_definitions() {
        let tree = parse("See [notes][n] and [missing][x].\n\n[n]: ./NOTES.md#top\n");
        assert_eq!(tree.links.len(), 1);
        assert_eq!(tree.links[0].target_uri, "./NOTES.md#top");
        assert_eq!(tree.links[0].position, r(1, 5, 1, 15));
    }

    #[test]
    fn test_duplicate_headings_get_unique_slugs() {
        let tree = parse("# Notes\n\n# Notes\n\n## Tagged #foo\n");
        let anchors: Vec<_> = tree.anchors.iter().map(|a| a.uri.as_str()).collect();
        assert_eq!(anchors, vec!["#notes", "#notes-1", "#tagged-foo", ""]);
        assert_eq!(tree.tags.len(), 1);
    }

    #[test]
    fn test_opaque_regions() {
        let markdown = "---\ntags: [#nope]\n---\n\n```md\n#nope [x](./X.md)\n```\n\nInline `#nope` and #yes\n";
        let tree = parse(markdown);
        let tags: Vec<_> = tree.tags.iter().map(|t| t.value.as_str()).collect();
        assert_eq!(tags, vec!["yes"]);
        assert!(tree.links.is_empty());
    }

    #[test]
    fn test_completion_fixture_tree() {
        let base = "#fo # #fooop\n\n[]()\n[foo]()\n[](#)\n# local\n[](./AN)\n[![asd](./asd.png)](./AN)\n";
        let tree = parse(base);

        let leaf = tree.root.find_leaf(Point::new(1, 3)).unwrap();
        assert_eq!(leaf.kind, NodeKind::Tag { name: "fo".into() });
        assert_eq!(leaf.position, r(1, 1, 1, 4));

        let leaf = tree.root.find_leaf(Point::new(1, 6)).unwrap();
        assert_eq!(leaf.kind, NodeKind::Text);

        let leaf = tree.root.find_leaf(Point::new(7, 7)).unwrap();
        assert_eq!(leaf.kind, NodeKind::Link { url: "./AN".into() });
        assert_eq!(leaf.position, r(7, 1, 7, 9));

        let leaf = tree.root.find_leaf(Point::new(8, 24)).unwrap();
        assert_eq!(leaf.kind, NodeKind::Link { url: "./AN".into() });

        let anchors: Vec<_> = tree.anchors.iter().map(|a| a.uri.as_str()).collect();
        assert_eq!(anchors, vec!["#local", ""]);
    }

    #[test]
    fn test_empty_heading() {
        let tree = parse("#\n");
        let leaf = tree.root.find_leaf(Point::new(1, 2)).unwrap();
        assert_eq!(leaf.kind, NodeKind::Heading { depth: 1 });
        assert_eq!(tree.anchors[0].uri, "#");
    }

    #[test]
    fn test_empty_document() {
        let tree = parse("");
        assert_eq!(tree.anchors, vec![AnchorEntry::document()]);
        assert!(tree.root.children.is_empty());
    }

    #[test]
    fn test_processor_trait() {
        let uri = Url::parse("file:///notes/IDEAS.md").unwrap();
        let tree = MarkdownProcessor::new().process(&uri, "#idea").unwrap();
        assert_eq!(tree.tags.len(), 1);
    }
}
