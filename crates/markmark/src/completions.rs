//
// completions.rs
//
// Tag and link target completion
//

use indexmap::IndexSet;
use url::Url;

use crate::indexer::Indexer;
use crate::location::Location;
use crate::processor::{Node, NodeKind};
use crate::references::References;
use crate::types::{Completion, LocationRef, Point, Range};

const TAG_TRIGGER: char = '#';

#[derive(Clone)]
pub struct Completions {
    indexer: Indexer,
    references: References,
}

impl Completions {
    pub fn new(indexer: Indexer, references: References) -> Self {
        Self {
            indexer,
            references,
        }
    }

    pub async fn get(&self, location: &LocationRef) -> Vec<Completion> {
        let item = match self.indexer.get(&location.uri).await {
            Ok(Some(item)) => item,
            Ok(None) => return Vec::new(),
            Err(err) => {
                log::warn!("completions :: cannot resolve {}: {}", location.uri, err);
                return Vec::new();
            }
        };

        let point = location.position.start;
        let Some(node) = item.parse_tree.root.find_leaf(point) else {
            return Vec::new();
        };

        let source = Location::new(&item.value);
        let request = Request {
            uri: &location.uri,
            point,
            node,
            source: &source,
            root: self.indexer.find_root(&location.uri),
        };

        match &node.kind {
            NodeKind::Text | NodeKind::Heading { .. } => self.complete_trigger(&request),
            NodeKind::Tag { .. } => self.complete_tag(&request),
            NodeKind::Link { .. } => self.complete_link(&request),
            NodeKind::Root
            | NodeKind::Paragraph
            | NodeKind::Image { .. }
            | NodeKind::LinkReference { .. }
            | NodeKind::Definition { .. }
            | NodeKind::Code
            | NodeKind::Other => {
                log::debug!("completions :: unsupported node {}", node.kind.name());
                Vec::new()
            }
        }
    }

    /// Tag names after a bare `#`, replacing the `#`.
    fn complete_trigger(&self, request: &Request<'_>) -> Vec<Completion> {
        let Some(offset) = request.source.to_offset(request.point) else {
            return Vec::new();
        };
        let before = &request.source.text()[..offset];
        if !before.ends_with(TAG_TRIGGER) {
            return Vec::new();
        }

        let replace = Range::new(
            request.source.to_point(offset - TAG_TRIGGER.len_utf8()),
            request.point,
        );
        self.tag_names(request, |_| true)
            .into_iter()
            .map(|name| Completion::replacing(format!("#{}", name), replace))
            .collect()
    }

    /// Tag names containing what has been typed of the tag so far.
    fn complete_tag(&self, request: &Request<'_>) -> Vec<Completion> {
        let (Some(start), Some(cursor)) = (
            request.source.to_offset(request.node.position.start),
            request.source.to_offset(request.point),
        ) else {
            return Vec::new();
        };

        let prefix = request
            .source
            .text()
            .get(start + TAG_TRIGGER.len_utf8()..cursor)
            .unwrap_or_default();

        let replace = request.node.position;
        self.tag_names(request, |name| name != prefix && name.contains(prefix))
            .into_iter()
            .map(|name| Completion::replacing(format!("#{}", name), replace))
            .collect()
    }

    fn tag_names(&self, request: &Request<'_>, keep: impl Fn(&str) -> bool) -> Vec<String> {
        self.references
            .get_tags()
            .into_iter()
            .filter(|tag| keep(tag.name.as_str()))
            .filter(|tag| {
                tag.references
                    .iter()
                    .any(|reference| self.indexer.find_root(&reference.uri) == request.root)
            })
            .map(|tag| tag.name)
            .collect()
    }

    /// Link targets relative to the current document, inside `(...)`.
    fn complete_link(&self, request: &Request<'_>) -> Vec<Completion> {
        let source = request.source;
        let (Some(start), Some(end), Some(cursor)) = (
            source.to_offset(request.node.position.start),
            source.to_offset(request.node.position.end),
            source.to_offset(request.point),
        ) else {
            return Vec::new();
        };
        let Some(text) = source.text().get(start..end) else {
            return Vec::new();
        };

        let Some(paren) = text.rfind('(') else {
            return Vec::new();
        };
        // still inside the label
        if cursor.saturating_sub(start) <= paren {
            return Vec::new();
        }

        let url_start = start + paren + 1;
        let url_end = if text.ends_with(')') { end - 1 } else { end };
        let prefix = source
            .text()
            .get(url_start..cursor.min(url_end))
            .unwrap_or_default();
        let replace = Range::new(source.to_point(url_start), source.to_point(url_end));

        let mut candidates = IndexSet::new();
        for anchor in self.references.get_anchors() {
            if self.indexer.find_root(&anchor.document) != request.root {
                continue;
            }

            let relative = if anchor.document == *request.uri {
                String::new()
            } else {
                relative_document_path(request.uri, &anchor.document)
            };
            let hash = anchor
                .uri
                .fragment()
                .filter(|fragment| !fragment.is_empty())
                .map(|fragment| format!("#{}", fragment))
                .unwrap_or_default();

            if relative.is_empty() && hash.is_empty() {
                continue;
            }
            candidates.insert(format!("{}{}", relative, hash));
        }

        candidates
            .into_iter()
            .filter(|candidate| candidate.contains(prefix))
            .map(|candidate| Completion::replacing(candidate, replace))
            .collect()
    }
}

struct Request<'a> {
    uri: &'a Url,
    point: Point,
    node: &'a Node,
    source: &'a Location<'a>,
    root: Option<Url>,
}

/// POSIX-style path from the directory of `from` to `to`, always starting
/// with `.`.
fn relative_document_path(from: &Url, to: &Url) -> String {
    let from_dir = directory_segments(from);
    let to_dir = directory_segments(to);
    let file_name = to.path_segments().and_then(|s| s.last()).unwrap_or_default();

    let common = from_dir
        .iter()
        .zip(&to_dir)
        .take_while(|(a, b)| a == b)
        .count();

    let mut parts: Vec<&str> = Vec::new();
    parts.extend(std::iter::repeat("..").take(from_dir.len() - common));
    parts.extend(to_dir[common..].iter().copied());
    parts.push(file_name);

    let path = parts.join("/");
    if path.starts_with('.') {
        path
    } else {
        format!("./{}", path)
    }
}

fn directory_segments(uri: &Url) -> Vec<&str> {
    let mut segments: Vec<&str> = uri.path_segments().map(|s| s.collect()).unwrap_or_default();
    segments.pop();
    segments.retain(|segment| !segment.is_empty());
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::file_source::MemoryFileSource;
    use crate::markdown::MarkdownProcessor;
    use crate::workqueue::Workqueue;
    use std::sync::Arc;
    use std::time::Duration;

    const BASE: &str = "#fo # #fooop\n\n[]()\n[foo]()\n[](#)\n# local\n[](./AN)\n[![asd](./asd.png)](./AN)\n\n\n\nSome text here\n";
    const ANCHOR: &str = "# anchor\n\n## deeplink\n";
    const TAGGED: &str = "# tagged\n\n#other #bar\n";
    const HEADING: &str = "#\n";
    const IDEAS: &str = "# Ideas\n\n#foo\n\n## Notes\n\n[](../base/ANCHOR.md)\n[](./OTHER.md)\n";

    fn base_uri(name: &str) -> Url {
        Url::parse(&format!("file:///project/base/{}", name)).unwrap()
    }

    fn notes_uri(name: &str) -> Url {
        Url::parse(&format!("file:///project/notes/{}", name)).unwrap()
    }

    async fn fixture() -> Completions {
        let events = EventBus::new();
        let workqueue = Workqueue::new(events.clone());
        let files = Arc::new(MemoryFileSource::new());
        let indexer = Indexer::new(
            events.clone(),
            workqueue,
            Arc::new(MarkdownProcessor),
            files.clone(),
        );
        let references = References::new(events, Duration::from_millis(300));

        indexer.add_root(&Url::parse("file:///project/base").unwrap());
        indexer.add_root(&Url::parse("file:///project/notes").unwrap());

        let documents = [
            (base_uri("ANCHOR.md"), ANCHOR),
            (base_uri("BASE.md"), BASE),
            (base_uri("TAGGED.md"), TAGGED),
            (base_uri("HEADING.md"), HEADING),
            (notes_uri("IDEAS.md"), IDEAS),
        ];
        for (uri, text) in documents {
            files.insert(uri.clone(), text);
            indexer.add(&uri, None).await.unwrap();
        }

        Completions::new(indexer, references)
    }

    async fn complete(completions: &Completions, line: u32, column: u32) -> Vec<Completion> {
        completions
            .get(&LocationRef::new(base_uri("BASE.md"), Point::new(line, column)))
            .await
    }

    fn labels(completions: &[Completion]) -> Vec<&str> {
        completions.iter().map(|c| c.label.as_str()).collect()
    }

    fn span(sl: u32, sc: u32, el: u32, ec: u32) -> Range {
        Range::new(Point::new(sl, sc), Point::new(el, ec))
    }

    fn assert_replaces(completions: &[Completion], range: Range) {
        for completion in completions {
            assert_eq!(completion.replace.position, range, "{}", completion.label);
            assert_eq!(completion.replace.new_text, completion.label);
        }
    }

    #[tokio::test]
    async fn test_tag_prefix() {
        let completions = fixture().await;
        let result = complete(&completions, 1, 3).await;
        assert_eq!(labels(&result), vec!["#fo", "#fooop"]);
        assert_replaces(&result, span(1, 1, 1, 4));
    }

    #[tokio::test]
    async fn test_tag_prefix_skips_exact_match() {
        let completions = fixture().await;
        let uri = base_uri("PREFIX.md");
        completions
            .indexer
            .add(&uri, Some("See #fo\n".to_string()))
            .await
            .unwrap();

        let result = completions
            .get(&LocationRef::new(uri, Point::new(1, 8)))
            .await;
        assert_eq!(labels(&result), vec!["#fooop"]);
        assert_replaces(&result, span(1, 5, 1, 8));
    }

    #[tokio::test]
    async fn test_bare_trigger_offers_scoped_tags() {
        let completions = fixture().await;
        let result = complete(&completions, 1, 6).await;
        assert_eq!(labels(&result), vec!["#fo", "#fooop", "#other", "#bar"]);
        assert_replaces(&result, span(1, 5, 1, 6));
    }

    #[tokio::test]
    async fn test_empty_heading_trigger() {
        let completions = fixture().await;
        let result = completions
            .get(&LocationRef::new(base_uri("HEADING.md"), Point::new(1, 2)))
            .await;
        assert_eq!(labels(&result), vec!["#fo", "#fooop", "#other", "#bar"]);
        assert_replaces(&result, span(1, 1, 1, 2));
    }

    #[tokio::test]
    async fn test_plain_text_has_no_completions() {
        let completions = fixture().await;
        assert!(complete(&completions, 12, 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_link_label_has_no_completions() {
        let completions = fixture().await;
        assert!(complete(&completions, 3, 2).await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_link_offers_all_targets() {
        let completions = fixture().await;
        let expected = vec![
            "./ANCHOR.md#anchor",
            "./ANCHOR.md#deeplink",
            "./ANCHOR.md",
            "#local",
            "./TAGGED.md#tagged",
            "./TAGGED.md",
            "./HEADING.md",
        ];

        let result = complete(&completions, 3, 4).await;
        assert_eq!(labels(&result), expected);
        assert_replaces(&result, span(3, 4, 3, 4));

        let result = complete(&completions, 4, 7).await;
        assert_eq!(labels(&result), expected);
        assert_replaces(&result, span(4, 7, 4, 7));
    }

    #[tokio::test]
    async fn test_link_fragment_prefix() {
        let completions = fixture().await;
        let result = complete(&completions, 5, 5).await;
        assert_eq!(
            labels(&result),
            vec!["./ANCHOR.md#anchor", "./ANCHOR.md#deeplink", "#local", "./TAGGED.md#tagged"]
        );
        assert_replaces(&result, span(5, 4, 5, 5));
    }

    #[tokio::test]
    async fn test_link_path_prefix() {
        let completions = fixture().await;
        let expected = vec!["./ANCHOR.md#anchor", "./ANCHOR.md#deeplink", "./ANCHOR.md"];

        let result = complete(&completions, 7, 7).await;
        assert_eq!(labels(&result), expected);
        assert_replaces(&result, span(7, 4, 7, 8));

        // image inside the link label does not confuse the url range
        let result = complete(&completions, 8, 24).await;
        assert_eq!(labels(&result), expected);
        assert_replaces(&result, span(8, 21, 8, 25));

        // cursor past the closing paren still uses the whole url
        let result = complete(&completions, 8, 26).await;
        assert_eq!(labels(&result), expected);
        assert_replaces(&result, span(8, 21, 8, 25));
    }

    #[tokio::test]
    async fn test_unknown_document() {
        let completions = fixture().await;
        let result = completions
            .get(&LocationRef::new(base_uri("MISSING.md"), Point::new(1, 1)))
            .await;
        assert!(result.is_empty());
    }

    #[test]
    fn test_relative_document_path() {
        let from = Url::parse("file:///project/base/BASE.md").unwrap();
        let cases = [
            ("file:///project/base/ANCHOR.md", "./ANCHOR.md"),
            ("file:///project/base/sub/deep/A.md", "./sub/deep/A.md"),
            ("file:///project/other/A.md", "../other/A.md"),
            ("file:///A.md", "../../A.md"),
        ];
        for (to, expected) in cases {
            let to = Url::parse(to).unwrap();
            assert_eq!(relative_document_path(&from, &to), expected);
        }
    }
}
