//
// references.rs
//
// Workspace reference graph: anchors, links and tags across all documents
//

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use indexmap::{IndexMap, IndexSet};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::events::{Event, EventBus, EventKind};
use crate::indexer::IndexItem;
use crate::processor::{AnchorEntry, LinkEntry, TagEntry};
use crate::types::{LocationRef, Positioned, Range};

/// One document's contribution to the graph, as extracted by the parser.
///
/// Anchor and link uris may be relative; they are resolved against `uri`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub uri: Url,
    pub anchors: Vec<AnchorEntry>,
    pub links: Vec<LinkEntry>,
    pub tags: Vec<TagEntry>,
}

impl Document {
    pub fn from_item(item: &IndexItem) -> Self {
        Self {
            uri: item.uri.clone(),
            anchors: item.parse_tree.anchors.clone(),
            links: item.parse_tree.links.clone(),
            tags: item.parse_tree.tags.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    /// Absolute target uri, with the heading fragment if any.
    pub uri: Url,
    /// Owning document.
    pub document: Url,
    pub position: Range,
    pub references: Vec<Positioned>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Owning document.
    pub uri: Url,
    pub target_uri: Url,
    pub position: Range,
    /// Uri of the anchor the link resolves to.
    pub anchor: Option<Url>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    pub references: Vec<Positioned>,
}

type AnchorId = u64;
type LinkId = u64;

#[derive(Debug)]
struct AnchorNode {
    uri: Url,
    document: Url,
    position: Range,
    references: IndexSet<LinkId>,
}

#[derive(Debug)]
struct LinkNode {
    document: Url,
    target: Url,
    position: Range,
    anchor: Option<AnchorId>,
}

#[derive(Debug, Default)]
struct DocumentEntry {
    anchors: Vec<AnchorId>,
    links: Vec<LinkId>,
    tags: Vec<(String, Positioned)>,
}

/// Arena storage. Links and anchors refer to each other by id only.
#[derive(Debug, Default)]
struct Graph {
    next_id: u64,
    anchors: IndexMap<AnchorId, AnchorNode>,
    links: IndexMap<LinkId, LinkNode>,
    tags: IndexMap<String, IndexSet<Positioned>>,
    /// Every anchor claiming a uri; the last one wins.
    anchors_by_uri: HashMap<Url, IndexSet<AnchorId>>,
    links_by_target: HashMap<Url, IndexSet<LinkId>>,
    documents: HashMap<Url, DocumentEntry>,
}

impl Graph {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn winner(&self, uri: &Url) -> Option<AnchorId> {
        self.anchors_by_uri
            .get(uri)
            .and_then(|ids| ids.last().copied())
    }

    /// Point every link targeting `target` at the current winning anchor.
    fn rebind(&mut self, target: &Url) {
        let winner = self.winner(target);
        let Some(link_ids) = self.links_by_target.get(target) else {
            return;
        };

        for link_id in link_ids.iter().copied() {
            let Some(link) = self.links.get_mut(&link_id) else {
                continue;
            };
            if link.anchor == winner {
                continue;
            }
            if let Some(old) = link.anchor.take() {
                if let Some(anchor) = self.anchors.get_mut(&old) {
                    anchor.references.shift_remove(&link_id);
                }
            }
            if let Some(new) = winner {
                if let Some(anchor) = self.anchors.get_mut(&new) {
                    anchor.references.insert(link_id);
                    link.anchor = Some(new);
                }
            }
        }
    }

    fn add_document(&mut self, document: &Document) {
        self.remove_document(&document.uri);

        let mut entry = DocumentEntry::default();

        for tag in &document.tags {
            let reference = Positioned {
                uri: document.uri.clone(),
                position: tag.position,
            };
            self.tags
                .entry(tag.value.clone())
                .or_default()
                .insert(reference.clone());
            entry.tags.push((tag.value.clone(), reference));
        }

        for anchor in &document.anchors {
            let uri = match document.uri.join(&anchor.uri) {
                Ok(uri) => uri,
                Err(err) => {
                    log::debug!("references :: skipping anchor {:?} in {}: {}", anchor.uri, document.uri, err);
                    continue;
                }
            };
            let id = self.next_id();
            self.anchors.insert(
                id,
                AnchorNode {
                    uri: uri.clone(),
                    document: document.uri.clone(),
                    position: anchor.position,
                    references: IndexSet::new(),
                },
            );
            self.anchors_by_uri.entry(uri.clone()).or_default().insert(id);
            entry.anchors.push(id);
            self.rebind(&uri);
        }

        for link in &document.links {
            let target = match document.uri.join(&link.target_uri) {
                Ok(target) => target,
                Err(err) => {
                    log::debug!("references :: skipping link {:?} in {}: {}", link.target_uri, document.uri, err);
                    continue;
                }
            };
            let id = self.next_id();
            let anchor = self.winner(&target);
            if let Some(anchor_id) = anchor {
                if let Some(node) = self.anchors.get_mut(&anchor_id) {
                    node.references.insert(id);
                }
            }
            self.links.insert(
                id,
                LinkNode {
                    document: document.uri.clone(),
                    target: target.clone(),
                    position: link.position,
                    anchor,
                },
            );
            self.links_by_target.entry(target).or_default().insert(id);
            entry.links.push(id);
        }

        self.documents.insert(document.uri.clone(), entry);
    }

    fn remove_document(&mut self, uri: &Url) -> bool {
        let Some(entry) = self.documents.remove(uri) else {
            return false;
        };

        for link_id in entry.links {
            let Some(link) = self.links.shift_remove(&link_id) else {
                continue;
            };
            if let Some(anchor) = link.anchor.and_then(|id| self.anchors.get_mut(&id)) {
                anchor.references.shift_remove(&link_id);
            }
            if let Some(ids) = self.links_by_target.get_mut(&link.target) {
                ids.shift_remove(&link_id);
                if ids.is_empty() {
                    self.links_by_target.remove(&link.target);
                }
            }
        }

        for anchor_id in entry.anchors {
            let Some(anchor) = self.anchors.shift_remove(&anchor_id) else {
                continue;
            };
            for link_id in &anchor.references {
                if let Some(link) = self.links.get_mut(link_id) {
                    link.anchor = None;
                }
            }
            if let Some(ids) = self.anchors_by_uri.get_mut(&anchor.uri) {
                ids.shift_remove(&anchor_id);
                if ids.is_empty() {
                    self.anchors_by_uri.remove(&anchor.uri);
                }
            }
            self.rebind(&anchor.uri);
        }

        for (name, reference) in entry.tags {
            if let Some(references) = self.tags.get_mut(&name) {
                references.shift_remove(&reference);
                if references.is_empty() {
                    self.tags.shift_remove(&name);
                }
            }
        }

        true
    }

    fn anchor_references(&self, id: AnchorId) -> Vec<Positioned> {
        let Some(anchor) = self.anchors.get(&id) else {
            return Vec::new();
        };
        anchor
            .references
            .iter()
            .filter_map(|link_id| self.links.get(link_id))
            .map(|link| Positioned {
                uri: link.document.clone(),
                position: link.position,
            })
            .collect()
    }

    fn find_link(&self, location: &LocationRef) -> Option<(LinkId, &LinkNode)> {
        let entry = self.documents.get(&location.uri)?;
        entry.links.iter().find_map(|id| {
            self.links
                .get(id)
                .filter(|link| link.position.contains(&location.position))
                .map(|link| (*id, link))
        })
    }
}

struct Inner {
    events: EventBus,
    debounce: Mutex<Duration>,
    graph: Mutex<Graph>,
    pending: Mutex<Option<CancellationToken>>,
}

impl Inner {
    fn graph(&self) -> MutexGuard<'_, Graph> {
        self.graph.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit_changed(&self) {
        {
            let graph = self.graph();
            log::debug!(
                "references :: changed ({} links, {} anchors, {} tags)",
                graph.links.len(),
                graph.anchors.len(),
                graph.tags.len()
            );
        }
        self.events.emit(Event::ReferencesChanged);
    }
}

/// The workspace reference graph.
///
/// Follows the indexer: every `IndexerUpdated` replaces that document's
/// entries and every `IndexerRemoved` drops them. `ReferencesChanged` is
/// emitted once mutations have been quiet for the debounce delay.
#[derive(Clone)]
pub struct References {
    inner: Arc<Inner>,
}

impl References {
    pub fn new(events: EventBus, debounce: Duration) -> Self {
        let inner = Arc::new(Inner {
            events: events.clone(),
            debounce: Mutex::new(debounce),
            graph: Mutex::new(Graph::default()),
            pending: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        events.on(EventKind::IndexerUpdated, move |event| {
            if let Event::IndexerUpdated(item) = event {
                with_references(&weak, |references| {
                    references.add_document(&Document::from_item(item))
                })
            }
        });

        let weak = Arc::downgrade(&inner);
        events.on(EventKind::IndexerRemoved, move |event| {
            if let Event::IndexerRemoved(item) = event {
                with_references(&weak, |references| references.remove_document(&item.uri))
            }
        });

        Self { inner }
    }

    /// Replace everything `document.uri` contributed with `document`.
    pub fn add_document(&self, document: &Document) {
        log::trace!("references :: addDocument {}", document.uri);
        self.inner.graph().add_document(document);
        self.schedule_changed();
    }

    pub fn remove_document(&self, uri: &Url) {
        log::trace!("references :: removeDocument {}", uri);
        if self.inner.graph().remove_document(uri) {
            self.schedule_changed();
        }
    }

    /// Restart the quiet period before `ReferencesChanged`.
    ///
    /// Outside a Tokio runtime the event is emitted immediately.
    fn schedule_changed(&self) {
        let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old_token) = pending.take() {
            old_token.cancel();
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            drop(pending);
            self.inner.emit_changed();
            return;
        };

        let token = CancellationToken::new();
        *pending = Some(token.clone());

        let weak = Arc::downgrade(&self.inner);
        let delay = *self.inner.debounce.lock().unwrap_or_else(|e| e.into_inner());
        handle.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Some(inner) = weak.upgrade() {
                inner.emit_changed();
            }
        });
    }

    /// Quiet period for change notifications scheduled from now on.
    pub fn set_debounce(&self, debounce: Duration) {
        *self.inner.debounce.lock().unwrap_or_else(|e| e.into_inner()) = debounce;
    }

    /// Cancel a pending change notification.
    pub fn cancel_pending(&self) {
        let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = pending.take() {
            token.cancel();
        }
    }

    pub fn find_references(&self, location: &LocationRef) -> Vec<Positioned> {
        let graph = self.inner.graph();

        if let Some((_, link)) = graph.find_link(location) {
            return match link.anchor {
                Some(anchor) => graph.anchor_references(anchor),
                None => graph
                    .links_by_target
                    .get(&link.target)
                    .into_iter()
                    .flatten()
                    .filter_map(|id| graph.links.get(id))
                    .map(|link| Positioned {
                        uri: link.document.clone(),
                        position: link.position,
                    })
                    .collect(),
            };
        }

        let Some(entry) = graph.documents.get(&location.uri) else {
            return Vec::new();
        };

        if let Some((name, _)) = entry
            .tags
            .iter()
            .find(|(_, tag)| tag.position.contains(&location.position))
        {
            return graph
                .tags
                .get(name)
                .map(|refs| refs.iter().cloned().collect())
                .unwrap_or_default();
        }

        entry
            .anchors
            .iter()
            .copied()
            .find(|id| {
                graph
                    .anchors
                    .get(id)
                    .is_some_and(|anchor| anchor.position.contains(&location.position))
            })
            .map(|id| graph.anchor_references(id))
            .unwrap_or_default()
    }

    /// Where the link at `location` points.
    ///
    /// A resolved link yields its anchor, located in the anchor's document.
    /// An unresolved one yields its own target uri at the link's position.
    pub fn find_definitions(&self, location: &LocationRef) -> Vec<Positioned> {
        let graph = self.inner.graph();
        let Some((_, link)) = graph.find_link(location) else {
            return Vec::new();
        };

        match link.anchor.and_then(|id| graph.anchors.get(&id)) {
            Some(anchor) => vec![Positioned {
                uri: anchor.document.clone(),
                position: anchor.position,
            }],
            None => vec![Positioned {
                uri: link.target.clone(),
                position: link.position,
            }],
        }
    }

    pub fn get_anchors(&self) -> Vec<Anchor> {
        let graph = self.inner.graph();
        graph
            .anchors
            .keys()
            .filter_map(|id| {
                let anchor = graph.anchors.get(id)?;
                Some(Anchor {
                    uri: anchor.uri.clone(),
                    document: anchor.document.clone(),
                    position: anchor.position,
                    references: graph.anchor_references(*id),
                })
            })
            .collect()
    }

    pub fn get_links(&self) -> Vec<Link> {
        let graph = self.inner.graph();
        graph
            .links
            .values()
            .map(|link| Link {
                uri: link.document.clone(),
                target_uri: link.target.clone(),
                position: link.position,
                anchor: link
                    .anchor
                    .and_then(|id| graph.anchors.get(&id))
                    .map(|anchor| anchor.uri.clone()),
            })
            .collect()
    }

    pub fn get_tags(&self) -> Vec<Tag> {
        self.inner
            .graph()
            .tags
            .iter()
            .map(|(name, references)| Tag {
                name: name.clone(),
                references: references.iter().cloned().collect(),
            })
            .collect()
    }
}

fn with_references(weak: &Weak<Inner>, f: impl FnOnce(References)) {
    if let Some(inner) = weak.upgrade() {
        f(References { inner });
    }
}
