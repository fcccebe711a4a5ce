//
// indexer.rs
//
// Per-document cache: read -> parse pipeline, memoized per source version
//

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use tokio::sync::watch;
use url::Url;

use crate::events::{Event, EventBus, EventKind};
use crate::file_source::FileSource;
use crate::processor::{ParseTree, ProcessError, Processor};
use crate::workqueue::Workqueue;

/// Which sources back a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    FileOnly,
    OverrideOnly,
    Both,
    /// Never stored: an item reaching this state is deleted.
    Neither,
}

impl Lifecycle {
    fn of(global: bool, has_override: bool) -> Self {
        match (global, has_override) {
            (true, false) => Lifecycle::FileOnly,
            (false, true) => Lifecycle::OverrideOnly,
            (true, true) => Lifecycle::Both,
            (false, false) => Lifecycle::Neither,
        }
    }
}

/// A resolved document snapshot.
#[derive(Debug, Clone)]
pub struct IndexItem {
    pub uri: Url,
    /// Effective text: the override if present, else the file text.
    pub value: Arc<str>,
    /// Editor override, absent when the document is not open.
    pub local_value: Option<Arc<str>>,
    /// Whether a file-backed source has been seen.
    pub global: bool,
    /// Last text read from the file source.
    pub file: Option<Arc<str>>,
    pub parse_tree: Arc<ParseTree>,
    /// Pipeline generation that produced this snapshot.
    pub version: u64,
}

impl IndexItem {
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::of(self.global, self.local_value.is_some())
    }

    fn removed(uri: Url) -> Self {
        Self {
            uri,
            value: Arc::from(""),
            local_value: None,
            global: false,
            file: None,
            parse_tree: Arc::new(ParseTree::empty()),
            version: 0,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum IndexError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("indexing of {0} was interrupted")]
    Cancelled(Url),
}

/// Progress of one read -> parse run.
#[derive(Debug, Clone)]
pub enum PipelineState {
    Unset,
    Reading,
    Processing,
    Ready(Arc<IndexItem>),
    Failed(IndexError),
}

/// Outcome of [`Indexer::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// No item for that uri.
    Unknown,
    /// The named source was not present.
    Unchanged,
    /// The last source went away and the item was deleted.
    Deleted,
    /// The item fell back to its remaining source and is being re-indexed.
    Reindexing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    File,
    Override(Arc<str>),
}

#[derive(Debug, Clone)]
struct Pipeline {
    generation: u64,
    source: Source,
    state: watch::Receiver<PipelineState>,
}

impl Pipeline {
    /// Whether a request for `source` may share this run instead of
    /// starting another.
    fn attachable(&self, source: &Source) -> bool {
        let state = self.state.borrow().clone();
        match (&self.source, source) {
            (Source::File, Source::File) => {
                matches!(state, PipelineState::Unset | PipelineState::Reading)
            }
            (Source::Override(running), Source::Override(requested)) => {
                running == requested
                    && !matches!(state, PipelineState::Ready(_) | PipelineState::Failed(_))
            }
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
struct ItemEntry {
    local_value: Option<Arc<str>>,
    global: bool,
    file: Option<Arc<str>>,
    pipeline: Option<Pipeline>,
    last: Option<Arc<IndexItem>>,
}

impl ItemEntry {
    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::of(self.global, self.local_value.is_some())
    }

    fn source(&self) -> Source {
        match &self.local_value {
            Some(text) => Source::Override(text.clone()),
            None => Source::File,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.pipeline
            .as_ref()
            .is_some_and(|p| p.generation == generation)
    }
}

struct Inner {
    events: EventBus,
    workqueue: Workqueue,
    processor: Arc<dyn Processor>,
    file_source: Arc<dyn FileSource>,
    items: Mutex<HashMap<Url, ItemEntry>>,
    /// Held from the currency check through the emit of `IndexerUpdated`
    /// and `IndexerRemoved`, so subscribers see them in cache order.
    publish: Mutex<()>,
    roots: RwLock<Vec<Url>>,
    awaiting_ready: AtomicBool,
    generations: AtomicU64,
}

impl Inner {
    fn items(&self) -> MutexGuard<'_, HashMap<Url, ItemEntry>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self) -> MutexGuard<'_, ()> {
        self.publish.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Per-document cache.
///
/// Every operation that changes a document's source starts (or joins) a
/// pipeline run on the Tokio runtime, so these methods must be called from
/// within one. Runs are tracked by the workqueue.
///
/// `IndexerUpdated` and `IndexerRemoved` handlers must not call
/// [`Indexer::remove`].
#[derive(Clone)]
pub struct Indexer {
    inner: Arc<Inner>,
}

impl Indexer {
    pub fn new(
        events: EventBus,
        workqueue: Workqueue,
        processor: Arc<dyn Processor>,
        file_source: Arc<dyn FileSource>,
    ) -> Self {
        let inner = Arc::new(Inner {
            events: events.clone(),
            workqueue,
            processor,
            file_source,
            items: Mutex::new(HashMap::new()),
            publish: Mutex::new(()),
            roots: RwLock::new(Vec::new()),
            awaiting_ready: AtomicBool::new(false),
            generations: AtomicU64::new(0),
        });

        let weak = Arc::downgrade(&inner);
        events.on(EventKind::WatcherReady, move |_| {
            with_indexer(&weak, |indexer| {
                indexer.inner.awaiting_ready.store(true, Ordering::SeqCst);
                if indexer.inner.workqueue.is_empty() {
                    indexer.emit_ready();
                }
            })
        });

        let weak = Arc::downgrade(&inner);
        events.on(EventKind::WorkqueueEmpty, move |_| {
            with_indexer(&weak, |indexer| indexer.emit_ready())
        });

        let weak = Arc::downgrade(&inner);
        events.on(EventKind::WatcherAdd, move |event| {
            if let Event::WatcherAdd(uri) = event {
                // the run is spawned; its result arrives as IndexerUpdated
                with_indexer(&weak, |indexer| drop(indexer.add(uri, None)))
            }
        });

        let weak = Arc::downgrade(&inner);
        events.on(EventKind::WatcherRemove, move |event| {
            if let Event::WatcherRemove(uri) = event {
                with_indexer(&weak, |indexer| {
                    indexer.remove(uri, false);
                })
            }
        });

        Self { inner }
    }

    fn emit_ready(&self) {
        if self.inner.awaiting_ready.swap(false, Ordering::SeqCst) {
            log::info!("indexer :: ready");
            self.inner.events.emit(Event::IndexerReady);
        }
    }

    pub fn add_root(&self, uri: &Url) {
        let uri = normalize_root(uri);
        {
            let mut roots = self.inner.roots.write().unwrap_or_else(|e| e.into_inner());
            if roots.contains(&uri) {
                return;
            }
            roots.push(uri.clone());
        }
        log::info!("indexer :: add root {}", uri);
        self.inner.events.emit(Event::RootAdded(uri));
    }

    pub fn remove_root(&self, uri: &Url) {
        let uri = normalize_root(uri);
        {
            let mut roots = self.inner.roots.write().unwrap_or_else(|e| e.into_inner());
            let before = roots.len();
            roots.retain(|root| *root != uri);
            if roots.len() == before {
                return;
            }
        }
        log::info!("indexer :: remove root {}", uri);
        self.inner.events.emit(Event::RootRemoved(uri));
    }

    pub fn roots(&self) -> Vec<Url> {
        self.inner
            .roots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The first root that is a prefix of `uri`.
    pub fn find_root(&self, uri: &Url) -> Option<Url> {
        find_root(uri, &self.roots())
    }

    /// Index `uri`, from `local_value` when given, otherwise from its file.
    ///
    /// The returned future resolves with the parsed item; dropping it does
    /// not stop indexing.
    pub fn add(
        &self,
        uri: &Url,
        local_value: Option<String>,
    ) -> impl Future<Output = Result<Arc<IndexItem>, IndexError>> + Send + 'static {
        log::debug!("indexer :: add {} (override: {})", uri, local_value.is_some());

        let state = {
            let mut items = self.inner.items();
            let entry = items.entry(uri.clone()).or_default();
            match local_value {
                Some(text) => entry.local_value = Some(Arc::from(text)),
                None => entry.global = true,
            }
            self.start(uri, entry, true)
        };

        wait_for(uri.clone(), state)
    }

    /// Drop one source of `uri`: the override when `local`, else the file.
    pub fn remove(&self, uri: &Url, local: bool) -> Removal {
        log::debug!("indexer :: remove {} (local: {})", uri, local);

        let _publish = self.inner.publish();
        let removed = {
            let mut items = self.inner.items();
            let Some(entry) = items.get_mut(uri) else {
                return Removal::Unknown;
            };

            if local {
                if entry.local_value.take().is_none() {
                    return Removal::Unchanged;
                }
            } else if !std::mem::take(&mut entry.global) {
                return Removal::Unchanged;
            }

            if entry.lifecycle() != Lifecycle::Neither {
                self.start(uri, entry, true);
                return Removal::Reindexing;
            }

            items.remove(uri)
        };

        let item = removed
            .and_then(|entry| entry.last)
            .unwrap_or_else(|| Arc::new(IndexItem::removed(uri.clone())));

        log::debug!("indexer :: removed {}", uri);
        self.inner.events.emit(Event::IndexerRemoved(item));
        Removal::Deleted
    }

    /// The current parsed item, parsing first if nothing is memoized.
    pub async fn get(&self, uri: &Url) -> Result<Option<Arc<IndexItem>>, IndexError> {
        let state = {
            let mut items = self.inner.items();
            match items.get_mut(uri) {
                Some(entry) => self.start(uri, entry, false),
                None => return Ok(None),
            }
        };
        wait_for(uri.clone(), state).await.map(Some)
    }

    pub fn file_open(
        &self,
        uri: &Url,
        text: String,
    ) -> impl Future<Output = Result<Arc<IndexItem>, IndexError>> + Send + 'static {
        self.add(uri, Some(text))
    }

    pub fn file_content_changed(
        &self,
        uri: &Url,
        text: String,
    ) -> impl Future<Output = Result<Arc<IndexItem>, IndexError>> + Send + 'static {
        self.add(uri, Some(text))
    }

    pub fn file_closed(&self, uri: &Url) -> Removal {
        self.remove(uri, true)
    }

    /// Every item that has resolved at least once.
    pub fn items(&self) -> Vec<Arc<IndexItem>> {
        self.inner
            .items()
            .values()
            .filter_map(|entry| entry.last.clone())
            .collect()
    }

    pub fn uris(&self) -> Vec<Url> {
        self.inner.items().keys().cloned().collect()
    }

    pub fn lifecycle(&self, uri: &Url) -> Lifecycle {
        self.inner
            .items()
            .get(uri)
            .map(ItemEntry::lifecycle)
            .unwrap_or(Lifecycle::Neither)
    }

    /// Join or start the pipeline for `entry`'s current source.
    ///
    /// With `invalidate`, a settled run is replaced; otherwise any memoized
    /// run is reused.
    fn start(&self, uri: &Url, entry: &mut ItemEntry, invalidate: bool) -> watch::Receiver<PipelineState> {
        let source = entry.source();

        if let Some(pipeline) = &entry.pipeline {
            if !invalidate || pipeline.attachable(&source) {
                return pipeline.state.clone();
            }
        }

        let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = watch::channel(PipelineState::Unset);
        entry.pipeline = Some(Pipeline {
            generation,
            source: source.clone(),
            state: rx.clone(),
        });

        log::trace!("indexer :: pipeline {} for {}", generation, uri);

        let run = run_pipeline(self.inner.clone(), uri.clone(), generation, source, tx);
        tokio::spawn(self.inner.workqueue.add(run));
        rx
    }
}

fn with_indexer(weak: &Weak<Inner>, f: impl FnOnce(Indexer)) {
    if let Some(inner) = weak.upgrade() {
        f(Indexer { inner });
    }
}

async fn wait_for(
    uri: Url,
    mut state: watch::Receiver<PipelineState>,
) -> Result<Arc<IndexItem>, IndexError> {
    loop {
        let current = state.borrow_and_update().clone();
        match current {
            PipelineState::Ready(item) => return Ok(item),
            PipelineState::Failed(err) => return Err(err),
            _ => {}
        }
        if state.changed().await.is_err() {
            let last = state.borrow().clone();
            return match last {
                PipelineState::Ready(item) => Ok(item),
                PipelineState::Failed(err) => Err(err),
                _ => Err(IndexError::Cancelled(uri)),
            };
        }
    }
}

async fn run_pipeline(
    inner: Arc<Inner>,
    uri: Url,
    generation: u64,
    source: Source,
    state: watch::Sender<PipelineState>,
) {
    let (text, from_file) = match source {
        Source::Override(text) => (text, false),
        Source::File => {
            state.send_replace(PipelineState::Reading);
            let text = match inner.file_source.read(&uri).await {
                Ok(text) => Arc::from(text),
                Err(err) => {
                    log::warn!("indexer :: failed to read {}: {}", uri, err);
                    Arc::from("")
                }
            };
            (text, true)
        }
    };

    state.send_replace(PipelineState::Processing);

    let processor = inner.processor.clone();
    let parse_uri = uri.clone();
    let parse_text = text.clone();
    let parsed = tokio::task::spawn_blocking(move || processor.process(&parse_uri, &parse_text)).await;

    let tree = match parsed {
        Ok(Ok(tree)) => tree,
        Ok(Err(err)) => {
            log::warn!("indexer :: failed to process {}: {}", uri, err);
            {
                let mut items = inner.items();
                if let Some(entry) = items.get_mut(&uri) {
                    if entry.is_current(generation) {
                        entry.pipeline = None;
                    }
                }
            }
            state.send_replace(PipelineState::Failed(err.into()));
            return;
        }
        Err(join_err) => {
            log::warn!("indexer :: parser task for {} failed: {}", uri, join_err);
            {
                let mut items = inner.items();
                if let Some(entry) = items.get_mut(&uri) {
                    if entry.is_current(generation) {
                        entry.pipeline = None;
                    }
                }
            }
            state.send_replace(PipelineState::Failed(IndexError::Cancelled(uri)));
            return;
        }
    };

    let _publish = inner.publish();
    let (item, current) = {
        let mut items = inner.items();
        match items.get_mut(&uri) {
            Some(entry) if entry.is_current(generation) => {
                if from_file {
                    entry.file = Some(text.clone());
                }
                let item = Arc::new(IndexItem {
                    uri: uri.clone(),
                    value: text,
                    local_value: entry.local_value.clone(),
                    global: entry.global,
                    file: entry.file.clone(),
                    parse_tree: Arc::new(tree),
                    version: generation,
                });
                entry.last = Some(item.clone());
                (item, true)
            }
            entry => {
                let item = Arc::new(IndexItem {
                    uri: uri.clone(),
                    value: text.clone(),
                    local_value: (!from_file).then(|| text.clone()),
                    global: entry.is_some_and(|e| e.global),
                    file: from_file.then_some(text),
                    parse_tree: Arc::new(tree),
                    version: generation,
                });
                (item, false)
            }
        }
    };

    if current {
        log::debug!("indexer :: updated {}", uri);
        inner.events.emit(Event::IndexerUpdated(item.clone()));
    } else {
        log::trace!("indexer :: pipeline {} for {} superseded", generation, uri);
    }

    state.send_replace(PipelineState::Ready(item));
}

/// Roots compare as prefixes, so they always end in `/`.
fn normalize_root(uri: &Url) -> Url {
    let mut uri = uri.clone();
    if !uri.path().ends_with('/') {
        let path = format!("{}/", uri.path());
        uri.set_path(&path);
    }
    uri
}

pub fn find_root(uri: &Url, roots: &[Url]) -> Option<Url> {
    roots
        .iter()
        .find(|root| uri.as_str().starts_with(root.as_str()))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_source::MemoryFileSource;
    use crate::markdown::MarkdownProcessor;
    use crate::references::References;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const FILE_TEXT: &str = "# file\n\n[](./OTHER.md)\n";
    const OVERRIDE_TEXT: &str = "# override\n";
    const CHANGED_TEXT: &str = "# changed\n";

    fn test_uri(name: &str) -> Url {
        Url::parse(&format!("file:///notes/{}", name)).unwrap()
    }

    /// Counts parser invocations and can be told to fail.
    #[derive(Default)]
    struct CountingProcessor {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    impl Processor for CountingProcessor {
        fn process(&self, uri: &Url, text: &str) -> Result<ParseTree, ProcessError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(ProcessError::Parse {
                    uri: uri.clone(),
                    message: "boom".to_string(),
                });
            }
            MarkdownProcessor.process(uri, text)
        }
    }

    struct Fixture {
        indexer: Indexer,
        events: EventBus,
        workqueue: Workqueue,
        files: Arc<MemoryFileSource>,
        processor: Arc<CountingProcessor>,
        removed: Arc<AtomicUsize>,
        updated: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        let events = EventBus::new();
        let workqueue = Workqueue::new(events.clone());
        let files = Arc::new(MemoryFileSource::new());
        let processor = Arc::new(CountingProcessor::default());
        let indexer = Indexer::new(
            events.clone(),
            workqueue.clone(),
            processor.clone(),
            files.clone(),
        );

        let removed = Arc::new(AtomicUsize::new(0));
        let counter = removed.clone();
        events.on(EventKind::IndexerRemoved, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let updated = Arc::new(AtomicUsize::new(0));
        let counter = updated.clone();
        events.on(EventKind::IndexerUpdated, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        Fixture {
            indexer,
            events,
            workqueue,
            files,
            processor,
            removed,
            updated,
        }
    }

    #[tokio::test]
    async fn test_add_reads_file() {
        let f = fixture();
        let uri = test_uri("IDEAS.md");
        f.files.insert(uri.clone(), FILE_TEXT);

        let item = f.indexer.add(&uri, None).await.unwrap();
        assert_eq!(&*item.value, FILE_TEXT);
        assert!(item.global);
        assert_eq!(item.parse_tree.anchors.len(), 2);
        assert_eq!(item.parse_tree.links.len(), 1);
        assert_eq!(item.lifecycle(), Lifecycle::FileOnly);
        assert_eq!(f.updated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_file_indexes_empty_document() {
        let f = fixture();
        let uri = test_uri("NON_EXISTING.md");

        let item = f.indexer.add(&uri, None).await.unwrap();
        assert_eq!(&*item.value, "");
        assert_eq!(item.parse_tree.anchors.len(), 1);
        assert!(item.parse_tree.links.is_empty());
        assert!(item.parse_tree.tags.is_empty());
    }

    #[tokio::test]
    async fn test_override_precedence() {
        let f = fixture();
        let uri = test_uri("IDEAS.md");
        f.files.insert(uri.clone(), FILE_TEXT);
        f.indexer.add(&uri, None).await.unwrap();

        let item = f
            .indexer
            .file_open(&uri, "# hello world!".to_string())
            .await
            .unwrap();
        assert_eq!(item.parse_tree.anchors.len(), 2);
        assert_eq!(item.parse_tree.anchors[0].uri, "#hello-world");
        assert!(item.parse_tree.links.is_empty());

        let fetched = f.indexer.get(&uri).await.unwrap().unwrap();
        assert_eq!(fetched.version, item.version);

        assert_eq!(f.indexer.file_closed(&uri), Removal::Reindexing);
        let item = f.indexer.get(&uri).await.unwrap().unwrap();
        assert_eq!(&*item.value, FILE_TEXT);
        assert_eq!(item.parse_tree.links.len(), 1);
        assert_eq!(f.removed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_adds_share_one_parse() {
        let f = fixture();
        let uri = test_uri("IDEAS.md");
        f.files.insert(uri.clone(), FILE_TEXT);

        let a = f.indexer.add(&uri, None);
        let b = f.indexer.add(&uri, None);
        let (a, b) = tokio::join!(a, b);

        assert_eq!(a.unwrap().version, b.unwrap().version);
        assert_eq!(f.processor.calls.load(Ordering::SeqCst), 1);

        let c = f.indexer.file_open(&uri, "# same".to_string());
        let d = f.indexer.file_content_changed(&uri, "# same".to_string());
        let (c, d) = tokio::join!(c, d);
        assert_eq!(c.unwrap().version, d.unwrap().version);
        assert_eq!(f.processor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_get_is_memoized() {
        let f = fixture();
        let uri = test_uri("IDEAS.md");
        f.files.insert(uri.clone(), FILE_TEXT);
        f.indexer.add(&uri, None).await.unwrap();

        f.indexer.get(&uri).await.unwrap();
        f.indexer.get(&uri).await.unwrap();
        assert_eq!(f.processor.calls.load(Ordering::SeqCst), 1);

        assert!(f.indexer.get(&test_uri("UNKNOWN.md")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_settled_pipeline_is_replaced_on_add() {
        let f = fixture();
        let uri = test_uri("IDEAS.md");
        f.files.insert(uri.clone(), "# one");
        let first = f.indexer.add(&uri, None).await.unwrap();

        f.files.insert(uri.clone(), "# two");
        let second = f.indexer.add(&uri, None).await.unwrap();

        assert!(second.version > first.version);
        assert_eq!(second.parse_tree.anchors[0].uri, "#two");
        assert_eq!(f.processor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_superseded_pipeline_resolves_without_update() {
        let f = fixture();
        let uri = test_uri("IDEAS.md");

        let stale = f.indexer.file_open(&uri, "# first".to_string());
        let fresh = f.indexer.file_content_changed(&uri, "# second".to_string());
        let (stale, fresh) = tokio::join!(stale, fresh);

        assert_eq!(stale.unwrap().parse_tree.anchors[0].uri, "#first");
        assert_eq!(fresh.unwrap().parse_tree.anchors[0].uri, "#second");
        assert_eq!(f.updated.load(Ordering::SeqCst), 1);

        let current = f.indexer.get(&uri).await.unwrap().unwrap();
        assert_eq!(current.parse_tree.anchors[0].uri, "#second");
    }

    #[tokio::test]
    async fn test_parse_failure_retries_on_next_access() {
        let f = fixture();
        let uri = test_uri("IDEAS.md");
        f.files.insert(uri.clone(), FILE_TEXT);

        f.processor.fail.store(true, Ordering::SeqCst);
        let err = f.indexer.add(&uri, None).await.unwrap_err();
        assert!(matches!(err, IndexError::Process(_)));
        assert_eq!(f.updated.load(Ordering::SeqCst), 0);

        f.processor.fail.store(false, Ordering::SeqCst);
        let item = f.indexer.get(&uri).await.unwrap().unwrap();
        assert_eq!(item.parse_tree.links.len(), 1);
        assert_eq!(f.processor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_late_pipeline_after_delete_is_ignored() {
        let f = fixture();
        let uri = test_uri("IDEAS.md");
        f.files.insert(uri.clone(), FILE_TEXT);

        let pending = f.indexer.add(&uri, None);
        assert_eq!(f.indexer.remove(&uri, false), Removal::Deleted);
        pending.await.unwrap();

        assert_eq!(f.updated.load(Ordering::SeqCst), 0);
        assert_eq!(f.removed.load(Ordering::SeqCst), 1);
        assert!(f.indexer.items().is_empty());
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        AddFile,
        AddOverride,
        RemoveFile,
        RemoveOverride,
    }

    async fn enter(f: &Fixture, uri: &Url, state: Lifecycle) {
        match state {
            Lifecycle::FileOnly => {
                f.indexer.add(uri, None).await.unwrap();
            }
            Lifecycle::OverrideOnly => {
                f.indexer.add(uri, Some(OVERRIDE_TEXT.to_string())).await.unwrap();
            }
            Lifecycle::Both => {
                f.indexer.add(uri, None).await.unwrap();
                f.indexer.add(uri, Some(OVERRIDE_TEXT.to_string())).await.unwrap();
            }
            Lifecycle::Neither => {}
        }
    }

    async fn apply(f: &Fixture, uri: &Url, op: Op) -> Option<Removal> {
        match op {
            Op::AddFile => {
                f.indexer.add(uri, None).await.unwrap();
                None
            }
            Op::AddOverride => {
                f.indexer.add(uri, Some(CHANGED_TEXT.to_string())).await.unwrap();
                None
            }
            Op::RemoveFile => Some(f.indexer.remove(uri, false)),
            Op::RemoveOverride => Some(f.indexer.remove(uri, true)),
        }
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        use Lifecycle::*;
        use Op::*;

        // (state, op, next state, effective text, removal outcome)
        let table: [(Lifecycle, Op, Lifecycle, Option<&str>, Option<Removal>); 16] = [
            (FileOnly, AddFile, FileOnly, Some(FILE_TEXT), None),
            (FileOnly, AddOverride, Both, Some(CHANGED_TEXT), None),
            (FileOnly, RemoveFile, Neither, None, Some(Removal::Deleted)),
            (FileOnly, RemoveOverride, FileOnly, Some(FILE_TEXT), Some(Removal::Unchanged)),
            (OverrideOnly, AddFile, Both, Some(OVERRIDE_TEXT), None),
            (OverrideOnly, AddOverride, OverrideOnly, Some(CHANGED_TEXT), None),
            (OverrideOnly, RemoveFile, OverrideOnly, Some(OVERRIDE_TEXT), Some(Removal::Unchanged)),
            (OverrideOnly, RemoveOverride, Neither, None, Some(Removal::Deleted)),
            (Both, AddFile, Both, Some(OVERRIDE_TEXT), None),
            (Both, AddOverride, Both, Some(CHANGED_TEXT), None),
            (Both, RemoveFile, OverrideOnly, Some(OVERRIDE_TEXT), Some(Removal::Reindexing)),
            (Both, RemoveOverride, FileOnly, Some(FILE_TEXT), Some(Removal::Reindexing)),
            (Neither, AddFile, FileOnly, Some(FILE_TEXT), None),
            (Neither, AddOverride, OverrideOnly, Some(CHANGED_TEXT), None),
            (Neither, RemoveFile, Neither, None, Some(Removal::Unknown)),
            (Neither, RemoveOverride, Neither, None, Some(Removal::Unknown)),
        ];

        for (state, op, next, text, removal) in table {
            let f = fixture();
            let uri = test_uri("DOC.md");
            f.files.insert(uri.clone(), FILE_TEXT);

            enter(&f, &uri, state).await;
            assert_eq!(f.indexer.lifecycle(&uri), state, "entering {:?}", state);

            let outcome = apply(&f, &uri, op).await;
            assert_eq!(outcome, removal, "{:?} + {:?}", state, op);
            assert_eq!(f.indexer.lifecycle(&uri), next, "{:?} + {:?}", state, op);

            let item = f.indexer.get(&uri).await.unwrap();
            assert_eq!(
                item.as_ref().map(|i| &*i.value),
                text,
                "{:?} + {:?}",
                state,
                op
            );
            if let Some(item) = item {
                assert_eq!(item.lifecycle(), next, "{:?} + {:?}", state, op);
            }

            let expected_removed = usize::from(removal == Some(Removal::Deleted));
            assert_eq!(f.removed.load(Ordering::SeqCst), expected_removed, "{:?} + {:?}", state, op);
        }
    }

    /// A subscriber that stalls on the `# first` update, holding its run
    /// between the currency check and References.
    fn stall_first_update(events: &EventBus) -> References {
        events.on(EventKind::IndexerUpdated, |event| {
            if let Event::IndexerUpdated(item) = event {
                if item.value.starts_with("# first") {
                    std::thread::sleep(Duration::from_millis(300));
                }
            }
        });
        References::new(events.clone(), Duration::from_millis(10))
    }

    fn graph_anchors(references: &References) -> Vec<String> {
        let mut anchors: Vec<String> = references
            .get_anchors()
            .into_iter()
            .map(|anchor| anchor.uri.to_string())
            .collect();
        anchors.sort();
        anchors
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stalled_update_cannot_overwrite_newer_content() {
        let f = fixture();
        let references = stall_first_update(&f.events);
        let uri = test_uri("DOC.md");

        let first = f.indexer.file_open(&uri, "# first\n".to_string());
        tokio::time::sleep(Duration::from_millis(100)).await;
        f.indexer
            .file_content_changed(&uri, "# second\n".to_string())
            .await
            .unwrap();
        let _ = first.await;
        f.workqueue.wait_empty().await;

        let cached = f.indexer.get(&uri).await.unwrap().unwrap();
        assert_eq!(&*cached.value, "# second\n");
        assert_eq!(
            graph_anchors(&references),
            vec![
                "file:///notes/DOC.md".to_string(),
                "file:///notes/DOC.md#second".to_string()
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stalled_update_cannot_resurrect_deleted_document() {
        let f = fixture();
        let references = stall_first_update(&f.events);
        let uri = test_uri("DOC.md");

        let first = f.indexer.file_open(&uri, "# first\n".to_string());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.indexer.file_closed(&uri), Removal::Deleted);
        let _ = first.await;
        f.workqueue.wait_empty().await;

        assert!(f.indexer.uris().is_empty());
        assert!(graph_anchors(&references).is_empty());
    }

    #[tokio::test]
    async fn test_ready_after_watcher_ready_and_quiescence() {
        let f = fixture();
        let ready = Arc::new(AtomicUsize::new(0));
        let counter = ready.clone();
        f.events.on(EventKind::IndexerReady, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let uri = test_uri("IDEAS.md");
        f.files.insert(uri.clone(), FILE_TEXT);
        f.events.emit(Event::WatcherAdd(uri.clone()));
        f.events.emit(Event::WatcherReady);
        assert_eq!(ready.load(Ordering::SeqCst), 0);

        f.workqueue.wait_empty().await;
        assert_eq!(ready.load(Ordering::SeqCst), 1);
        assert_eq!(f.indexer.items().len(), 1);

        // already quiet: ready fires immediately, once
        f.events.emit(Event::WatcherReady);
        assert_eq!(ready.load(Ordering::SeqCst), 2);
        f.indexer.add(&uri, None).await.unwrap();
        assert_eq!(ready.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_watcher_remove_deletes() {
        let f = fixture();
        let uri = test_uri("IDEAS.md");
        f.files.insert(uri.clone(), FILE_TEXT);
        f.indexer.add(&uri, None).await.unwrap();

        f.events.emit(Event::WatcherRemove(uri.clone()));
        assert_eq!(f.removed.load(Ordering::SeqCst), 1);
        assert!(f.indexer.uris().is_empty());
    }

    #[test]
    fn test_roots() {
        let events = EventBus::new();
        let indexer = Indexer::new(
            events.clone(),
            Workqueue::new(events),
            Arc::new(MarkdownProcessor),
            Arc::new(MemoryFileSource::new()),
        );

        indexer.add_root(&Url::parse("file:///work/notes").unwrap());
        indexer.add_root(&Url::parse("file:///work/notes/").unwrap());
        indexer.add_root(&Url::parse("file:///work/other").unwrap());
        assert_eq!(indexer.roots().len(), 2);

        let root = indexer.find_root(&test_uri("IDEAS.md")).unwrap();
        assert_eq!(root.as_str(), "file:///work/notes/");
        assert!(indexer
            .find_root(&Url::parse("file:///work/notes2/a.md").unwrap())
            .is_none());

        indexer.remove_root(&Url::parse("file:///work/notes").unwrap());
        assert_eq!(indexer.roots().len(), 1);
    }
}
