//
// markmark.rs
//
// Engine facade: one event bus, all components wired together
//

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use url::Url;

use crate::completions::Completions;
use crate::config::Config;
use crate::events::{Event, EventBus};
use crate::file_source::{DiskFileSource, FileSource};
use crate::indexer::{IndexError, IndexItem, Indexer, Removal};
use crate::linter::Linter;
use crate::markdown::MarkdownProcessor;
use crate::processor::Processor;
use crate::references::References;
use crate::types::{Completion, LintReport, LocationRef, Positioned};
use crate::watcher::{scan_folder, Watcher};
use crate::workqueue::Workqueue;

/// How roots are kept in sync with the filesystem.
enum Mode {
    /// `init` has not run yet.
    Idle,
    /// The built-in watcher follows every root.
    Watching(Watcher),
    /// Roots are scanned once; the client reports later changes.
    Scanned,
}

pub struct Markmark {
    config: Config,
    events: EventBus,
    workqueue: Workqueue,
    indexer: Indexer,
    references: References,
    linter: Linter,
    completions: Completions,
    mode: Mutex<Mode>,
}

impl Markmark {
    pub fn new(config: Config, processor: Arc<dyn Processor>, file_source: Arc<dyn FileSource>) -> Self {
        let events = EventBus::new();
        let workqueue = Workqueue::new(events.clone());
        let indexer = Indexer::new(events.clone(), workqueue.clone(), processor, file_source);
        let references = References::new(events.clone(), config.debounce());
        let linter = Linter::new(events.clone(), references.clone(), config.clone());
        let completions = Completions::new(indexer.clone(), references.clone());

        Self {
            config,
            events,
            workqueue,
            indexer,
            references,
            linter,
            completions,
            mode: Mutex::new(Mode::Idle),
        }
    }

    /// Engine reading documents from disk with the markdown processor.
    pub fn with_config(config: Config) -> Self {
        Self::new(config, Arc::new(MarkdownProcessor), Arc::new(DiskFileSource))
    }

    fn mode(&self) -> MutexGuard<'_, Mode> {
        self.mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn workqueue(&self) -> &Workqueue {
        &self.workqueue
    }

    pub fn indexer(&self) -> &Indexer {
        &self.indexer
    }

    pub fn references(&self) -> &References {
        &self.references
    }

    /// Apply settings received after startup.
    ///
    /// Debounce and severity take effect immediately and diagnostics are
    /// re-published. Document extensions, ignored directories and the
    /// watcher mode are fixed for the lifetime of the engine.
    pub fn apply_config(&self, config: &Config) {
        self.references.set_debounce(config.debounce());
        self.linter.set_severity(config.unresolved_link_severity);

        if config.document_extensions != self.config.document_extensions
            || config.ignored_dirs != self.config.ignored_dirs
            || config.watcher_enabled != self.config.watcher_enabled
        {
            log::warn!("markmark :: extension, ignore and watch settings apply after a restart");
        }

        self.events.emit(Event::LinterLint(Arc::new(self.linter.lint())));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn add_root(&self, uri: &Url) {
        self.indexer.add_root(uri);
        if matches!(*self.mode(), Mode::Scanned) {
            self.spawn_scan(vec![uri.clone()]);
        }
    }

    pub fn remove_root(&self, uri: &Url) {
        self.indexer.remove_root(uri);
        if matches!(*self.mode(), Mode::Scanned) {
            let Ok(root) = uri.to_file_path() else {
                return;
            };
            for doc in self.indexer.uris() {
                let under_root = doc.to_file_path().is_ok_and(|path| path.starts_with(&root));
                if under_root && self.indexer.find_root(&doc).is_none() {
                    self.indexer.remove(&doc, false);
                }
            }
        }
    }

    /// Start tracking documents under every root.
    ///
    /// With `watch`, the built-in watcher scans and follows each root.
    /// Otherwise each root is scanned once and the caller reports changes
    /// through [`Markmark::add_file`] and friends. Either way `IndexerReady`
    /// follows once the scan has been indexed.
    pub async fn init(&self, watch: bool) {
        let roots = self.indexer.roots();
        log::info!("markmark :: init ({} roots, watch: {})", roots.len(), watch);

        if !watch {
            *self.mode() = Mode::Scanned;
            self.scan(roots).await;
            return;
        }

        let watcher = Watcher::new(self.events.clone(), self.config.clone());
        *self.mode() = Mode::Watching(watcher.clone());
        for root in roots {
            if let Err(err) = watcher.add_folder(&root).await {
                log::warn!("markmark :: cannot watch {}: {}", root, err);
            }
        }
    }

    fn spawn_scan(&self, roots: Vec<Url>) {
        let indexer = self.indexer.clone();
        let events = self.events.clone();
        let config = self.config.clone();
        tokio::spawn(async move { scan_roots(indexer, events, config, roots).await });
    }

    async fn scan(&self, roots: Vec<Url>) {
        scan_roots(self.indexer.clone(), self.events.clone(), self.config.clone(), roots).await
    }

    pub fn add_file(
        &self,
        uri: &Url,
    ) -> impl Future<Output = Result<Arc<IndexItem>, IndexError>> + Send + 'static {
        self.indexer.add(uri, None)
    }

    pub fn update_file(
        &self,
        uri: &Url,
    ) -> impl Future<Output = Result<Arc<IndexItem>, IndexError>> + Send + 'static {
        self.indexer.add(uri, None)
    }

    pub fn remove_file(&self, uri: &Url) -> Removal {
        self.indexer.remove(uri, false)
    }

    pub fn file_open(
        &self,
        uri: &Url,
        text: String,
    ) -> impl Future<Output = Result<Arc<IndexItem>, IndexError>> + Send + 'static {
        self.indexer.file_open(uri, text)
    }

    pub fn file_content_changed(
        &self,
        uri: &Url,
        text: String,
    ) -> impl Future<Output = Result<Arc<IndexItem>, IndexError>> + Send + 'static {
        self.indexer.file_content_changed(uri, text)
    }

    pub fn file_closed(&self, uri: &Url) -> Removal {
        self.indexer.file_closed(uri)
    }

    pub fn find_references(&self, location: &LocationRef) -> Vec<Positioned> {
        self.references.find_references(location)
    }

    pub fn find_definitions(&self, location: &LocationRef) -> Vec<Positioned> {
        self.references.find_definitions(location)
    }

    pub async fn get_completions(&self, location: &LocationRef) -> Vec<Completion> {
        self.completions.get(location).await
    }

    /// Lint the current graph now, without waiting for the next change.
    pub fn lint(&self) -> Vec<LintReport> {
        self.linter.lint()
    }

    /// Resolve once nothing is being indexed.
    pub async fn settled(&self) {
        self.workqueue.wait_empty().await
    }

    /// Stop watching and release every subscriber.
    pub fn close(&self) {
        if let Mode::Watching(watcher) = std::mem::replace(&mut *self.mode(), Mode::Idle) {
            watcher.close();
        }
        self.references.cancel_pending();
        self.events.clear();
        log::info!("markmark :: closed");
    }
}

async fn scan_roots(indexer: Indexer, events: EventBus, config: Config, roots: Vec<Url>) {
    for root in roots {
        let Ok(path) = root.to_file_path() else {
            log::warn!("markmark :: cannot scan {}", root);
            continue;
        };
        let scan_config = config.clone();
        let found = match tokio::task::spawn_blocking(move || scan_folder(&path, &scan_config)).await {
            Ok(found) => found,
            Err(err) => {
                log::warn!("markmark :: scan of {} failed: {}", root, err);
                continue;
            }
        };
        log::info!("markmark :: found {} documents in {}", found.len(), root);
        for file in found {
            if let Ok(uri) = Url::from_file_path(&file) {
                // indexing continues in the background
                drop(indexer.add(&uri, None));
            }
        }
    }
    events.emit(Event::WatcherReady);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::file_source::MemoryFileSource;
    use crate::types::{Point, Severity};
    use std::time::Duration;

    fn engine() -> (Markmark, Arc<MemoryFileSource>) {
        let files = Arc::new(MemoryFileSource::new());
        let engine = Markmark::new(Config::default(), Arc::new(MarkdownProcessor), files.clone());
        (engine, files)
    }

    fn uri(name: &str) -> Url {
        Url::parse(&format!("file:///notes/{}", name)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_lint_follows_debounced_changes() {
        let (engine, files) = engine();
        let mut stream = engine.subscribe();

        files.insert(uri("IDEAS.md"), "# Ideas\n\n[](./NOTES.md)\n");
        engine.add_file(&uri("IDEAS.md")).await.unwrap();
        engine.settled().await;

        let reports = loop {
            match stream.recv().await.unwrap() {
                Event::LinterLint(reports) => break reports,
                _ => continue,
            }
        };
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].uri, uri("IDEAS.md"));

        files.insert(uri("NOTES.md"), "# Notes\n");
        engine.add_file(&uri("NOTES.md")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let reports = loop {
            match stream.recv().await.unwrap() {
                Event::LinterLint(reports) => break reports,
                _ => continue,
            }
        };
        assert!(reports.is_empty());
    }

    #[tokio::test]
    async fn test_queries_pass_through() {
        let (engine, files) = engine();
        engine.add_root(&Url::parse("file:///notes/").unwrap());
        files.insert(uri("NOTES.md"), "# Notes\n\n#idea\n");
        engine.add_file(&uri("NOTES.md")).await.unwrap();
        engine
            .file_open(&uri("IDEAS.md"), "[](./NOTES.md#notes) #\n".to_string())
            .await
            .unwrap();

        let at_link = LocationRef::new(uri("IDEAS.md"), Point::new(1, 3));
        let definitions = engine.find_definitions(&at_link);
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].uri, uri("NOTES.md"));
        assert_eq!(engine.find_references(&at_link).len(), 1);

        let after_hash = LocationRef::new(uri("IDEAS.md"), Point::new(1, 23));
        let completions = engine.get_completions(&after_hash).await;
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].label, "#idea");

        assert_eq!(engine.file_closed(&uri("IDEAS.md")), Removal::Deleted);
        assert!(engine.find_definitions(&at_link).is_empty());
    }

    #[tokio::test]
    async fn test_file_changes_index_without_awaiting() {
        let (engine, files) = engine();
        files.insert(uri("NEW.md"), "# New\n");
        files.insert(uri("OLD.md"), "# Old\n");
        engine.add_file(&uri("OLD.md")).await.unwrap();

        files.insert(uri("OLD.md"), "# Changed\n");
        drop(engine.add_file(&uri("NEW.md")));
        drop(engine.update_file(&uri("OLD.md")));
        engine.settled().await;

        let new = engine.indexer().get(&uri("NEW.md")).await.unwrap().unwrap();
        assert_eq!(&*new.value, "# New\n");
        let old = engine.indexer().get(&uri("OLD.md")).await.unwrap().unwrap();
        assert_eq!(&*old.value, "# Changed\n");
    }

    #[tokio::test]
    async fn test_apply_config_republishes_lints() {
        let (engine, files) = engine();
        files.insert(uri("IDEAS.md"), "[](./MISSING.md)\n");
        engine.add_file(&uri("IDEAS.md")).await.unwrap();
        engine.settled().await;

        let mut stream = engine.subscribe();
        engine.apply_config(&Config {
            unresolved_link_severity: Severity::Error,
            references_debounce_ms: 50,
            ..Config::default()
        });

        let reports = loop {
            match stream.recv().await.unwrap() {
                Event::LinterLint(reports) => break reports,
                _ => continue,
            }
        };
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].results[0].severity, Severity::Error);
        assert_eq!(engine.lint()[0].results[0].severity, Severity::Error);
    }

    #[tokio::test]
    async fn test_init_without_watch_scans_roots() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("IDEAS.md"), "# Ideas\n").unwrap();
        std::fs::write(dir.path().join("NOTES.md"), "[](./IDEAS.md)\n").unwrap();

        let engine = Markmark::with_config(Config::default());
        let ready = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = ready.clone();
        engine.events().on(EventKind::IndexerReady, move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        engine.add_root(&Url::from_directory_path(dir.path()).unwrap());
        engine.init(false).await;
        engine.settled().await;

        assert_eq!(ready.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(engine.indexer().items().len(), 2);
        assert!(engine.lint().is_empty());

        engine.close();
    }
}
