//
// events.rs
//
// Publish/subscribe context shared by the indexing components
//

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use url::Url;

use crate::indexer::IndexItem;
use crate::types::LintReport;

const BROADCAST_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    WatcherAdd,
    WatcherRemove,
    WatcherReady,
    RootAdded,
    RootRemoved,
    IndexerUpdated,
    IndexerRemoved,
    IndexerReady,
    WorkqueueEmpty,
    ReferencesChanged,
    LinterLint,
}

#[derive(Debug, Clone)]
pub enum Event {
    WatcherAdd(Url),
    WatcherRemove(Url),
    WatcherReady,
    RootAdded(Url),
    RootRemoved(Url),
    IndexerUpdated(Arc<IndexItem>),
    IndexerRemoved(Arc<IndexItem>),
    IndexerReady,
    WorkqueueEmpty,
    ReferencesChanged,
    LinterLint(Arc<Vec<LintReport>>),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::WatcherAdd(_) => EventKind::WatcherAdd,
            Event::WatcherRemove(_) => EventKind::WatcherRemove,
            Event::WatcherReady => EventKind::WatcherReady,
            Event::RootAdded(_) => EventKind::RootAdded,
            Event::RootRemoved(_) => EventKind::RootRemoved,
            Event::IndexerUpdated(_) => EventKind::IndexerUpdated,
            Event::IndexerRemoved(_) => EventKind::IndexerRemoved,
            Event::IndexerReady => EventKind::IndexerReady,
            Event::WorkqueueEmpty => EventKind::WorkqueueEmpty,
            Event::ReferencesChanged => EventKind::ReferencesChanged,
            Event::LinterLint(_) => EventKind::LinterLint,
        }
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct BusInner {
    handlers: RwLock<HashMap<EventKind, Vec<Handler>>>,
    sender: broadcast::Sender<Event>,
}

/// Event bus handed to every component at construction.
///
/// Synchronous handlers registered with [`EventBus::on`] run inline on the
/// emitting thread, in registration order. Every event is also forwarded to
/// broadcast receivers obtained from [`EventBus::subscribe`].
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.inner.sender.receiver_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(BusInner {
                handlers: RwLock::new(HashMap::new()),
                sender,
            }),
        }
    }

    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        handlers.entry(kind).or_default().push(Arc::new(handler));
    }

    pub fn emit(&self, event: Event) {
        // Handlers may emit further events, so the lock is released first.
        let handlers: Vec<Handler> = {
            let handlers = self
                .inner
                .handlers
                .read()
                .unwrap_or_else(|e| e.into_inner());
            handlers.get(&event.kind()).cloned().unwrap_or_default()
        };

        log::trace!("events :: emit {:?} ({} handlers)", event.kind(), handlers.len());

        for handler in &handlers {
            handler(&event);
        }

        // No receivers is fine.
        let _ = self.inner.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.sender.subscribe()
    }

    /// Drop every synchronous handler. Handlers hold component handles, so
    /// this is what releases them on shutdown.
    pub fn clear(&self) {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        handlers.clear();
    }
}
