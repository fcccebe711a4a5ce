//
// watcher.rs
//
// Filesystem watcher: initial scan per root plus notify-driven updates
//

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use notify::{EventKind as FsEventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use url::Url;
use walkdir::WalkDir;

use crate::config::Config;
use crate::events::{Event, EventBus, EventKind};

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("not a file uri: {0}")]
    InvalidUri(Url),
    #[error(transparent)]
    Notify(#[from] notify::Error),
    #[error("scan of {0} did not complete")]
    Scan(Url),
}

/// All document files below `root`, skipping ignored directories.
pub fn scan_folder(root: &Path, config: &Config) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || !config
                    .ignored_dirs
                    .iter()
                    .any(|dir| entry.file_name() == dir.as_str())
        })
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                log::debug!("watcher :: skipping entry: {}", err);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && config.is_document_file(entry.path()))
        .map(walkdir::DirEntry::into_path)
        .collect()
}

struct Folder {
    uri: Url,
    path: PathBuf,
    _watcher: RecommendedWatcher,
}

struct Inner {
    events: EventBus,
    config: Config,
    folders: Mutex<Vec<Folder>>,
    files: Mutex<BTreeSet<Url>>,
}

impl Inner {
    fn folders(&self) -> MutexGuard<'_, Vec<Folder>> {
        self.folders.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn files(&self) -> MutexGuard<'_, BTreeSet<Url>> {
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn covers(&self, path: &Path) -> bool {
        self.folders()
            .iter()
            .any(|folder| path.starts_with(&folder.path))
    }

    fn handle(&self, event: notify::Event) {
        if matches!(event.kind, FsEventKind::Access(_)) {
            return;
        }

        for path in event.paths {
            if self.config.is_ignored(&path) {
                continue;
            }

            if path.is_dir() {
                // a folder created or moved in: only its path is reported
                for file in scan_folder(&path, &self.config) {
                    self.add_file(&file);
                }
            } else if self.config.is_document_file(&path) {
                if path.is_file() {
                    self.add_file(&path);
                } else if let Ok(uri) = Url::from_file_path(&path) {
                    if self.files().remove(&uri) {
                        log::trace!("watcher :: remove {}", uri);
                        self.events.emit(Event::WatcherRemove(uri));
                    }
                }
            } else if !path.exists() {
                // a folder deleted or moved out
                for uri in self.forget_under(&path, false) {
                    log::trace!("watcher :: remove {}", uri);
                    self.events.emit(Event::WatcherRemove(uri));
                }
            }
        }
    }

    fn add_file(&self, path: &Path) {
        let Ok(uri) = Url::from_file_path(path) else {
            return;
        };
        self.files().insert(uri.clone());
        log::trace!("watcher :: add {}", uri);
        self.events.emit(Event::WatcherAdd(uri));
    }

    /// Drop every known file below `path` and return them. With
    /// `keep_covered`, files some watched folder still covers are kept.
    fn forget_under(&self, path: &Path, keep_covered: bool) -> Vec<Url> {
        let mut files = self.files();
        let gone: Vec<Url> = files
            .iter()
            .filter(|file| {
                file.to_file_path().is_ok_and(|file| {
                    file.starts_with(path) && !(keep_covered && self.covers(&file))
                })
            })
            .cloned()
            .collect();
        for file in &gone {
            files.remove(file);
        }
        gone
    }
}

/// Watches every root folder for document files.
///
/// Follows `RootAdded`/`RootRemoved` once created. Emits `WatcherAdd` for
/// every document found or written, `WatcherRemove` for every one deleted,
/// and `WatcherReady` after each folder's initial scan.
#[derive(Clone)]
pub struct Watcher {
    inner: Arc<Inner>,
}

impl Watcher {
    pub fn new(events: EventBus, config: Config) -> Self {
        let inner = Arc::new(Inner {
            events: events.clone(),
            config,
            folders: Mutex::new(Vec::new()),
            files: Mutex::new(BTreeSet::new()),
        });

        let weak = Arc::downgrade(&inner);
        events.on(EventKind::RootAdded, move |event| {
            if let Event::RootAdded(uri) = event {
                let uri = uri.clone();
                with_watcher(&weak, |watcher| {
                    tokio::spawn(async move {
                        if let Err(err) = watcher.add_folder(&uri).await {
                            log::warn!("watcher :: cannot watch {}: {}", uri, err);
                        }
                    });
                });
            }
        });

        let weak = Arc::downgrade(&inner);
        events.on(EventKind::RootRemoved, move |event| {
            if let Event::RootRemoved(uri) = event {
                with_watcher(&weak, |watcher| watcher.remove_folder(uri));
            }
        });

        Self { inner }
    }

    /// Scan and start watching `uri`. Folders inside an already watched
    /// folder are ignored.
    pub async fn add_folder(&self, uri: &Url) -> Result<(), WatchError> {
        let path = uri
            .to_file_path()
            .map_err(|_| WatchError::InvalidUri(uri.clone()))?;

        if self.inner.covers(&path) {
            log::debug!("watcher :: {} is already watched", uri);
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = tx.send(res);
        })?;
        watcher.watch(&path, RecursiveMode::Recursive)?;

        self.inner.folders().push(Folder {
            uri: uri.clone(),
            path: path.clone(),
            _watcher: watcher,
        });
        log::info!("watcher :: watching {}", path.display());

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match res {
                    Ok(event) => inner.handle(event),
                    Err(err) => log::warn!("watcher :: watch error: {}", err),
                }
            }
        });

        let config = self.inner.config.clone();
        let scan_path = path.clone();
        let found = tokio::task::spawn_blocking(move || scan_folder(&scan_path, &config))
            .await
            .map_err(|_| WatchError::Scan(uri.clone()))?;

        log::info!("watcher :: found {} documents in {}", found.len(), path.display());

        for file in found {
            let Ok(file_uri) = Url::from_file_path(&file) else {
                continue;
            };
            self.inner.files().insert(file_uri.clone());
            self.inner.events.emit(Event::WatcherAdd(file_uri));
        }

        self.inner.events.emit(Event::WatcherReady);
        Ok(())
    }

    /// Stop watching `uri`; its documents are reported removed.
    pub fn remove_folder(&self, uri: &Url) {
        let removed = {
            let mut folders = self.inner.folders();
            let before = folders.len();
            folders.retain(|folder| folder.uri != *uri);
            before != folders.len()
        };
        if !removed {
            return;
        }

        let Ok(path) = uri.to_file_path() else {
            return;
        };
        log::info!("watcher :: stopped watching {}", path.display());

        for file in self.inner.forget_under(&path, true) {
            self.inner.events.emit(Event::WatcherRemove(file));
        }
    }

    /// Document files currently known to the watcher.
    pub fn files(&self) -> Vec<Url> {
        self.inner.files().iter().cloned().collect()
    }

    pub fn folders(&self) -> Vec<Url> {
        self.inner
            .folders()
            .iter()
            .map(|folder| folder.uri.clone())
            .collect()
    }

    /// Stop all watches.
    pub fn close(&self) {
        self.inner.folders().clear();
        self.inner.files().clear();
        log::debug!("watcher :: closed");
    }
}

fn with_watcher(weak: &Weak<Inner>, f: impl FnOnce(Watcher)) {
    if let Some(inner) = weak.upgrade() {
        f(Watcher { inner });
    }
}
