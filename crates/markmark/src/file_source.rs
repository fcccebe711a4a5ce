//
// file_source.rs
//
// File-read collaborator used by the indexer
//

use std::collections::HashMap;
use std::io;
use std::sync::RwLock;

use async_trait::async_trait;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum FileSourceError {
    #[error("file not found: {0}")]
    NotFound(Url),
    #[error("failed to read {uri}: {source}")]
    Io {
        uri: Url,
        #[source]
        source: io::Error,
    },
    #[error("not a file uri: {0}")]
    InvalidUri(Url),
}

/// Reads document text by URI.
#[async_trait]
pub trait FileSource: Send + Sync {
    async fn read(&self, uri: &Url) -> Result<String, FileSourceError>;
}

/// Reads `file://` URIs from disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskFileSource;

#[async_trait]
impl FileSource for DiskFileSource {
    async fn read(&self, uri: &Url) -> Result<String, FileSourceError> {
        let path = uri
            .to_file_path()
            .map_err(|_| FileSourceError::InvalidUri(uri.clone()))?;

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(FileSourceError::NotFound(uri.clone()))
            }
            Err(source) => Err(FileSourceError::Io {
                uri: uri.clone(),
                source,
            }),
        }
    }
}

/// In-memory file source for tests and embedders without a filesystem.
#[derive(Debug, Default)]
pub struct MemoryFileSource {
    files: RwLock<HashMap<Url, String>>,
}

impl MemoryFileSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, uri: Url, text: impl Into<String>) {
        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(uri, text.into());
    }

    pub fn remove(&self, uri: &Url) {
        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(uri);
    }
}

#[async_trait]
impl FileSource for MemoryFileSource {
    async fn read(&self, uri: &Url) -> Result<String, FileSourceError> {
        self.files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(uri)
            .cloned()
            .ok_or_else(|| FileSourceError::NotFound(uri.clone()))
    }
}
