//! Pluggable storage for generated itinerary documents.
//!
//! Jobs record the identifier of the backend they were prepared with, and [`FileManagers`]
//! resolves that identifier back to an implementation when the file is written, read or reclaimed.
use std::{collections::HashMap, pin::Pin, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

pub mod local;
pub mod memory;

/// Identifier of the local filesystem backend and the default when none is configured.
pub const LOCAL: &str = "local";

pub type FileReader = Pin<Box<dyn AsyncRead + Send + Unpin>>;

#[derive(Debug, Error)]
pub enum FileManagerError {
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("Invalid file path: {0}")]
    InvalidPath(String),
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FileManager: Send + Sync {
    async fn save(&self, path: &str, content: &[u8]) -> Result<(), FileManagerError>;
    async fn open(&self, path: &str) -> Result<FileReader, FileManagerError>;
    async fn delete(&self, path: &str) -> Result<(), FileManagerError>;
}

/// The registry of storage backends, keyed by identifier.
#[derive(Clone)]
pub struct FileManagers {
    managers: HashMap<String, Arc<dyn FileManager>>,
    default: Arc<dyn FileManager>,
}

impl FileManagers {
    /// Create a registry whose fallback is `manager`, registered under `id`.
    pub fn new(id: impl Into<String>, manager: Arc<dyn FileManager>) -> Self {
        let mut managers = HashMap::new();
        managers.insert(id.into(), manager.clone());
        Self {
            managers,
            default: manager,
        }
    }

    pub fn with_manager(mut self, id: impl Into<String>, manager: Arc<dyn FileManager>) -> Self {
        self.managers.insert(id.into(), manager);
        self
    }

    /// Look up a backend. Unknown identifiers resolve to the default backend.
    pub fn resolve(&self, id: &str) -> Arc<dyn FileManager> {
        match self.managers.get(id) {
            Some(manager) => manager.clone(),
            None => {
                tracing::warn!(
                    file_manager = id,
                    "Unknown file manager {id}, falling back to the default"
                );
                self.default.clone()
            }
        }
    }
}
