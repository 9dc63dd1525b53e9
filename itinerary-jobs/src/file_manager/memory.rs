//! An in memory [`FileManager`], for tests.
use std::{
    collections::HashMap,
    io::Cursor,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;

use super::{FileManager, FileManagerError, FileReader};

#[derive(Clone, Default)]
pub struct InMemoryFileManager {
    files: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl InMemoryFileManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files
            .read()
            .map(|files| files.contains_key(path))
            .unwrap_or_default()
    }

    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        self.files
            .read()
            .ok()
            .and_then(|files| files.get(path).cloned())
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths = self
            .files
            .read()
            .map(|files| files.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        paths.sort();
        paths
    }

    fn poisoned(path: &str) -> FileManagerError {
        FileManagerError::Io {
            path: path.to_owned(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "lock poisoned"),
        }
    }
}

#[async_trait]
impl FileManager for InMemoryFileManager {
    async fn save(&self, path: &str, content: &[u8]) -> Result<(), FileManagerError> {
        self.files
            .write()
            .map_err(|_| Self::poisoned(path))?
            .insert(path.to_owned(), content.to_vec());
        Ok(())
    }

    async fn open(&self, path: &str) -> Result<FileReader, FileManagerError> {
        let content = self
            .files
            .read()
            .map_err(|_| Self::poisoned(path))?
            .get(path)
            .cloned()
            .ok_or_else(|| FileManagerError::NotFound(path.to_owned()))?;
        Ok(Box::pin(Cursor::new(content)))
    }

    async fn delete(&self, path: &str) -> Result<(), FileManagerError> {
        self.files
            .write()
            .map_err(|_| Self::poisoned(path))?
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| FileManagerError::NotFound(path.to_owned()))
    }
}
