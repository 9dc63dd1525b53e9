//! A [`FileManager`] writing to a directory on the local filesystem.
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::instrument;

use super::{FileManager, FileManagerError, FileReader};

#[derive(Debug, Clone)]
pub struct LocalFileManager {
    root: PathBuf,
}

impl LocalFileManager {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative storage path under the root, refusing anything that could escape it.
    fn resolve(&self, path: &str) -> Result<PathBuf, FileManagerError> {
        let relative = Path::new(path);
        let is_plain = !path.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !is_plain {
            return Err(FileManagerError::InvalidPath(path.to_owned()));
        }
        Ok(self.root.join(relative))
    }

    fn io_error(path: &Path, source: std::io::Error) -> FileManagerError {
        match source.kind() {
            std::io::ErrorKind::NotFound => {
                FileManagerError::NotFound(path.display().to_string())
            }
            _ => FileManagerError::Io {
                path: path.display().to_string(),
                source,
            },
        }
    }
}

#[async_trait]
impl FileManager for LocalFileManager {
    #[instrument(skip(self, content), fields(bytes = content.len()))]
    async fn save(&self, path: &str, content: &[u8]) -> Result<(), FileManagerError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| Self::io_error(parent, err))?;
        }

        // Write next to the target and rename, so readers never observe a partial file.
        let staging = target.with_extension(format!("{}.partial", uuid::Uuid::new_v4()));
        tokio::fs::write(&staging, content)
            .await
            .map_err(|err| Self::io_error(&staging, err))?;
        if let Err(err) = tokio::fs::rename(&staging, &target).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(Self::io_error(&target, err));
        }
        tracing::debug!(path = %target.display(), "Saved file");
        Ok(())
    }

    async fn open(&self, path: &str) -> Result<FileReader, FileManagerError> {
        let target = self.resolve(path)?;
        let file = tokio::fs::File::open(&target)
            .await
            .map_err(|err| Self::io_error(&target, err))?;
        Ok(Box::pin(file))
    }

    #[instrument(skip(self))]
    async fn delete(&self, path: &str) -> Result<(), FileManagerError> {
        let target = self.resolve(path)?;
        tokio::fs::remove_file(&target)
            .await
            .map_err(|err| Self::io_error(&target, err))
    }
}
