use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

use crate::atomic::AtomicFile;

/// The consume directory downstream tooling watches.
#[derive(Clone, Debug)]
pub struct ConsumeDir {
    root: PathBuf,
}

impl ConsumeDir {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// Only a single plain path component is accepted.
    fn resolve(&self, name: &str) -> Result<PathBuf, StorageError> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(segment)), None) if !name.starts_with('.') => {
                Ok(self.root.join(segment))
            }
            _ => Err(StorageError::InvalidName(name.to_string())),
        }
    }

    /// Writes `bytes` to `<root>/<name>`, replacing any existing file.
    pub async fn save(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, StorageError> {
        let target = self.resolve(name)?;
        self.ensure_root().await?;

        let mut atomic = AtomicFile::new(&target).await?;
        if let Err(err) = atomic.write_all(bytes).await {
            atomic.cleanup().await;
            return Err(StorageError::Io(err));
        }
        atomic.finalize().await?;
        Ok(target)
    }
}

#[derive(Debug)]
pub enum StorageError {
    InvalidName(String),
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}
