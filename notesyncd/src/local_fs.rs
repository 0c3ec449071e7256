use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LocalIoError {
    #[error("{} does not exist", .0.display())]
    NotFound(PathBuf),
    #[error("permission denied for {}", .0.display())]
    PermissionDenied(PathBuf),
    #[error("I/O error on {}: {source}", path.display())]
    Other {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LocalIoError {
    pub fn from_io(path: &Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => LocalIoError::NotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => LocalIoError::PermissionDenied(path.to_path_buf()),
            _ => LocalIoError::Other {
                path: path.to_path_buf(),
                source: err,
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, LocalIoError::NotFound(_))
    }
}

/// Whole-file access to note bodies on local disk.
#[async_trait]
pub trait LocalFiles: Send + Sync {
    async fn read(&self, path: &Path) -> Result<String, LocalIoError>;
    async fn write(&self, path: &Path, body: &str) -> Result<(), LocalIoError>;
    async fn rename(&self, from: &Path, to: &Path) -> Result<(), LocalIoError>;
    async fn delete(&self, path: &Path) -> Result<(), LocalIoError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FsLocalFiles;

#[async_trait]
impl LocalFiles for FsLocalFiles {
    async fn read(&self, path: &Path) -> Result<String, LocalIoError> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|err| LocalIoError::from_io(path, err))
    }

    async fn write(&self, path: &Path, body: &str) -> Result<(), LocalIoError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| LocalIoError::from_io(parent, err))?;
        }
        tokio::fs::write(path, body)
            .await
            .map_err(|err| LocalIoError::from_io(path, err))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), LocalIoError> {
        tokio::fs::rename(from, to)
            .await
            .map_err(|err| LocalIoError::from_io(from, err))
    }

    async fn delete(&self, path: &Path) -> Result<(), LocalIoError> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|err| LocalIoError::from_io(path, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn write_creates_parent_dirs_and_reads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/Todo.md");

        FsLocalFiles.write(&path, "# hello").await.unwrap();

        assert_eq!(FsLocalFiles.read(&path).await.unwrap(), "# hello");
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.md");

        let err = FsLocalFiles.read(&path).await.unwrap_err();

        assert!(err.is_not_found());
        assert!(matches!(err, LocalIoError::NotFound(p) if p == path));
    }

    #[tokio::test]
    async fn rename_moves_content() {
        let dir = tempdir().unwrap();
        let from = dir.path().join("Old.md");
        let to = dir.path().join("New.md");
        std::fs::write(&from, "body").unwrap();

        FsLocalFiles.rename(&from, &to).await.unwrap();

        assert!(!from.exists());
        assert_eq!(std::fs::read_to_string(&to).unwrap(), "body");
    }

    #[tokio::test]
    async fn delete_of_missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let err = FsLocalFiles
            .delete(&dir.path().join("gone.md"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn permission_errors_are_classified() {
        let err = LocalIoError::from_io(
            Path::new("/root/locked.md"),
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(err, LocalIoError::PermissionDenied(_)));

        let err = LocalIoError::from_io(Path::new("/x"), io::Error::other("disk full"));
        assert!(matches!(err, LocalIoError::Other { .. }));
    }
}
