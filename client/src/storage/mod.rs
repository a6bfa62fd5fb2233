//! Placement of downloaded bytes on disk.
//!
//! [`Storage`] resolves the download directory; [`StorageWriter`] owns the
//! pre-sized destination files and maps absolute content offsets onto them.

mod writer;

pub use writer::{Segment, StorageWriter, segments};

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("write of {len} bytes at offset {offset} exceeds content length {total}")]
    OutOfBounds { offset: u64, len: u64, total: u64 },

    #[error("storage is already closed")]
    Closed,
}

impl StorageError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(io::Error) -> StorageError + '_ {
        move |source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Manages the download directory.
///
/// The `Storage` struct is responsible for determining the download directory,
/// creating it if it doesn't exist, and resolving file paths relative to it.
pub struct Storage {
    /// The root directory where files will be stored.
    pub download_dir: PathBuf,
}

impl Storage {
    /// Creates a new `Storage` instance.
    ///
    /// If a `path` is provided, it uses that as the download directory.
    /// If `path` is `None`, it defaults to a `downloads` directory in the
    /// current working directory.
    ///
    /// This function also attempts to create the directory if it does not exist.
    pub async fn new(path: Option<PathBuf>) -> Result<Self, StorageError> {
        let download_dir = match path {
            Some(p) => p,
            None => std::env::current_dir()
                .map_err(StorageError::io(Path::new(".")))?
                .join("downloads"),
        };

        match fs::metadata(&download_dir).await {
            Ok(metadata) if !metadata.is_dir() => {
                return Err(StorageError::Io {
                    path: download_dir,
                    source: io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        "Path exists but is not a directory",
                    ),
                });
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&download_dir)
                    .await
                    .map_err(StorageError::io(&download_dir))?;
            }
            Err(e) => return Err(StorageError::io(&download_dir)(e)),
        }

        Ok(Self { download_dir })
    }

    /// Resolves the full path for a given relative path inside the download directory.
    pub fn get_file_path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.download_dir.join(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_new_storage_with_path() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("nested").join("out");

        let storage = Storage::new(Some(path.clone()))
            .await
            .expect("Failed to create storage");
        assert_eq!(storage.download_dir, path);
        assert!(storage.download_dir.is_dir());
    }

    #[tokio::test]
    async fn test_get_file_path() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let storage = Storage {
            download_dir: temp_dir.path().to_path_buf(),
        };

        assert_eq!(
            storage.get_file_path("dir/test_file.txt"),
            temp_dir.path().join("dir/test_file.txt")
        );
    }

    #[tokio::test]
    async fn test_storage_creation_fails_on_file_path() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let file_path = temp_dir.path().join("i_am_a_file");
        fs::write(&file_path, "content").await.unwrap();

        let result = Storage::new(Some(file_path)).await;
        assert!(
            matches!(result, Err(StorageError::Io { .. })),
            "Should return error if path exists and is not a directory"
        );
    }
}
