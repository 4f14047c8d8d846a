//! Staging files handed to the external publisher.
//!
//! Each publish writes its serialized envelope to a file named
//! `<dir>/<prefix>.message.<topic>.<id>`, which the publisher reads. The file
//! is owned by the in-flight publish and removed once the publisher exits.

use std::path::{Path, PathBuf};

/// Path of the staging file for request `id` on `topic`.
pub fn staging_path(dir: &Path, prefix: &str, topic: &str, id: &uuid::Uuid) -> PathBuf {
    dir.join(format!("{prefix}.message.{topic}.{id}"))
}

/// A staging file written to disk.
///
/// Not removed on drop: removal is asynchronous and its failure must be
/// reported, so callers go through [`StagingFile::remove`].
#[derive(Debug)]
#[must_use = "staging files must be removed once the publisher exits"]
pub struct StagingFile {
    path: PathBuf,
}

impl StagingFile {
    /// Write `contents` to `path`.
    ///
    /// A file left behind by a failed write is removed before the error is
    /// returned.
    #[tracing::instrument(skip(contents))]
    pub async fn write(path: PathBuf, contents: &[u8]) -> std::io::Result<Self> {
        match tokio::fs::write(&path, contents).await {
            Ok(()) => Ok(Self { path }),
            Err(err) => {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => tracing::warn!(?path, "Removed partially written staging file"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        tracing::error!(error = ?e, ?path, "Failed to remove partial staging file")
                    }
                }
                Err(err)
            }
        }
    }

    /// Location of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file.
    #[tracing::instrument(skip(self), fields(path = ?self.path))]
    pub async fn remove(self) -> std::io::Result<()> {
        tokio::fs::remove_file(&self.path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_follows_prefix_topic_id_pattern() {
        let id = uuid::Uuid::new_v4();
        let path = staging_path(Path::new("/tmp"), "elytron", "orders", &id);

        assert_eq!(
            path,
            PathBuf::from(format!("/tmp/elytron.message.orders.{id}"))
        );
    }

    #[tokio::test]
    async fn write_then_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = staging_path(dir.path(), "elytron", "orders", &uuid::Uuid::new_v4());

        let staged = StagingFile::write(path.clone(), b"{}").await.unwrap();
        assert_eq!(std::fs::read_to_string(staged.path()).unwrap(), "{}");

        staged.remove().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn remove_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = staging_path(dir.path(), "elytron", "orders", &uuid::Uuid::new_v4());

        let staged = StagingFile::write(path.clone(), b"{}").await.unwrap();
        std::fs::remove_file(&path).unwrap();

        let err = staged.remove().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn write_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("elytron.message.orders.1");

        assert!(StagingFile::write(path.clone(), b"{}").await.is_err());
        assert!(!path.exists());
    }
}
