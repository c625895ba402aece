use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{BlobStore, ByteStream, PutResult, UploadError, UploadResult};

const READ_BUFFER_BYTES: usize = 64 * 1024;

/// Blob store backed by a local directory.
///
/// Writes go to a uniquely named temp file beside the target, are fsynced,
/// and then renamed into place.
#[derive(Debug, Clone)]
pub struct FilesystemBlobStore {
    root: PathBuf,
}

impl FilesystemBlobStore {
    /// Open (creating if needed) a store rooted at `root`
    pub async fn new(root: impl AsRef<Path>) -> UploadResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a path under the root, rejecting anything that could escape it
    fn key_path(&self, key: &str) -> UploadResult<PathBuf> {
        let key = key.trim_matches('/');
        if key.is_empty() {
            return Err(UploadError::validation("Empty storage key"));
        }

        let relative = Path::new(key);
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => {
                    return Err(UploadError::validation(format!(
                        "Invalid storage key: {}",
                        key
                    )))
                }
            }
        }

        Ok(self.root.join(relative))
    }

    fn temp_path_for(path: &Path) -> PathBuf {
        let temp_name = format!(".tmp.{}", Uuid::new_v4());
        path.with_file_name(
            path.file_name()
                .map(|n| format!("{}{}", n.to_string_lossy(), temp_name))
                .unwrap_or_else(|| temp_name.clone()),
        )
    }

    async fn write_temp(temp_path: &Path, mut stream: ByteStream) -> UploadResult<u64> {
        let mut file = match fs::File::create(temp_path).await {
            // The parent may have been pruned by a concurrent delete
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if let Some(parent) = temp_path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::File::create(temp_path).await?
            }
            result => result?,
        };
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    /// Remove the directory holding `path` if it is now empty. Never touches the root.
    async fn prune_empty_parent(&self, path: &Path) {
        let Some(parent) = path.parent() else {
            return;
        };
        if parent == self.root || !parent.starts_with(&self.root) {
            return;
        }
        // Only succeeds once the directory is empty
        if let Err(e) = fs::remove_dir(parent).await {
            debug!(path = %parent.display(), error = %e, "Kept non-empty directory");
        }
    }
}

async fn count_files(dir: &Path) -> std::io::Result<usize> {
    let mut count = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else {
                count += 1;
            }
        }
    }
    Ok(count)
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    #[instrument(skip(self, stream), fields(backend = "filesystem"))]
    async fn put(&self, key: &str, stream: ByteStream) -> UploadResult<PutResult> {
        let path = self.key_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = Self::temp_path_for(&path);
        let size_bytes = match Self::write_temp(&temp_path, stream).await {
            Ok(size) => size,
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&temp_path).await {
                    if cleanup.kind() != ErrorKind::NotFound {
                        warn!(path = %temp_path.display(), error = %cleanup, "Failed to remove temp file");
                    }
                }
                return Err(e);
            }
        };
        fs::rename(&temp_path, &path).await?;

        Ok(PutResult { size_bytes })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, key: &str) -> UploadResult<Option<Bytes>> {
        let path = self.key_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get_stream(&self, key: &str) -> UploadResult<Option<ByteStream>> {
        let path = self.key_path(key)?;
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let stream = async_stream::stream! {
            let mut buf = vec![0u8; READ_BUFFER_BYTES];
            loop {
                match file.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        yield Ok(Bytes::copy_from_slice(&buf[..n]));
                    }
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        };
        Ok(Some(Box::pin(stream)))
    }

    /// Delete a blob. An emptied parent directory is removed as well.
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> UploadResult<()> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.prune_empty_parent(&path).await;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete_prefix(&self, prefix: &str) -> UploadResult<usize> {
        let path = self.key_path(prefix)?;
        let removed = match count_files(&path).await {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        match fs::remove_dir_all(&path).await {
            Ok(()) => Ok(removed),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes_stream;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path()).await.unwrap();

        let result = store
            .put("a/b/chunk_1", bytes_stream(Bytes::from_static(b"hello")))
            .await
            .unwrap();
        assert_eq!(result.size_bytes, 5);
        assert_eq!(
            store.get("a/b/chunk_1").await.unwrap(),
            Some(Bytes::from_static(b"hello"))
        );
        assert_eq!(store.get("a/b/chunk_2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path()).await.unwrap();

        let stream: ByteStream = Box::pin(futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"part")),
            Err(std::io::Error::new(ErrorKind::Other, "boom")),
        ]));
        assert!(store.put("x/out", stream).await.is_err());
        assert_eq!(store.get("x/out").await.unwrap(), None);
        assert_eq!(count_files(&dir.path().join("x")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_get_stream_reads_in_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path()).await.unwrap();
        let data = Bytes::from(vec![7u8; READ_BUFFER_BYTES * 2 + 10]);
        store.put("big/blob", bytes_stream(data.clone())).await.unwrap();

        let mut stream = store.get_stream("big/blob").await.unwrap().unwrap();
        let mut pieces = 0;
        let mut read = Vec::new();
        while let Some(piece) = stream.next().await {
            read.extend_from_slice(&piece.unwrap());
            pieces += 1;
        }
        assert!(pieces >= 3);
        assert_eq!(read, data.to_vec());
        assert!(store.get_stream("big/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_prunes_emptied_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path()).await.unwrap();
        for key in ["chunks/s1/chunk_1", "chunks/s2/chunk_1", "chunks/s2/chunk_2"] {
            store.put(key, bytes_stream(Bytes::from_static(b"x"))).await.unwrap();
        }

        store.delete("chunks/s1/chunk_1").await.unwrap();
        assert!(!dir.path().join("chunks/s1").exists());
        assert!(dir.path().join("chunks").exists());

        store.delete("chunks/s2/chunk_1").await.unwrap();
        assert!(dir.path().join("chunks/s2").exists());

        // A top-level key never removes the root
        store.put("top", bytes_stream(Bytes::from_static(b"x"))).await.unwrap();
        store.delete("top").await.unwrap();
        assert!(dir.path().exists());

        // A later write into a pruned directory recreates it
        store.put("chunks/s1/chunk_2", bytes_stream(Bytes::from_static(b"y"))).await.unwrap();
        assert!(store.get("chunks/s1/chunk_2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path()).await.unwrap();

        let result = store
            .put("../escape", bytes_stream(Bytes::from_static(b"x")))
            .await;
        assert!(matches!(result, Err(UploadError::Validation { .. })));
        assert!(store.get("a/../../b").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_prefix_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path()).await.unwrap();

        for key in ["chunks/s1/chunk_1", "chunks/s1/chunk_2", "chunks/s10/chunk_1"] {
            store.put(key, bytes_stream(Bytes::from_static(b"x"))).await.unwrap();
        }

        assert_eq!(store.delete_prefix("chunks/s1").await.unwrap(), 2);
        assert_eq!(store.delete_prefix("chunks/s1").await.unwrap(), 0);
        assert!(store.get("chunks/s10/chunk_1").await.unwrap().is_some());

        store.delete("chunks/s10/chunk_1").await.unwrap();
        store.delete("chunks/s10/chunk_1").await.unwrap();
    }
}
