//! Key-addressed blob storage.
//!
//! Local-filesystem backend behind the storage adapter contract: streaming
//! save, buffer save, read stream, local-path resolution and idempotent
//! delete. Each job owns a unique key derived from its id; keys may carry
//! one level of prefix (`import-errors/<job>.ndjson`).

use std::path::{Component, Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::debug;

use stevedore_protocol::{ErrorCode, TransferError, TransferResult};

/// Result of a completed save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedObject {
    pub key: String,
    pub bytes: u64,
    /// Backend-internal location (the absolute path for this backend).
    pub location: String,
}

/// Local-filesystem storage rooted at a configured directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to its backing path, rejecting traversal components.
    fn path_for(&self, key: &str) -> TransferResult<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative.is_absolute()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(TransferError::new(
                ErrorCode::StorageError,
                format!("invalid storage key: {key:?}"),
            ));
        }
        Ok(self.root.join(relative))
    }

    /// Stream a reader to the key, optionally enforcing a byte cap.
    ///
    /// On cap overrun the partial object is deleted and `FILE_TOO_LARGE`
    /// is returned.
    pub async fn save_stream<R>(
        &self,
        key: &str,
        mut reader: R,
        max_bytes: Option<u64>,
    ) -> TransferResult<SavedObject>
    where
        R: AsyncRead + Unpin,
    {
        let path = self.path_for(key)?;
        ensure_parent(&path).await?;

        let file = File::create(&path).await?;
        let mut writer = BufWriter::new(file);
        let mut total: u64 = 0;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            total += n as u64;
            if let Some(cap) = max_bytes {
                if total > cap {
                    drop(writer);
                    self.delete(key).await?;
                    return Err(TransferError::new(
                        ErrorCode::FileTooLarge,
                        format!("stream exceeded the {cap} byte limit"),
                    ));
                }
            }
            writer.write_all(&buf[..n]).await?;
        }
        writer.flush().await?;
        debug!(key, bytes = total, "saved stream");

        Ok(SavedObject {
            key: key.to_string(),
            bytes: total,
            location: path.display().to_string(),
        })
    }

    pub async fn save_buffer(&self, key: &str, bytes: &[u8]) -> TransferResult<SavedObject> {
        let path = self.path_for(key)?;
        ensure_parent(&path).await?;
        fs::write(&path, bytes).await?;
        Ok(SavedObject {
            key: key.to_string(),
            bytes: bytes.len() as u64,
            location: path.display().to_string(),
        })
    }

    /// Open a writer for incremental artifact production.
    pub async fn create_write_stream(&self, key: &str) -> TransferResult<BufWriter<File>> {
        let path = self.path_for(key)?;
        ensure_parent(&path).await?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        Ok(BufWriter::new(file))
    }

    pub async fn create_read_stream(&self, key: &str) -> TransferResult<File> {
        let path = self.path_for(key)?;
        match File::open(&path).await {
            Ok(file) => Ok(file),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(TransferError::new(
                ErrorCode::StorageError,
                format!("no object at key {key}"),
            )),
            Err(err) => Err(err.into()),
        }
    }

    /// Byte length of a stored object.
    pub async fn size_of(&self, key: &str) -> TransferResult<u64> {
        let path = self.path_for(key)?;
        let meta = fs::metadata(&path).await?;
        Ok(meta.len())
    }

    /// Resolver only; does not touch the filesystem.
    pub fn local_path(&self, key: &str) -> TransferResult<PathBuf> {
        self.path_for(key)
    }

    /// Idempotent delete.
    pub async fn delete(&self, key: &str) -> TransferResult<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

async fn ensure_parent(path: &Path) -> TransferResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> (tempfile::TempDir, LocalStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        (dir, storage)
    }

    #[tokio::test]
    async fn save_and_read_round_trip() {
        let (_dir, storage) = storage();
        let saved = storage.save_buffer("job1.ndjson", b"hello\n").await.unwrap();
        assert_eq!(saved.bytes, 6);

        let mut file = storage.create_read_stream("job1.ndjson").await.unwrap();
        let mut out = String::new();
        file.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello\n");
        assert_eq!(storage.size_of("job1.ndjson").await.unwrap(), 6);
    }

    #[tokio::test]
    async fn prefixed_keys_create_directories() {
        let (_dir, storage) = storage();
        storage
            .save_buffer("import-errors/job1.json", b"[]")
            .await
            .unwrap();
        assert!(storage.local_path("import-errors/job1.json").unwrap().exists());
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let (_dir, storage) = storage();
        assert!(storage.save_buffer("../escape", b"x").await.is_err());
        assert!(storage.local_path("/abs/path").is_err());
        assert!(storage.local_path("a/../b").is_err());
    }

    #[tokio::test]
    async fn stream_cap_deletes_partial_and_reports() {
        let (_dir, storage) = storage();
        let data = vec![7u8; 1024];
        let err = storage
            .save_stream("big.bin", data.as_slice(), Some(100))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::FileTooLarge);
        assert!(!storage.local_path("big.bin").unwrap().exists());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_dir, storage) = storage();
        storage.save_buffer("x", b"1").await.unwrap();
        storage.delete("x").await.unwrap();
        storage.delete("x").await.unwrap();
    }
}
