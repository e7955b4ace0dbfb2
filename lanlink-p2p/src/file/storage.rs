//! Filesystem abstraction for the file layer.
//!
//! The transfer manager never touches `tokio::fs` directly; it goes
//! through [`Storage`], so tests can swap the disk for an in-memory
//! store.

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};

/// Readable byte stream for an outgoing file.
pub trait ReadStream: AsyncRead + Send + Unpin {}
impl<T: AsyncRead + Send + Unpin> ReadStream for T {}

impl std::fmt::Debug for dyn ReadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<dyn ReadStream>")
    }
}

/// Seekable, writable byte stream for an incoming file.
pub trait WriteStream: AsyncWrite + AsyncSeek + Send + Unpin {}
impl<T: AsyncWrite + AsyncSeek + Send + Unpin> WriteStream for T {}

/// Host filesystem seam.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Open a file for reading. Returns the stream and its length.
    async fn open_read(&self, path: &Path) -> io::Result<(Box<dyn ReadStream>, u64)>;

    /// Create a writable file at `path`, replacing any existing file and
    /// creating parent directories as needed.
    async fn create_write(&self, path: &Path) -> io::Result<Box<dyn WriteStream>>;
}

/// Real filesystem via `tokio::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskStorage;

#[async_trait]
impl Storage for DiskStorage {
    async fn open_read(&self, path: &Path) -> io::Result<(Box<dyn ReadStream>, u64)> {
        let file = fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        Ok((Box::new(file), len))
    }

    async fn create_write(&self, path: &Path) -> io::Result<Box<dyn WriteStream>> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        Ok(Box::new(fs::File::create(path).await?))
    }
}

type FileMap = Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>;

/// In-memory store for tests.
#[derive(Debug, Default, Clone)]
pub struct MemStorage {
    files: FileMap,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file.
    pub fn insert(&self, path: impl Into<PathBuf>, data: Vec<u8>) {
        self.files.lock().unwrap().insert(path.into(), data);
    }

    /// Current contents of a file, if it exists.
    pub fn contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path.as_ref()).cloned()
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn open_read(&self, path: &Path) -> io::Result<(Box<dyn ReadStream>, u64)> {
        let data = self
            .files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))?;
        let len = data.len() as u64;
        Ok((Box::new(std::io::Cursor::new(data)), len))
    }

    async fn create_write(&self, path: &Path) -> io::Result<Box<dyn WriteStream>> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), Vec::new());
        Ok(Box::new(MemFile {
            files: self.files.clone(),
            path: path.to_path_buf(),
            pos: 0,
        }))
    }
}

/// Writable handle into a [`MemStorage`] entry.
struct MemFile {
    files: FileMap,
    path: PathBuf,
    pos: u64,
}

impl AsyncWrite for MemFile {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        {
            let mut files = this.files.lock().unwrap();
            let data = files.entry(this.path.clone()).or_default();
            let pos = this.pos as usize;
            if data.len() < pos + buf.len() {
                data.resize(pos + buf.len(), 0);
            }
            data[pos..pos + buf.len()].copy_from_slice(buf);
        }
        this.pos += buf.len() as u64;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncSeek for MemFile {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let this = self.get_mut();
        let len = this
            .files
            .lock()
            .unwrap()
            .get(&this.path)
            .map(|d| d.len() as u64)
            .unwrap_or(0);
        let target = match position {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::End(n) => len as i128 + n as i128,
            SeekFrom::Current(n) => this.pos as i128 + n as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }
        this.pos = target as u64;
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(self.pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_mem_storage_roundtrip() {
        let storage = MemStorage::new();
        storage.insert("/src/a", vec![1, 2, 3, 4, 5]);

        let (mut reader, len) = storage.open_read(Path::new("/src/a")).await.unwrap();
        assert_eq!(len, 5);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_mem_storage_missing_file() {
        let storage = MemStorage::new();
        let err = storage.open_read(Path::new("/nope")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_mem_write_with_seek() {
        let storage = MemStorage::new();
        let mut writer = storage.create_write(Path::new("/dst/b")).await.unwrap();

        writer.write_all(b"world").await.unwrap();
        writer.seek(SeekFrom::Start(0)).await.unwrap();
        writer.write_all(b"hello").await.unwrap();
        writer.seek(SeekFrom::Start(5)).await.unwrap();
        writer.write_all(b"!").await.unwrap();
        writer.flush().await.unwrap();

        assert_eq!(storage.contents("/dst/b").unwrap(), b"hello!");
    }

    #[tokio::test]
    async fn test_mem_create_replaces() {
        let storage = MemStorage::new();
        storage.insert("/dst/c", vec![9; 100]);
        let mut writer = storage.create_write(Path::new("/dst/c")).await.unwrap();
        writer.write_all(b"new").await.unwrap();
        assert_eq!(storage.contents("/dst/c").unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_disk_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage;

        let path = dir.path().join("nested").join("f.bin");
        let mut writer = storage.create_write(&path).await.unwrap();
        writer.write_all(&[7u8; 64]).await.unwrap();
        writer.flush().await.unwrap();
        drop(writer);

        let (mut reader, len) = storage.open_read(&path).await.unwrap();
        assert_eq!(len, 64);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, vec![7u8; 64]);
    }
}
