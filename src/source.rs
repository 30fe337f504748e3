// Random-access byte sources backing file reads
//
// An indexed archive needs nothing more than "read these bytes at this offset"
// from the raw tar: a local file, an HTTP range reader, or memory in tests.

use crate::index::{IndexError, IndexResult};
use async_trait::async_trait;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

#[async_trait]
pub trait ByteSource: Send + Sync {
    /// Fill as much of `buf` as possible from `offset`. Short reads only happen at end of source.
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> IndexResult<usize>;

    /// Total length in bytes, when known
    fn size(&self) -> Option<u64>;
}

/// Local file read through positional reads on the blocking pool
#[derive(Debug, Clone)]
pub struct LocalFile {
    file: Arc<File>,
    len: u64,
}

impl LocalFile {
    pub fn open(path: impl AsRef<Path>) -> IndexResult<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self { file: Arc::new(file), len })
    }
}

#[async_trait]
impl ByteSource for LocalFile {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> IndexResult<usize> {
        if buf.is_empty() || offset >= self.len {
            return Ok(0);
        }

        let want = buf.len().min((self.len - offset) as usize);
        let file = Arc::clone(&self.file);
        let data = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut data = vec![0u8; want];
            let mut filled = 0;
            while filled < want {
                match file.read_at(&mut data[filled..], offset + filled as u64) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
            data.truncate(filled);
            Ok(data)
        })
        .await
        .map_err(IndexError::from)??;

        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    fn size(&self) -> Option<u64> {
        Some(self.len)
    }
}

/// In-memory byte source
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Arc<[u8]>,
}

impl MemorySource {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> IndexResult<usize> {
        let len = self.data.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }

    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}
