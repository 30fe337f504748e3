// Indexed archive reader
//
// Serves the Index contract from a built store plus random access to the raw
// tar bytes. Nothing is read from the archive until a file's content is asked
// for, and then only the requested span.

use crate::index::path::{descendant_range, is_direct_child, is_root_level, normalize_entry_name};
use crate::index::{
    Attributes, Entry, EntryAttr, EntryKind, EntryRef, Index, IndexResult, OpContext, Ownership,
    clamp_read, timestamp,
};
use crate::source::{ByteSource, LocalFile};
use crate::store::{IndexRecord, IndexStore};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

pub struct TarIndex {
    store: IndexStore,
    source: Arc<dyn ByteSource>,
    /// Extracted store directory for remote indexes, removed when the index is dropped
    _workdir: Option<TempDir>,
}

impl TarIndex {
    pub fn new(store: IndexStore, source: Arc<dyn ByteSource>) -> Self {
        Self { store, source, _workdir: None }
    }

    /// Tie the lifetime of a temporary store directory to this index
    pub fn with_workdir(mut self, workdir: TempDir) -> Self {
        self._workdir = Some(workdir);
        self
    }

    /// Open a store directory and the tar file it was built from
    pub async fn open_local(
        index_dir: impl AsRef<Path>,
        tar_path: impl AsRef<Path>,
    ) -> IndexResult<Self> {
        let store = IndexStore::open(index_dir).await?;
        let source = LocalFile::open(tar_path)?;
        Ok(Self::new(store, Arc::new(source)))
    }

    async fn materialize(&self, key: String, record: IndexRecord) -> IndexResult<EntryRef> {
        let header = &record.header;
        let mut kind = header.kind;
        let mut offset = record.offset.max(0) as u64;
        let mut size = header.size;

        // Hard links carry no data of their own; serve the target's bytes instead
        if kind == EntryKind::HardLink {
            kind = EntryKind::File;
            size = 0;
            let target = header.linkname.as_deref().map(normalize_entry_name);
            match target {
                Some(target) => match self.store.get(&target).await? {
                    Some(resolved) if resolved.header.kind == EntryKind::File => {
                        offset = resolved.offset.max(0) as u64;
                        size = resolved.header.size;
                    }
                    _ => tracing::warn!(path = %key, target = %target, "Hard link target not in index"),
                },
                None => tracing::warn!(path = %key, "Hard link without target"),
            }
        }

        let link_target = match kind {
            EntryKind::Symlink => header.linkname.clone(),
            _ => None,
        };

        // A symlink's size is the length of its target
        let size = match kind {
            EntryKind::File => size,
            EntryKind::Symlink => link_target.as_ref().map_or(0, |t| t.len() as u64),
            _ => 0,
        };

        Ok(Arc::new(TarEntry {
            attr: EntryAttr {
                size,
                mode: header.mode,
                mtime: timestamp(header.mtime),
                atime: header.atime.map(timestamp),
            },
            owner: Ownership { uid: header.uid, gid: header.gid },
            path: key,
            kind,
            offset,
            link_target,
            source: Arc::clone(&self.source),
        }))
    }

    async fn materialize_all(
        &self,
        rows: Vec<(String, IndexRecord)>,
    ) -> IndexResult<Vec<EntryRef>> {
        let mut entries = Vec::with_capacity(rows.len());
        for (key, record) in rows {
            entries.push(self.materialize(key, record).await?);
        }
        Ok(entries)
    }
}

#[async_trait]
impl Index for TarIndex {
    async fn root_entries(&self, ctx: &OpContext) -> IndexResult<Vec<EntryRef>> {
        ctx.run(async {
            let rows = self.store.scan(is_root_level).await?;
            self.materialize_all(rows).await
        })
        .await
    }

    async fn children(&self, ctx: &OpContext, of: &dyn Entry) -> IndexResult<Vec<EntryRef>> {
        if !of.is_dir() {
            return Ok(Vec::new());
        }

        let parent = of.path().to_string();
        ctx.run(async {
            let (start, end) = descendant_range(&parent);
            let rows = self.store.scan_range(&start, &end).await?;
            let rows = rows.into_iter().filter(|(key, _)| is_direct_child(&parent, key)).collect();
            self.materialize_all(rows).await
        })
        .await
    }
}

/// One archive member, reading its bytes straight from the raw tar
pub struct TarEntry {
    path: String,
    kind: EntryKind,
    attr: EntryAttr,
    owner: Ownership,
    offset: u64,
    link_target: Option<String>,
    source: Arc<dyn ByteSource>,
}

impl std::fmt::Debug for TarEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TarEntry")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("offset", &self.offset)
            .field("size", &self.attr.size)
            .finish()
    }
}

#[async_trait]
impl Entry for TarEntry {
    fn path(&self) -> &str {
        &self.path
    }

    fn kind(&self) -> EntryKind {
        self.kind
    }

    fn attributes(&self) -> Attributes {
        Attributes::Known(self.attr.clone(), self.owner)
    }

    fn link_target(&self) -> Option<&str> {
        self.link_target.as_deref()
    }

    async fn read_at(&self, buf: &mut [u8], offset: u64) -> IndexResult<usize> {
        if self.kind != EntryKind::File {
            return Ok(0);
        }
        let n = clamp_read(self.attr.size, offset, buf.len());
        if n == 0 {
            return Ok(0);
        }
        self.source.read_at(&mut buf[..n], self.offset + offset).await
    }
}
