// Repository tree index
//
// Lists a repository one directory at a time through a tree API and caches
// each listing by path. File content is fetched with range requests the first
// time an entry is read.

pub mod client;

pub use client::{GitHubClient, RepoRef};

use crate::index::{
    Attributes, Entry, EntryAttr, EntryKind, EntryRef, Index, IndexResult, OpContext, clamp_read,
};
use crate::metrics;
use crate::source::ByteSource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::OnceCell;

/// Kind of object a tree listing points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeItemKind {
    Tree,
    Blob,
    /// Submodule commit, shown as an empty directory
    Commit,
}

/// One child returned by a tree listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeItem {
    pub name: String,
    /// Path from the repository root
    pub path: String,
    pub kind: TreeItemKind,
    pub mode: u32,
    pub size: u64,
}

/// Remote tree API: immediate children of a path, and content of a blob
#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait TreeClient: Send + Sync {
    /// Children of `path` ("" for the repository root)
    async fn list_tree(&self, path: &str) -> IndexResult<Vec<TreeItem>>;

    /// Random-access reader over the blob at `path`
    async fn open_blob(&self, path: &str, size: u64) -> IndexResult<Arc<dyn ByteSource>>;
}

pub struct TreeIndex {
    client: Arc<dyn TreeClient>,
    listed_at: DateTime<Utc>,
    /// Directory path -> its children; "" is the root
    children: RwLock<HashMap<String, Vec<EntryRef>>>,
}

impl TreeIndex {
    /// Create the index and fetch the root listing; a failed root fetch fails construction
    pub async fn new(ctx: &OpContext, client: Arc<dyn TreeClient>) -> IndexResult<Self> {
        let index =
            Self { client, listed_at: Utc::now(), children: RwLock::new(HashMap::new()) };

        let root = index.fetch(ctx, "").await?;
        tracing::info!(entries = root.len(), "Repository root listed");
        Ok(index)
    }

    fn cached(&self, path: &str) -> Option<Vec<EntryRef>> {
        let children = self.children.read().unwrap_or_else(|e| e.into_inner());
        children.get(path).cloned()
    }

    async fn fetch(&self, ctx: &OpContext, path: &str) -> IndexResult<Vec<EntryRef>> {
        let items = ctx.run(self.client.list_tree(path)).await?;
        let entries: Vec<EntryRef> = items.iter().map(|item| self.entry(item)).collect();

        let mut children = self.children.write().unwrap_or_else(|e| e.into_inner());
        for item in items.iter().filter(|item| item.kind == TreeItemKind::Commit) {
            children.entry(item.path.clone()).or_default();
        }
        children.insert(path.to_string(), entries.clone());

        tracing::debug!(path = %path, entries = entries.len(), "Tree listing cached");
        Ok(entries)
    }

    fn entry(&self, item: &TreeItem) -> EntryRef {
        let is_dir = item.kind != TreeItemKind::Blob;
        let perm = match item.mode & 0o7777 {
            0 if is_dir => 0o755,
            0 => 0o644,
            perm => perm,
        };

        Arc::new(TreeEntry {
            path: item.path.clone(),
            kind: if is_dir { EntryKind::Directory } else { EntryKind::File },
            attr: EntryAttr {
                size: if is_dir { 0 } else { item.size },
                mode: perm,
                mtime: self.listed_at,
                atime: None,
            },
            client: Arc::clone(&self.client),
            reader: OnceCell::new(),
        })
    }
}

#[async_trait]
impl Index for TreeIndex {
    async fn root_entries(&self, ctx: &OpContext) -> IndexResult<Vec<EntryRef>> {
        match self.cached("") {
            Some(root) => Ok(root),
            None => self.fetch(ctx, "").await,
        }
    }

    async fn children(&self, ctx: &OpContext, of: &dyn Entry) -> IndexResult<Vec<EntryRef>> {
        if !of.is_dir() {
            return Ok(Vec::new());
        }

        if let Some(hit) = self.cached(of.path()) {
            metrics::with(|m| m.tree_cache_hits.inc());
            return Ok(hit);
        }

        metrics::with(|m| m.tree_cache_misses.inc());
        self.fetch(ctx, of.path()).await
    }
}

/// File or directory in a repository tree
pub struct TreeEntry {
    path: String,
    kind: EntryKind,
    attr: EntryAttr,
    client: Arc<dyn TreeClient>,
    reader: OnceCell<Arc<dyn ByteSource>>,
}

impl std::fmt::Debug for TreeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeEntry")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("size", &self.attr.size)
            .field("opened", &self.reader.initialized())
            .finish()
    }
}

#[async_trait]
impl Entry for TreeEntry {
    fn path(&self) -> &str {
        &self.path
    }

    fn kind(&self) -> EntryKind {
        self.kind
    }

    fn attributes(&self) -> Attributes {
        Attributes::ApplyDefaults(self.attr.clone())
    }

    async fn read_at(&self, buf: &mut [u8], offset: u64) -> IndexResult<usize> {
        if self.kind != EntryKind::File {
            return Ok(0);
        }
        let n = clamp_read(self.attr.size, offset, buf.len());
        if n == 0 {
            return Ok(0);
        }

        let reader = self
            .reader
            .get_or_try_init(|| self.client.open_blob(&self.path, self.attr.size))
            .await?;
        reader.read_at(&mut buf[..n], offset).await
    }
}
