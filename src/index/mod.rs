// Index abstraction
//
// Every back-end (indexed local tar, remote bundle, repository tree) exposes the
// same lazy entry model: root entries, children of an entry, and byte reads.
// The FUSE adapter only ever talks to these traits.

pub mod context;
pub mod error;
pub mod path;

pub use context::{CancelHandle, OpContext};
pub use error::{IndexError, IndexResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Kind of node an entry represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    HardLink,
    CharDevice,
    BlockDevice,
    Fifo,
}

/// Owner of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

/// Size, permission bits and timestamps of an entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryAttr {
    pub size: u64,
    pub mode: u32, // Permission bits only
    pub mtime: DateTime<Utc>,
    pub atime: Option<DateTime<Utc>>,
}

/// Attributes as reported by a back-end.
///
/// Back-ends that do not know who owns an entry report `ApplyDefaults`, and
/// the mount fills in its configured uid/gid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attributes {
    Known(EntryAttr, Ownership),
    ApplyDefaults(EntryAttr),
}

impl Attributes {
    pub fn attr(&self) -> &EntryAttr {
        match self {
            Attributes::Known(attr, _) | Attributes::ApplyDefaults(attr) => attr,
        }
    }

    pub fn ownership_or(&self, defaults: Ownership) -> Ownership {
        match self {
            Attributes::Known(_, owner) => *owner,
            Attributes::ApplyDefaults(_) => defaults,
        }
    }
}

/// One file or directory node exposed by an index
#[async_trait]
pub trait Entry: Send + Sync + std::fmt::Debug {
    /// Normalized path from the archive root, without leading `./` or trailing `/`
    fn path(&self) -> &str;

    fn name(&self) -> &str {
        path::base_name(self.path())
    }

    fn kind(&self) -> EntryKind;

    fn is_dir(&self) -> bool {
        self.kind() == EntryKind::Directory
    }

    fn attributes(&self) -> Attributes;

    fn link_target(&self) -> Option<&str> {
        None
    }

    /// Read up to `buf.len()` bytes starting at `offset` within the entry.
    /// Returns 0 at or past end of file.
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> IndexResult<usize>;
}

pub type EntryRef = Arc<dyn Entry>;

/// Lazy view over a tree of entries
#[async_trait]
pub trait Index: Send + Sync {
    async fn root_entries(&self, ctx: &OpContext) -> IndexResult<Vec<EntryRef>>;

    /// Entries exactly one path segment below `of`
    async fn children(&self, ctx: &OpContext, of: &dyn Entry) -> IndexResult<Vec<EntryRef>>;

    async fn read(
        &self,
        ctx: &OpContext,
        entry: &dyn Entry,
        buf: &mut [u8],
        offset: u64,
    ) -> IndexResult<usize> {
        ctx.run(entry.read_at(buf, offset)).await
    }
}

/// Seconds since the epoch to a UTC timestamp, epoch for out-of-range values
pub fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// Number of bytes a read of `want` bytes at `offset` may return for a file of `size` bytes
pub fn clamp_read(size: u64, offset: u64, want: usize) -> usize {
    if offset >= size {
        return 0;
    }
    (size - offset).min(want as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr() -> EntryAttr {
        EntryAttr { size: 10, mode: 0o644, mtime: timestamp(1_700_000_000), atime: None }
    }

    #[test]
    fn test_ownership_overlay() {
        let defaults = Ownership { uid: 33333, gid: 33333 };

        let known = Attributes::Known(attr(), Ownership { uid: 0, gid: 0 });
        assert_eq!(known.ownership_or(defaults), Ownership { uid: 0, gid: 0 });

        let unknown = Attributes::ApplyDefaults(attr());
        assert_eq!(unknown.ownership_or(defaults), defaults);
        assert_eq!(unknown.attr().size, 10);
    }

    #[test]
    fn test_clamp_read() {
        assert_eq!(clamp_read(27, 0, 4096), 27);
        assert_eq!(clamp_read(27, 20, 4096), 7);
        assert_eq!(clamp_read(27, 0, 5), 5);
        assert_eq!(clamp_read(27, 27, 10), 0);
        assert_eq!(clamp_read(27, 100, 10), 0);
        assert_eq!(clamp_read(0, 0, 10), 0);
    }

    #[test]
    fn test_timestamp_out_of_range_falls_back_to_epoch() {
        assert_eq!(timestamp(0).timestamp(), 0);
        assert_eq!(timestamp(1_700_000_000).timestamp(), 1_700_000_000);
        assert_eq!(timestamp(i64::MAX).timestamp(), 0);
    }

    #[test]
    fn test_entry_kind_serde_names() {
        assert_eq!(serde_json::to_string(&EntryKind::Directory).unwrap(), "\"directory\"");
        assert_eq!(serde_json::to_string(&EntryKind::HardLink).unwrap(), "\"hardlink\"");
        let kind: EntryKind = serde_json::from_str("\"symlink\"").unwrap();
        assert_eq!(kind, EntryKind::Symlink);
    }
}
