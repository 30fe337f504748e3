// FUSE adapter - binds a lazy Index onto fuser::Filesystem
//
// The kernel addresses nodes by inode and expects synchronous answers, while
// an Index hands out entries lazily through async calls. This adapter:
// - Blocks on index calls from a dedicated tokio runtime
// - Allocates inodes as entries are first seen, keyed by entry path
// - Caches each directory's children after the first listing
// - Overlays default ownership where the back-end reports none
// - Answers an explicitly cancelled lookup/readdir/read with an empty result
//
// IMPORTANT: FUSE callbacks must not run inside the runtime they block on.
// The adapter owns (or is handed) a runtime used only from the FUSE thread.

use crate::config::MountConfig;
use crate::index::{Entry, EntryKind, EntryRef, Index, IndexError, IndexResult, OpContext, Ownership};
use crate::metrics;
use chrono::{DateTime, Utc};
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, Request,
};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::runtime::Runtime;

pub const ROOT_INODE: u64 = 1;

const BLOCK_SIZE: u32 = 4096;
const MAX_NAME_LENGTH: u32 = 255;

/// Mount-wide behaviour of the adapter
#[derive(Debug, Clone, Copy)]
pub struct AdapterOptions {
    /// Owner reported for entries whose attributes carry none, and for the root
    pub default_owner: Ownership,
    pub attr_ttl: Duration,
    /// Deadline for each index call made on behalf of the kernel
    pub operation_timeout: Duration,
}

impl From<&MountConfig> for AdapterOptions {
    fn from(config: &MountConfig) -> Self {
        Self {
            default_owner: Ownership { uid: config.default_uid, gid: config.default_gid },
            attr_ttl: config.attr_ttl(),
            operation_timeout: config.operation_timeout(),
        }
    }
}

struct Node {
    /// `None` only for the mount root
    entry: Option<EntryRef>,
    parent: u64,
    /// Set once the directory has been listed
    children: Option<Vec<u64>>,
}

/// Inode table: inode -> node, entry path -> inode
struct NodeTable {
    nodes: HashMap<u64, Node>,
    by_path: HashMap<String, u64>,
    next_inode: u64,
}

impl NodeTable {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_INODE, Node { entry: None, parent: ROOT_INODE, children: None });
        Self { nodes, by_path: HashMap::new(), next_inode: ROOT_INODE + 1 }
    }

    fn get(&self, ino: u64) -> Option<&Node> {
        self.nodes.get(&ino)
    }

    /// Inode for `entry`, allocating one the first time its path is seen
    fn register(&mut self, parent: u64, entry: EntryRef) -> u64 {
        if let Some(&ino) = self.by_path.get(entry.path()) {
            if let Some(node) = self.nodes.get_mut(&ino) {
                node.entry = Some(entry);
            }
            return ino;
        }

        let ino = self.next_inode;
        self.next_inode += 1;
        self.by_path.insert(entry.path().to_string(), ino);
        self.nodes.insert(ino, Node { entry: Some(entry), parent, children: None });
        ino
    }

    fn set_children(&mut self, ino: u64, children: Vec<u64>) {
        if let Some(node) = self.nodes.get_mut(&ino) {
            node.children = Some(children);
        }
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }
}

/// Read-only filesystem over any Index
pub struct IndexFs {
    index: Arc<dyn Index>,
    runtime: Arc<Runtime>,
    options: AdapterOptions,
    nodes: RwLock<NodeTable>,
    mount_time: SystemTime,
}

impl IndexFs {
    /// Create an adapter with its own runtime
    pub fn new(index: Arc<dyn Index>, config: &MountConfig) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .thread_name("tarmount-fuse")
            .enable_all()
            .build()?;

        Ok(Self::with_runtime(index, Arc::new(runtime), config))
    }

    /// Create an adapter that blocks on `runtime`.
    ///
    /// The runtime must not be the one driving the caller, or `block_on` panics.
    pub fn with_runtime(index: Arc<dyn Index>, runtime: Arc<Runtime>, config: &MountConfig) -> Self {
        Self {
            index,
            runtime,
            options: AdapterOptions::from(config),
            nodes: RwLock::new(NodeTable::new()),
            mount_time: SystemTime::now(),
        }
    }

    fn read_nodes(&self) -> RwLockReadGuard<'_, NodeTable> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_nodes(&self) -> RwLockWriteGuard<'_, NodeTable> {
        self.nodes.write().unwrap_or_else(|e| e.into_inner())
    }

    fn op_context(&self) -> OpContext {
        OpContext::with_timeout(self.options.operation_timeout)
    }

    fn entry(&self, ino: u64) -> IndexResult<Option<EntryRef>> {
        let nodes = self.read_nodes();
        let node = nodes.get(ino).ok_or_else(|| unknown_inode(ino))?;
        Ok(node.entry.clone())
    }

    /// Register the root entries under the mount root
    pub fn populate_root(&self) -> IndexResult<usize> {
        self.list_children(ROOT_INODE).map(|children| children.len())
    }

    /// Inodes of the children of `ino`, listing through the index on first use
    pub fn list_children(&self, ino: u64) -> IndexResult<Vec<u64>> {
        let entry = {
            let nodes = self.read_nodes();
            let node = nodes.get(ino).ok_or_else(|| unknown_inode(ino))?;
            if let Some(children) = &node.children {
                return Ok(children.clone());
            }
            node.entry.clone()
        };

        let ctx = self.op_context();
        let entries = match &entry {
            None => self.runtime.block_on(self.index.root_entries(&ctx))?,
            Some(entry) if entry.is_dir() => {
                self.runtime.block_on(self.index.children(&ctx, entry.as_ref()))?
            }
            Some(entry) => return Err(IndexError::NotADirectory(entry.path().to_string())),
        };

        let mut nodes = self.write_nodes();
        let children: Vec<u64> = entries.into_iter().map(|e| nodes.register(ino, e)).collect();
        nodes.set_children(ino, children.clone());

        tracing::debug!(ino, children = children.len(), "Directory listed");
        Ok(children)
    }

    /// Find `name` among the children of `parent`
    pub fn lookup_child(&self, parent: u64, name: &str) -> IndexResult<Option<u64>> {
        let children = self.list_children(parent)?;
        let nodes = self.read_nodes();
        Ok(children.into_iter().find(|ino| {
            nodes.get(*ino).and_then(|n| n.entry.as_ref()).is_some_and(|e| e.name() == name)
        }))
    }

    /// Kernel attributes of a known inode
    pub fn attr(&self, ino: u64) -> Option<FileAttr> {
        let nodes = self.read_nodes();
        let node = nodes.get(ino)?;
        Some(match &node.entry {
            None => self.root_attr(),
            Some(entry) => self.entry_attr(ino, entry.as_ref()),
        })
    }

    /// `(inode, kind, name)` of every child of `ino`, preceded by `.` and `..`
    pub fn dir_entries(&self, ino: u64) -> IndexResult<Vec<(u64, FileType, String)>> {
        let children = self.list_children(ino)?;
        let nodes = self.read_nodes();
        let parent = nodes.get(ino).map_or(ROOT_INODE, |n| n.parent);

        let mut entries = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent, FileType::Directory, "..".to_string()),
        ];
        for child in children {
            if let Some(entry) = nodes.get(child).and_then(|n| n.entry.as_ref()) {
                entries.push((child, file_type(entry.kind()), entry.name().to_string()));
            }
        }
        Ok(entries)
    }

    /// Read up to `size` bytes at `offset` from a file inode
    pub fn read_node(&self, ino: u64, offset: u64, size: u32) -> IndexResult<Vec<u8>> {
        let entry = self.entry(ino)?.ok_or_else(|| IndexError::IsADirectory("/".to_string()))?;
        if entry.is_dir() {
            return Err(IndexError::IsADirectory(entry.path().to_string()));
        }

        let mut buf = vec![0u8; size as usize];
        let ctx = self.op_context();
        let n = self.runtime.block_on(self.index.read(&ctx, entry.as_ref(), &mut buf, offset))?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Target of a symlink inode
    pub fn read_link(&self, ino: u64) -> IndexResult<String> {
        let entry = self.entry(ino)?.ok_or_else(|| IndexError::InvalidPath("/".to_string()))?;
        entry
            .link_target()
            .map(str::to_string)
            .ok_or_else(|| IndexError::InvalidPath(format!("{} is not a symlink", entry.path())))
    }

    fn root_attr(&self) -> FileAttr {
        let owner = self.options.default_owner;
        FileAttr {
            ino: ROOT_INODE,
            size: 0,
            blocks: 0,
            atime: self.mount_time,
            mtime: self.mount_time,
            ctime: self.mount_time,
            crtime: self.mount_time,
            kind: FileType::Directory,
            perm: 0o755,
            nlink: 2,
            uid: owner.uid,
            gid: owner.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn entry_attr(&self, ino: u64, entry: &dyn Entry) -> FileAttr {
        let attributes = entry.attributes();
        let owner = attributes.ownership_or(self.options.default_owner);
        let attr = attributes.attr();
        let mtime = datetime_to_systemtime(attr.mtime);
        let kind = file_type(entry.kind());

        FileAttr {
            ino,
            size: attr.size,
            blocks: attr.size.div_ceil(512),
            atime: attr.atime.map(datetime_to_systemtime).unwrap_or(mtime),
            mtime,
            ctime: mtime,
            crtime: UNIX_EPOCH,
            kind,
            perm: (attr.mode & 0o7777) as u16,
            nlink: if kind == FileType::Directory { 2 } else { 1 },
            uid: owner.uid,
            gid: owner.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    /// Attributes for `name` under `parent`, or the errno to reply with.
    /// A cancelled listing reads as a missing name.
    pub fn lookup_reply(&self, parent: u64, name: &str) -> Result<FileAttr, libc::c_int> {
        match self.lookup_child(parent, name) {
            Ok(Some(ino)) => {
                let attr = self.attr(ino).ok_or(libc::ENOENT)?;
                metrics::with(|m| m.record_operation("lookup", true));
                Ok(attr)
            }
            Ok(None) => Err(libc::ENOENT),
            Err(e) => Err(self.failure("lookup", &e).unwrap_or(libc::ENOENT)),
        }
    }

    /// Directory stream for `ino`, or the errno to reply with.
    /// A cancelled listing yields only `.` and `..`.
    pub fn readdir_listing(&self, ino: u64) -> Result<Vec<(u64, FileType, String)>, libc::c_int> {
        match self.dir_entries(ino) {
            Ok(entries) => {
                metrics::with(|m| m.record_operation("readdir", true));
                Ok(entries)
            }
            Err(e) => match self.failure("readdir", &e) {
                Some(errno) => Err(errno),
                None => {
                    let parent = self.read_nodes().get(ino).map_or(ROOT_INODE, |n| n.parent);
                    Ok(vec![
                        (ino, FileType::Directory, ".".to_string()),
                        (parent, FileType::Directory, "..".to_string()),
                    ])
                }
            },
        }
    }

    /// Data for a read request, or the errno to reply with.
    /// A cancelled read yields no data; a passed deadline is `ETIMEDOUT`.
    pub fn read_reply(&self, ino: u64, offset: u64, size: u32) -> Result<Vec<u8>, libc::c_int> {
        match self.read_node(ino, offset, size) {
            Ok(data) => {
                metrics::with(|m| m.record_operation("read", true));
                Ok(data)
            }
            Err(e) => match self.failure("read", &e) {
                Some(errno) => Err(errno),
                None => Ok(Vec::new()),
            },
        }
    }

    /// Errno for a failed operation, or `None` when it was cancelled and should
    /// be answered with an empty result instead
    fn failure(&self, operation: &str, err: &IndexError) -> Option<libc::c_int> {
        if err.is_cancel_signal() {
            tracing::warn!(operation, error = %err, "Operation cancelled");
            metrics::with(|m| m.record_cancellation(operation));
            return None;
        }

        match err {
            IndexError::NotFound(_) => tracing::debug!(operation, error = %err, "Not found"),
            IndexError::DeadlineExceeded => {
                tracing::warn!(operation, error = %err, "Operation timed out")
            }
            _ => tracing::error!(operation, error = %err, "Operation failed"),
        }
        metrics::with(|m| m.record_operation(operation, false));
        Some(err.to_errno())
    }
}

fn unknown_inode(ino: u64) -> IndexError {
    IndexError::NotFound(format!("inode {}", ino))
}

fn file_type(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::File | EntryKind::HardLink => FileType::RegularFile,
        EntryKind::Directory => FileType::Directory,
        EntryKind::Symlink => FileType::Symlink,
        EntryKind::CharDevice => FileType::CharDevice,
        EntryKind::BlockDevice => FileType::BlockDevice,
        EntryKind::Fifo => FileType::NamedPipe,
    }
}

/// Convert chrono DateTime to SystemTime, clamping pre-epoch times to the epoch
fn datetime_to_systemtime(dt: DateTime<Utc>) -> SystemTime {
    u64::try_from(dt.timestamp())
        .map(|secs| UNIX_EPOCH + Duration::new(secs, dt.timestamp_subsec_nanos()))
        .unwrap_or(UNIX_EPOCH)
}

fn wants_write(flags: i32) -> bool {
    flags & libc::O_ACCMODE != libc::O_RDONLY || flags & libc::O_TRUNC != 0
}

impl Filesystem for IndexFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        match self.populate_root() {
            Ok(count) => tracing::info!(entries = count, "FUSE filesystem initialized"),
            // Root listing is retried on first readdir/lookup
            Err(e) => tracing::warn!(error = %e, "Root listing failed during init"),
        }
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!(nodes = self.read_nodes().len(), "FUSE filesystem destroyed");
    }

    /// Look up a directory entry by name
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };

        match self.lookup_reply(parent, name) {
            Ok(attr) => reply.entry(&self.options.attr_ttl, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    /// Get file attributes
    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.attr(ino) {
            Some(attr) => reply.attr(&self.options.attr_ttl, &attr),
            None => reply.error(libc::ENOENT),
        }
    }

    /// Read the target of a symbolic link
    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.read_link(ino) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(self.failure("readlink", &e).unwrap_or(libc::EINVAL)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        if wants_write(flags) {
            reply.error(libc::EROFS);
            return;
        }
        match self.attr(ino) {
            Some(attr) if attr.kind == FileType::Directory => reply.error(libc::EISDIR),
            Some(_) => reply.opened(0, 0),
            None => reply.error(libc::ENOENT),
        }
    }

    /// Read data from file
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let offset = u64::try_from(offset).unwrap_or(0);
        match self.read_reply(ino, offset, size) {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        if wants_write(flags) {
            reply.error(libc::EROFS);
            return;
        }
        match self.attr(ino) {
            Some(attr) if attr.kind == FileType::Directory => reply.opened(0, 0),
            Some(_) => reply.error(libc::ENOTDIR),
            None => reply.error(libc::ENOENT),
        }
    }

    /// Read directory entries
    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.readdir_listing(ino) {
            Ok(entries) => entries,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, (child, kind, name)) in entries.iter().enumerate().skip(skip) {
            if reply.add(*child, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    /// Get filesystem statistics
    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let files = self.read_nodes().len() as u64;
        reply.statfs(0, 0, 0, files, 0, BLOCK_SIZE, MAX_NAME_LENGTH, BLOCK_SIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{Attributes, EntryAttr, timestamp};
    use async_trait::async_trait;

    #[derive(Debug)]
    struct StubEntry(&'static str, EntryKind);

    #[async_trait]
    impl Entry for StubEntry {
        fn path(&self) -> &str {
            self.0
        }

        fn kind(&self) -> EntryKind {
            self.1
        }

        fn attributes(&self) -> Attributes {
            Attributes::ApplyDefaults(EntryAttr {
                size: 0,
                mode: 0o644,
                mtime: timestamp(0),
                atime: None,
            })
        }

        async fn read_at(&self, _buf: &mut [u8], _offset: u64) -> IndexResult<usize> {
            Ok(0)
        }
    }

    #[test]
    fn test_node_table_new() {
        let table = NodeTable::new();
        assert!(table.get(ROOT_INODE).is_some());
        assert!(table.get(ROOT_INODE).unwrap().entry.is_none());
        assert_eq!(table.next_inode, 2);
    }

    #[test]
    fn test_node_table_register_is_stable() {
        let mut table = NodeTable::new();
        let a = table.register(ROOT_INODE, Arc::new(StubEntry("a", EntryKind::Directory)));
        let b = table.register(a, Arc::new(StubEntry("a/b", EntryKind::File)));
        let again = table.register(ROOT_INODE, Arc::new(StubEntry("a", EntryKind::Directory)));

        assert_eq!(a, again);
        assert_ne!(a, b);
        assert_eq!(table.get(b).unwrap().parent, a);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_node_table_children() {
        let mut table = NodeTable::new();
        assert!(table.get(ROOT_INODE).unwrap().children.is_none());
        table.set_children(ROOT_INODE, vec![2, 3]);
        assert_eq!(table.get(ROOT_INODE).unwrap().children, Some(vec![2, 3]));
    }

    #[test]
    fn test_datetime_conversion() {
        let st = datetime_to_systemtime(timestamp(1_700_000_000));
        assert_eq!(st.duration_since(UNIX_EPOCH).unwrap().as_secs(), 1_700_000_000);

        let before_epoch = DateTime::from_timestamp(-100, 0).unwrap();
        assert_eq!(datetime_to_systemtime(before_epoch), UNIX_EPOCH);
    }

    #[test]
    fn test_file_type_mapping() {
        assert_eq!(file_type(EntryKind::File), FileType::RegularFile);
        assert_eq!(file_type(EntryKind::HardLink), FileType::RegularFile);
        assert_eq!(file_type(EntryKind::Directory), FileType::Directory);
        assert_eq!(file_type(EntryKind::Symlink), FileType::Symlink);
        assert_eq!(file_type(EntryKind::Fifo), FileType::NamedPipe);
    }

    #[test]
    fn test_write_flags_detected() {
        assert!(!wants_write(libc::O_RDONLY));
        assert!(wants_write(libc::O_WRONLY));
        assert!(wants_write(libc::O_RDWR));
        assert!(wants_write(libc::O_RDONLY | libc::O_TRUNC));
    }
}
