// Tar index builder
//
// Reads a tar stream exactly once, front to back, and records for every member
// where its data begins plus its header metadata. The input is never seeked,
// so pipes and sockets work as well as files.
//
// Parsing is blocking (tar crate) and runs on the blocking pool; records flow
// over a bounded channel to the async writer, one store transaction per entry.
//
// Archives often omit members for intermediate directories (`tar cf x.tar a/b`).
// Every missing ancestor gets an implied directory record so the whole tree
// stays reachable from the root; a real header for that directory replaces it.

use crate::index::path::{ancestors, normalize_entry_name};
use crate::index::{EntryKind, IndexError, IndexResult};
use crate::store::{IndexRecord, IndexStore, RecordHeader};
use std::collections::HashSet;
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tar::EntryType;
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 256;

/// Outcome of a successful build
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    /// Records written to the store
    pub entries: u64,
    /// Members that were not indexed (archive root, global headers, unsupported types)
    pub skipped: u64,
    /// Directory records added for ancestors the archive has no member for
    pub implied_dirs: u64,
    /// Bytes consumed from the input, trailing padding included
    pub bytes_read: u64,
}

/// Reader wrapper counting the bytes pulled through it
pub struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, count: Arc::new(AtomicU64::new(0)) }
    }

    /// Shared handle to the running count, readable after the reader moved elsewhere
    pub fn counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.count)
    }

    pub fn bytes_read(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

struct ParsedEntry {
    key: String,
    record: IndexRecord,
}

enum Parsed {
    Entry(ParsedEntry),
    Skipped,
}

/// Build an index of `reader` into `store`.
///
/// On failure every record written so far is removed again, so a store never
/// holds a partial index.
pub async fn build_index<R>(store: &IndexStore, reader: R) -> IndexResult<BuildStats>
where
    R: Read + Send + 'static,
{
    let reader = CountingReader::new(reader);
    let counter = reader.counter();
    let (tx, mut rx) = mpsc::channel::<ParsedEntry>(CHANNEL_CAPACITY);

    let parser = tokio::task::spawn_blocking(move || parse_stream(reader, tx));

    let mut written = 0u64;
    // Every directory key known to exist, real or implied
    let mut dirs: HashSet<String> = HashSet::new();
    // Implied directories that no real header has replaced yet
    let mut implied: HashSet<String> = HashSet::new();
    let write_result = async {
        while let Some(parsed) = rx.recv().await {
            store.put(&parsed.key, &parsed.record).await?;
            tracing::debug!(
                key = %parsed.key,
                offset = parsed.record.offset,
                size = parsed.record.header.size,
                "Indexed entry"
            );
            written += 1;

            implied.remove(&parsed.key);
            if parsed.record.header.kind == EntryKind::Directory {
                dirs.insert(parsed.key.clone());
            }

            for dir in ancestors(&parsed.key) {
                if dirs.contains(dir) {
                    continue;
                }
                dirs.insert(dir.to_string());
                let record = implied_directory(dir, &parsed.record.header);
                if store.put_if_absent(dir, &record).await? {
                    tracing::debug!(key = %dir, "Implied directory");
                    implied.insert(dir.to_string());
                }
            }
        }
        Ok::<_, IndexError>(())
    }
    .await;

    // A failed writer closes the channel, which stops the parser
    drop(rx);
    let parse_result = parser.await.map_err(IndexError::from).and_then(|r| r);

    let skipped = match write_result.and(parse_result) {
        Ok(skipped) => skipped,
        Err(e) => {
            tracing::error!(error = %e, written, "Index build failed, discarding partial index");
            if let Err(clear_err) = store.clear().await {
                tracing::warn!(error = %clear_err, "Failed to discard partial index");
            }
            return Err(e);
        }
    };

    store.compact().await?;

    let stats = BuildStats {
        entries: written,
        skipped,
        implied_dirs: implied.len() as u64,
        bytes_read: counter.load(Ordering::Relaxed),
    };
    tracing::info!(
        entries = stats.entries,
        skipped = stats.skipped,
        implied_dirs = stats.implied_dirs,
        bytes_read = stats.bytes_read,
        "Index build completed"
    );
    Ok(stats)
}

fn parse_stream<R: Read>(
    reader: CountingReader<R>,
    tx: mpsc::Sender<ParsedEntry>,
) -> IndexResult<u64> {
    let mut archive = tar::Archive::new(reader);
    let mut skipped = 0u64;

    for entry in archive.entries().map_err(IndexError::MalformedArchive)? {
        let mut entry = entry.map_err(IndexError::MalformedArchive)?;
        match parse_entry(&mut entry).map_err(IndexError::MalformedArchive)? {
            Parsed::Entry(parsed) => {
                if tx.blocking_send(parsed).is_err() {
                    // Writer gave up; its error is reported by the caller
                    return Ok(skipped);
                }
            }
            Parsed::Skipped => skipped += 1,
        }
    }

    // Consume the end-of-archive blocks and any trailing padding
    let mut inner = archive.into_inner();
    io::copy(&mut inner, &mut io::sink()).map_err(IndexError::MalformedArchive)?;
    Ok(skipped)
}

fn parse_entry<R: Read>(entry: &mut tar::Entry<'_, R>) -> io::Result<Parsed> {
    let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
    let key = normalize_entry_name(&name);
    let entry_type = entry.header().entry_type();

    if key.is_empty() {
        return Ok(Parsed::Skipped);
    }

    let Some(kind) = entry_kind(entry_type) else {
        tracing::debug!(name = %name, entry_type = ?entry_type, "Skipping unsupported tar member");
        return Ok(Parsed::Skipped);
    };

    let linkname = entry
        .link_name_bytes()
        .map(|link| String::from_utf8_lossy(&link).into_owned())
        .filter(|link| !link.is_empty());
    let atime = access_time(entry)?;

    let header = entry.header();
    let mode = numeric_field(header.mode(), "mode", &name);
    let uid = numeric_field(header.uid(), "uid", &name);
    let gid = numeric_field(header.gid(), "gid", &name);
    let mtime = numeric_field(header.mtime(), "mtime", &name);

    let record = IndexRecord {
        offset: entry.raw_file_position() as i64,
        header: RecordHeader {
            mode: mode & 0o7777,
            kind,
            size: entry.size(),
            uid: uid as u32,
            gid: gid as u32,
            mtime: mtime as i64,
            atime,
            linkname,
            name,
        },
    };

    Ok(Parsed::Entry(ParsedEntry { key, record }))
}

/// Header numbers that are blank or garbled read as zero rather than failing the build
fn numeric_field<T: Default>(value: io::Result<T>, field: &'static str, name: &str) -> T {
    value.unwrap_or_else(|e| {
        tracing::debug!(name, field, error = %e, "Unreadable header field, using 0");
        T::default()
    })
}

/// Directory record standing in for an ancestor with no member of its own.
/// Ownership and mtime follow the member that implied it.
fn implied_directory(key: &str, child: &RecordHeader) -> IndexRecord {
    IndexRecord {
        offset: 0,
        header: RecordHeader {
            name: format!("{}/", key),
            mode: 0o755,
            kind: EntryKind::Directory,
            size: 0,
            uid: child.uid,
            gid: child.gid,
            mtime: child.mtime,
            atime: None,
            linkname: None,
        },
    }
}

fn entry_kind(entry_type: EntryType) -> Option<EntryKind> {
    match entry_type {
        EntryType::Regular | EntryType::Continuous => Some(EntryKind::File),
        EntryType::Directory => Some(EntryKind::Directory),
        EntryType::Symlink => Some(EntryKind::Symlink),
        EntryType::Link => Some(EntryKind::HardLink),
        EntryType::Char => Some(EntryKind::CharDevice),
        EntryType::Block => Some(EntryKind::BlockDevice),
        EntryType::Fifo => Some(EntryKind::Fifo),
        _ => None,
    }
}

/// Access time from a PAX `atime` record, falling back to the GNU header field
fn access_time<R: Read>(entry: &mut tar::Entry<'_, R>) -> io::Result<Option<i64>> {
    if let Some(extensions) = entry.pax_extensions()? {
        for ext in extensions {
            let ext = ext?;
            if ext.key().ok() == Some("atime") {
                if let Some(secs) = ext.value().ok().and_then(parse_pax_time) {
                    return Ok(Some(secs));
                }
            }
        }
    }

    Ok(entry
        .header()
        .as_gnu()
        .and_then(|gnu| gnu.atime().ok())
        .filter(|&t| t > 0)
        .map(|t| t as i64))
}

/// PAX times are decimal seconds with an optional fraction, e.g. `1700000000.25`
fn parse_pax_time(value: &str) -> Option<i64> {
    let whole = value.split('.').next()?;
    whole.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tar::{Builder, Header};

    fn header(name: &str, entry_type: EntryType, size: u64, mode: u32) -> Header {
        let mut header = Header::new_gnu();
        header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
        header.set_entry_type(entry_type);
        header.set_size(size);
        header.set_mode(mode);
        header.set_mtime(1_700_000_000);
        header.set_uid(1000);
        header.set_gid(100);
        header.set_cksum();
        header
    }

    fn archive(members: &[(&str, EntryType, &[u8])]) -> Vec<u8> {
        let mut builder = Builder::new(Vec::new());
        for (name, entry_type, data) in members {
            let mode = if *entry_type == EntryType::Directory { 0o755 } else { 0o644 };
            let header = header(name, *entry_type, data.len() as u64, mode);
            builder.append(&header, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_counting_reader() {
        let mut reader = CountingReader::new(&b"abcdefgh"[..]);
        let mut buf = [0u8; 3];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(reader.bytes_read(), 3);
        io::copy(&mut reader, &mut io::sink()).unwrap();
        assert_eq!(reader.bytes_read(), 8);
    }

    #[test]
    fn test_entry_kind_mapping() {
        assert_eq!(entry_kind(EntryType::Regular), Some(EntryKind::File));
        assert_eq!(entry_kind(EntryType::Directory), Some(EntryKind::Directory));
        assert_eq!(entry_kind(EntryType::Link), Some(EntryKind::HardLink));
        assert_eq!(entry_kind(EntryType::XGlobalHeader), None);
    }

    #[test]
    fn test_parse_pax_time() {
        assert_eq!(parse_pax_time("1700000000"), Some(1_700_000_000));
        assert_eq!(parse_pax_time("1700000000.123456"), Some(1_700_000_000));
        assert_eq!(parse_pax_time("soon"), None);
    }

    #[tokio::test]
    async fn test_build_records_offsets_and_headers() {
        let data = archive(&[
            ("./", EntryType::Directory, b""),
            ("./hello.txt", EntryType::Regular, b"Hello World\n"),
            ("./foo/", EntryType::Directory, b""),
            ("./foo/bar.txt", EntryType::Regular, b"More file content"),
        ]);

        let store = IndexStore::in_memory().await.unwrap();
        let stats = build_index(&store, std::io::Cursor::new(data.clone())).await.unwrap();

        assert_eq!(stats.entries, 3);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.bytes_read, data.len() as u64);

        let hello = store.get("hello.txt").await.unwrap().unwrap();
        assert_eq!(hello.header.name, "./hello.txt");
        assert_eq!(hello.header.kind, EntryKind::File);
        assert_eq!(hello.header.size, 12);
        assert_eq!(hello.header.mode, 0o644);
        assert_eq!(hello.header.uid, 1000);
        assert_eq!(hello.header.gid, 100);
        assert_eq!(hello.header.mtime, 1_700_000_000);
        let start = hello.offset as usize;
        assert_eq!(&data[start..start + 12], b"Hello World\n");

        let foo = store.get("foo").await.unwrap().unwrap();
        assert_eq!(foo.header.kind, EntryKind::Directory);

        let bar = store.get("foo/bar.txt").await.unwrap().unwrap();
        let start = bar.offset as usize;
        assert_eq!(&data[start..start + 17], b"More file content");
    }

    #[tokio::test]
    async fn test_build_keeps_link_targets() {
        let mut builder = Builder::new(Vec::new());
        let mut link = header("./link", EntryType::Symlink, 0, 0o777);
        link.set_link_name("hello.txt").unwrap();
        link.set_cksum();
        builder.append(&link, &b""[..]).unwrap();
        let data = builder.into_inner().unwrap();

        let store = IndexStore::in_memory().await.unwrap();
        build_index(&store, std::io::Cursor::new(data)).await.unwrap();

        let record = store.get("link").await.unwrap().unwrap();
        assert_eq!(record.header.kind, EntryKind::Symlink);
        assert_eq!(record.header.linkname.as_deref(), Some("hello.txt"));
    }

    #[tokio::test]
    async fn test_build_reads_pax_atime() {
        let mut builder = Builder::new(Vec::new());
        builder.append_pax_extensions([("atime", &b"1600000000.5"[..])]).unwrap();
        builder
            .append(&header("./stamped", EntryType::Regular, 2, 0o600), &b"hi"[..])
            .unwrap();
        let data = builder.into_inner().unwrap();

        let store = IndexStore::in_memory().await.unwrap();
        build_index(&store, std::io::Cursor::new(data)).await.unwrap();

        let record = store.get("stamped").await.unwrap().unwrap();
        assert_eq!(record.header.atime, Some(1_600_000_000));
        assert_eq!(record.header.mode, 0o600);
    }

    #[tokio::test]
    async fn test_build_implies_missing_parent_directories() {
        let data = archive(&[
            ("a/b/c.txt", EntryType::Regular, b"abc"),
            ("a/b/", EntryType::Directory, b""),
        ]);

        let store = IndexStore::in_memory().await.unwrap();
        let stats = build_index(&store, std::io::Cursor::new(data)).await.unwrap();

        assert_eq!(stats.entries, 2);
        assert_eq!(stats.implied_dirs, 1);
        assert_eq!(store.count().await.unwrap(), 3);

        let a = store.get("a").await.unwrap().unwrap();
        assert_eq!(a.header.kind, EntryKind::Directory);
        assert_eq!(a.header.mode, 0o755);
        assert_eq!(a.header.uid, 1000);
        assert_eq!(a.header.mtime, 1_700_000_000);
        assert_eq!(a.offset, 0);

        // The real header arrived later and replaced the implied record
        let b = store.get("a/b").await.unwrap().unwrap();
        assert_eq!(b.header.kind, EntryKind::Directory);
        assert_ne!(b.offset, 0);
    }

    #[tokio::test]
    async fn test_build_reads_blank_numeric_fields_as_zero() {
        let mut header = Header::new_gnu();
        let name = b"bare.txt";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_entry_type(EntryType::Regular);
        header.set_size(4);
        header.set_cksum();

        let mut builder = Builder::new(Vec::new());
        builder.append(&header, &b"bare"[..]).unwrap();
        let data = builder.into_inner().unwrap();

        let store = IndexStore::in_memory().await.unwrap();
        let stats = build_index(&store, std::io::Cursor::new(data)).await.unwrap();
        assert_eq!(stats.entries, 1);

        let record = store.get("bare.txt").await.unwrap().unwrap();
        assert_eq!(record.header.mode, 0);
        assert_eq!(record.header.uid, 0);
        assert_eq!(record.header.gid, 0);
        assert_eq!(record.header.mtime, 0);
        assert_eq!(record.header.size, 4);
    }

    #[tokio::test]
    async fn test_build_rejects_garbage_and_leaves_store_empty() {
        let mut data = archive(&[("./ok.txt", EntryType::Regular, b"fine")]);
        // Corrupt the second header block so its checksum no longer matches
        let garbage = vec![0x41u8; 512];
        let end = data.len() - 1024;
        data.splice(end..end, garbage);

        let store = IndexStore::in_memory().await.unwrap();
        let err = build_index(&store, std::io::Cursor::new(data)).await.unwrap_err();

        assert!(matches!(err, IndexError::MalformedArchive(_)));
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
