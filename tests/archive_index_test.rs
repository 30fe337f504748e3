// Integration tests for building and serving tar indexes

mod common;

use common::{FOO_BAR_TXT, HELLO_TXT, HIDDEN, fixture_index, fixture_tar};
use tarmount::archive::{TarIndex, build_index};
use tarmount::index::{Attributes, EntryKind, EntryRef, Index, IndexError, OpContext, Ownership};
use tarmount::source::MemorySource;
use tarmount::store::IndexStore;

fn names(entries: &[EntryRef]) -> Vec<String> {
    entries.iter().map(|e| e.name().to_string()).collect()
}

async fn find(index: &TarIndex, path: &str) -> EntryRef {
    let ctx = OpContext::background();
    let mut entries = index.root_entries(&ctx).await.unwrap();
    let mut found: Option<EntryRef> = None;
    for segment in path.split('/') {
        if let Some(parent) = found.take() {
            entries = index.children(&ctx, parent.as_ref()).await.unwrap();
        }
        found = entries.iter().find(|e| e.name() == segment).cloned();
        assert!(found.is_some(), "{} not found while resolving {}", segment, path);
    }
    found.unwrap()
}

async fn read_all(index: &TarIndex, entry: &EntryRef) -> Vec<u8> {
    let mut buf = vec![0u8; entry.attributes().attr().size as usize + 16];
    let n = index.read(&OpContext::background(), entry.as_ref(), &mut buf, 0).await.unwrap();
    buf.truncate(n);
    buf
}

#[tokio::test]
async fn test_root_entries() {
    let index = fixture_index().await;
    let root = index.root_entries(&OpContext::background()).await.unwrap();

    assert_eq!(names(&root), vec!["foo", "hello.txt", "hidden"]);
    assert!(root[0].is_dir());
    assert_eq!(root[1].kind(), EntryKind::File);
}

#[tokio::test]
async fn test_children_with_modes() {
    let index = fixture_index().await;
    let foo = find(&index, "foo").await;

    let children = index.children(&OpContext::background(), foo.as_ref()).await.unwrap();
    let listing: Vec<String> = children
        .iter()
        .map(|e| format!("{}:{:o}", e.name(), e.attributes().attr().mode))
        .collect();

    assert_eq!(listing, vec!["bar.txt:644", "dir:755", "three:755"]);
    assert_eq!(children[0].path(), "foo/bar.txt");
}

#[tokio::test]
async fn test_deep_children() {
    let index = fixture_index().await;
    let ctx = OpContext::background();

    let three = find(&index, "foo/three").await;
    let levels = index.children(&ctx, three.as_ref()).await.unwrap();
    assert_eq!(names(&levels), vec!["levels"]);

    let deep = index.children(&ctx, levels[0].as_ref()).await.unwrap();
    assert_eq!(names(&deep), vec!["deep"]);
    assert_eq!(deep[0].attributes().attr().mode, 0o755);

    let empty = find(&index, "foo/dir").await;
    assert!(index.children(&ctx, empty.as_ref()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_read_stops_at_end_of_file() {
    let index = fixture_index().await;
    let hello = find(&index, "hello.txt").await;

    let mut buf = [0u8; 27];
    let n = index.read(&OpContext::background(), hello.as_ref(), &mut buf, 0).await.unwrap();
    assert_eq!(n, HELLO_TXT.len());
    assert_eq!(&buf[..n], HELLO_TXT);
}

#[tokio::test]
async fn test_reads_at_offsets() {
    let index = fixture_index().await;
    let ctx = OpContext::background();
    let hello = find(&index, "hello.txt").await;

    for offset in [0usize, 1, 11, 12, 25] {
        let mut buf = [0u8; 8];
        let n = index.read(&ctx, hello.as_ref(), &mut buf, offset as u64).await.unwrap();
        let expected = &HELLO_TXT[offset..(offset + 8).min(HELLO_TXT.len())];
        assert_eq!(&buf[..n], expected, "offset {}", offset);
    }

    let mut buf = [0u8; 8];
    assert_eq!(index.read(&ctx, hello.as_ref(), &mut buf, 26).await.unwrap(), 0);
    assert_eq!(index.read(&ctx, hello.as_ref(), &mut buf, 1000).await.unwrap(), 0);
}

#[tokio::test]
async fn test_every_file_reads_back() {
    let index = fixture_index().await;

    for (path, content) in [
        ("hello.txt", HELLO_TXT),
        ("hidden", HIDDEN),
        ("foo/bar.txt", FOO_BAR_TXT),
        ("foo/three/levels/deep", HELLO_TXT),
    ] {
        let entry = find(&index, path).await;
        assert_eq!(entry.attributes().attr().size, content.len() as u64, "{}", path);
        assert_eq!(read_all(&index, &entry).await, content, "{}", path);
    }
}

#[tokio::test]
async fn test_ownership_is_recorded() {
    let index = fixture_index().await;
    let hidden = find(&index, "hidden").await;

    let owner = Ownership { uid: 33333, gid: 33333 };
    assert!(matches!(hidden.attributes(), Attributes::Known(_, o) if o == owner));
    assert_eq!(hidden.attributes().attr().mtime.timestamp(), 1_600_000_000);
}

#[tokio::test]
async fn test_builds_are_idempotent() {
    let data = fixture_tar();

    let first = IndexStore::in_memory().await.unwrap();
    let second = IndexStore::in_memory().await.unwrap();
    let stats = build_index(&first, std::io::Cursor::new(data.clone())).await.unwrap();
    build_index(&second, std::io::Cursor::new(data.clone())).await.unwrap();

    // "./" becomes the empty root key and is skipped
    assert_eq!(stats.entries, 8);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.bytes_read, data.len() as u64);

    let all = |_: &str| true;
    assert_eq!(first.scan(all).await.unwrap(), second.scan(all).await.unwrap());
}

#[tokio::test]
async fn test_members_without_parent_headers_are_reachable() {
    // What `tar cf x.tar a/b.txt` writes: no member for `a` itself
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(HIDDEN.len() as u64);
    header.set_mode(0o600);
    header.set_uid(1000);
    header.set_gid(1000);
    header.set_mtime(1_650_000_000);
    builder.append_data(&mut header, "a/b.txt", HIDDEN).unwrap();
    let data = builder.into_inner().unwrap();

    let store = IndexStore::in_memory().await.unwrap();
    let stats = build_index(&store, std::io::Cursor::new(data.clone())).await.unwrap();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.implied_dirs, 1);

    let index = TarIndex::new(store, std::sync::Arc::new(MemorySource::new(data)));
    let root = index.root_entries(&OpContext::background()).await.unwrap();
    assert_eq!(names(&root), vec!["a"]);
    assert_eq!(root[0].kind(), EntryKind::Directory);
    assert_eq!(root[0].attributes().attr().mode, 0o755);

    let file = find(&index, "a/b.txt").await;
    assert_eq!(read_all(&index, &file).await, HIDDEN);
}

#[tokio::test]
async fn test_malformed_archive_leaves_empty_store() {
    let mut data = fixture_tar();
    // Corrupt the checksum of the header for "./hidden", after hello.txt was indexed
    let hidden_header = 3 * 512;
    data[hidden_header + 148..hidden_header + 156].copy_from_slice(b"0000000\0");

    let store = IndexStore::in_memory().await.unwrap();
    let err = build_index(&store, std::io::Cursor::new(data)).await.unwrap_err();

    assert!(matches!(err, IndexError::MalformedArchive(_)));
    assert_eq!(store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_on_disk_store_round_trip() {
    let dir = tempfile::TempDir::new().unwrap();
    let index_dir = dir.path().join("index");
    let tar_path = dir.path().join("fixture.tar");
    std::fs::write(&tar_path, fixture_tar()).unwrap();

    let store = IndexStore::create(&index_dir).await.unwrap();
    let file = std::fs::File::open(&tar_path).unwrap();
    build_index(&store, file).await.unwrap();
    store.close().await;

    let entries: Vec<_> = std::fs::read_dir(&index_dir).unwrap().collect();
    assert_eq!(entries.len(), 1, "store directory should hold only the database");

    let index = TarIndex::open_local(&index_dir, &tar_path).await.unwrap();
    let bar = find(&index, "foo/bar.txt").await;
    assert_eq!(read_all(&index, &bar).await, FOO_BAR_TXT);
}

#[tokio::test]
async fn test_cancelled_context_is_benign() {
    let index = fixture_index().await;
    let (ctx, handle) = OpContext::background().cancellable();
    handle.cancel();

    let err = index.root_entries(&ctx).await.unwrap_err();
    assert!(matches!(err, IndexError::Cancelled));
    assert!(err.is_cancelled());
}
