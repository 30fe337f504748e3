// Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use tar::{Builder, EntryType, Header};
use tarmount::archive::{TarIndex, build_index};
use tarmount::source::MemorySource;
use tarmount::store::IndexStore;

pub const HELLO_TXT: &[u8] = b"Hello World\nThis is a test";
pub const HIDDEN: &[u8] = b"Filename starts with a .";
pub const FOO_BAR_TXT: &[u8] = b"More file content";

pub const FIXTURE_UID: u64 = 33333;

/// Header with the name written verbatim, so `./` prefixes and trailing
/// slashes reach the indexer untouched
fn raw_header(name: &str, entry_type: EntryType, size: u64, mode: u32) -> Header {
    let mut header = Header::new_ustar();
    header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
    header.set_entry_type(entry_type);
    header.set_size(size);
    header.set_mode(mode);
    header.set_uid(FIXTURE_UID);
    header.set_gid(FIXTURE_UID);
    header.set_mtime(1_600_000_000);
    header.set_cksum();
    header
}

/// Archive laid out the way `tar -C dir -cf - .` would produce it
pub fn fixture_tar() -> Vec<u8> {
    let members: &[(&str, EntryType, u32, &[u8])] = &[
        ("./", EntryType::Directory, 0o755, b""),
        ("./hello.txt", EntryType::Regular, 0o644, HELLO_TXT),
        ("./hidden", EntryType::Regular, 0o644, HIDDEN),
        ("./foo/", EntryType::Directory, 0o755, b""),
        ("./foo/bar.txt", EntryType::Regular, 0o644, FOO_BAR_TXT),
        ("./foo/dir", EntryType::Directory, 0o755, b""),
        ("./foo/three", EntryType::Directory, 0o755, b""),
        ("./foo/three/levels", EntryType::Directory, 0o755, b""),
        ("./foo/three/levels/deep", EntryType::Regular, 0o755, HELLO_TXT),
    ];

    let mut builder = Builder::new(Vec::new());
    for (name, entry_type, mode, data) in members {
        let header = raw_header(name, *entry_type, data.len() as u64, *mode);
        builder.append(&header, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

/// Fixture indexed into an in-memory store and served from memory
pub async fn fixture_index() -> TarIndex {
    let data = fixture_tar();
    let store = IndexStore::in_memory().await.unwrap();
    build_index(&store, std::io::Cursor::new(data.clone())).await.unwrap();
    TarIndex::new(store, Arc::new(MemorySource::new(data)))
}
