// Remote index bundles
//
// A published archive `B` consists of `B.index`, a gzip tar of a store
// directory, and `B.tar`, the raw archive. Opening fetches and unpacks the
// index into a private temporary directory, then serves file content through
// range requests against the raw archive.

use super::range::HttpRangeReader;
use crate::archive::TarIndex;
use crate::config::RemoteConfig;
use crate::index::path::sanitize_relative;
use crate::index::{IndexError, IndexResult, OpContext};
use crate::store::IndexStore;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, Read, Seek, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tar::EntryType;
use tokio::io::AsyncWriteExt;

pub fn index_url(base_url: &str) -> String {
    format!("{}.index", base_url)
}

pub fn tar_url(base_url: &str) -> String {
    format!("{}.tar", base_url)
}

/// Download and open the index published at `base_url`.
///
/// The extracted store lives in a temporary directory owned by the returned
/// index and is removed when it is dropped.
pub async fn open_remote_index(
    ctx: &OpContext,
    base_url: &str,
    config: &RemoteConfig,
) -> IndexResult<TarIndex> {
    ctx.check()?;

    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = ctx.remaining().or_else(|| config.download_timeout()) {
        builder = builder.timeout(timeout);
    }
    let download = builder.build()?;

    let workdir = tempfile::Builder::new().prefix("tarmount-index-").tempdir()?;
    let index_url = index_url(base_url);
    tracing::info!(url = %index_url, dir = %workdir.path().display(), "Downloading index bundle");

    let bundle = ctx.run(download_to_file(&download, &index_url)).await?;

    let dest = workdir.path().to_path_buf();
    let files = tokio::task::spawn_blocking(move || extract_bundle(bundle, &dest)).await??;
    tracing::debug!(files, "Index bundle extracted");

    let store = IndexStore::open(workdir.path()).await?;

    let client = reqwest::Client::builder().timeout(config.request_timeout()).build()?;
    let tar_url = tar_url(base_url);
    let reader = ctx.run(HttpRangeReader::open(client, tar_url, config.range_options())).await?;

    Ok(TarIndex::new(store, Arc::new(reader)).with_workdir(workdir))
}

/// Stream the body of `url` into an anonymous temporary file, rewound for reading
async fn download_to_file(client: &reqwest::Client, url: &str) -> IndexResult<fs::File> {
    let mut response = client.get(url).send().await?.error_for_status()?;
    let mut file = tokio::fs::File::from_std(tempfile::tempfile()?);

    let mut received = 0u64;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        received += chunk.len() as u64;
    }
    file.flush().await?;
    tracing::debug!(url, bytes = received, "Index bundle downloaded");

    let mut file = file.into_std().await;
    file.rewind()?;
    Ok(file)
}

/// Unpack a gzip tar into `dest`, returning the number of regular files written.
///
/// Directories are created as needed, existing files are overwritten, declared
/// permission bits are applied, and all other member types are skipped.
/// Directory modes are applied last so read-only directories can still be filled.
pub fn extract_bundle<R: Read>(reader: R, dest: &Path) -> IndexResult<usize> {
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    let mut files = 0;
    let mut dir_modes: Vec<(PathBuf, u32)> = Vec::new();

    for entry in archive.entries().map_err(IndexError::MalformedArchive)? {
        let mut entry = entry.map_err(IndexError::MalformedArchive)?;
        let relative = sanitize_relative(&entry.path().map_err(IndexError::MalformedArchive)?)?;
        if relative.as_os_str().is_empty() {
            continue;
        }

        let target = dest.join(&relative);

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target)?;
                let mode = member_mode(&entry);
                if mode != 0 {
                    dir_modes.push((target, mode));
                }
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut file =
                    OpenOptions::new().write(true).create(true).truncate(true).open(&target)?;
                io::copy(&mut entry, &mut file).map_err(IndexError::MalformedArchive)?;
                file.flush()?;
                let mode = match member_mode(&entry) {
                    0 => 0o644,
                    mode => mode,
                };
                fs::set_permissions(&target, Permissions::from_mode(mode))?;
                files += 1;
            }
            other => {
                tracing::debug!(
                    path = %relative.display(),
                    entry_type = ?other,
                    "Skipping bundle member"
                );
            }
        }
    }

    // Deepest first, so restricting a parent never blocks its children
    dir_modes.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
    for (path, mode) in dir_modes {
        fs::set_permissions(&path, Permissions::from_mode(mode))?;
    }

    Ok(files)
}

/// Permission bits of a bundle member; a blank mode field reads as 0
fn member_mode<R: Read>(entry: &tar::Entry<'_, R>) -> u32 {
    entry.header().mode().unwrap_or_else(|e| {
        tracing::debug!(error = %e, "Unreadable mode in bundle member, using default");
        0
    }) & 0o7777
}

/// Pack a store directory as a gzip tar bundle
pub fn write_bundle<W: Write>(store_dir: &Path, writer: W) -> io::Result<W> {
    let mut builder = tar::Builder::new(GzEncoder::new(writer, Compression::default()));
    builder.append_dir_all(".", store_dir)?;
    builder.into_inner()?.finish()
}
