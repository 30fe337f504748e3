// Index dump
//
// Walks an index breadth-first from its root and serializes every entry.

use crate::index::{Attributes, EntryKind, EntryRef, Index, IndexResult, OpContext};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::io::Write;

/// One entry as written by `index dump`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySummary {
    pub path: String,
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    /// Absent when the back-end leaves ownership to the mount defaults
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    pub mtime: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
}

impl EntrySummary {
    pub fn of(entry: &EntryRef) -> Self {
        let attributes = entry.attributes();
        let attr = attributes.attr();
        let owner = match &attributes {
            Attributes::Known(_, owner) => Some(*owner),
            Attributes::ApplyDefaults(_) => None,
        };

        Self {
            path: entry.path().to_string(),
            name: entry.name().to_string(),
            kind: entry.kind(),
            size: attr.size,
            mode: attr.mode,
            uid: owner.map(|o| o.uid),
            gid: owner.map(|o| o.gid),
            mtime: attr.mtime,
            link_target: entry.link_target().map(str::to_string),
        }
    }
}

/// Every entry reachable from the root, level by level
pub async fn collect_entries(ctx: &OpContext, index: &dyn Index) -> IndexResult<Vec<EntrySummary>> {
    let mut queue: VecDeque<EntryRef> = index.root_entries(ctx).await?.into();
    let mut summaries = Vec::new();

    while let Some(entry) = queue.pop_front() {
        if entry.is_dir() {
            queue.extend(index.children(ctx, entry.as_ref()).await?);
        }
        summaries.push(EntrySummary::of(&entry));
    }

    tracing::debug!(entries = summaries.len(), "Index walked");
    Ok(summaries)
}

/// Write the summaries as a pretty-printed JSON array
pub fn write_json<W: Write>(mut writer: W, entries: &[EntrySummary]) -> serde_json::Result<()> {
    serde_json::to_writer_pretty(&mut writer, entries)?;
    writer.write_all(b"\n").map_err(serde_json::Error::io)
}
