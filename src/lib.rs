// tarmount - lazy read-only FUSE mounts of tar archives and repository trees

pub mod archive;
pub mod config;
pub mod daemon;
pub mod dump;
pub mod fuse;
pub mod github;
pub mod index;
pub mod metrics;
pub mod open;
pub mod remote;
pub mod source;
pub mod store;

pub use index::{Entry, EntryKind, EntryRef, Index, IndexError, IndexResult, OpContext};
pub use open::IndexSource;
