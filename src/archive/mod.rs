// Tar archive indexing
//
// `builder` turns a tar stream into a store of offsets and headers once;
// `reader` serves that store as a lazy Index over any random-access source.

pub mod builder;
pub mod reader;

pub use builder::{BuildStats, CountingReader, build_index};
pub use reader::{TarEntry, TarIndex};
