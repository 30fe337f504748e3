// Remote archives served over HTTP

pub mod bundle;
pub mod range;

pub use bundle::{extract_bundle, open_remote_index, write_bundle};
pub use range::{HttpRangeReader, RangeOptions};
