// FUSE filesystem
//
// Exposes any Index as a read-only POSIX filesystem.

pub mod adapter;
pub mod mount;

pub use adapter::{AdapterOptions, IndexFs, ROOT_INODE};
pub use mount::{MountOptions, mount, prepare_mountpoint, unmount, wait};
