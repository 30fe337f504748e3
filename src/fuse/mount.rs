// FUSE mount management
//
// Mounts an IndexFs read-only in a background session. The session serves
// until it is dropped or the filesystem is unmounted from outside.

use super::IndexFs;
use crate::config::MountConfig;
use anyhow::{Context, Result};
use std::path::Path;

/// Mount options for FUSE filesystem
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Allow other users to access the filesystem
    pub allow_other: bool,

    /// Allow root to access the filesystem
    pub allow_root: bool,

    /// Filesystem name (for mtab)
    pub fsname: Option<String>,

    /// Auto-unmount on process exit
    pub auto_unmount: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            allow_other: false,
            allow_root: false,
            fsname: Some("tarmount".to_string()),
            auto_unmount: false,
        }
    }
}

impl From<&MountConfig> for MountOptions {
    fn from(config: &MountConfig) -> Self {
        Self {
            allow_other: config.allow_other,
            allow_root: config.allow_root,
            fsname: Some(config.fsname.clone()),
            ..Default::default()
        }
    }
}

impl MountOptions {
    /// Convert to fuser mount options; the mount is always read-only
    fn to_fuser_options(&self) -> Vec<fuser::MountOption> {
        let mut options = vec![fuser::MountOption::RO];

        if self.allow_other {
            options.push(fuser::MountOption::AllowOther);
        }

        if self.allow_root {
            options.push(fuser::MountOption::AllowRoot);
        }

        if let Some(ref fsname) = self.fsname {
            options.push(fuser::MountOption::FSName(fsname.clone()));
        }

        if self.auto_unmount {
            options.push(fuser::MountOption::AutoUnmount);
        }

        options
    }
}

fn check_mountpoint(mountpoint: &Path) -> Result<()> {
    if !mountpoint.exists() {
        anyhow::bail!("Mount point does not exist: {}", mountpoint.display());
    }

    if !mountpoint.is_dir() {
        anyhow::bail!("Mount point is not a directory: {}", mountpoint.display());
    }

    Ok(())
}

/// Create `mountpoint` if it is missing and check that it is a directory
pub fn prepare_mountpoint(mountpoint: &Path) -> Result<()> {
    if !mountpoint.exists() {
        std::fs::create_dir_all(mountpoint).with_context(|| {
            format!("Failed to create mount point {}", mountpoint.display())
        })?;
    }
    check_mountpoint(mountpoint)
}

/// Mount in a background session that keeps the filesystem mounted until dropped
pub fn mount(
    fs: IndexFs,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<fuser::BackgroundSession> {
    let mountpoint = mountpoint.as_ref();
    check_mountpoint(mountpoint)?;

    tracing::info!(mountpoint = %mountpoint.display(), "Mounting filesystem in background");

    let session = fuser::spawn_mount2(fs, mountpoint, &options.to_fuser_options())
        .context("Failed to mount filesystem")?;

    tracing::info!("Filesystem mounted successfully");

    Ok(session)
}

/// Block until `session` ends, which happens once the filesystem is unmounted
pub fn wait(session: fuser::BackgroundSession) -> Result<()> {
    let served = session
        .guard
        .join()
        .map_err(|_| anyhow::anyhow!("FUSE session thread panicked"))?;
    served.context("FUSE session failed")?;

    tracing::info!("Filesystem unmounted");
    Ok(())
}

/// Unmount a FUSE filesystem
///
/// Note: a BackgroundSession unmounts when dropped; this is for mounts owned
/// by another process.
pub fn unmount(mountpoint: impl AsRef<Path>) -> Result<()> {
    let mountpoint = mountpoint.as_ref();

    tracing::info!("Unmounting filesystem at {}", mountpoint.display());

    #[cfg(target_os = "linux")]
    let mut command = {
        let mut command = std::process::Command::new("fusermount");
        command.arg("-u");
        command
    };

    #[cfg(not(target_os = "linux"))]
    let mut command = std::process::Command::new("umount");

    let output = command.arg(mountpoint).output().context("Failed to execute unmount command")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("Failed to unmount: {}", stderr.trim());
    }

    tracing::info!("Filesystem unmounted successfully");

    Ok(())
}
