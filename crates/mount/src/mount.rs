//! Helpers for interacting with mountpoints
//!
//! Mounting and unmounting go through the `mount`/`umount` binaries so that
//! filesystem type detection and `/etc/mtab` handling match what the rest of
//! the box does.

use anyhow::{Context, Result};
use bootslot_utils::AsyncCommandRunExt;
use camino::Utf8Path;
use cap_std_ext::cap_std::{self, fs::Dir};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use rustix::io::Errno;
use tokio::process::Command;

/// Returns `true` if `path` is the root of a mounted filesystem, including
/// bind mounts from the same filesystem.
///
/// A path that does not exist or is not a directory is not a mountpoint.
/// If the kernel cannot tell (no `statx` mount-root support), the path is
/// reported as not mounted.
#[context("Checking mountpoint {path}")]
pub fn is_mountpoint(path: &Utf8Path) -> Result<bool> {
    let d = match Dir::open_ambient_dir(path, cap_std::ambient_authority()) {
        Ok(d) => d,
        Err(e) => match Errno::from_io_error(&e) {
            Some(Errno::NOENT | Errno::NOTDIR) => return Ok(false),
            _ => return Err(e.into()),
        },
    };
    Ok(d.is_mountpoint(".")?.unwrap_or(false))
}

/// Lazily detach whatever is mounted on `target`, without spawning a process.
///
/// Usable from `Drop` where no runtime is available.
pub fn detach(target: &Utf8Path) -> Result<()> {
    rustix::mount::unmount(target.as_std_path(), rustix::mount::UnmountFlags::DETACH)
        .with_context(|| format!("Detaching {target}"))?;
    tracing::debug!("Detached {target}");
    Ok(())
}

/// Mount `source` on `target`, optionally with `-o options`.
///
/// The child process is killed if the returned future is dropped.
#[context("Mounting {source} on {target}")]
pub async fn mount(source: &str, target: &Utf8Path, options: Option<&str>) -> Result<()> {
    let mut c = Command::new("mount");
    if let Some(options) = options {
        c.args(["-o", options]);
    }
    c.arg(source).arg(target.as_str());
    c.run().await?;
    tracing::debug!("Mounted {source} on {target}");
    Ok(())
}

/// Unmount the filesystem mounted on `target`.
#[context("Unmounting {target}")]
pub async fn unmount(target: &Utf8Path) -> Result<()> {
    Command::new("umount").arg(target.as_str()).run().await?;
    tracing::debug!("Unmounted {target}");
    Ok(())
}
