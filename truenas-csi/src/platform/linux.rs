//! Linux platform implementation for CSI Node operations
//!
//! Uses Linux-specific tools:
//! - blkid for filesystem probing
//! - mkfs.ext3/mkfs.ext4/mkfs.xfs for formatting
//! - mount/umount
//! - resize2fs/xfs_growfs for online growth

use std::fs::{self, DirBuilder};
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::Path;

use tonic::Status;
use tracing::{debug, error, info, warn};

use super::{CommandOutput, CommandRunner, PlatformResult};

/// Default filesystem type for Linux
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// `blkid -p` exit status when no signature was found
const BLKID_NO_SIGNATURE: i32 = 2;

const EXT4_SUPER_MAGIC: i64 = 0xEF53;
const XFS_SUPER_MAGIC: i64 = 0x5846_5342;

/// Validate that a path is safe to hand to external tools.
pub fn validate_path(path: &str) -> PlatformResult<()> {
    if path.is_empty() {
        return Err(Status::invalid_argument("Path cannot be empty"));
    }

    if !path.starts_with('/') {
        return Err(Status::invalid_argument("Path must be absolute"));
    }

    // Disallow characters that could enable shell injection
    let dangerous_chars = [
        ';', '|', '&', '$', '`', '(', ')', '{', '}', '<', '>', '\n', '\r',
    ];
    for c in dangerous_chars {
        if path.contains(c) {
            return Err(Status::invalid_argument(format!(
                "Path contains dangerous character: '{}'",
                c
            )));
        }
    }

    if path.contains("..") {
        return Err(Status::invalid_argument(
            "Path cannot contain '..' (path traversal)",
        ));
    }

    Ok(())
}

/// Validate that an IQN is safe to pass to iscsiadm.
pub fn validate_target_name(target: &str) -> PlatformResult<()> {
    if target.is_empty() {
        return Err(Status::invalid_argument("Target name cannot be empty"));
    }

    let valid = target
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == ':' || c == '-' || c == '_');

    if !valid {
        return Err(Status::invalid_argument(
            "Target name contains invalid characters",
        ));
    }

    Ok(())
}

/// Run a command and fail with `Unavailable` unless it exits 0.
pub async fn run_checked(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[&str],
) -> PlatformResult<CommandOutput> {
    let output = runner.run(program, args).await.map_err(|e| {
        error!(error = %e, program = %program, "Failed to execute command");
        Status::unavailable(format!("Failed to execute {}: {}", program, e))
    })?;

    if !output.success() {
        error!(
            program = %program,
            code = ?output.code,
            stderr = %output.stderr.trim(),
            "Command failed"
        );
        return Err(Status::unavailable(format!(
            "{} failed: {}",
            program,
            output.stderr.trim()
        )));
    }

    Ok(output)
}

/// Map a requested fsType onto a supported one. Empty selects ext4.
pub fn normalize_fs_type(fs_type: &str) -> PlatformResult<&'static str> {
    match fs_type.to_lowercase().as_str() {
        "" | "ext4" => Ok(DEFAULT_FS_TYPE),
        "ext3" => Ok("ext3"),
        "xfs" => Ok("xfs"),
        _ => Err(Status::invalid_argument(format!(
            "Unsupported filesystem on Linux: {}. Supported: ext3, ext4, xfs",
            fs_type
        ))),
    }
}

/// Probe a device for an existing filesystem signature.
pub async fn has_filesystem(runner: &dyn CommandRunner, device: &str) -> PlatformResult<bool> {
    let output = runner.run("blkid", &["-p", device]).await.map_err(|e| {
        error!(error = %e, "Failed to execute blkid");
        Status::unavailable(format!("Failed to check device filesystem: {}", e))
    })?;

    match output.code {
        Some(0) => Ok(true),
        Some(BLKID_NO_SIGNATURE) => Ok(false),
        code => {
            error!(device = %device, code = ?code, stderr = %output.stderr.trim(), "blkid failed");
            Err(Status::unavailable(format!(
                "blkid failed on {}: {}",
                device,
                output.stderr.trim()
            )))
        }
    }
}

/// Format `device` unless a probe finds a filesystem signature on it.
pub async fn ensure_filesystem(
    runner: &dyn CommandRunner,
    device: &str,
    fs_type: &str,
) -> PlatformResult<()> {
    let fs_type = normalize_fs_type(fs_type)?;

    if has_filesystem(runner, device).await? {
        debug!(device = %device, "Device already formatted");
        return Ok(());
    }

    info!(device = %device, fs_type = %fs_type, "Formatting device");
    let mkfs = format!("mkfs.{}", fs_type);
    run_checked(runner, &mkfs, &[device]).await?;
    Ok(())
}

/// Create a directory with mode 0755. An existing directory is fine.
pub fn make_dir(path: &str) -> PlatformResult<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(path)
        .map_err(|e| {
            error!(error = %e, path = %path, "Failed to create directory");
            Status::unavailable(format!("Failed to create directory {}: {}", path, e))
        })
}

/// Mount `source` on `target`, passing `options` joined with commas.
pub async fn mount(
    runner: &dyn CommandRunner,
    source: &str,
    target: &str,
    options: &[String],
) -> PlatformResult<()> {
    info!(source = %source, target = %target, options = ?options, "Mounting");

    let joined = options.join(",");
    let mut args = Vec::with_capacity(4);
    if !joined.is_empty() {
        args.push("-o");
        args.push(joined.as_str());
    }
    args.push(source);
    args.push(target);

    run_checked(runner, "mount", &args).await?;
    Ok(())
}

pub async fn umount(runner: &dyn CommandRunner, target: &str) -> PlatformResult<()> {
    info!(target = %target, "Unmounting");
    run_checked(runner, "umount", &[target]).await?;
    Ok(())
}

/// A path is a mount point when it lives on a different device than its parent.
pub fn is_mount_point(path: &Path) -> std::io::Result<bool> {
    let meta = fs::symlink_metadata(path)?;
    let Some(parent) = path.parent() else {
        return Ok(true);
    };
    let parent_meta = fs::metadata(parent)?;
    Ok(meta.dev() != parent_meta.dev())
}

/// Filesystem mounted at a path, as far as online growth cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemKind {
    Ext4,
    Xfs,
    Other(i64),
}

impl FilesystemKind {
    pub fn from_magic(magic: i64) -> Self {
        match magic {
            EXT4_SUPER_MAGIC => FilesystemKind::Ext4,
            XFS_SUPER_MAGIC => FilesystemKind::Xfs,
            other => FilesystemKind::Other(other),
        }
    }
}

/// Identify the filesystem mounted at `path` from its statfs magic.
pub fn filesystem_kind(path: &str) -> PlatformResult<FilesystemKind> {
    let stat = nix::sys::statfs::statfs(path).map_err(|e| {
        error!(error = %e, path = %path, "statfs failed");
        Status::unavailable(format!("statfs {} failed: {}", path, e))
    })?;
    #[allow(clippy::unnecessary_cast)]
    let magic = stat.filesystem_type().0 as i64;
    Ok(FilesystemKind::from_magic(magic))
}

/// Ask the kernel to re-read the size of block device `name` (e.g. "sdb").
pub fn rescan_device(sysfs_block_root: &Path, name: &str) -> PlatformResult<()> {
    let rescan = sysfs_block_root.join(name).join("device").join("rescan");
    info!(device = %name, path = %rescan.display(), "Rescanning block device");
    fs::write(&rescan, "- - -").map_err(|e| {
        error!(error = %e, path = %rescan.display(), "Failed to rescan device");
        Status::unavailable(format!("Failed to rescan {}: {}", name, e))
    })
}

/// Size of block device `name` in bytes, 0 when sysfs cannot tell.
pub fn device_size_bytes(sysfs_block_root: &Path, name: &str) -> i64 {
    let path = sysfs_block_root.join(name).join("size");
    match fs::read_to_string(&path) {
        Ok(sectors) => sectors.trim().parse::<i64>().map(|s| s * 512).unwrap_or(0),
        Err(e) => {
            warn!(error = %e, path = %path.display(), "Cannot read device size");
            0
        }
    }
}

/// Grow a mounted filesystem to fill its device.
pub async fn grow_filesystem(
    runner: &dyn CommandRunner,
    kind: FilesystemKind,
    device: &str,
    mount_path: &str,
) -> PlatformResult<()> {
    match kind {
        FilesystemKind::Ext4 => {
            info!(device = %device, "Growing ext4 filesystem");
            run_checked(runner, "resize2fs", &[device]).await?;
        }
        FilesystemKind::Xfs => {
            info!(path = %mount_path, "Growing xfs filesystem");
            run_checked(runner, "xfs_growfs", &[mount_path]).await?;
        }
        FilesystemKind::Other(magic) => {
            warn!(path = %mount_path, magic = magic, "Not growing unknown filesystem");
        }
    }
    Ok(())
}
