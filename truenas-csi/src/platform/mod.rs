//! Platform operations for CSI Node service
//!
//! Linux implementations of the filesystem, mount and block device
//! primitives the node needs. External tools run through [`CommandRunner`]
//! so node logic can be exercised without touching the host.
//!
//! # Usage
//!
//! ```ignore
//! use crate::platform::{self, SystemRunner};
//!
//! let runner = SystemRunner;
//! platform::ensure_filesystem(&runner, "/staging/device", "ext4").await?;
//! platform::mount(&runner, "/staging/device", "/target", &[]).await?;
//! ```

mod linux;

use async_trait::async_trait;
use tonic::Status;

/// Result type for platform operations
pub type PlatformResult<T> = Result<T, Status>;

// Re-export all platform functions and types
pub use linux::{
    DEFAULT_FS_TYPE, FilesystemKind, device_size_bytes, ensure_filesystem, filesystem_kind,
    grow_filesystem, has_filesystem, is_mount_point, make_dir, mount, normalize_fs_type,
    rescan_device, run_checked, umount, validate_path, validate_target_name,
};

/// Exit status and output of an external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs external programs on behalf of the node service.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` to completion. `Err` only when the
    /// process could not be started.
    async fn run(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput>;
}

/// Runs commands on the host via `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}
