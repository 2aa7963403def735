//! CSI Node Service Implementation
//!
//! Attaches volumes on worker nodes. iSCSI volumes are logged in during
//! staging and recorded by two files in the staging directory:
//!
//! - `iscsi`: the target IQN, enough to log out after a restart
//! - `device`: symlink to the udev by-path node of LUN 0
//!
//! NFS volumes have no staging step and are mounted straight at the
//! publish target.

mod iscsi;

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

pub use iscsi::{DEFAULT_ISCSI_PORT, Initiator, by_path_device, normalize_portal};

use crate::csi;
use crate::csi::volume_capability::AccessType;
use crate::metrics::OperationTimer;
use crate::platform::{self, CommandRunner, SystemRunner};
use crate::volume_context::{IscsiContext, NfsContext, VolumeContext};

/// Staging file holding the target IQN
pub const ISCSI_MARKER: &str = "iscsi";
/// Staging symlink to the block device
pub const DEVICE_LINK: &str = "device";

pub const DEFAULT_BY_PATH_ROOT: &str = "/dev/disk/by-path";
pub const DEFAULT_SYSFS_BLOCK_ROOT: &str = "/sys/class/block";

const DEVICE_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// CSI Node Service
pub struct NodeService {
    /// The node identifier for this CSI node
    node_id: String,
    runner: Arc<dyn CommandRunner>,
    initiator: Initiator,
    by_path_root: PathBuf,
    sysfs_block_root: PathBuf,
    device_timeout: Duration,
}

impl NodeService {
    /// Create a NodeService that runs tools on the host.
    pub fn new(node_id: String) -> Self {
        Self::with_runner(node_id, Arc::new(SystemRunner))
    }

    pub fn with_runner(node_id: String, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            node_id,
            initiator: Initiator::new(runner.clone()),
            runner,
            by_path_root: PathBuf::from(DEFAULT_BY_PATH_ROOT),
            sysfs_block_root: PathBuf::from(DEFAULT_SYSFS_BLOCK_ROOT),
            device_timeout: DEVICE_WAIT_TIMEOUT,
        }
    }

    /// Override where by-path device nodes and sysfs block entries live.
    pub fn with_device_roots(
        mut self,
        by_path_root: impl Into<PathBuf>,
        sysfs_block_root: impl Into<PathBuf>,
    ) -> Self {
        self.by_path_root = by_path_root.into();
        self.sysfs_block_root = sysfs_block_root.into();
        self
    }

    pub fn with_device_timeout(mut self, timeout: Duration) -> Self {
        self.device_timeout = timeout;
        self
    }

    /// Delay between retries of a busy iscsiadm node database.
    pub fn with_iscsiadm_backoff(mut self, backoff: Duration) -> Self {
        self.initiator = self.initiator.with_backoff(backoff);
        self
    }

    fn decode_context(
        map: &std::collections::HashMap<String, String>,
    ) -> Result<VolumeContext, Status> {
        VolumeContext::decode(map).map_err(|e| {
            warn!(error = %e, "Invalid volume context");
            Status::invalid_argument(format!("Invalid volume context received: {}", e))
        })
    }

    /// Make sure a session to `ctx.target` is up and its device exists.
    ///
    /// Nothing is done when the device node is already present. Partial
    /// progress is undone on failure.
    async fn attach(&self, ctx: &IscsiContext, device: &Path) -> Result<(), Status> {
        if tokio::fs::try_exists(device).await.unwrap_or(false) {
            debug!(device = %device.display(), "iSCSI device already present");
            return Ok(());
        }

        let target = ctx.target.as_str();

        if let Err(e) = self.initiator.add_node(ctx).await {
            self.rollback(target, false).await;
            return Err(Status::unavailable(format!(
                "failed adding iscsi node: {}",
                e.message()
            )));
        }

        if let Err(e) = self.initiator.login(target).await {
            self.rollback(target, false).await;
            return Err(Status::unavailable(format!(
                "failed logging into iscsi target: {}",
                e.message()
            )));
        }

        if !iscsi::wait_for_device(device, self.device_timeout, DEVICE_POLL_INTERVAL).await {
            self.rollback(target, true).await;
            error!(device = %device.display(), "Timed out waiting for iSCSI device");
            return Err(Status::unavailable(format!(
                "waiting for device at {} timed out",
                device.display()
            )));
        }

        info!(target = %target, device = %device.display(), "iSCSI session established");
        Ok(())
    }

    async fn rollback(&self, target: &str, logged_in: bool) {
        if logged_in && let Err(e) = self.initiator.logout(target).await {
            warn!(target = %target, error = %e.message(), "Rollback: logout failed");
        }
        if let Err(e) = self.initiator.delete_node(target).await {
            warn!(target = %target, error = %e.message(), "Rollback: deleting node record failed");
        }
    }

    async fn stage_iscsi(
        &self,
        ctx: &IscsiContext,
        staging: &Path,
        capability: &csi::VolumeCapability,
    ) -> Result<(), Status> {
        platform::validate_target_name(&ctx.target)?;

        let fs_type = match &capability.access_type {
            Some(AccessType::Mount(mount)) => Some(platform::normalize_fs_type(&mount.fs_type)?),
            _ => None,
        };

        let device = by_path_device(&self.by_path_root, &ctx.portal, &ctx.target);
        let marker = staging.join(ISCSI_MARKER);

        if tokio::fs::try_exists(&marker).await.unwrap_or(false) {
            debug!(marker = %marker.display(), "iSCSI session already recorded");
        } else {
            self.attach(ctx, &device).await?;
            write_marker(&marker, &ctx.target)?;
        }

        let link = staging.join(DEVICE_LINK);
        remove_if_exists(&link)
            .and_then(|_| std::os::unix::fs::symlink(&device, &link))
            .map_err(|e| {
                error!(error = %e, link = %link.display(), "Failed to link staged device");
                Status::unavailable(format!("Error creating symlink: {}", e))
            })?;

        if let Some(fs_type) = fs_type {
            let link = path_str(&link)?;
            platform::ensure_filesystem(self.runner.as_ref(), link, fs_type).await?;
        }

        Ok(())
    }

    async fn publish_nfs(
        &self,
        nfs: &NfsContext,
        target_path: &str,
        capability: &csi::VolumeCapability,
        readonly: bool,
    ) -> Result<(), Status> {
        let Some(AccessType::Mount(mount)) = &capability.access_type else {
            return Err(Status::failed_precondition(
                "NFS volumes can only be published with a mount capability",
            ));
        };

        platform::make_dir(target_path)?;
        platform::mount(
            self.runner.as_ref(),
            &nfs.address,
            target_path,
            &mount_options(mount, readonly),
        )
        .await
    }

    async fn publish_iscsi(
        &self,
        staging_path: &str,
        target_path: &str,
        capability: &csi::VolumeCapability,
        readonly: bool,
    ) -> Result<(), Status> {
        if staging_path.is_empty() || !Path::new(staging_path).is_dir() {
            return Err(Status::failed_precondition(
                "Staging target path does not exist or is not a directory",
            ));
        }
        platform::validate_path(staging_path)?;

        let link = Path::new(staging_path).join(DEVICE_LINK);

        match &capability.access_type {
            Some(AccessType::Block(_)) => {
                let device = std::fs::read_link(&link).map_err(|e| {
                    error!(error = %e, link = %link.display(), "Cannot read staged device link");
                    Status::unavailable(format!("Error reading staged device link: {}", e))
                })?;
                std::os::unix::fs::symlink(&device, target_path).map_err(|e| {
                    error!(error = %e, target_path = %target_path, "Failed to link block device");
                    Status::unavailable(format!("Failed creating symlink at target path: {}", e))
                })
            }
            Some(AccessType::Mount(mount)) => {
                platform::make_dir(target_path)?;
                platform::mount(
                    self.runner.as_ref(),
                    path_str(&link)?,
                    target_path,
                    &mount_options(mount, readonly),
                )
                .await
            }
            None => Err(Status::unimplemented("Volume capability has no access type")),
        }
    }
}

fn mount_options(mount: &csi::volume_capability::MountVolume, readonly: bool) -> Vec<String> {
    let mut options = mount.mount_flags.clone();
    if readonly {
        options.push("ro".to_string());
    }
    options
}

fn path_str(path: &Path) -> Result<&str, Status> {
    path.to_str()
        .ok_or_else(|| Status::invalid_argument(format!("Path is not UTF-8: {}", path.display())))
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn write_marker(marker: &Path, target: &str) -> Result<(), Status> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o640)
        .open(marker)
        .and_then(|mut f| f.write_all(target.as_bytes()))
        .map_err(|e| {
            error!(error = %e, marker = %marker.display(), "Failed to record iSCSI session");
            Status::unavailable(format!("Error writing {}: {}", marker.display(), e))
        })
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    /// Log in to the iSCSI target and format the device on first use.
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_stage_volume");
        let req = request.into_inner();

        let result = async {
            if req.volume_id.is_empty() {
                return Err(Status::invalid_argument("Volume ID is required"));
            }
            if req.staging_target_path.is_empty() {
                return Err(Status::invalid_argument("Staging target path is required"));
            }
            platform::validate_path(&req.staging_target_path)?;
            let capability = req
                .volume_capability
                .as_ref()
                .ok_or_else(|| Status::invalid_argument("Volume capability is required"))?;

            info!(
                volume_id = %req.volume_id,
                staging_target_path = %req.staging_target_path,
                "NodeStageVolume request"
            );

            let context = Self::decode_context(&req.volume_context)?;
            if let Some(iscsi) = &context.iscsi {
                self.stage_iscsi(iscsi, Path::new(&req.staging_target_path), capability)
                    .await?;
            }

            info!(volume_id = %req.volume_id, "Volume staged successfully");
            Ok(Response::new(csi::NodeStageVolumeResponse {}))
        }
        .await;

        timer.finish(&result);
        result
    }

    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_unstage_volume");
        let req = request.into_inner();

        let result = async {
            if req.volume_id.is_empty() {
                return Err(Status::invalid_argument("Volume ID is required"));
            }
            if req.staging_target_path.is_empty() {
                return Err(Status::invalid_argument("Staging target path is required"));
            }
            platform::validate_path(&req.staging_target_path)?;

            info!(
                volume_id = %req.volume_id,
                staging_target_path = %req.staging_target_path,
                "NodeUnstageVolume request"
            );

            let staging = Path::new(&req.staging_target_path);
            let marker = staging.join(ISCSI_MARKER);

            let target = match tokio::fs::read_to_string(&marker).await {
                Ok(target) => target.trim().to_string(),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(volume_id = %req.volume_id, "No iSCSI session recorded");
                    return Ok(Response::new(csi::NodeUnstageVolumeResponse {}));
                }
                Err(e) => {
                    error!(error = %e, marker = %marker.display(), "Failed to read iSCSI marker");
                    return Err(Status::unavailable(format!(
                        "Error reading {}: {}",
                        marker.display(),
                        e
                    )));
                }
            };
            platform::validate_target_name(&target)?;

            self.initiator.logout(&target).await?;
            self.initiator.delete_node(&target).await?;

            for file in [staging.join(DEVICE_LINK), marker] {
                remove_if_exists(&file).map_err(|e| {
                    error!(error = %e, path = %file.display(), "Failed to remove staging file");
                    Status::unavailable(format!("Error removing {}: {}", file.display(), e))
                })?;
            }

            info!(volume_id = %req.volume_id, target = %target, "Volume unstaged successfully");
            Ok(Response::new(csi::NodeUnstageVolumeResponse {}))
        }
        .await;

        timer.finish(&result);
        result
    }

    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_publish_volume");
        let req = request.into_inner();

        let result = async {
            if req.volume_id.is_empty() {
                return Err(Status::invalid_argument("Volume ID is required"));
            }
            if req.target_path.is_empty() {
                return Err(Status::invalid_argument("Target path is required"));
            }
            platform::validate_path(&req.target_path)?;
            let capability = req
                .volume_capability
                .as_ref()
                .ok_or_else(|| Status::invalid_argument("Volume capability is required"))?;

            info!(
                volume_id = %req.volume_id,
                target_path = %req.target_path,
                readonly = req.readonly,
                "NodePublishVolume request"
            );

            if std::fs::symlink_metadata(&req.target_path).is_ok() {
                info!(target_path = %req.target_path, "Volume already published");
                return Ok(Response::new(csi::NodePublishVolumeResponse {}));
            }

            let context = Self::decode_context(&req.volume_context)?;
            match (&context.nfs, &context.iscsi) {
                (Some(nfs), _) => {
                    self.publish_nfs(nfs, &req.target_path, capability, req.readonly)
                        .await?
                }
                (None, Some(_)) => {
                    self.publish_iscsi(
                        &req.staging_target_path,
                        &req.target_path,
                        capability,
                        req.readonly,
                    )
                    .await?
                }
                (None, None) => {
                    return Err(Status::invalid_argument(
                        "Volume context names neither NFS nor iSCSI",
                    ));
                }
            }

            info!(volume_id = %req.volume_id, target_path = %req.target_path, "Volume published successfully");
            Ok(Response::new(csi::NodePublishVolumeResponse {}))
        }
        .await;

        timer.finish(&result);
        result
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_unpublish_volume");
        let req = request.into_inner();

        let result = async {
            if req.volume_id.is_empty() {
                return Err(Status::invalid_argument("Volume ID is required"));
            }
            if req.target_path.is_empty() {
                return Err(Status::invalid_argument("Target path is required"));
            }
            platform::validate_path(&req.target_path)?;

            info!(
                volume_id = %req.volume_id,
                target_path = %req.target_path,
                "NodeUnpublishVolume request"
            );

            let target = Path::new(&req.target_path);
            let meta = match std::fs::symlink_metadata(target) {
                Ok(meta) => meta,
                Err(_) => {
                    debug!(target_path = %req.target_path, "Target path absent");
                    return Ok(Response::new(csi::NodeUnpublishVolumeResponse {}));
                }
            };

            let removed = if meta.is_dir() {
                if platform::is_mount_point(target).unwrap_or(false) {
                    platform::umount(self.runner.as_ref(), &req.target_path).await?;
                }
                std::fs::remove_dir(target)
            } else {
                std::fs::remove_file(target)
            };
            removed.map_err(|e| {
                error!(error = %e, target_path = %req.target_path, "Failed to remove target path");
                Status::unavailable(format!("Error removing target path: {}", e))
            })?;

            info!(volume_id = %req.volume_id, "Volume unpublished successfully");
            Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
        }
        .await;

        timer.finish(&result);
        result
    }

    /// Get information about this node.
    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        info!(node_id = %self.node_id, "NodeGetInfo request");

        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: 0, // No limit
            accessible_topology: None,
        }))
    }

    /// Report node capabilities.
    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        let capabilities = vec![
            csi::NodeServiceCapability {
                r#type: Some(csi::node_service_capability::Type::Rpc(
                    csi::node_service_capability::Rpc {
                        r#type: csi::node_service_capability::rpc::Type::StageUnstageVolume as i32,
                    },
                )),
            },
            csi::NodeServiceCapability {
                r#type: Some(csi::node_service_capability::Type::Rpc(
                    csi::node_service_capability::Rpc {
                        r#type: csi::node_service_capability::rpc::Type::ExpandVolume as i32,
                    },
                )),
            },
        ];

        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities,
        }))
    }

    /// Rescan the block device and grow a mounted filesystem online.
    async fn node_expand_volume(
        &self,
        request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_expand_volume");
        let req = request.into_inner();

        let result = async {
            if req.volume_id.is_empty() {
                return Err(Status::invalid_argument("Volume ID is required"));
            }
            if req.staging_target_path.is_empty() {
                return Err(Status::invalid_argument("Staging target path is required"));
            }
            platform::validate_path(&req.staging_target_path)?;

            info!(
                volume_id = %req.volume_id,
                volume_path = %req.volume_path,
                "NodeExpandVolume request"
            );

            let link = Path::new(&req.staging_target_path).join(DEVICE_LINK);
            let device = std::fs::canonicalize(&link).map_err(|e| {
                warn!(error = %e, link = %link.display(), "Staged device not accessible");
                Status::not_found(format!("Device unaccessible at {}", link.display()))
            })?;
            let device = path_str(&device)?.to_string();

            let block = device
                .strip_prefix("/dev/")
                .ok_or_else(|| Status::invalid_argument(format!("Invalid device read: {}", device)))?;

            platform::rescan_device(&self.sysfs_block_root, block)?;

            if !req.volume_path.is_empty() {
                platform::validate_path(&req.volume_path)?;
                if platform::is_mount_point(Path::new(&req.volume_path)).unwrap_or(false) {
                    let kind = platform::filesystem_kind(&req.volume_path)?;
                    platform::grow_filesystem(self.runner.as_ref(), kind, &device, &req.volume_path)
                        .await?;
                }
            }

            let capacity_bytes = platform::device_size_bytes(&self.sysfs_block_root, block);
            info!(volume_id = %req.volume_id, device = %device, capacity_bytes, "Volume expanded");

            Ok(Response::new(csi::NodeExpandVolumeResponse { capacity_bytes }))
        }
        .await;

        timer.finish(&result);
        result
    }

    async fn node_get_volume_stats(
        &self,
        _request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        Err(Status::unimplemented("NodeGetVolumeStats is not supported"))
    }
}
