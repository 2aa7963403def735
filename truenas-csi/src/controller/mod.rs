//! CSI Controller Service Implementation
//!
//! Provisions volumes on the NAS selected by the request parameters. A
//! volume is a dataset named after the hash of the CO-supplied name, plus
//! either an NFS share (filesystem datasets) or an iSCSI extent, target
//! and CHAP credential (zvols). Nothing is stored locally: retries find
//! earlier work again through deterministic names and comment tags.

mod dataset;
mod iscsi;
mod nfs;
mod saga;

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};
use truenas_api::NasApi;
use truenas_api::models::{Dataset, DatasetKind, DatasetUpdate};

pub use dataset::{Capacity, Classification, DEFAULT_VOLUME_SIZE, classify};
use saga::Rollback;

use crate::config::{Backend, Configuration, DeletePolicy, IscsiSettings, NfsSettings, Resolver};
use crate::csi;
use crate::error::NasResultExt;
use crate::metrics::OperationTimer;
use crate::naming::{VolumeId, hashed_name};
use crate::volume_context::VolumeContext;

/// How a new volume is exported.
#[derive(Debug, Clone, Copy)]
enum Export<'a> {
    Iscsi(&'a IscsiSettings),
    Nfs(&'a NfsSettings),
}

impl Export<'_> {
    /// Prefer an iSCSI zvol when the capabilities allow one.
    fn select<'a>(class: Classification, config: &'a Configuration) -> Result<Export<'a>, Status> {
        if class.volume
            && let Some(iscsi) = &config.iscsi
        {
            return Ok(Export::Iscsi(iscsi));
        }
        if class.filesystem
            && let Some(nfs) = &config.nfs
        {
            return Ok(Export::Nfs(nfs));
        }
        Err(Status::unavailable(format!(
            "Configuration {} cannot serve the requested capabilities",
            config.name
        )))
    }

    fn kind(&self) -> DatasetKind {
        match self {
            Export::Iscsi(_) => DatasetKind::Volume,
            Export::Nfs(_) => DatasetKind::Filesystem,
        }
    }
}

/// CSI Controller Service
pub struct ControllerService {
    resolver: Arc<Resolver>,
}

impl ControllerService {
    pub fn new(resolver: Resolver) -> Self {
        Self {
            resolver: Arc::new(resolver),
        }
    }

    /// Resolve a volume id to its backend and dataset. Anything that does
    /// not lead to an existing dataset is NotFound.
    async fn find_volume(&self, volume_id: &str) -> Result<(VolumeId, &Backend, Dataset), Status> {
        let id: VolumeId = volume_id
            .parse()
            .map_err(|e| Status::not_found(format!("{}", e)))?;
        let backend = self
            .resolver
            .backend(id.backend())
            .ok_or_else(|| Status::not_found(format!("Unknown backend {}", id.backend())))?;
        let dataset = backend
            .client
            .get_dataset(id.dataset())
            .await
            .or_unavailable("lookup dataset")?
            .ok_or_else(|| Status::not_found(format!("Volume {} does not exist", volume_id)))?;
        Ok((id, backend, dataset))
    }

    async fn create(&self, req: &csi::CreateVolumeRequest) -> Result<csi::Volume, Status> {
        let name = &req.name;
        if name.is_empty() {
            return Err(Status::invalid_argument("Volume name is required"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument("Volume capabilities are required"));
        }

        info!(name = %name, "CreateVolume request");

        let class = classify(&req.volume_capabilities)?;
        let (backend_name, config_name, found) = self.resolver.lookup_parameters(&req.parameters);
        let (backend, config) = found.ok_or_else(|| {
            Status::unavailable(format!(
                "No configuration {} on backend {}",
                config_name, backend_name
            ))
        })?;
        let capacity = Capacity::for_create(req.capacity_range.as_ref())?;
        let export = Export::select(class, config)?;

        let hash = hashed_name(name);
        let dataset = format!("{}/{}", config.dataset, hash);

        debug!(
            name = %name,
            backend = %backend.name,
            config = %config.name,
            dataset = %dataset,
            kind = %export.kind(),
            size_bytes = capacity.effective(),
            "Provisioning volume"
        );

        let client = backend.client.as_ref();
        let mut rollback = Rollback::new();
        let provisioned = self
            .provision(client, config, export, name, &hash, &dataset, capacity, &mut rollback)
            .await;

        let context = match provisioned {
            Ok(context) => context,
            Err(status) => {
                error!(name = %name, error = %status.message(), "Volume provisioning failed");
                rollback.run(client).await;
                return Err(status);
            }
        };

        let volume_context = context
            .encode()
            .map_err(|e| Status::internal(format!("Failed to encode volume context: {}", e)))?;
        let volume_id = VolumeId::new(&backend.name, &dataset).to_string();

        info!(volume_id = %volume_id, name = %name, "Volume created successfully");

        Ok(csi::Volume {
            capacity_bytes: capacity.effective(),
            volume_id,
            volume_context,
            content_source: None,
            accessible_topology: vec![],
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn provision(
        &self,
        client: &dyn NasApi,
        config: &Configuration,
        export: Export<'_>,
        name: &str,
        hash: &str,
        dataset: &str,
        capacity: Capacity,
        rollback: &mut Rollback,
    ) -> Result<VolumeContext, Status> {
        let created = dataset::ensure_dataset(
            client,
            config,
            name,
            dataset,
            export.kind(),
            capacity,
            rollback,
        )
        .await?;

        match export {
            Export::Nfs(settings) => {
                if created {
                    dataset::make_world_writable(client, dataset).await?;
                }
                nfs::ensure_share(client, settings, name, dataset, rollback).await
            }
            Export::Iscsi(settings) => {
                iscsi::ensure_export(client, settings, name, hash, dataset, rollback).await
            }
        }
    }

    async fn delete(&self, volume_id: &str) -> Result<(), Status> {
        if volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }

        info!(volume_id = %volume_id, "DeleteVolume request");

        let id: VolumeId = match volume_id.parse() {
            Ok(id) => id,
            Err(e) => {
                warn!(volume_id = %volume_id, error = %e, "Malformed volume ID, nothing to delete");
                return Ok(());
            }
        };
        let Some(backend) = self.resolver.backend(id.backend()) else {
            warn!(volume_id = %volume_id, "Unknown backend, nothing to delete");
            return Ok(());
        };
        let client = backend.client.as_ref();

        let Some(dataset) = client
            .get_dataset(id.dataset())
            .await
            .or_unavailable("lookup dataset")?
        else {
            warn!(volume_id = %volume_id, "Dataset not found, treating as already deleted");
            return Ok(());
        };

        let root = id.dataset_root().unwrap_or_default();
        let policy = self.resolver.delete_policy(id.backend(), root).ok_or_else(|| {
            error!(volume_id = %volume_id, root = %root, "No configuration owns dataset root");
            Status::internal(format!("No delete policy for dataset root {}", root))
        })?;

        match dataset.kind {
            DatasetKind::Filesystem => nfs::remove_shares(client, &dataset.comments).await?,
            DatasetKind::Volume => {
                let hash = id.dataset().rsplit('/').next().unwrap_or_default();
                iscsi::remove_export(client, hash, &dataset.comments).await?;
            }
        }

        match policy {
            DeletePolicy::Delete => {
                client
                    .delete_dataset(id.dataset(), true)
                    .await
                    .ignore_not_found("delete dataset")?;
                info!(volume_id = %volume_id, "Volume deleted successfully");
            }
            DeletePolicy::Retain => {
                info!(volume_id = %volume_id, "Volume unexported, dataset retained");
            }
        }

        Ok(())
    }

    async fn validate(
        &self,
        req: csi::ValidateVolumeCapabilitiesRequest,
    ) -> Result<csi::ValidateVolumeCapabilitiesResponse, Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument("Volume capabilities are required"));
        }

        info!(volume_id = %req.volume_id, "ValidateVolumeCapabilities request");

        let (_, _, dataset) = self.find_volume(&req.volume_id).await?;

        let mut unsupported: Vec<String> = Vec::new();
        for capability in &req.volume_capabilities {
            match &capability.access_type {
                Some(csi::volume_capability::AccessType::Block(_)) => {
                    if dataset.kind != DatasetKind::Volume {
                        unsupported.push("Block access requires a zvol-backed volume".to_string());
                    }
                }
                Some(csi::volume_capability::AccessType::Mount(_)) => {
                    if dataset.kind == DatasetKind::Volume && dataset::is_shared_mount(capability) {
                        unsupported.push(
                            "Multi-node mount is not supported on a zvol-backed volume".to_string(),
                        );
                    }
                }
                None => {
                    unsupported.push("Volume capability must specify access type".to_string());
                }
            }
        }

        if !unsupported.is_empty() {
            let message = unsupported.join("; ");
            warn!(volume_id = %req.volume_id, message = %message, "Volume capabilities not supported");
            return Ok(csi::ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message,
            });
        }

        Ok(csi::ValidateVolumeCapabilitiesResponse {
            confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                volume_context: req.volume_context,
                volume_capabilities: req.volume_capabilities,
                parameters: req.parameters,
            }),
            message: String::new(),
        })
    }

    async fn expand(
        &self,
        req: &csi::ControllerExpandVolumeRequest,
    ) -> Result<csi::ControllerExpandVolumeResponse, Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        let range = req.capacity_range.as_ref().ok_or_else(|| {
            Status::invalid_argument("Capacity range is required for volume expansion")
        })?;
        let capacity = Capacity::parse(range)?.ok_or_else(|| {
            Status::invalid_argument("Required or limit bytes must be positive")
        })?;

        info!(
            volume_id = %req.volume_id,
            new_size_bytes = capacity.effective(),
            "ControllerExpandVolume request"
        );

        let (id, backend, dataset) = self.find_volume(&req.volume_id).await?;
        let client = backend.client.as_ref();

        let response = match dataset.kind {
            DatasetKind::Volume => {
                let update = DatasetUpdate {
                    volsize: Some(capacity.effective()),
                    ..Default::default()
                };
                client
                    .update_dataset(id.dataset(), &update)
                    .await
                    .or_unavailable("update dataset")?;
                csi::ControllerExpandVolumeResponse {
                    capacity_bytes: capacity.effective(),
                    node_expansion_required: true,
                }
            }
            DatasetKind::Filesystem => {
                let sparse = self
                    .resolver
                    .sparse(id.backend(), id.dataset_root().unwrap_or_default())
                    .unwrap_or(false);
                let update = DatasetUpdate {
                    volsize: None,
                    refquota: Some(capacity.refquota()),
                    refreservation: (!sparse).then(|| capacity.refreservation()),
                };
                client
                    .update_dataset(id.dataset(), &update)
                    .await
                    .or_unavailable("update dataset")?;
                csi::ControllerExpandVolumeResponse {
                    capacity_bytes: capacity.refquota(),
                    node_expansion_required: false,
                }
            }
        };

        info!(
            volume_id = %req.volume_id,
            capacity_bytes = response.capacity_bytes,
            node_expansion_required = response.node_expansion_required,
            "Volume expanded successfully"
        );
        Ok(response)
    }
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    /// Create a new volume.
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let timer = OperationTimer::new("create_volume");
        let req = request.into_inner();

        let result = self.create(&req).await.map(|volume| {
            Response::new(csi::CreateVolumeResponse {
                volume: Some(volume),
            })
        });

        timer.finish(&result);
        result
    }

    /// Delete a volume.
    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let timer = OperationTimer::new("delete_volume");
        let req = request.into_inner();

        let result = self
            .delete(&req.volume_id)
            .await
            .map(|()| Response::new(csi::DeleteVolumeResponse {}));

        timer.finish(&result);
        result
    }

    async fn controller_publish_volume(
        &self,
        _request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "ControllerPublishVolume is not supported",
        ))
    }

    async fn controller_unpublish_volume(
        &self,
        _request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "ControllerUnpublishVolume is not supported",
        ))
    }

    /// Check that an existing volume can serve the given capabilities.
    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let timer = OperationTimer::new("validate_volume_capabilities");
        let req = request.into_inner();

        let result = self.validate(req).await.map(Response::new);

        timer.finish(&result);
        result
    }

    async fn list_volumes(
        &self,
        _request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        Err(Status::unimplemented("ListVolumes is not supported"))
    }

    async fn get_capacity(
        &self,
        _request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        Err(Status::unimplemented("GetCapacity is not supported"))
    }

    /// Report controller capabilities.
    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        use csi::controller_service_capability::rpc::Type;

        let capabilities = [
            Type::CreateDeleteVolume,
            Type::ExpandVolume,
            Type::SingleNodeMultiWriter,
        ]
        .into_iter()
        .map(|t| csi::ControllerServiceCapability {
            r#type: Some(csi::controller_service_capability::Type::Rpc(
                csi::controller_service_capability::Rpc { r#type: t as i32 },
            )),
        })
        .collect();

        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn create_snapshot(
        &self,
        _request: Request<csi::CreateSnapshotRequest>,
    ) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
        Err(Status::unimplemented("CreateSnapshot is not supported"))
    }

    async fn delete_snapshot(
        &self,
        _request: Request<csi::DeleteSnapshotRequest>,
    ) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
        Err(Status::unimplemented("DeleteSnapshot is not supported"))
    }

    async fn list_snapshots(
        &self,
        _request: Request<csi::ListSnapshotsRequest>,
    ) -> Result<Response<csi::ListSnapshotsResponse>, Status> {
        Err(Status::unimplemented("ListSnapshots is not supported"))
    }

    /// Expand a volume.
    async fn controller_expand_volume(
        &self,
        request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        let timer = OperationTimer::new("expand_volume");
        let req = request.into_inner();

        let result = self.expand(&req).await.map(Response::new);

        timer.finish(&result);
        result
    }

    async fn controller_get_volume(
        &self,
        _request: Request<csi::ControllerGetVolumeRequest>,
    ) -> Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerGetVolume is not supported"))
    }
}
