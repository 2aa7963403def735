//! Dataset sizing and idempotent dataset creation.

use tonic::Status;
use tracing::{debug, info, warn};
use truenas_api::NasApi;
use truenas_api::models::{DatasetCreate, DatasetKind, PermissionUpdate};

use super::saga::{Created, Rollback};
use crate::config::Configuration;
use crate::csi;
use crate::error::NasResultExt;

/// Default volume size: 1GiB
pub const DEFAULT_VOLUME_SIZE: i64 = 1024 * 1024 * 1024;

/// What the requested capabilities allow the volume to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// A zvol exported over iSCSI can serve every capability
    pub volume: bool,
    /// An NFS filesystem can serve every capability
    pub filesystem: bool,
}

fn is_multi_node(mode: Option<&csi::volume_capability::AccessMode>) -> bool {
    use csi::volume_capability::access_mode::Mode;

    matches!(
        mode.and_then(|m| Mode::try_from(m.mode).ok()),
        Some(Mode::MultiNodeReaderOnly | Mode::MultiNodeSingleWriter | Mode::MultiNodeMultiWriter)
    )
}

/// True when `capability` mounts a filesystem from more than one node.
pub fn is_shared_mount(capability: &csi::VolumeCapability) -> bool {
    matches!(
        capability.access_type,
        Some(csi::volume_capability::AccessType::Mount(_))
    ) && is_multi_node(capability.access_mode.as_ref())
}

/// Work out which dataset kinds can satisfy all `capabilities`.
///
/// Block access rules out a filesystem; a mount shared between nodes rules
/// out a zvol, since a local filesystem on a LUN cannot be mounted twice.
pub fn classify(capabilities: &[csi::VolumeCapability]) -> Result<Classification, Status> {
    let mut class = Classification {
        volume: true,
        filesystem: true,
    };

    for capability in capabilities {
        match &capability.access_type {
            Some(csi::volume_capability::AccessType::Block(_)) => class.filesystem = false,
            Some(csi::volume_capability::AccessType::Mount(_)) => {
                if is_multi_node(capability.access_mode.as_ref()) {
                    class.volume = false;
                }
            }
            None => {
                return Err(Status::unimplemented(
                    "Volume capability must specify block or mount access",
                ));
            }
        }
    }

    if !class.volume && !class.filesystem {
        return Err(Status::invalid_argument(
            "Block access cannot be combined with a multi-node mount",
        ));
    }

    Ok(class)
}

/// Requested size in bytes. Zero means "not specified".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub required: i64,
    pub limit: i64,
}

impl Capacity {
    pub const DEFAULT: Capacity = Capacity {
        required: DEFAULT_VOLUME_SIZE,
        limit: DEFAULT_VOLUME_SIZE,
    };

    /// Validate a range. `None` when neither bound is set.
    pub fn parse(range: &csi::CapacityRange) -> Result<Option<Self>, Status> {
        let (required, limit) = (range.required_bytes, range.limit_bytes);

        if required < 0 || limit < 0 {
            return Err(Status::invalid_argument("Capacity must not be negative"));
        }
        if required > 0 && limit > 0 && limit < required {
            return Err(Status::invalid_argument(format!(
                "Capacity limit {} is below required {}",
                limit, required
            )));
        }
        if required == 0 && limit == 0 {
            return Ok(None);
        }

        Ok(Some(Self { required, limit }))
    }

    /// Capacity for CreateVolume, defaulting to 1GiB.
    pub fn for_create(range: Option<&csi::CapacityRange>) -> Result<Self, Status> {
        match range {
            Some(range) => Ok(Self::parse(range)?.unwrap_or(Self::DEFAULT)),
            None => Ok(Self::DEFAULT),
        }
    }

    /// Size a zvol gets: the limit when set, else the required bytes.
    pub fn effective(&self) -> i64 {
        if self.limit > 0 {
            self.limit
        } else {
            self.required
        }
    }

    pub fn refquota(&self) -> i64 {
        self.effective()
    }

    pub fn refreservation(&self) -> i64 {
        if self.required > 0 {
            self.required
        } else {
            self.limit
        }
    }
}

/// Make sure the dataset `dataset` exists with the requested kind and size.
///
/// A refused create is treated as a possible retry: the existing dataset is
/// accepted only if it carries `name` as its comment and has the same size.
/// Returns true when this call created the dataset.
pub async fn ensure_dataset(
    client: &dyn NasApi,
    config: &Configuration,
    name: &str,
    dataset: &str,
    kind: DatasetKind,
    capacity: Capacity,
    rollback: &mut Rollback,
) -> Result<bool, Status> {
    let create = match kind {
        DatasetKind::Volume => {
            let mut create = DatasetCreate::volume(dataset, name, capacity.effective());
            create.sparse = Some(config.sparse);
            create.volblocksize = config.iscsi.as_ref().and_then(|i| i.volblocksize.clone());
            create
        }
        DatasetKind::Filesystem => {
            let mut create = DatasetCreate::filesystem(dataset, name);
            create.refquota = Some(capacity.refquota()).filter(|q| *q > 0);
            if !config.sparse {
                create.refreservation = Some(capacity.refreservation());
            }
            create
        }
    };

    debug!(dataset = %dataset, kind = %kind, size = capacity.effective(), "Creating dataset");

    match client.create_dataset(&create).await {
        Ok(()) => {
            rollback.push(Created::Dataset(dataset.to_string()));
            info!(dataset = %dataset, kind = %kind, "Dataset created");
            Ok(true)
        }
        Err(e) if e.is_rejected() => {
            debug!(dataset = %dataset, error = %e, "Dataset create refused, checking existing dataset");
            verify_existing(client, name, dataset, kind, capacity).await?;
            Ok(false)
        }
        Err(e) => Err(crate::error::nas_unavailable("create dataset", &e)),
    }
}

async fn verify_existing(
    client: &dyn NasApi,
    name: &str,
    dataset: &str,
    kind: DatasetKind,
    capacity: Capacity,
) -> Result<(), Status> {
    let existing = client
        .get_dataset(dataset)
        .await
        .or_unavailable("lookup dataset")?
        .ok_or_else(|| Status::unavailable(format!("Dataset {} could not be created", dataset)))?;

    if existing.comments != name {
        warn!(
            dataset = %dataset,
            comments = %existing.comments,
            name = %name,
            "Dataset belongs to another volume"
        );
        return Err(Status::unavailable(format!(
            "Dataset {} exists with a different owner",
            dataset
        )));
    }

    if existing.kind != kind {
        return Err(Status::invalid_argument(format!(
            "Dataset {} is a {}, volume capabilities may have changed",
            dataset, existing.kind
        )));
    }

    let size = match kind {
        DatasetKind::Volume => existing.volsize,
        DatasetKind::Filesystem => existing.refquota,
    };
    let size = size.ok_or_else(|| {
        Status::invalid_argument(format!(
            "Dataset {} has no size set, volume capabilities may have changed",
            dataset
        ))
    })?;

    if size != capacity.effective() {
        return Err(Status::already_exists(format!(
            "Volume {} exists with size {}, requested {}",
            name,
            size,
            capacity.effective()
        )));
    }

    debug!(dataset = %dataset, "Existing dataset matches request");
    Ok(())
}

/// Open up a freshly created filesystem for any pod user.
pub async fn make_world_writable(client: &dyn NasApi, dataset: &str) -> Result<(), Status> {
    client
        .set_dataset_permission(dataset, &PermissionUpdate::world_writable())
        .await
        .or_unavailable("set dataset permission")
}
