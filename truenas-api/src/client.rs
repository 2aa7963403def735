use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    AuthFilter, Dataset, DatasetCreate, DatasetUpdate, IscsiAuth, IscsiAuthCreate,
    IscsiAuthUpdate, IscsiExtent, IscsiExtentCreate, IscsiGlobal, IscsiTarget, IscsiTargetCreate,
    NfsShare, NfsShareCreate, PermissionUpdate, TargetExtent, TargetExtentCreate,
};

/// Operations the driver needs from the NAS.
///
/// Lookups return every object matching the filter; callers decide whether
/// more than one match is an error. Create calls return the new object's id.
/// A refusal by the NAS surfaces as [`crate::NasError::Status`].
#[async_trait]
pub trait NasApi: Send + Sync {
    /// Fetch a dataset by its full name. `None` if it does not exist.
    async fn get_dataset(&self, id: &str) -> Result<Option<Dataset>>;

    async fn create_dataset(&self, create: &DatasetCreate) -> Result<()>;

    async fn update_dataset(&self, id: &str, update: &DatasetUpdate) -> Result<()>;

    async fn delete_dataset(&self, id: &str, recursive: bool) -> Result<()>;

    async fn set_dataset_permission(&self, id: &str, permission: &PermissionUpdate) -> Result<()>;

    async fn find_nfs_shares(&self, comment: &str) -> Result<Vec<NfsShare>>;

    async fn create_nfs_share(&self, create: &NfsShareCreate) -> Result<i64>;

    async fn delete_nfs_share(&self, id: i64) -> Result<()>;

    async fn find_iscsi_extents(&self, comment: &str) -> Result<Vec<IscsiExtent>>;

    async fn create_iscsi_extent(&self, create: &IscsiExtentCreate) -> Result<i64>;

    async fn delete_iscsi_extent(&self, id: i64) -> Result<()>;

    async fn find_iscsi_targets(&self, name: &str) -> Result<Vec<IscsiTarget>>;

    async fn create_iscsi_target(&self, create: &IscsiTargetCreate) -> Result<i64>;

    async fn delete_iscsi_target(&self, id: i64) -> Result<()>;

    async fn find_iscsi_auths(&self, filter: &AuthFilter) -> Result<Vec<IscsiAuth>>;

    async fn create_iscsi_auth(&self, create: &IscsiAuthCreate) -> Result<i64>;

    async fn update_iscsi_auth(&self, id: i64, update: &IscsiAuthUpdate) -> Result<()>;

    async fn delete_iscsi_auth(&self, id: i64) -> Result<()>;

    async fn find_target_extents(&self, target: i64, extent: i64) -> Result<Vec<TargetExtent>>;

    async fn create_target_extent(&self, create: &TargetExtentCreate) -> Result<i64>;

    async fn delete_target_extent(&self, id: i64) -> Result<()>;

    async fn iscsi_global(&self) -> Result<IscsiGlobal>;
}
