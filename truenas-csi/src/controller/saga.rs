//! Compensation for partially provisioned volumes.
//!
//! Every NAS object created while serving one CreateVolume is recorded here.
//! When a later step fails, the objects are deleted newest first. Failures
//! while compensating are logged and counted, and never replace the error
//! that caused the rollback.

use tracing::{info, warn};
use truenas_api::NasApi;

use crate::metrics;

/// An object created during the current call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Created {
    Dataset(String),
    NfsShare(i64),
    Extent(i64),
    Auth(i64),
    Target(i64),
    TargetExtent(i64),
}

impl Created {
    fn step(&self) -> &'static str {
        match self {
            Created::Dataset(_) => "dataset",
            Created::NfsShare(_) => "nfs_share",
            Created::Extent(_) => "iscsi_extent",
            Created::Auth(_) => "iscsi_auth",
            Created::Target(_) => "iscsi_target",
            Created::TargetExtent(_) => "iscsi_targetextent",
        }
    }

    async fn delete(&self, client: &dyn NasApi) -> truenas_api::Result<()> {
        match self {
            Created::Dataset(id) => client.delete_dataset(id, true).await,
            Created::NfsShare(id) => client.delete_nfs_share(*id).await,
            Created::Extent(id) => client.delete_iscsi_extent(*id).await,
            Created::Auth(id) => client.delete_iscsi_auth(*id).await,
            Created::Target(id) => client.delete_iscsi_target(*id).await,
            Created::TargetExtent(id) => client.delete_target_extent(*id).await,
        }
    }
}

#[derive(Debug, Default)]
pub struct Rollback {
    created: Vec<Created>,
}

impl Rollback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, created: Created) {
        self.created.push(created);
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
    }

    /// Delete everything recorded, newest first.
    pub async fn run(self, client: &dyn NasApi) {
        if self.created.is_empty() {
            return;
        }
        info!(steps = self.created.len(), "Rolling back partially provisioned volume");

        for created in self.created.into_iter().rev() {
            match created.delete(client).await {
                Ok(()) => metrics::record_rollback_step(created.step(), true),
                // Removing a target or extent takes its associations with it
                Err(e) if e.is_not_found() => metrics::record_rollback_step(created.step(), true),
                Err(e) => {
                    warn!(object = ?created, error = %e, "Rollback step failed");
                    metrics::record_rollback_step(created.step(), false);
                }
            }
        }
    }
}
