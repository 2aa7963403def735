//! In-memory NAS used by tests.
//!
//! Behaves like the REST API where the driver cares: creating an existing
//! dataset is refused with 422, deleting a missing object is a 404, and
//! removing a target or extent drops its LUN associations.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::client::NasApi;
use crate::error::{NasError, Result};
use crate::models::{
    AuthFilter, Dataset, DatasetCreate, DatasetKind, DatasetUpdate, IscsiAuth, IscsiAuthCreate,
    IscsiAuthUpdate, IscsiExtent, IscsiExtentCreate, IscsiGlobal, IscsiTarget, IscsiTargetCreate,
    NfsShare, NfsShareCreate, PermissionUpdate, TargetExtent, TargetExtentCreate,
};

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    datasets: BTreeMap<String, Dataset>,
    permissions: BTreeMap<String, PermissionUpdate>,
    nfs_shares: BTreeMap<i64, NfsShareCreate>,
    extents: BTreeMap<i64, IscsiExtentCreate>,
    targets: BTreeMap<i64, IscsiTargetCreate>,
    auths: BTreeMap<i64, IscsiAuth>,
    target_extents: BTreeMap<i64, TargetExtentCreate>,
    basename: Option<String>,
    failures: HashMap<String, u16>,
    calls: Vec<String>,
    dataset_creates: usize,
}

impl State {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    /// Record the call and return the injected failure for it, if any.
    fn enter(&mut self, op: &str) -> Result<()> {
        self.calls.push(op.to_string());
        match self.failures.get(op) {
            Some(&status) => Err(NasError::Status {
                status,
                body: format!("injected failure for {}", op),
            }),
            None => Ok(()),
        }
    }
}

fn not_found(what: &str, id: impl std::fmt::Display) -> NasError {
    NasError::Status {
        status: 404,
        body: format!("{} {} does not exist", what, id),
    }
}

/// A NAS kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryNas {
    state: Mutex<State>,
}

impl MemoryNas {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Report iSCSI base name `basename` from `iscsi_global`.
    pub fn with_basename(self, basename: &str) -> Self {
        self.state().basename = Some(basename.to_string());
        self
    }

    /// Make every call to `op` (a [`NasApi`] method name) fail with `status`.
    pub fn fail_on(&self, op: &str, status: u16) {
        self.state().failures.insert(op.to_string(), status);
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Place a dataset directly, bypassing create accounting.
    pub fn insert_dataset(&self, dataset: Dataset) {
        self.state().datasets.insert(dataset.id.clone(), dataset);
    }

    pub fn dataset(&self, id: &str) -> Option<Dataset> {
        self.state().datasets.get(id).cloned()
    }

    pub fn dataset_count(&self) -> usize {
        self.state().datasets.len()
    }

    /// Number of successful `create_dataset` calls.
    pub fn dataset_creates(&self) -> usize {
        self.state().dataset_creates
    }

    pub fn permission(&self, id: &str) -> Option<PermissionUpdate> {
        self.state().permissions.get(id).cloned()
    }

    /// NFS shares with the full create request that made them.
    pub fn nfs_shares(&self) -> Vec<(i64, NfsShareCreate)> {
        let state = self.state();
        state
            .nfs_shares
            .iter()
            .map(|(id, s)| (*id, s.clone()))
            .collect()
    }

    pub fn extents(&self) -> Vec<(i64, IscsiExtentCreate)> {
        let state = self.state();
        state.extents.iter().map(|(id, e)| (*id, e.clone())).collect()
    }

    pub fn targets(&self) -> Vec<(i64, IscsiTargetCreate)> {
        let state = self.state();
        state.targets.iter().map(|(id, t)| (*id, t.clone())).collect()
    }

    pub fn auths(&self) -> Vec<IscsiAuth> {
        self.state().auths.values().cloned().collect()
    }

    pub fn target_extents(&self) -> Vec<TargetExtent> {
        let state = self.state();
        state
            .target_extents
            .iter()
            .map(|(id, a)| TargetExtent {
                id: *id,
                target: a.target,
                extent: a.extent,
                lunid: Some(a.lunid),
            })
            .collect()
    }

    /// Every call made so far, by method name.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.state().calls.iter().filter(|c| *c == op).count()
    }

    /// True when no share, extent, target, auth or association is left.
    pub fn has_no_exports(&self) -> bool {
        let state = self.state();
        state.nfs_shares.is_empty()
            && state.extents.is_empty()
            && state.targets.is_empty()
            && state.auths.is_empty()
            && state.target_extents.is_empty()
    }
}

#[async_trait]
impl NasApi for MemoryNas {
    async fn get_dataset(&self, id: &str) -> Result<Option<Dataset>> {
        let mut state = self.state();
        state.enter("get_dataset")?;
        Ok(state.datasets.get(id).cloned())
    }

    async fn create_dataset(&self, create: &DatasetCreate) -> Result<()> {
        let mut state = self.state();
        state.enter("create_dataset")?;
        if state.datasets.contains_key(&create.name) {
            return Err(NasError::Status {
                status: 422,
                body: format!("{} already exists", create.name),
            });
        }

        let dataset = Dataset {
            id: create.name.clone(),
            kind: create.kind,
            comments: create.comments.clone(),
            volsize: create.volsize,
            refquota: match create.kind {
                DatasetKind::Filesystem => Some(create.refquota.unwrap_or(0)),
                DatasetKind::Volume => None,
            },
            refreservation: Some(create.refreservation.unwrap_or(0)),
        };
        state.datasets.insert(create.name.clone(), dataset);
        state.dataset_creates += 1;
        Ok(())
    }

    async fn update_dataset(&self, id: &str, update: &DatasetUpdate) -> Result<()> {
        let mut state = self.state();
        state.enter("update_dataset")?;
        let dataset = state
            .datasets
            .get_mut(id)
            .ok_or_else(|| not_found("dataset", id))?;

        if let Some(volsize) = update.volsize {
            dataset.volsize = Some(volsize);
        }
        if let Some(refquota) = update.refquota {
            dataset.refquota = Some(refquota);
        }
        if let Some(refreservation) = update.refreservation {
            dataset.refreservation = Some(refreservation);
        }
        Ok(())
    }

    async fn delete_dataset(&self, id: &str, recursive: bool) -> Result<()> {
        let mut state = self.state();
        state.enter("delete_dataset")?;
        if state.datasets.remove(id).is_none() {
            return Err(not_found("dataset", id));
        }
        if recursive {
            let prefix = format!("{}/", id);
            state.datasets.retain(|name, _| !name.starts_with(&prefix));
        }
        state.permissions.remove(id);
        Ok(())
    }

    async fn set_dataset_permission(&self, id: &str, permission: &PermissionUpdate) -> Result<()> {
        let mut state = self.state();
        state.enter("set_dataset_permission")?;
        if !state.datasets.contains_key(id) {
            return Err(not_found("dataset", id));
        }
        state.permissions.insert(id.to_string(), permission.clone());
        Ok(())
    }

    async fn find_nfs_shares(&self, comment: &str) -> Result<Vec<NfsShare>> {
        let mut state = self.state();
        state.enter("find_nfs_shares")?;
        Ok(state
            .nfs_shares
            .iter()
            .filter(|(_, s)| s.comment == comment)
            .map(|(id, s)| NfsShare {
                id: *id,
                paths: s.paths.clone(),
                path: None,
                comment: s.comment.clone(),
            })
            .collect())
    }

    async fn create_nfs_share(&self, create: &NfsShareCreate) -> Result<i64> {
        let mut state = self.state();
        state.enter("create_nfs_share")?;
        let id = state.allocate_id();
        state.nfs_shares.insert(id, create.clone());
        Ok(id)
    }

    async fn delete_nfs_share(&self, id: i64) -> Result<()> {
        let mut state = self.state();
        state.enter("delete_nfs_share")?;
        state
            .nfs_shares
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found("nfs share", id))
    }

    async fn find_iscsi_extents(&self, comment: &str) -> Result<Vec<IscsiExtent>> {
        let mut state = self.state();
        state.enter("find_iscsi_extents")?;
        Ok(state
            .extents
            .iter()
            .filter(|(_, e)| e.comment == comment)
            .map(|(id, e)| IscsiExtent {
                id: *id,
                name: e.name.clone(),
                disk: Some(e.disk.clone()),
                comment: e.comment.clone(),
            })
            .collect())
    }

    async fn create_iscsi_extent(&self, create: &IscsiExtentCreate) -> Result<i64> {
        let mut state = self.state();
        state.enter("create_iscsi_extent")?;
        if state.extents.values().any(|e| e.name == create.name) {
            return Err(NasError::Status {
                status: 422,
                body: format!("extent {} already exists", create.name),
            });
        }
        let id = state.allocate_id();
        state.extents.insert(id, create.clone());
        Ok(id)
    }

    async fn delete_iscsi_extent(&self, id: i64) -> Result<()> {
        let mut state = self.state();
        state.enter("delete_iscsi_extent")?;
        state
            .extents
            .remove(&id)
            .ok_or_else(|| not_found("extent", id))?;
        state.target_extents.retain(|_, a| a.extent != id);
        Ok(())
    }

    async fn find_iscsi_targets(&self, name: &str) -> Result<Vec<IscsiTarget>> {
        let mut state = self.state();
        state.enter("find_iscsi_targets")?;
        Ok(state
            .targets
            .iter()
            .filter(|(_, t)| t.name == name)
            .map(|(id, t)| IscsiTarget {
                id: *id,
                name: t.name.clone(),
                groups: t.groups.clone(),
            })
            .collect())
    }

    async fn create_iscsi_target(&self, create: &IscsiTargetCreate) -> Result<i64> {
        let mut state = self.state();
        state.enter("create_iscsi_target")?;
        if state.targets.values().any(|t| t.name == create.name) {
            return Err(NasError::Status {
                status: 422,
                body: format!("target {} already exists", create.name),
            });
        }
        let id = state.allocate_id();
        state.targets.insert(id, create.clone());
        Ok(id)
    }

    async fn delete_iscsi_target(&self, id: i64) -> Result<()> {
        let mut state = self.state();
        state.enter("delete_iscsi_target")?;
        state
            .targets
            .remove(&id)
            .ok_or_else(|| not_found("target", id))?;
        state.target_extents.retain(|_, a| a.target != id);
        Ok(())
    }

    async fn find_iscsi_auths(&self, filter: &AuthFilter) -> Result<Vec<IscsiAuth>> {
        let mut state = self.state();
        state.enter("find_iscsi_auths")?;
        Ok(state
            .auths
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect())
    }

    async fn create_iscsi_auth(&self, create: &IscsiAuthCreate) -> Result<i64> {
        let mut state = self.state();
        state.enter("create_iscsi_auth")?;
        let id = state.allocate_id();
        state.auths.insert(
            id,
            IscsiAuth {
                id,
                tag: create.tag,
                user: create.user.clone(),
                secret: create.secret.clone(),
                peeruser: String::new(),
                peersecret: String::new(),
            },
        );
        Ok(id)
    }

    async fn update_iscsi_auth(&self, id: i64, update: &IscsiAuthUpdate) -> Result<()> {
        let mut state = self.state();
        state.enter("update_iscsi_auth")?;
        let auth = state
            .auths
            .get_mut(&id)
            .ok_or_else(|| not_found("auth", id))?;
        if let Some(tag) = update.tag {
            auth.tag = tag;
        }
        Ok(())
    }

    async fn delete_iscsi_auth(&self, id: i64) -> Result<()> {
        let mut state = self.state();
        state.enter("delete_iscsi_auth")?;
        state
            .auths
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found("auth", id))
    }

    async fn find_target_extents(&self, target: i64, extent: i64) -> Result<Vec<TargetExtent>> {
        let mut state = self.state();
        state.enter("find_target_extents")?;
        Ok(state
            .target_extents
            .iter()
            .filter(|(_, a)| a.target == target && a.extent == extent)
            .map(|(id, a)| TargetExtent {
                id: *id,
                target: a.target,
                extent: a.extent,
                lunid: Some(a.lunid),
            })
            .collect())
    }

    async fn create_target_extent(&self, create: &TargetExtentCreate) -> Result<i64> {
        let mut state = self.state();
        state.enter("create_target_extent")?;
        if !state.targets.contains_key(&create.target) {
            return Err(not_found("target", create.target));
        }
        if !state.extents.contains_key(&create.extent) {
            return Err(not_found("extent", create.extent));
        }
        let id = state.allocate_id();
        state.target_extents.insert(id, create.clone());
        Ok(id)
    }

    async fn delete_target_extent(&self, id: i64) -> Result<()> {
        let mut state = self.state();
        state.enter("delete_target_extent")?;
        state
            .target_extents
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found("targetextent", id))
    }

    async fn iscsi_global(&self) -> Result<IscsiGlobal> {
        let mut state = self.state();
        state.enter("iscsi_global")?;
        Ok(IscsiGlobal {
            basename: state.basename.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_dataset_is_rejected() {
        let nas = MemoryNas::new();
        let create = DatasetCreate::volume("tank/a", "pvc-1", 1024);

        nas.create_dataset(&create).await.unwrap();
        let err = nas.create_dataset(&create).await.unwrap_err();
        assert!(err.is_rejected());
        assert!(!err.is_not_found());
        assert_eq!(nas.dataset_creates(), 1);
    }

    #[tokio::test]
    async fn test_deleting_target_drops_associations() {
        let nas = MemoryNas::new();
        let target = nas
            .create_iscsi_target(&IscsiTargetCreate {
                name: "t".into(),
                groups: vec![],
            })
            .await
            .unwrap();
        let extent = nas
            .create_iscsi_extent(&IscsiExtentCreate {
                name: "e".into(),
                kind: "DISK".into(),
                disk: "zvol/tank/a".into(),
                comment: "pvc-1".into(),
                serial: "00112233445566".into(),
                insecure_tpc: false,
                pblocksize: false,
            })
            .await
            .unwrap();
        nas.create_target_extent(&TargetExtentCreate {
            target,
            extent,
            lunid: 0,
        })
        .await
        .unwrap();

        nas.delete_iscsi_target(target).await.unwrap();
        assert!(nas.target_extents().is_empty());
        assert!(nas.delete_iscsi_target(target).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let nas = MemoryNas::new();
        nas.fail_on("iscsi_global", 503);

        let err = nas.iscsi_global().await.unwrap_err();
        assert!(matches!(err, NasError::Status { status: 503, .. }));

        nas.clear_failures();
        assert_eq!(nas.iscsi_global().await.unwrap().basename, None);
        assert_eq!(nas.call_count("iscsi_global"), 2);
    }
}
