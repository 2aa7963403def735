//! NFS share provisioning and teardown.

use tonic::Status;
use tracing::{debug, info, warn};
use truenas_api::NasApi;
use truenas_api::models::NfsShareCreate;

use super::saga::{Created, Rollback};
use crate::config::NfsSettings;
use crate::error::NasResultExt;
use crate::naming::mount_path;
use crate::volume_context::VolumeContext;

/// Export `dataset` over NFS, reusing the share tagged with `name` if present.
pub async fn ensure_share(
    client: &dyn NasApi,
    settings: &NfsSettings,
    name: &str,
    dataset: &str,
    rollback: &mut Rollback,
) -> Result<VolumeContext, Status> {
    let path = mount_path(dataset);
    let shares = client
        .find_nfs_shares(name)
        .await
        .or_unavailable("lookup nfs share")?;

    match shares.as_slice() {
        [] => {
            let create = NfsShareCreate {
                enabled: true,
                paths: vec![path.clone()],
                comment: name.to_string(),
                hosts: settings.allowed_hosts.clone(),
                networks: settings.allowed_networks.clone(),
                maproot_user: "root".to_string(),
                maproot_group: "wheel".to_string(),
            };
            let id = client
                .create_nfs_share(&create)
                .await
                .or_unavailable("create nfs share")?;
            rollback.push(Created::NfsShare(id));
            info!(share_id = id, path = %path, "NFS share created");
        }
        [share] => {
            if !share.exported_paths().contains(&path.as_str()) {
                warn!(share_id = share.id, path = %path, "NFS share exports a different path");
                return Err(Status::unavailable(format!(
                    "NFS share {} for {} does not export {}",
                    share.id, name, path
                )));
            }
            debug!(share_id = share.id, "Reusing NFS share");
        }
        _ => {
            return Err(Status::unavailable(format!(
                "Found {} NFS shares tagged {}",
                shares.len(),
                name
            )));
        }
    }

    Ok(VolumeContext::nfs(format!("{}:{}", settings.server, path)))
}

/// Remove every share tagged with `comment`.
pub async fn remove_shares(client: &dyn NasApi, comment: &str) -> Result<(), Status> {
    if comment.is_empty() {
        warn!("Dataset has no comment, cannot locate its NFS share");
        return Ok(());
    }

    let shares = client
        .find_nfs_shares(comment)
        .await
        .or_unavailable("lookup nfs share")?;

    for share in shares {
        client
            .delete_nfs_share(share.id)
            .await
            .ignore_not_found("delete nfs share")?;
        info!(share_id = share.id, "NFS share deleted");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use truenas_api::memory::MemoryNas;

    fn settings() -> NfsSettings {
        NfsSettings {
            server: "10.0.0.5".into(),
            allowed_hosts: vec!["worker-1".into()],
            allowed_networks: vec!["10.0.0.0/24".into()],
        }
    }

    #[tokio::test]
    async fn test_share_created_once() {
        let nas = MemoryNas::new();
        let mut rollback = Rollback::new();

        let ctx = ensure_share(&nas, &settings(), "pvc-1", "tank/k8s/abc", &mut rollback)
            .await
            .unwrap();
        assert_eq!(ctx.nfs.unwrap().address, "10.0.0.5:/mnt/tank/k8s/abc");
        assert!(!rollback.is_empty());

        let shares = nas.nfs_shares();
        assert_eq!(shares.len(), 1);
        let share = &shares[0].1;
        assert_eq!(share.paths, vec!["/mnt/tank/k8s/abc".to_string()]);
        assert_eq!(share.hosts, vec!["worker-1".to_string()]);
        assert_eq!(share.networks, vec!["10.0.0.0/24".to_string()]);
        assert_eq!(share.maproot_user, "root");
        assert_eq!(share.maproot_group, "wheel");

        // Retry reuses it and records nothing new
        let mut retry = Rollback::new();
        ensure_share(&nas, &settings(), "pvc-1", "tank/k8s/abc", &mut retry)
            .await
            .unwrap();
        assert!(retry.is_empty());
        assert_eq!(nas.call_count("create_nfs_share"), 1);
    }

    #[tokio::test]
    async fn test_share_with_other_path_rejected() {
        let nas = MemoryNas::new();
        let mut rollback = Rollback::new();
        ensure_share(&nas, &settings(), "pvc-1", "tank/k8s/abc", &mut rollback)
            .await
            .unwrap();

        let err = ensure_share(&nas, &settings(), "pvc-1", "tank/k8s/other", &mut rollback)
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);
    }

    #[tokio::test]
    async fn test_remove_shares() {
        let nas = MemoryNas::new();
        let mut rollback = Rollback::new();
        ensure_share(&nas, &settings(), "pvc-1", "tank/k8s/abc", &mut rollback)
            .await
            .unwrap();

        remove_shares(&nas, "pvc-1").await.unwrap();
        assert!(nas.has_no_exports());

        // Nothing left to remove
        remove_shares(&nas, "pvc-1").await.unwrap();
    }
}
