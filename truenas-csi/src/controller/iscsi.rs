//! iSCSI export of a zvol: extent, CHAP credential, target and LUN.
//!
//! Objects are found again on retry by their tags: the extent by its
//! comment (the volume name), the target by its name and the CHAP entry by
//! its user, both of which are the hashed volume name.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tonic::Status;
use tracing::{debug, info};
use truenas_api::NasApi;
use truenas_api::models::{
    AuthFilter, IscsiAuth, IscsiAuthCreate, IscsiAuthUpdate, IscsiExtentCreate, IscsiTargetCreate,
    TargetExtentCreate, TargetGroup,
};
use uuid::Uuid;

use super::saga::{Created, Rollback};
use crate::config::IscsiSettings;
use crate::error::NasResultExt;
use crate::volume_context::{ChapCredentials, IscsiContext, VolumeContext};

/// Random bytes in an extent serial (14 hex chars).
const SERIAL_BYTES: usize = 7;
/// Random bytes in a CHAP secret (16 base64 chars).
const SECRET_BYTES: usize = 12;

fn random_serial() -> String {
    hex::encode(&Uuid::new_v4().as_bytes()[..SERIAL_BYTES])
}

fn random_secret() -> String {
    STANDARD.encode(&Uuid::new_v4().as_bytes()[..SECRET_BYTES])
}

fn more_than_one(what: &str, tag: &str, count: usize) -> Status {
    Status::unavailable(format!("Found {} iSCSI {}s for {}", count, what, tag))
}

/// Export the zvol `dataset` and return the context a node logs in with.
pub async fn ensure_export(
    client: &dyn NasApi,
    settings: &IscsiSettings,
    name: &str,
    hash: &str,
    dataset: &str,
    rollback: &mut Rollback,
) -> Result<VolumeContext, Status> {
    let extent = ensure_extent(client, settings, name, hash, dataset, rollback).await?;
    let auth = ensure_auth(client, hash, rollback).await?;

    let targets = client
        .find_iscsi_targets(hash)
        .await
        .or_unavailable("lookup iscsi target")?;
    let target = match targets.as_slice() {
        [] => {
            let create = IscsiTargetCreate {
                name: hash.to_string(),
                groups: vec![TargetGroup {
                    portal: settings.portal_id,
                    initiator: None,
                    authmethod: "CHAP".to_string(),
                    auth: Some(auth.tag),
                }],
            };
            let id = client
                .create_iscsi_target(&create)
                .await
                .or_unavailable("create iscsi target")?;
            rollback.push(Created::Target(id));
            info!(target_id = id, target = %hash, "iSCSI target created");
            id
        }
        [target] => {
            debug!(target_id = target.id, "Reusing iSCSI target");
            target.id
        }
        _ => return Err(more_than_one("target", hash, targets.len())),
    };

    let associations = client
        .find_target_extents(target, extent)
        .await
        .or_unavailable("lookup iscsi targetextent")?;
    if associations.is_empty() {
        let id = client
            .create_target_extent(&TargetExtentCreate {
                target,
                extent,
                lunid: 0,
            })
            .await
            .or_unavailable("create iscsi targetextent")?;
        rollback.push(Created::TargetExtent(id));
        debug!(targetextent_id = id, target, extent, "iSCSI LUN association created");
    }

    let basename = client
        .iscsi_global()
        .await
        .or_unavailable("lookup iscsi global settings")?
        .basename
        .ok_or_else(|| Status::unavailable("NAS has no iSCSI base name configured"))?;

    Ok(VolumeContext::iscsi(IscsiContext {
        portal: settings.portal.clone(),
        target: format!("{}:{}", basename, hash),
        in_auth: Some(ChapCredentials {
            username: auth.user,
            password: auth.secret,
        }),
        out_auth: None,
    }))
}

async fn ensure_extent(
    client: &dyn NasApi,
    settings: &IscsiSettings,
    name: &str,
    hash: &str,
    dataset: &str,
    rollback: &mut Rollback,
) -> Result<i64, Status> {
    let disk = format!("zvol/{}", dataset);
    let extents = client
        .find_iscsi_extents(name)
        .await
        .or_unavailable("lookup iscsi extent")?;

    match extents.as_slice() {
        [] => {
            let create = IscsiExtentCreate {
                name: hash.to_string(),
                kind: "DISK".to_string(),
                disk: disk.clone(),
                comment: name.to_string(),
                serial: random_serial(),
                insecure_tpc: false,
                pblocksize: settings.disable_report_block_size,
            };
            let id = client
                .create_iscsi_extent(&create)
                .await
                .or_unavailable("create iscsi extent")?;
            rollback.push(Created::Extent(id));
            info!(extent_id = id, disk = %disk, "iSCSI extent created");
            Ok(id)
        }
        [extent] if extent.disk.as_deref() == Some(disk.as_str()) => {
            debug!(extent_id = extent.id, "Reusing iSCSI extent");
            Ok(extent.id)
        }
        [extent] => Err(Status::unavailable(format!(
            "iSCSI extent {} for {} is backed by {}, expected {}",
            extent.id,
            name,
            extent.disk.as_deref().unwrap_or("nothing"),
            disk
        ))),
        _ => Err(more_than_one("extent", name, extents.len())),
    }
}

/// Find the CHAP entry for user `hash`, creating it if needed. The entry's
/// tag is set to its own id so a target can reference it.
async fn ensure_auth(
    client: &dyn NasApi,
    hash: &str,
    rollback: &mut Rollback,
) -> Result<IscsiAuth, Status> {
    let auths = client
        .find_iscsi_auths(&AuthFilter::User(hash.to_string()))
        .await
        .or_unavailable("lookup iscsi auth")?;

    let mut auth = match auths.as_slice() {
        [] => {
            let create = IscsiAuthCreate {
                tag: 0,
                user: hash.to_string(),
                secret: random_secret(),
            };
            let id = client
                .create_iscsi_auth(&create)
                .await
                .or_unavailable("create iscsi auth")?;
            rollback.push(Created::Auth(id));
            info!(auth_id = id, "iSCSI CHAP credential created");
            IscsiAuth {
                id,
                tag: create.tag,
                user: create.user,
                secret: create.secret,
                peeruser: String::new(),
                peersecret: String::new(),
            }
        }
        [auth] => auth.clone(),
        _ => return Err(more_than_one("auth", hash, auths.len())),
    };

    if auth.tag == 0 {
        client
            .update_iscsi_auth(auth.id, &IscsiAuthUpdate { tag: Some(auth.id) })
            .await
            .or_unavailable("update iscsi auth")?;
        auth.tag = auth.id;
    }

    Ok(auth)
}

/// Remove the target, CHAP entry and extent belonging to a zvol.
///
/// `comment` is the dataset comment, which the extent carries as well.
pub async fn remove_export(client: &dyn NasApi, hash: &str, comment: &str) -> Result<(), Status> {
    let targets = client
        .find_iscsi_targets(hash)
        .await
        .or_unavailable("lookup iscsi target")?;
    for target in targets {
        client
            .delete_iscsi_target(target.id)
            .await
            .ignore_not_found("delete iscsi target")?;
        info!(target_id = target.id, "iSCSI target deleted");
    }

    let auths = client
        .find_iscsi_auths(&AuthFilter::User(hash.to_string()))
        .await
        .or_unavailable("lookup iscsi auth")?;
    for auth in auths {
        client
            .delete_iscsi_auth(auth.id)
            .await
            .ignore_not_found("delete iscsi auth")?;
        debug!(auth_id = auth.id, "iSCSI CHAP credential deleted");
    }

    if comment.is_empty() {
        return Ok(());
    }
    let extents = client
        .find_iscsi_extents(comment)
        .await
        .or_unavailable("lookup iscsi extent")?;
    for extent in extents {
        client
            .delete_iscsi_extent(extent.id)
            .await
            .ignore_not_found("delete iscsi extent")?;
        info!(extent_id = extent.id, "iSCSI extent deleted");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use truenas_api::memory::MemoryNas;

    fn settings() -> IscsiSettings {
        IscsiSettings {
            portal: "10.0.0.5:3260".into(),
            portal_id: 1,
            volblocksize: None,
            disable_report_block_size: true,
        }
    }

    const HASH: &str = "f2868e1aa7cab669517cd9f5ab1b7957c0b92df3";
    const DATASET: &str = "tank/k8s/f2868e1aa7cab669517cd9f5ab1b7957c0b92df3";

    #[test]
    fn test_random_formats() {
        assert_eq!(random_serial().len(), 14);
        assert!(random_serial().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(random_secret().len(), 16);
        assert_ne!(random_secret(), random_secret());
    }

    #[tokio::test]
    async fn test_export_chain() {
        let nas = MemoryNas::new().with_basename("iqn.2005-10.org.freenas.ctl");
        let mut rollback = Rollback::new();

        let ctx = ensure_export(&nas, &settings(), "pvc-1", HASH, DATASET, &mut rollback)
            .await
            .unwrap();
        let iscsi = ctx.iscsi.unwrap();
        assert_eq!(iscsi.portal, "10.0.0.5:3260");
        assert_eq!(iscsi.target, format!("iqn.2005-10.org.freenas.ctl:{}", HASH));
        let chap = iscsi.in_auth.unwrap();
        assert_eq!(chap.username, HASH);
        assert!(iscsi.out_auth.is_none());

        let extents = nas.extents();
        assert_eq!(extents.len(), 1);
        let extent = &extents[0].1;
        assert_eq!(extent.disk, format!("zvol/{}", DATASET));
        assert_eq!(extent.kind, "DISK");
        assert_eq!(extent.comment, "pvc-1");
        assert!(extent.pblocksize);

        let auths = nas.auths();
        assert_eq!(auths.len(), 1);
        assert_eq!(auths[0].tag, auths[0].id);
        assert_eq!(auths[0].secret, chap.password);

        let targets = nas.targets();
        assert_eq!(targets.len(), 1);
        let group = &targets[0].1.groups[0];
        assert_eq!(group.portal, 1);
        assert_eq!(group.authmethod, "CHAP");
        assert_eq!(group.auth, Some(auths[0].tag));

        let luns = nas.target_extents();
        assert_eq!(luns.len(), 1);
        assert_eq!(luns[0].lunid, Some(0));
    }

    #[tokio::test]
    async fn test_retry_reuses_everything() {
        let nas = MemoryNas::new().with_basename("iqn.test");
        let mut rollback = Rollback::new();
        let first = ensure_export(&nas, &settings(), "pvc-1", HASH, DATASET, &mut rollback)
            .await
            .unwrap();

        let mut retry = Rollback::new();
        let second = ensure_export(&nas, &settings(), "pvc-1", HASH, DATASET, &mut retry)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert!(retry.is_empty());
        assert_eq!(nas.call_count("create_iscsi_auth"), 1);
        assert_eq!(nas.call_count("create_iscsi_target"), 1);
        assert_eq!(nas.call_count("create_target_extent"), 1);
    }

    #[tokio::test]
    async fn test_existing_untagged_auth_is_reused_and_tagged() {
        let nas = MemoryNas::new().with_basename("iqn.test");
        let id = nas
            .create_iscsi_auth(&IscsiAuthCreate {
                tag: 0,
                user: HASH.into(),
                secret: "leftoversecret00".into(),
            })
            .await
            .unwrap();

        let mut rollback = Rollback::new();
        let ctx = ensure_export(&nas, &settings(), "pvc-1", HASH, DATASET, &mut rollback)
            .await
            .unwrap();

        assert_eq!(ctx.iscsi.unwrap().in_auth.unwrap().password, "leftoversecret00");
        assert_eq!(nas.auths()[0].tag, id);
        assert_eq!(nas.call_count("create_iscsi_auth"), 1);
    }

    #[tokio::test]
    async fn test_missing_basename_is_unavailable() {
        let nas = MemoryNas::new();
        let mut rollback = Rollback::new();
        let err = ensure_export(&nas, &settings(), "pvc-1", HASH, DATASET, &mut rollback)
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);
        // Everything created so far is left for the caller to roll back
        rollback.run(&nas).await;
        assert!(nas.has_no_exports());
    }

    #[tokio::test]
    async fn test_extent_with_other_disk_rejected() {
        let nas = MemoryNas::new().with_basename("iqn.test");
        let mut rollback = Rollback::new();
        ensure_export(&nas, &settings(), "pvc-1", HASH, DATASET, &mut rollback)
            .await
            .unwrap();

        let err = ensure_export(&nas, &settings(), "pvc-1", HASH, "tank/other/x", &mut rollback)
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);
    }

    #[tokio::test]
    async fn test_remove_export() {
        let nas = MemoryNas::new().with_basename("iqn.test");
        let mut rollback = Rollback::new();
        ensure_export(&nas, &settings(), "pvc-1", HASH, DATASET, &mut rollback)
            .await
            .unwrap();

        remove_export(&nas, HASH, "pvc-1").await.unwrap();
        assert!(nas.has_no_exports());

        remove_export(&nas, HASH, "pvc-1").await.unwrap();
    }
}
