//! Integration tests for truenas-csi
//!
//! Runs the Controller and Node services through their gRPC traits, backed
//! by the in-memory NAS and a scripted command runner. Tests focus on:
//! - Deterministic volume ids and contexts
//! - Idempotent create and delete
//! - Delete policies and rollback of partial provisioning
//! - Capability validation and expansion
//! - Staging an iSCSI volume handed over by the controller

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tonic::{Code, Request};

use truenas_api::NasApi;
use truenas_api::memory::MemoryNas;
use truenas_api::models::{DatasetKind, IscsiAuthCreate};
use truenas_csi::config::{CONFIG_PARAMETER, ControllerConfig};
use truenas_csi::csi;
use truenas_csi::csi::controller_server::Controller;
use truenas_csi::csi::node_server::Node;
use truenas_csi::csi::volume_capability::{
    AccessMode, AccessType, BlockVolume, MountVolume, access_mode::Mode,
};
use truenas_csi::naming::hashed_name;
use truenas_csi::node::by_path_device;
use truenas_csi::platform::{CommandOutput, CommandRunner};
use truenas_csi::{ControllerService, NodeService, VolumeContext};

const GIB: i64 = 1024 * 1024 * 1024;
const PVC1_HASH: &str = "f2868e1aa7cab669517cd9f5ab1b7957c0b92df3";

const CONFIG: &str = r#"
default:
  api_url: https://nas.example.com/api/v2.0
  api_key: 1-abcdef
  nfs:
    server: 10.0.0.5
    allowed_networks: [10.0.0.0/24]
  iscsi:
    portal: 10.0.0.5:3260
    portal_id: 1
  configurations:
    default:
      dataset: tank/k8s
    archive:
      dataset: tank/archive
      delete_policy: retain
    scratch:
      dataset: tank/scratch
      sparse: true
"#;

// ============================================================================
// Fixtures
// ============================================================================

fn controller() -> (ControllerService, Arc<MemoryNas>) {
    let nas = Arc::new(MemoryNas::new().with_basename("iqn.2005-10.org.freenas.ctl"));
    let client: Arc<dyn NasApi> = nas.clone();
    let resolver = ControllerConfig::parse(CONFIG)
        .unwrap()
        .into_resolver_with(|_, _| Ok(client.clone()))
        .unwrap();
    (ControllerService::new(resolver), nas)
}

fn capability(access: AccessType, mode: Mode) -> csi::VolumeCapability {
    csi::VolumeCapability {
        access_type: Some(access),
        access_mode: Some(AccessMode { mode: mode as i32 }),
    }
}

fn mount(mode: Mode) -> csi::VolumeCapability {
    capability(AccessType::Mount(MountVolume::default()), mode)
}

fn block(mode: Mode) -> csi::VolumeCapability {
    capability(AccessType::Block(BlockVolume::default()), mode)
}

fn create_request(
    name: &str,
    caps: Vec<csi::VolumeCapability>,
    required: i64,
    limit: i64,
) -> csi::CreateVolumeRequest {
    csi::CreateVolumeRequest {
        name: name.into(),
        capacity_range: Some(csi::CapacityRange {
            required_bytes: required,
            limit_bytes: limit,
        }),
        volume_capabilities: caps,
        ..Default::default()
    }
}

fn with_config(mut req: csi::CreateVolumeRequest, config: &str) -> csi::CreateVolumeRequest {
    req.parameters
        .insert(CONFIG_PARAMETER.to_string(), config.to_string());
    req
}

async fn create(svc: &ControllerService, req: csi::CreateVolumeRequest) -> csi::Volume {
    svc.create_volume(Request::new(req))
        .await
        .unwrap()
        .into_inner()
        .volume
        .unwrap()
}

async fn delete(svc: &ControllerService, volume_id: &str) -> Result<(), tonic::Status> {
    svc.delete_volume(Request::new(csi::DeleteVolumeRequest {
        volume_id: volume_id.into(),
        secrets: HashMap::new(),
    }))
    .await
    .map(|_| ())
}

/// Answers every command with success and creates the by-path device when
/// an iSCSI login runs.
#[derive(Default)]
struct ScriptedHost {
    calls: Mutex<Vec<String>>,
    device: Mutex<Option<PathBuf>>,
}

impl ScriptedHost {
    fn count(&self, pattern: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }
}

#[async_trait]
impl CommandRunner for ScriptedHost {
    async fn run(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput> {
        let line = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        self.calls.lock().unwrap().push(line);

        if program == "iscsiadm"
            && args.contains(&"-l")
            && let Some(device) = self.device.lock().unwrap().as_ref()
        {
            std::fs::write(device, b"")?;
        }

        Ok(CommandOutput {
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

fn path_str(path: &Path) -> String {
    path.to_str().unwrap().to_string()
}

// ============================================================================
// CreateVolume
// ============================================================================

#[tokio::test]
async fn test_create_nfs_volume_golden() {
    let (svc, nas) = controller();

    let volume = create(
        &svc,
        create_request("pvc-1", vec![mount(Mode::MultiNodeMultiWriter)], 0, 5 * GIB),
    )
    .await;

    assert_eq!(hashed_name("pvc-1"), PVC1_HASH);
    assert_eq!(volume.volume_id, format!("default:/mnt/tank/k8s/{}", PVC1_HASH));
    assert_eq!(volume.capacity_bytes, 5 * GIB);

    let ctx = VolumeContext::decode(&volume.volume_context).unwrap();
    assert!(ctx.iscsi.is_none());
    assert_eq!(
        ctx.nfs.unwrap().address,
        format!("10.0.0.5:/mnt/tank/k8s/{}", PVC1_HASH)
    );

    let dataset = nas.dataset(&format!("tank/k8s/{}", PVC1_HASH)).unwrap();
    assert_eq!(dataset.kind, DatasetKind::Filesystem);
    assert_eq!(dataset.comments, "pvc-1");
    assert_eq!(dataset.refquota, Some(5 * GIB));
    assert_eq!(dataset.refreservation, Some(5 * GIB));
}

#[tokio::test]
async fn test_create_is_idempotent() {
    let (svc, nas) = controller();

    let nfs = create_request("pvc-1", vec![mount(Mode::MultiNodeMultiWriter)], GIB, 0);
    let first = create(&svc, nfs.clone()).await;
    let second = create(&svc, nfs).await;
    assert_eq!(first, second);

    let iscsi = create_request("pvc-2", vec![block(Mode::SingleNodeWriter)], GIB, 0);
    let first = create(&svc, iscsi.clone()).await;
    let second = create(&svc, iscsi).await;
    assert_eq!(first.volume_id, second.volume_id);
    assert_eq!(
        VolumeContext::decode(&first.volume_context).unwrap(),
        VolumeContext::decode(&second.volume_context).unwrap()
    );

    assert_eq!(nas.dataset_creates(), 2);
    assert_eq!(nas.nfs_shares().len(), 1);
    assert_eq!(nas.extents().len(), 1);
    assert_eq!(nas.targets().len(), 1);
    assert_eq!(nas.auths().len(), 1);
}

#[tokio::test]
async fn test_create_size_conflict() {
    let (svc, nas) = controller();

    create(
        &svc,
        create_request("pvc-1", vec![block(Mode::SingleNodeWriter)], 0, GIB),
    )
    .await;

    let err = svc
        .create_volume(Request::new(create_request(
            "pvc-1",
            vec![block(Mode::SingleNodeWriter)],
            0,
            2 * GIB,
        )))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::AlreadyExists);

    // The existing volume is untouched
    assert_eq!(nas.dataset_count(), 1);
    assert_eq!(nas.extents().len(), 1);
}

#[tokio::test]
async fn test_create_rolls_back_on_failure() {
    let (svc, nas) = controller();
    nas.fail_on("create_nfs_share", 500);

    let err = svc
        .create_volume(Request::new(create_request(
            "pvc-1",
            vec![mount(Mode::MultiNodeMultiWriter)],
            0,
            0,
        )))
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::Unavailable);
    assert!(nas.has_no_exports());
    assert_eq!(nas.dataset_count(), 0);
    assert_eq!(nas.call_count("delete_dataset"), 1);
}

#[tokio::test]
async fn test_chap_credential_found_by_username() {
    let (svc, nas) = controller();
    let hash = hashed_name("pvc-1");
    nas.create_iscsi_auth(&IscsiAuthCreate {
        tag: 0,
        user: hash.clone(),
        secret: "c2VjcmV0c2VjcmV0".into(),
    })
    .await
    .unwrap();

    let volume = create(
        &svc,
        create_request("pvc-1", vec![mount(Mode::SingleNodeWriter)], 0, 0),
    )
    .await;

    let chap = VolumeContext::decode(&volume.volume_context)
        .unwrap()
        .iscsi
        .unwrap()
        .in_auth
        .unwrap();
    assert_eq!(chap.username, hash);
    assert_eq!(chap.password, "c2VjcmV0c2VjcmV0");
    assert_eq!(nas.auths().len(), 1);
}

// ============================================================================
// DeleteVolume
// ============================================================================

#[tokio::test]
async fn test_delete_is_idempotent() {
    let (svc, nas) = controller();

    delete(&svc, "not-a-volume-id").await.unwrap();
    delete(&svc, "nowhere:/mnt/tank/k8s/abc").await.unwrap();
    delete(&svc, "default:/mnt/tank/k8s/abc").await.unwrap();

    let volume = create(
        &svc,
        create_request("pvc-1", vec![mount(Mode::MultiNodeMultiWriter)], 0, 0),
    )
    .await;
    delete(&svc, &volume.volume_id).await.unwrap();
    delete(&svc, &volume.volume_id).await.unwrap();

    assert!(nas.has_no_exports());
    assert_eq!(nas.dataset_count(), 0);
}

#[tokio::test]
async fn test_delete_policies() {
    let (svc, nas) = controller();

    let deleted = create(
        &svc,
        create_request("pvc-1", vec![block(Mode::SingleNodeWriter)], 0, 0),
    )
    .await;
    let retained = create(
        &svc,
        with_config(
            create_request("pvc-2", vec![block(Mode::SingleNodeWriter)], 0, 0),
            "archive",
        ),
    )
    .await;
    assert!(retained.volume_id.starts_with("default:/mnt/tank/archive/"));

    delete(&svc, &deleted.volume_id).await.unwrap();
    delete(&svc, &retained.volume_id).await.unwrap();

    // Both are unexported, only the retained dataset is left
    assert!(nas.has_no_exports());
    assert!(nas.dataset(&format!("tank/k8s/{}", hashed_name("pvc-1"))).is_none());
    assert!(nas.dataset(&format!("tank/archive/{}", hashed_name("pvc-2"))).is_some());
}

// ============================================================================
// ValidateVolumeCapabilities / ControllerExpandVolume
// ============================================================================

async fn validate(
    svc: &ControllerService,
    volume_id: &str,
    cap: csi::VolumeCapability,
) -> csi::ValidateVolumeCapabilitiesResponse {
    svc.validate_volume_capabilities(Request::new(csi::ValidateVolumeCapabilitiesRequest {
        volume_id: volume_id.into(),
        volume_capabilities: vec![cap],
        ..Default::default()
    }))
    .await
    .unwrap()
    .into_inner()
}

#[tokio::test]
async fn test_validate_capabilities() {
    let (svc, _nas) = controller();
    let fs = create(
        &svc,
        create_request("pvc-fs", vec![mount(Mode::MultiNodeMultiWriter)], 0, 0),
    )
    .await;
    let zvol = create(
        &svc,
        create_request("pvc-zvol", vec![block(Mode::SingleNodeWriter)], 0, 0),
    )
    .await;

    let resp = validate(&svc, &fs.volume_id, block(Mode::SingleNodeWriter)).await;
    assert!(resp.confirmed.is_none());
    assert!(!resp.message.is_empty());

    let resp = validate(&svc, &zvol.volume_id, mount(Mode::MultiNodeMultiWriter)).await;
    assert!(resp.confirmed.is_none());

    let resp = validate(&svc, &zvol.volume_id, mount(Mode::SingleNodeWriter)).await;
    let confirmed = resp.confirmed.unwrap();
    assert_eq!(confirmed.volume_capabilities, vec![mount(Mode::SingleNodeWriter)]);

    let resp = validate(&svc, &fs.volume_id, mount(Mode::MultiNodeReaderOnly)).await;
    assert!(resp.confirmed.is_some());

    let err = svc
        .validate_volume_capabilities(Request::new(csi::ValidateVolumeCapabilitiesRequest {
            volume_id: fs.volume_id.clone(),
            volume_capabilities: vec![],
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

async fn expand(
    svc: &ControllerService,
    volume_id: &str,
    required: i64,
) -> csi::ControllerExpandVolumeResponse {
    svc.controller_expand_volume(Request::new(csi::ControllerExpandVolumeRequest {
        volume_id: volume_id.into(),
        capacity_range: Some(csi::CapacityRange {
            required_bytes: required,
            limit_bytes: 0,
        }),
        ..Default::default()
    }))
    .await
    .unwrap()
    .into_inner()
}

#[tokio::test]
async fn test_expand_zvol_requires_node_step() {
    let (svc, nas) = controller();
    let volume = create(
        &svc,
        create_request("pvc-1", vec![block(Mode::SingleNodeWriter)], 0, 0),
    )
    .await;

    let resp = expand(&svc, &volume.volume_id, 3 * GIB).await;
    assert!(resp.node_expansion_required);
    assert_eq!(resp.capacity_bytes, 3 * GIB);

    let dataset = nas.dataset(&format!("tank/k8s/{}", PVC1_HASH)).unwrap();
    assert_eq!(dataset.volsize, Some(3 * GIB));
}

#[tokio::test]
async fn test_expand_sparse_filesystem_keeps_reservation() {
    let (svc, nas) = controller();
    let volume = create(
        &svc,
        with_config(
            create_request("pvc-1", vec![mount(Mode::MultiNodeMultiWriter)], 0, 0),
            "scratch",
        ),
    )
    .await;
    let id = format!("tank/scratch/{}", PVC1_HASH);
    let before = nas.dataset(&id).unwrap().refreservation;

    let resp = expand(&svc, &volume.volume_id, 4 * GIB).await;
    assert!(!resp.node_expansion_required);
    assert_eq!(resp.capacity_bytes, 4 * GIB);

    let after = nas.dataset(&id).unwrap();
    assert_eq!(after.refquota, Some(4 * GIB));
    assert_eq!(after.refreservation, before);
}

// ============================================================================
// Controller to Node
// ============================================================================

struct NodeFixture {
    host: Arc<ScriptedHost>,
    node: NodeService,
    root: TempDir,
}

impl NodeFixture {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        for dir in ["by-path", "sys", "staging", "pods"] {
            std::fs::create_dir(root.path().join(dir)).unwrap();
        }
        let host = Arc::new(ScriptedHost::default());
        let node = NodeService::with_runner("node-1".into(), host.clone())
            .with_device_roots(root.path().join("by-path"), root.path().join("sys"))
            .with_device_timeout(Duration::from_millis(200))
            .with_iscsiadm_backoff(Duration::from_millis(1));
        Self { host, node, root }
    }
}

#[tokio::test]
async fn test_stage_controller_volume_twice() {
    let (svc, _nas) = controller();
    let volume = create(
        &svc,
        create_request("pvc-1", vec![mount(Mode::SingleNodeWriter)], 0, 0),
    )
    .await;
    let ctx = VolumeContext::decode(&volume.volume_context).unwrap();
    let iscsi = ctx.iscsi.unwrap();

    let fixture = NodeFixture::new();
    let device = by_path_device(&fixture.root.path().join("by-path"), &iscsi.portal, &iscsi.target);
    *fixture.host.device.lock().unwrap() = Some(device.clone());

    let staging = fixture.root.path().join("staging");
    let stage = csi::NodeStageVolumeRequest {
        volume_id: volume.volume_id.clone(),
        staging_target_path: path_str(&staging),
        volume_capability: Some(mount(Mode::SingleNodeWriter)),
        volume_context: volume.volume_context.clone(),
        ..Default::default()
    };

    fixture
        .node
        .node_stage_volume(Request::new(stage.clone()))
        .await
        .unwrap();
    fixture
        .node
        .node_stage_volume(Request::new(stage))
        .await
        .unwrap();

    assert_eq!(fixture.host.count(" -l"), 1);
    assert_eq!(
        std::fs::read_to_string(staging.join("iscsi")).unwrap(),
        iscsi.target
    );
    assert_eq!(std::fs::read_link(staging.join("device")).unwrap(), device);

    fixture
        .node
        .node_unstage_volume(Request::new(csi::NodeUnstageVolumeRequest {
            volume_id: volume.volume_id,
            staging_target_path: path_str(&staging),
        }))
        .await
        .unwrap();

    assert_eq!(fixture.host.count(" -u"), 1);
    assert!(!staging.join("iscsi").exists());
    assert!(std::fs::symlink_metadata(staging.join("device")).is_err());
}

#[tokio::test]
async fn test_publish_controller_nfs_volume() {
    let (svc, _nas) = controller();
    let volume = create(
        &svc,
        create_request("pvc-1", vec![mount(Mode::MultiNodeMultiWriter)], 0, 0),
    )
    .await;

    let fixture = NodeFixture::new();
    let target = fixture.root.path().join("pods").join("vol");

    fixture
        .node
        .node_publish_volume(Request::new(csi::NodePublishVolumeRequest {
            volume_id: volume.volume_id,
            target_path: path_str(&target),
            volume_capability: Some(mount(Mode::MultiNodeMultiWriter)),
            readonly: true,
            volume_context: volume.volume_context,
            ..Default::default()
        }))
        .await
        .unwrap();

    assert!(target.is_dir());
    let address = format!("10.0.0.5:/mnt/tank/k8s/{}", PVC1_HASH);
    assert_eq!(
        fixture.host.count(&format!("mount -o ro {} {}", address, path_str(&target))),
        1
    );
    assert_eq!(fixture.host.count("iscsiadm"), 0);
}
