//! TrueNAS CSI Driver Library
//!
//! Kubernetes CSI driver that provisions volumes on a TrueNAS appliance
//! through its REST API and attaches them to worker nodes over NFS or iSCSI.
//!
//! This library provides:
//! - CSI Identity, Controller, and Node service implementations
//! - Backend resolution from the controller YAML configuration
//! - The volume context codec shared by controller and node
//! - Linux node primitives (iscsiadm, mount, mkfs, resize)

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod config;
pub mod controller;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod naming;
pub mod node;
pub mod platform;
pub mod volume_context;

pub use config::Resolver;
pub use controller::ControllerService;
pub use identity::{DRIVER_NAME, DRIVER_VERSION, IdentityService};
pub use naming::VolumeId;
pub use node::NodeService;
pub use volume_context::VolumeContext;
