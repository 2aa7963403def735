//! Deterministic names for remote objects and the VolumeID format.
//!
//! The NAS-side name of every object belonging to a volume is derived from
//! the CO-supplied volume name, so a retried CreateVolume lands on the same
//! dataset, extent and target without any local bookkeeping.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Where the NAS mounts its pools.
pub const MOUNT_PREFIX: &str = "/mnt/";

/// Bytes of the SHA-256 digest kept in a derived name (40 hex chars).
const NAME_HASH_BYTES: usize = 20;

/// Hash a volume name into the leaf name used for its dataset, extent,
/// target and CHAP user.
pub fn hashed_name(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    hex::encode(&digest[..NAME_HASH_BYTES])
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VolumeIdError {
    #[error("volume id '{0}' has no backend separator")]
    MissingSeparator(String),

    #[error("volume id '{0}' has an empty backend")]
    EmptyBackend(String),

    #[error("volume id '{0}' does not reference a path under /mnt/")]
    NotUnderMount(String),
}

/// `<backend>:/mnt/<dataset>`, the only durable identity of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeId {
    backend: String,
    dataset: String,
}

impl VolumeId {
    pub fn new(backend: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            dataset: dataset.into(),
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Dataset name as the NAS API knows it (e.g. "tank/k8s/f286...").
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Parent dataset, which is the configuration's dataset root.
    pub fn dataset_root(&self) -> Option<&str> {
        self.dataset.rsplit_once('/').map(|(root, _)| root)
    }

    /// Absolute path of the dataset on the NAS.
    pub fn mount_path(&self) -> String {
        mount_path(&self.dataset)
    }
}

/// Absolute path of `dataset` on the NAS.
pub fn mount_path(dataset: &str) -> String {
    format!("{}{}", MOUNT_PREFIX, dataset)
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}{}", self.backend, MOUNT_PREFIX, self.dataset)
    }
}

impl FromStr for VolumeId {
    type Err = VolumeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (backend, path) = s
            .split_once(':')
            .ok_or_else(|| VolumeIdError::MissingSeparator(s.to_string()))?;

        if backend.is_empty() {
            return Err(VolumeIdError::EmptyBackend(s.to_string()));
        }

        let dataset = path
            .strip_prefix(MOUNT_PREFIX)
            .filter(|d| !d.is_empty())
            .ok_or_else(|| VolumeIdError::NotUnderMount(s.to_string()))?;

        Ok(Self::new(backend, dataset))
    }
}
