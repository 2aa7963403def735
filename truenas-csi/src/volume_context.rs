//! Attachment descriptor handed from the controller to the node.
//!
//! The CO stores `volume_context` as an opaque string map; the driver keeps a
//! single entry, `b64`, holding base64(JSON) of [`VolumeContext`].

use std::collections::HashMap;
use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Map key holding the encoded context.
pub const VOLUME_CONTEXT_KEY: &str = "b64";

#[derive(Error, Debug)]
pub enum VolumeContextError {
    #[error("volume context has no 'b64' entry")]
    Missing,

    #[error("volume context is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("volume context is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, VolumeContextError>;

/// What a node needs to attach a volume: an NFS address or an iSCSI target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iscsi: Option<IscsiContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nfs: Option<NfsContext>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IscsiContext {
    /// `host[:port]` of the NAS portal
    pub portal: String,
    /// Fully qualified target name (`<basename>:<name>`)
    pub target: String,
    /// Credentials the initiator presents to the target
    #[serde(rename = "inAuth", default, skip_serializing_if = "Option::is_none")]
    pub in_auth: Option<ChapCredentials>,
    /// Credentials the target presents back (mutual CHAP)
    #[serde(rename = "outAuth", default, skip_serializing_if = "Option::is_none")]
    pub out_auth: Option<ChapCredentials>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ChapCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChapCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfsContext {
    /// `server:/mnt/<dataset>`
    pub address: String,
}

impl VolumeContext {
    pub fn nfs(address: impl Into<String>) -> Self {
        Self {
            iscsi: None,
            nfs: Some(NfsContext {
                address: address.into(),
            }),
        }
    }

    pub fn iscsi(context: IscsiContext) -> Self {
        Self {
            iscsi: Some(context),
            nfs: None,
        }
    }

    /// Encode into the string map carried in `volume_context`.
    pub fn encode(&self) -> Result<HashMap<String, String>> {
        let json = serde_json::to_vec(self)?;
        let mut map = HashMap::new();
        map.insert(VOLUME_CONTEXT_KEY.to_string(), STANDARD.encode(json));
        Ok(map)
    }

    /// Decode from a `volume_context` map. Other entries are ignored.
    pub fn decode(map: &HashMap<String, String>) -> Result<Self> {
        let encoded = map
            .get(VOLUME_CONTEXT_KEY)
            .ok_or(VolumeContextError::Missing)?;
        let json = STANDARD.decode(encoded)?;
        Ok(serde_json::from_slice(&json)?)
    }
}
