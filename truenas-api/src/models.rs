//! Wire types for the NAS REST resources used by the driver.
//!
//! Request bodies skip unset optional fields so a partial update only
//! touches the properties it names.

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Datasets
// ============================================================================

/// Kind of a pool dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DatasetKind {
    /// A filesystem dataset, exported over NFS
    Filesystem,
    /// A zvol, exported as an iSCSI extent
    Volume,
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetKind::Filesystem => write!(f, "FILESYSTEM"),
            DatasetKind::Volume => write!(f, "VOLUME"),
        }
    }
}

/// A dataset as reported by `GET pool/dataset/id/<id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    /// Full dataset name (e.g., "tank/k8s/0123abcd")
    pub id: String,
    pub kind: DatasetKind,
    /// User comment, used as the correlation tag
    pub comments: String,
    pub volsize: Option<i64>,
    pub refquota: Option<i64>,
    pub refreservation: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct PropertyWire {
    #[serde(default)]
    rawvalue: Option<String>,
    #[serde(default)]
    parsed: Option<serde_json::Value>,
}

impl PropertyWire {
    fn parsed_i64(&self) -> Option<i64> {
        match &self.parsed {
            Some(serde_json::Value::Number(n)) => n.as_i64(),
            Some(serde_json::Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DatasetWire {
    id: String,
    #[serde(rename = "type")]
    kind: DatasetKind,
    #[serde(default)]
    comments: Option<PropertyWire>,
    #[serde(default)]
    volsize: Option<PropertyWire>,
    #[serde(default)]
    refquota: Option<PropertyWire>,
    #[serde(default)]
    refreservation: Option<PropertyWire>,
}

impl<'de> Deserialize<'de> for Dataset {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = DatasetWire::deserialize(deserializer)?;
        Ok(Dataset {
            id: wire.id,
            kind: wire.kind,
            comments: wire
                .comments
                .and_then(|c| c.rawvalue)
                .unwrap_or_default(),
            volsize: wire.volsize.as_ref().and_then(PropertyWire::parsed_i64),
            refquota: wire.refquota.as_ref().and_then(PropertyWire::parsed_i64),
            refreservation: wire
                .refreservation
                .as_ref()
                .and_then(PropertyWire::parsed_i64),
        })
    }
}

/// Body of `POST pool/dataset`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetCreate {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DatasetKind,
    pub comments: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volsize: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sparse: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volblocksize: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refquota: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refreservation: Option<i64>,
}

impl DatasetCreate {
    /// A zvol of `volsize` bytes.
    pub fn volume(name: impl Into<String>, comments: impl Into<String>, volsize: i64) -> Self {
        Self {
            name: name.into(),
            kind: DatasetKind::Volume,
            comments: comments.into(),
            volsize: Some(volsize),
            sparse: None,
            volblocksize: None,
            refquota: None,
            refreservation: None,
        }
    }

    /// A filesystem dataset without quota or reservation.
    pub fn filesystem(name: impl Into<String>, comments: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DatasetKind::Filesystem,
            comments: comments.into(),
            volsize: None,
            sparse: None,
            volblocksize: None,
            refquota: None,
            refreservation: None,
        }
    }
}

/// Body of `PUT pool/dataset/id/<id>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DatasetUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volsize: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refquota: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refreservation: Option<i64>,
}

/// Body of `DELETE pool/dataset/id/<id>`.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetDelete {
    pub recursive: bool,
}

/// Body of `POST pool/dataset/id/<id>/permission`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PermissionUpdate {
    pub mode: String,
    pub acl: Vec<serde_json::Value>,
}

impl PermissionUpdate {
    /// Mode 0777 with an empty ACL.
    pub fn world_writable() -> Self {
        Self {
            mode: "0777".to_string(),
            acl: Vec::new(),
        }
    }
}

// ============================================================================
// NFS shares
// ============================================================================

/// An NFS share. Older releases report `paths`, newer ones a single `path`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NfsShare {
    pub id: i64,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub comment: String,
}

impl NfsShare {
    /// All exported paths, whichever field the NAS used.
    pub fn exported_paths(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.paths.iter().map(String::as_str).collect();
        if let Some(path) = &self.path
            && !out.contains(&path.as_str())
        {
            out.push(path);
        }
        out
    }
}

/// Body of `POST sharing/nfs`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NfsShareCreate {
    pub enabled: bool,
    pub paths: Vec<String>,
    pub comment: String,
    pub hosts: Vec<String>,
    pub networks: Vec<String>,
    pub maproot_user: String,
    pub maproot_group: String,
}

// ============================================================================
// iSCSI
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IscsiExtent {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub disk: Option<String>,
    #[serde(default)]
    pub comment: String,
}

/// Body of `POST iscsi/extent`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IscsiExtentCreate {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub disk: String,
    pub comment: String,
    pub serial: String,
    pub insecure_tpc: bool,
    pub pblocksize: bool,
}

/// A portal group binding of a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroup {
    pub portal: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator: Option<i64>,
    pub authmethod: String,
    #[serde(default)]
    pub auth: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IscsiTarget {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub groups: Vec<TargetGroup>,
}

/// Body of `POST iscsi/target`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IscsiTargetCreate {
    pub name: String,
    pub groups: Vec<TargetGroup>,
}

/// A CHAP credential entry. `tag` groups entries for a target.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IscsiAuth {
    pub id: i64,
    pub tag: i64,
    pub user: String,
    pub secret: String,
    #[serde(default)]
    pub peeruser: String,
    #[serde(default)]
    pub peersecret: String,
}

/// Body of `POST iscsi/auth`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IscsiAuthCreate {
    pub tag: i64,
    pub user: String,
    pub secret: String,
}

/// Body of `PUT iscsi/auth/id/<id>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IscsiAuthUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<i64>,
}

/// How to look up CHAP entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFilter {
    User(String),
    Tag(i64),
}

impl AuthFilter {
    /// Query parameter for the filter.
    pub fn query(&self) -> (&'static str, String) {
        match self {
            AuthFilter::User(user) => ("user", user.clone()),
            AuthFilter::Tag(tag) => ("tag", tag.to_string()),
        }
    }

    pub fn matches(&self, auth: &IscsiAuth) -> bool {
        match self {
            AuthFilter::User(user) => &auth.user == user,
            AuthFilter::Tag(tag) => auth.tag == *tag,
        }
    }
}

/// A target to extent (LUN) association.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TargetExtent {
    pub id: i64,
    pub target: i64,
    pub extent: i64,
    #[serde(default)]
    pub lunid: Option<i64>,
}

/// Body of `POST iscsi/targetextent`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetExtentCreate {
    pub target: i64,
    pub extent: i64,
    pub lunid: i64,
}

/// Global iSCSI settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct IscsiGlobal {
    #[serde(default)]
    pub basename: Option<String>,
}

/// Identifier returned by create calls.
#[derive(Debug, Deserialize)]
pub(crate) struct Created {
    pub id: i64,
}
