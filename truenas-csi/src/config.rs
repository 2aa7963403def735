//! Controller configuration and backend resolution.
//!
//! The controller reads a YAML file mapping backend names to NAS
//! definitions. Each backend carries named configurations (a dataset root
//! plus provisioning settings); CreateVolume picks one through request
//! parameters.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;
use truenas_api::{Credentials, HttpNasClient, NasApi, NasError};

/// Request parameter selecting the backend
pub const NAS_PARAMETER: &str = "truenas-csi.dravanet.net/nas";
/// Request parameter selecting the configuration within the backend
pub const CONFIG_PARAMETER: &str = "truenas-csi.dravanet.net/config";
/// Value used when a selector parameter is absent
pub const DEFAULT_SELECTOR: &str = "default";

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("configuration defines no backends")]
    NoBackends,

    #[error("backend '{0}' defines no configurations")]
    NoConfigurations(String),

    #[error("backend '{0}' needs api_key, or username and password")]
    MissingCredentials(String),

    #[error("backend '{0}' has an empty api_url")]
    MissingApiUrl(String),

    #[error("backend '{backend}' uses dataset root '{dataset}' more than once")]
    DuplicateDatasetRoot { backend: String, dataset: String },

    #[error("backend '{backend}' configuration '{config}' has invalid dataset '{dataset}'")]
    InvalidDataset {
        backend: String,
        config: String,
        dataset: String,
    },

    #[error("backend '{backend}' configuration '{config}' has neither nfs nor iscsi settings")]
    NoProtocol { backend: String, config: String },

    #[error("invalid delete policy '{0}': expected 'delete' or 'retain'")]
    InvalidDeletePolicy(String),

    #[error("backend '{backend}': {source}")]
    Client { backend: String, source: NasError },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

// ============================================================================
// DeletePolicy
// ============================================================================

/// What DeleteVolume does with the dataset once its exports are gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletePolicy {
    /// Destroy the dataset (default)
    #[default]
    Delete,
    /// Leave the dataset in place
    Retain,
}

impl fmt::Display for DeletePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeletePolicy::Delete => write!(f, "delete"),
            DeletePolicy::Retain => write!(f, "retain"),
        }
    }
}

impl FromStr for DeletePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "delete" => Ok(DeletePolicy::Delete),
            "retain" => Ok(DeletePolicy::Retain),
            _ => Err(ConfigError::InvalidDeletePolicy(s.to_string())),
        }
    }
}

impl<'de> Deserialize<'de> for DeletePolicy {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// File format
// ============================================================================

/// NFS export settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NfsSettings {
    /// Address clients mount from
    pub server: String,
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default)]
    pub allowed_networks: Vec<String>,
}

/// iSCSI export settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IscsiSettings {
    /// Portal address handed to nodes
    pub portal: String,
    /// Portal group id on the NAS
    pub portal_id: i64,
    #[serde(default)]
    pub volblocksize: Option<String>,
    #[serde(default)]
    pub disable_report_block_size: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigurationFile {
    pub dataset: String,
    #[serde(default)]
    pub delete_policy: DeletePolicy,
    #[serde(default)]
    pub sparse: bool,
    /// Replaces the backend-level NFS settings
    #[serde(default)]
    pub nfs: Option<NfsSettings>,
    /// Replaces the backend-level iSCSI settings
    #[serde(default)]
    pub iscsi: Option<IscsiSettings>,
}

#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendFile {
    pub api_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub nfs: Option<NfsSettings>,
    #[serde(default)]
    pub iscsi: Option<IscsiSettings>,
    pub configurations: BTreeMap<String, ConfigurationFile>,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl fmt::Debug for BackendFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendFile")
            .field("api_url", &self.api_url)
            .field("username", &self.username)
            .field("timeout_secs", &self.timeout_secs)
            .field("configurations", &self.configurations.keys())
            .finish_non_exhaustive()
    }
}

impl BackendFile {
    /// API key wins over basic auth when both are given.
    pub fn credentials(&self) -> Option<Credentials> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Some(Credentials::ApiKey(key.clone()));
        }
        match (&self.username, &self.password) {
            (Some(username), Some(password)) if !username.is_empty() => Some(Credentials::Basic {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

/// The whole controller configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct ControllerConfig {
    pub backends: BTreeMap<String, BackendFile>,
}

impl ControllerConfig {
    /// Parse and validate YAML.
    pub fn parse(yaml: &str) -> Result<Self> {
        let config: ControllerConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a file.
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&yaml)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }

        for (name, backend) in &self.backends {
            if backend.api_url.trim().is_empty() {
                return Err(ConfigError::MissingApiUrl(name.clone()));
            }
            if backend.credentials().is_none() {
                return Err(ConfigError::MissingCredentials(name.clone()));
            }
            if backend.configurations.is_empty() {
                return Err(ConfigError::NoConfigurations(name.clone()));
            }

            let mut roots = HashSet::new();
            for (config_name, config) in &backend.configurations {
                let dataset = &config.dataset;
                if dataset.is_empty()
                    || dataset.starts_with('/')
                    || dataset.ends_with('/')
                    || dataset.split('/').any(|c| c.is_empty() || c == "..")
                {
                    return Err(ConfigError::InvalidDataset {
                        backend: name.clone(),
                        config: config_name.clone(),
                        dataset: dataset.clone(),
                    });
                }

                if !roots.insert(dataset.as_str()) {
                    return Err(ConfigError::DuplicateDatasetRoot {
                        backend: name.clone(),
                        dataset: dataset.clone(),
                    });
                }

                let has_nfs = config.nfs.is_some() || backend.nfs.is_some();
                let has_iscsi = config.iscsi.is_some() || backend.iscsi.is_some();
                if !has_nfs && !has_iscsi {
                    return Err(ConfigError::NoProtocol {
                        backend: name.clone(),
                        config: config_name.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Build a resolver talking to each backend over HTTP.
    pub fn into_resolver(self) -> Result<Resolver> {
        self.into_resolver_with(|name, backend| {
            let credentials = backend
                .credentials()
                .ok_or_else(|| ConfigError::MissingCredentials(name.to_string()))?;
            let client = HttpNasClient::new(
                &backend.api_url,
                credentials,
                Duration::from_secs(backend.timeout_secs),
            )
            .map_err(|source| ConfigError::Client {
                backend: name.to_string(),
                source,
            })?;
            Ok(Arc::new(client) as Arc<dyn NasApi>)
        })
    }

    /// Build a resolver with clients produced by `connect`.
    pub fn into_resolver_with<F>(self, mut connect: F) -> Result<Resolver>
    where
        F: FnMut(&str, &BackendFile) -> Result<Arc<dyn NasApi>>,
    {
        let mut backends = BTreeMap::new();

        for (name, file) in self.backends {
            let client = connect(&name, &file)?;

            let configurations = file
                .configurations
                .iter()
                .map(|(config_name, config)| {
                    let resolved = Configuration {
                        name: config_name.clone(),
                        dataset: config.dataset.clone(),
                        delete_policy: config.delete_policy,
                        sparse: config.sparse,
                        nfs: config.nfs.clone().or_else(|| file.nfs.clone()),
                        iscsi: config.iscsi.clone().or_else(|| file.iscsi.clone()),
                    };
                    (config_name.clone(), resolved)
                })
                .collect();

            info!(backend = %name, api_url = %file.api_url, "Configured NAS backend");
            backends.insert(
                name.clone(),
                Backend {
                    name,
                    client,
                    configurations,
                },
            );
        }

        Ok(Resolver { backends })
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// A configuration with backend-level defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub name: String,
    /// Dataset root under which volumes are created
    pub dataset: String,
    pub delete_policy: DeletePolicy,
    pub sparse: bool,
    pub nfs: Option<NfsSettings>,
    pub iscsi: Option<IscsiSettings>,
}

/// A NAS and the configurations provisioned on it.
pub struct Backend {
    pub name: String,
    pub client: Arc<dyn NasApi>,
    configurations: BTreeMap<String, Configuration>,
}

impl Backend {
    pub fn configuration(&self, name: &str) -> Option<&Configuration> {
        self.configurations.get(name)
    }

    /// The configuration whose dataset root is `root`.
    pub fn configuration_for_root(&self, root: &str) -> Option<&Configuration> {
        self.configurations.values().find(|c| c.dataset == root)
    }
}

/// Maps request selectors and volume ids to backends.
pub struct Resolver {
    backends: BTreeMap<String, Backend>,
}

impl Resolver {
    pub fn backend(&self, name: &str) -> Option<&Backend> {
        self.backends.get(name)
    }

    pub fn backend_names(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }

    /// Resolve a (backend, configuration) selector.
    pub fn lookup(&self, backend: &str, config: &str) -> Option<(&Backend, &Configuration)> {
        let b = self.backends.get(backend)?;
        let c = b.configuration(config)?;
        Some((b, c))
    }

    /// Resolve the selector carried in CreateVolume parameters.
    pub fn lookup_parameters(
        &self,
        parameters: &std::collections::HashMap<String, String>,
    ) -> (String, String, Option<(&Backend, &Configuration)>) {
        let backend = parameters
            .get(NAS_PARAMETER)
            .map(String::as_str)
            .unwrap_or(DEFAULT_SELECTOR)
            .to_string();
        let config = parameters
            .get(CONFIG_PARAMETER)
            .map(String::as_str)
            .unwrap_or(DEFAULT_SELECTOR)
            .to_string();
        let found = self.lookup(&backend, &config);
        (backend, config, found)
    }

    /// Delete policy of the configuration rooted at `root`.
    pub fn delete_policy(&self, backend: &str, root: &str) -> Option<DeletePolicy> {
        self.backends
            .get(backend)?
            .configuration_for_root(root)
            .map(|c| c.delete_policy)
    }

    /// Sparse flag of the configuration rooted at `root`.
    pub fn sparse(&self, backend: &str, root: &str) -> Option<bool> {
        self.backends
            .get(backend)?
            .configuration_for_root(root)
            .map(|c| c.sparse)
    }
}
