//! Repository configuration
//!
//! Every field has a default, so a missing file is a valid configuration.
//! A TOML file (`~/.config/iconrepo/config.toml` unless `ICONREPO_CONFIG`
//! says otherwise) overrides the defaults, and `ICONREPO_DATA_DIR`,
//! `ICONREPO_LOG_LEVEL`, `ICONREPO_GITLAB_ACCESS_TOKEN` and
//! `ICONREPO_DYNAMODB_URL` override the file.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::blobstore::DEFAULT_API_BASE;
use crate::lock::LockManagerConfig;

const ENV_PREFIX: &str = "ICONREPO";

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory for the SQLite database and the local blobstore
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[serde(default)]
    pub log_level: Option<String>,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub blobstore: BlobstoreConfig,

    #[serde(default)]
    pub locking: LockingConfig,
}

/// Which index repository to use
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IndexConfig {
    Sqlite {
        /// Defaults to `<data_dir>/iconrepo.db`
        #[serde(default)]
        path: Option<PathBuf>,
    },
    #[serde(rename = "dynamodb")]
    DynamoDb {
        #[serde(default)]
        endpoint_url: Option<String>,
        #[serde(default = "default_region")]
        region: String,
    },
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig::Sqlite { path: None }
    }
}

/// Which blobstore repository to use
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BlobstoreConfig {
    Local {
        /// Defaults to `<data_dir>/blobstore`
        #[serde(default)]
        location: Option<PathBuf>,
    },
    Gitlab {
        #[serde(default = "default_api_base")]
        api_base: String,
        namespace_path: String,
        #[serde(default = "default_project_path")]
        project_path: String,
        #[serde(default = "default_main_branch")]
        main_branch: String,
        #[serde(default)]
        access_token: String,
    },
}

impl Default for BlobstoreConfig {
    fn default() -> Self {
        BlobstoreConfig::Local { location: None }
    }
}

/// Lease timing for the document-store index, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    pub lease_ms: u64,
    /// A third of the lease when not set; must stay below `lease_ms`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_ms: Option<u64>,
    pub acquire_timeout_ms: u64,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            lease_ms: 6000,
            heartbeat_ms: None,
            acquire_timeout_ms: 30_000,
        }
    }
}

impl LockingConfig {
    pub fn heartbeat_ms(&self) -> u64 {
        self.heartbeat_ms.unwrap_or(self.lease_ms / 3)
    }

    /// A heartbeat that does not fire before the lease runs out lets a live
    /// holder lose its lock
    pub fn validate(&self) -> Result<()> {
        if self.lease_ms == 0 {
            bail!("locking.lease_ms must be greater than zero");
        }
        let heartbeat = self.heartbeat_ms();
        if heartbeat == 0 || heartbeat >= self.lease_ms {
            bail!(
                "locking.heartbeat_ms ({}) must be greater than zero and below locking.lease_ms ({})",
                heartbeat,
                self.lease_ms
            );
        }
        Ok(())
    }

    pub fn to_lock_manager_config(&self) -> LockManagerConfig {
        LockManagerConfig {
            heartbeat: Duration::from_millis(self.heartbeat_ms()),
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            ..LockManagerConfig::with_lease(Duration::from_millis(self.lease_ms))
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: None,
            index: IndexConfig::default(),
            blobstore: BlobstoreConfig::default(),
            locking: LockingConfig::default(),
        }
    }
}

impl Config {
    /// Read the file at `path` (defaults when it is absent), then apply
    /// `ICONREPO_*` overrides and create the data directory
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text)
                .with_context(|| format!("Invalid TOML in {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("Cannot read {}", path.display()));
            }
        };

        config.apply_env_overrides();
        config
            .locking
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("Cannot create data directory {}", config.data_dir.display())
        })?;
        Ok(config)
    }

    /// Parse TOML text and apply `ICONREPO_*` overrides; touches no files
    pub fn load_from_str(text: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(text).context("Invalid configuration TOML")?;
        config.apply_env_overrides();
        config.locking.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        let var = |name: &str| {
            std::env::var(format!("{}_{}", ENV_PREFIX, name))
                .ok()
                .filter(|val| !val.is_empty())
        };

        if let Some(val) = var("DATA_DIR") {
            self.data_dir = PathBuf::from(val);
        }

        if let Some(val) = var("LOG_LEVEL") {
            self.log_level = Some(val);
        }

        // Only meaningful for the GitLab blobstore
        if let Some(val) = var("GITLAB_ACCESS_TOKEN") {
            if let BlobstoreConfig::Gitlab { access_token, .. } = &mut self.blobstore {
                *access_token = val;
            }
        }

        // Selects the DynamoDB index
        if let Some(val) = var("DYNAMODB_URL") {
            self.index = match &self.index {
                IndexConfig::DynamoDb { region, .. } => IndexConfig::DynamoDb {
                    endpoint_url: Some(val),
                    region: region.clone(),
                },
                IndexConfig::Sqlite { .. } => IndexConfig::DynamoDb {
                    endpoint_url: Some(val),
                    region: default_region(),
                },
            };
        }
    }

    /// Write as TOML, creating parent directories
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Cannot create {}", dir.display()))?;
        }
        let text = toml::to_string_pretty(self).context("Cannot encode configuration")?;
        std::fs::write(path, text).with_context(|| format!("Cannot write {}", path.display()))
    }

    /// `ICONREPO_CONFIG`, or `iconrepo/config.toml` under the user config directory
    pub fn config_file_path() -> PathBuf {
        match std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => dirs::config_dir()
                .unwrap_or_default()
                .join("iconrepo")
                .join("config.toml"),
        }
    }

    /// Explicit SQLite path, else `<data_dir>/iconrepo.db`
    pub fn sqlite_path(&self) -> PathBuf {
        match &self.index {
            IndexConfig::Sqlite { path: Some(path) } => path.clone(),
            _ => self.data_dir.join("iconrepo.db"),
        }
    }

    /// Explicit local blobstore directory, else `<data_dir>/blobstore`
    pub fn blobstore_location(&self) -> PathBuf {
        match &self.blobstore {
            BlobstoreConfig::Local {
                location: Some(location),
            } => location.clone(),
            _ => self.data_dir.join("blobstore"),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir().unwrap_or_default().join("iconrepo")
}

fn default_region() -> String {
    "eu-west-1".to_string()
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_project_path() -> String {
    "icons".to_string()
}

fn default_main_branch() -> String {
    "main".to_string()
}
