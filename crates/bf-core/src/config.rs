//! Build farm configuration (JSON).
//!
//! One `FarmConfig` is loaded at process start and passed by reference to
//! every component. `bfd setup` fills in the provisioned `cluster` and
//! `infra_endpoint`; `bfd teardown` removes them again.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::backend::sha256_hex;

/// Inline JSON configuration, takes precedence over any file.
pub const CONFIG_ENV: &str = "INFRA_CONFIG";

/// Path of the configuration file.
pub const CONFIG_PATH_ENV: &str = "INFRA_LOCAL_CONFIG";

/// Result type alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot write config file '{}': {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse JSON config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("'{0}' is not set; has the farm been set up?")]
    NotProvisioned(&'static str),

    #[error("cannot locate a config file: neither $INFRA_LOCAL_CONFIG nor $HOME is set")]
    NoPath,
}

/// Names of the stacks forming one farm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackNames {
    pub infra: String,
    pub server: String,
    pub workers: String,
}

/// Network placement of the farm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VpcConfig {
    New {
        vpc_cidr: String,
        public_subnet1_cidr: String,
    },
    Existing {
        vpc_id: String,
        public_subnet1_id: String,
    },
}

/// How servers and workers authenticate each other and clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthConfig {
    /// Certificates stored as one JSON object in the object store.
    Simple { bucket: String, key: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FarmConfig {
    pub region: String,
    pub stacks: StackNames,
    pub server_image: String,
    pub worker_image: String,
    pub awslogs_region: String,
    pub awslogs_group: String,
    /// Toolchain target passed to the build tool.
    pub crosstool_top: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc: Option<VpcConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
    /// Container cluster name, set by setup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    /// Control endpoint URL, set by setup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infra_endpoint: Option<String>,
    #[serde(default)]
    pub debug: bool,
}

impl FarmConfig {
    pub fn from_json(json: &str) -> ConfigResult<Self> {
        let config: FarmConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&content)?;
        debug!(?path, "config loaded");
        Ok(config)
    }

    /// Default location: `$INFRA_LOCAL_CONFIG`, else `~/.bazel_bf/config.json`.
    pub fn default_path() -> ConfigResult<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Ok(PathBuf::from(path));
        }
        let home = std::env::var("HOME").map_err(|_| ConfigError::NoPath)?;
        Ok(Path::new(&home).join(".bazel_bf").join("config.json"))
    }

    /// Load from `$INFRA_CONFIG` if set, else from [`Self::default_path`].
    pub fn load() -> ConfigResult<Self> {
        if let Ok(inline) = std::env::var(CONFIG_ENV)
            && !inline.trim().is_empty()
        {
            return Self::from_json(&inline);
        }
        Self::from_file(&Self::default_path()?)
    }

    /// Pretty JSON with sorted keys.
    pub fn to_json_pretty(&self) -> ConfigResult<String> {
        // serde_json's Value map is ordered by key.
        let value = serde_json::to_value(self)?;
        Ok(serde_json::to_string_pretty(&value)?)
    }

    /// Write the config unless the file already holds identical content.
    ///
    /// Returns whether the file was written.
    pub fn write_to(&self, path: &Path) -> ConfigResult<bool> {
        self.validate()?;
        let next = self.to_json_pretty()?;
        if let Ok(current) = std::fs::read(path)
            && sha256_hex(&current) == sha256_hex(next.as_bytes())
        {
            info!(?path, "config up-to-date");
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, next).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        info!(?path, "config written");
        Ok(true)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let required = [
            ("region", &self.region),
            ("stacks.infra", &self.stacks.infra),
            ("stacks.server", &self.stacks.server),
            ("stacks.workers", &self.stacks.workers),
            ("server_image", &self.server_image),
            ("worker_image", &self.worker_image),
            ("awslogs_region", &self.awslogs_region),
            ("awslogs_group", &self.awslogs_group),
            ("crosstool_top", &self.crosstool_top),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("'{name}' must not be empty")));
            }
        }

        let stacks = &self.stacks;
        if stacks.infra == stacks.server
            || stacks.infra == stacks.workers
            || stacks.server == stacks.workers
        {
            return Err(ConfigError::Invalid(
                "stack names must be distinct".to_string(),
            ));
        }

        if let Some(AuthConfig::Simple { bucket, key }) = &self.auth
            && (bucket.is_empty() || key.is_empty())
        {
            return Err(ConfigError::Invalid(
                "auth.simple requires both 'bucket' and 'key'".to_string(),
            ));
        }
        Ok(())
    }

    /// Task family of the build servers.
    pub fn server_family(&self) -> String {
        format!("{}-BuildFarm-Server", self.stacks.server)
    }

    /// Task family of the build workers.
    pub fn worker_family(&self) -> String {
        format!("{}-BuildFarm-Worker", self.stacks.workers)
    }

    pub fn cluster(&self) -> ConfigResult<&str> {
        self.cluster
            .as_deref()
            .ok_or(ConfigError::NotProvisioned("cluster"))
    }

    pub fn infra_endpoint(&self) -> ConfigResult<&str> {
        self.infra_endpoint
            .as_deref()
            .ok_or(ConfigError::NotProvisioned("infra_endpoint"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "region": "eu-west-1",
        "stacks": {"infra": "infra_stack", "server": "server_stack", "workers": "workers_stack"},
        "server_image": "some_server_image",
        "worker_image": "some_worker_image",
        "awslogs_region": "eu-west-1",
        "awslogs_group": "buildfarm",
        "crosstool_top": "@bazel_toolchains//configs/ubuntu16_04_clang/1.0:toolchain",
        "vpc": {"new": {"vpc_cidr": "10.0.0.0/16", "public_subnet1_cidr": "10.0.0.0/24"}}
    }"#;

    #[test]
    fn parse_minimal() {
        let config = FarmConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.stacks.server, "server_stack");
        assert_eq!(config.auth, None);
        assert!(!config.debug);
        assert!(matches!(config.vpc, Some(VpcConfig::New { .. })));
    }

    #[test]
    fn task_families() {
        let config = FarmConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.server_family(), "server_stack-BuildFarm-Server");
        assert_eq!(config.worker_family(), "workers_stack-BuildFarm-Worker");
    }

    #[test]
    fn simple_auth_is_externally_tagged() {
        let mut value: serde_json::Value = serde_json::from_str(SAMPLE).unwrap();
        value["auth"] = serde_json::json!({"simple": {"bucket": "b", "key": "k"}});
        let config = FarmConfig::from_json(&value.to_string()).unwrap();
        assert_eq!(
            config.auth,
            Some(AuthConfig::Simple {
                bucket: "b".to_string(),
                key: "k".to_string()
            })
        );
    }

    #[test]
    fn rejects_duplicate_stack_names() {
        let mut config = FarmConfig::from_json(SAMPLE).unwrap();
        config.stacks.workers = config.stacks.server.clone();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_empty_fields() {
        let mut config = FarmConfig::from_json(SAMPLE).unwrap();
        config.worker_image = " ".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("worker_image"));
    }

    #[test]
    fn unprovisioned_fields_error() {
        let config = FarmConfig::from_json(SAMPLE).unwrap();
        assert!(matches!(config.cluster(), Err(ConfigError::NotProvisioned("cluster"))));
    }

    #[test]
    fn write_is_skipped_when_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = FarmConfig::from_json(SAMPLE).unwrap();

        assert!(config.write_to(&path).unwrap());
        assert!(!config.write_to(&path).unwrap());

        config.cluster = Some("cluster-1".to_string());
        assert!(config.write_to(&path).unwrap());

        let back = FarmConfig::from_file(&path).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn pretty_json_has_sorted_keys() {
        let config = FarmConfig::from_json(SAMPLE).unwrap();
        let json = config.to_json_pretty().unwrap();
        let awslogs = json.find("\"awslogs_group\"").unwrap();
        let region = json.find("\"region\"").unwrap();
        let worker = json.find("\"worker_image\"").unwrap();
        assert!(awslogs < region && region < worker);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FarmConfig::from_file(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
