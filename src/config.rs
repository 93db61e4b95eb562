//! Configuration management for Apiguard.
//!
//! Configuration is read once at startup from an optional YAML file and
//! `APIGUARD__`-prefixed environment variables, e.g.
//! `APIGUARD__STORAGE__DEPLOYMENT=production` or
//! `APIGUARD__STORAGE__REDIS_URL=redis://cache:6379/`.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{GuardError, Result};
use crate::ratelimit::{
    LocalStorage, PolicyRouter, PolicyTable, PolicyTableConfig, SharedStorage, Storage,
    StorageBackends, StorageKind,
};

/// Main configuration for the Apiguard service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Route table; the built-in marketplace table when absent
    #[serde(default)]
    pub policies: Option<PolicyTableConfig>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

/// Deployment flavour. Production deployments keep counters in the shared
/// store so every instance sees the same budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Deployment {
    #[default]
    Development,
    Production,
}

impl Deployment {
    /// Storage used by policies that do not pick one.
    pub fn default_storage(self) -> StorageKind {
        match self {
            Deployment::Development => StorageKind::Local,
            Deployment::Production => StorageKind::Shared,
        }
    }
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Deployment flavour
    #[serde(default)]
    pub deployment: Deployment,

    /// Redis URL for the shared store
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Bound on each shared store round trip, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// How often expired local counters are purged, in seconds
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            deployment: Deployment::default(),
            redis_url: None,
            timeout_ms: default_timeout_ms(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    250
}

fn default_purge_interval() -> u64 {
    60
}

impl GuardConfig {
    /// Load configuration from an optional YAML file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Yaml),
            );
        }

        let config: GuardConfig = builder
            .add_source(
                ::config::Environment::with_prefix("APIGUARD")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GuardConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check everything that can be checked without connecting anywhere.
    pub fn validate(&self) -> Result<()> {
        let table = self.policy_table()?;
        let needs_shared = table.policies().any(|p| p.storage == StorageKind::Shared);

        if needs_shared && self.storage.redis_url.is_none() {
            return Err(GuardError::config(
                "storage.redis_url is required when shared storage is in use",
            ));
        }
        if self.storage.timeout_ms == 0 {
            return Err(GuardError::config("storage.timeout_ms must be greater than 0"));
        }
        Ok(())
    }

    /// Resolve the route table, applying the deployment's default storage.
    pub fn policy_table(&self) -> Result<PolicyTable> {
        self.policies
            .clone()
            .unwrap_or_default()
            .resolve(self.storage.deployment.default_storage())
    }

    /// Construct the counter stores the route table needs.
    ///
    /// The shared store connects lazily, so this succeeds while Redis is
    /// down; requests then fail open until it comes back.
    pub fn build_backends(
        &self,
        table: &PolicyTable,
    ) -> Result<(Arc<LocalStorage>, StorageBackends)> {
        let local = Arc::new(LocalStorage::new());
        let needs_shared = table.policies().any(|p| p.storage == StorageKind::Shared);

        let shared: Option<Arc<dyn Storage>> = match (&self.storage.redis_url, needs_shared) {
            (Some(url), true) => {
                let timeout = Duration::from_millis(self.storage.timeout_ms);
                info!(timeout_ms = self.storage.timeout_ms, "Using shared counter store");
                let store: Arc<dyn Storage> = Arc::new(SharedStorage::connect_lazy(url, timeout)?);
                Some(store)
            }
            (None, true) => {
                return Err(GuardError::config(
                    "storage.redis_url is required when shared storage is in use",
                ))
            }
            (_, false) => None,
        };

        let backends = StorageBackends::new(local.clone(), shared);
        Ok((local, backends))
    }

    /// Build the policy router with freshly constructed stores.
    pub fn build_router(&self) -> Result<PolicyRouter> {
        let table = self.policy_table()?;
        let (_local, backends) = self.build_backends(&table)?;
        PolicyRouter::new(table, backends)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GuardConfig::default();
        assert_eq!(config.server.listen_addr.port(), 3000);
        assert_eq!(config.storage.deployment, Deployment::Development);
        assert_eq!(config.storage.timeout_ms, 250);
        assert!(config.validate().is_ok());

        let table = config.policy_table().unwrap();
        assert!(table.policies().all(|p| p.storage == StorageKind::Local));
    }

    #[test]
    fn test_production_requires_redis_url() {
        let yaml = r#"
storage:
  deployment: production
"#;
        let err = GuardConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, GuardError::Config(_)));
        assert!(err.to_string().contains("redis_url"));
    }

    #[test]
    fn test_production_with_redis_url() {
        let yaml = r#"
server:
  listen_addr: "0.0.0.0:8080"
storage:
  deployment: production
  redis_url: "redis://127.0.0.1:6379/"
  timeout_ms: 100
"#;
        let config = GuardConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.listen_addr.port(), 8080);

        let table = config.policy_table().unwrap();
        assert!(table.policies().all(|p| p.storage == StorageKind::Shared));

        // No connection is attempted while building.
        let router = config.build_router().unwrap();
        assert_eq!(router.table().rules.len(), 3);
    }

    #[test]
    fn test_explicit_shared_policy_in_development_needs_url() {
        let yaml = r#"
policies:
  rules:
    - path: "^/api/digimons/mint$"
      method: POST
      policy:
        name: mint
        window_seconds: 60
        max_requests: 5
        storage: shared
"#;
        assert!(GuardConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_custom_policy_table() {
        let yaml = r#"
policies:
  protected_prefix: /v1/
  exempt_prefixes: [/v1/login]
  rules:
    - path: "^/v1/orders"
      method: POST
      policy:
        name: orders
        window_seconds: 10
        max_requests: 3
  default:
    name: fallback
    window_seconds: 60
    max_requests: 100
"#;
        let config = GuardConfig::from_yaml(yaml).unwrap();
        let table = config.policy_table().unwrap();

        assert_eq!(table.protected_prefix, "/v1/");
        assert!(table.is_exempt("/v1/login"));
        assert!(table.is_exempt("/api/anything"));
        assert_eq!(table.rules[0].policy.key_prefix, "rl:orders");
        assert_eq!(table.default.name, "fallback");
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = GuardConfig::from_yaml("storage: [not, a, map]").unwrap_err();
        assert!(matches!(err, GuardError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("apiguard-test-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "server:\n  listen_addr: \"127.0.0.1:4100\"\nstorage:\n  purge_interval_secs: 5\n",
        )
        .unwrap();

        let config = GuardConfig::load(Some(path.as_path())).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.server.listen_addr.port(), 4100);
        assert_eq!(config.storage.purge_interval_secs, 5);
    }
}
