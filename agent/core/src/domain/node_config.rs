// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Node Configuration Types
//
// Defines the configuration schema for Hearth agent nodes, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Container engine and registry connection settings
// - Lifecycle serialization and retry policy
// - Console, telemetry and observability settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_VERSION: &str = "100monkeys.ai/v1";
pub const KIND: &str = "NodeConfig";

/// Top-level Kubernetes-style node configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfigManifest {
    /// API version (must be "100monkeys.ai/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "NodeConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: NodeConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable node name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfigSpec {
    pub node: NodeIdentity,

    #[serde(default)]
    pub docker: DockerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub console: ConsoleConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Stable node identifier assigned by the control plane
    pub id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Unix socket path; auto-detected when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,

    /// Network for runtime containers; engine default bridge when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `sqlite://...` or `memory`
    #[serde(default = "default_database_url")]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Bearer token identifying the control-plane backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_token: Option<String>,

    /// Accept unauthenticated requests when no backend token is set.
    /// Development only.
    #[serde(default)]
    pub insecure_open_access: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// How long a request waits for another operation on the same server
    #[serde(default = "default_lock_timeout", with = "humantime_serde")]
    pub lock_timeout: Duration,

    /// How long a graceful stop waits for the blueprint stop command to take
    /// effect before the engine stop is issued
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,

    /// How long the setup script may run before it is killed and the
    /// install fails
    #[serde(default = "default_install_timeout", with = "humantime_serde")]
    pub install_timeout: Duration,

    /// Mount point of the server volume inside containers
    #[serde(default = "default_data_mount")]
    pub data_mount: String,

    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// Historical lines replayed when a console opens
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_storage_sample_interval", with = "humantime_serde")]
    pub storage_sample_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus exporter port; disabled when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,
}

fn default_database_url() -> String {
    "sqlite:///var/lib/hearth/agent.db".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_install_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_data_mount() -> String {
    "/data".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_secs(2)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(60)
}

fn default_log_tail_lines() -> usize {
    100
}

fn default_storage_sample_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: default_database_url() }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_api_port(),
            backend_token: None,
            insecure_open_access: false,
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            lock_timeout: default_lock_timeout(),
            stop_timeout: default_stop_timeout(),
            install_timeout: default_install_timeout(),
            data_mount: default_data_mount(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self { log_tail_lines: default_log_tail_lines() }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { storage_sample_interval: default_storage_sample_interval() }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            metrics_port: None,
        }
    }
}

impl Default for NodeConfigSpec {
    fn default() -> Self {
        let node_id = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "hearth-node".to_string());

        Self {
            node: NodeIdentity { id: node_id, region: None },
            docker: DockerConfig::default(),
            database: DatabaseConfig::default(),
            api: ApiConfig::default(),
            lifecycle: LifecycleConfig::default(),
            console: ConsoleConfig::default(),
            telemetry: TelemetryConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Default for NodeConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "hearth-node".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: NodeConfigSpec::default(),
        }
    }
}

impl NodeConfigManifest {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. HEARTH_CONFIG_PATH environment variable
    /// 2. ./hearth-config.yaml (working directory)
    /// 3. ~/.hearth/config.yaml (user home)
    /// 4. /etc/hearth/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("HEARTH_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./hearth-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".hearth").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/hearth/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path fails if missing or invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("HEARTH_DOCKER_SOCKET") {
            tracing::info!("Environment override: HEARTH_DOCKER_SOCKET={}", val);
            self.spec.docker.socket_path = Some(val);
        }

        if let Some(val) = lookup("HEARTH_DATABASE_URL") {
            tracing::info!("Environment override: HEARTH_DATABASE_URL");
            self.spec.database.url = val;
        }

        if let Some(val) = lookup("HEARTH_BACKEND_TOKEN") {
            tracing::info!("Environment override: HEARTH_BACKEND_TOKEN");
            self.spec.api.backend_token = Some(val);
        }

        if let Some(val) = lookup("HEARTH_LOG_LEVEL") {
            tracing::info!("Environment override: HEARTH_LOG_LEVEL={}", val);
            self.spec.observability.log_level = val;
        }

        if let Some(val) = lookup("HEARTH_METRICS_PORT") {
            match val.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Environment override: HEARTH_METRICS_PORT={}", port);
                    self.spec.observability.metrics_port = Some(port);
                }
                Err(_) => {
                    tracing::warn!(
                        "Invalid value for HEARTH_METRICS_PORT: '{}'. Expected a port number. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        if self.spec.node.id.is_empty() {
            anyhow::bail!("spec.node.id cannot be empty");
        }

        if self.spec.database.url.is_empty() {
            anyhow::bail!("spec.database.url cannot be empty");
        }

        if self.spec.lifecycle.retry.max_attempts == 0 {
            anyhow::bail!("spec.lifecycle.retry.max_attempts must be at least 1");
        }

        if self.spec.lifecycle.install_timeout.is_zero() {
            anyhow::bail!("spec.lifecycle.install_timeout cannot be zero");
        }

        if !self.spec.lifecycle.data_mount.starts_with('/') {
            anyhow::bail!(
                "spec.lifecycle.data_mount must be an absolute path, got '{}'",
                self.spec.lifecycle.data_mount
            );
        }

        if self.spec.console.log_tail_lines == 0 {
            anyhow::bail!("spec.console.log_tail_lines must be at least 1");
        }

        if self.spec.telemetry.storage_sample_interval.is_zero() {
            anyhow::bail!("spec.telemetry.storage_sample_interval cannot be zero");
        }

        Ok(())
    }
}
