use serde::Deserialize;
use std::path::{Path, PathBuf};
use thinkgate_agent::{FeatureFlags, ModelConfig, ResilienceConfig, ThinkingConfig};
use thinkgate_security::KeyStoreConfig;

/// Contents of `thinkgate.toml`.
#[derive(Debug, Deserialize)]
pub struct ThinkgateConfig {
    /// Primary model and its fallbacks.
    pub model: ModelConfig,
    /// Root for the key snapshot, the root key file and audit logs.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Breaker, retry and hedge settings.
    #[serde(default)]
    pub resilience: ResilienceConfig,
    /// Refinement loop defaults.
    #[serde(default)]
    pub thinking: ThinkingConfig,
    /// Flag defaults. Environment variables override them at load time.
    #[serde(default)]
    pub features: FeatureFlags,
    /// Listen address.
    #[serde(default)]
    pub server: ServerConfig,
    /// Key store and rate limits.
    #[serde(default)]
    pub security: SecurityConfig,
}

/// `[server]` section.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// `[security]` section.
#[derive(Debug, Deserialize)]
pub struct SecurityConfig {
    /// Key record snapshot; relative paths resolve against `data_dir`.
    #[serde(default = "default_keystore_path")]
    pub keystore_path: PathBuf,
    /// Environment variable holding hex root key material.
    #[serde(default = "default_root_key_env")]
    pub root_key_env: String,
    /// File holding the root key when the variable is unset; generated on
    /// first start. Relative to `data_dir`.
    #[serde(default = "default_root_key_path")]
    pub root_key_path: PathBuf,
    /// Sustained request rate allowed per key.
    #[serde(default = "default_rps")]
    pub max_requests_per_second: f64,
    /// Token bucket capacity per key.
    #[serde(default = "default_burst")]
    pub max_burst: f64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            keystore_path: default_keystore_path(),
            root_key_env: default_root_key_env(),
            root_key_path: default_root_key_path(),
            max_requests_per_second: default_rps(),
            max_burst: default_burst(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_keystore_path() -> PathBuf {
    PathBuf::from("keys.json")
}
fn default_root_key_env() -> String {
    "THINKGATE_ROOT_KEY".to_string()
}
fn default_root_key_path() -> PathBuf {
    PathBuf::from("root.key")
}
fn default_rps() -> f64 {
    10.0
}
fn default_burst() -> f64 {
    50.0
}

impl ThinkgateConfig {
    /// Reads and parses a config file, then applies the `ENABLE_*` flag
    /// overrides from the environment.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        let mut config = Self::parse(&raw)?;
        config.features = config.features.with_env_overrides();
        Ok(config)
    }

    /// Parses and validates TOML without touching the environment.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.model.model_id.trim().is_empty() {
            anyhow::bail!("[model] model_id is empty");
        }
        if !(0.0..=1.0).contains(&self.thinking.target_quality) {
            anyhow::bail!("[thinking] target_quality must be within 0..=1");
        }
        if self.resilience.retry.max_attempts == 0 {
            anyhow::bail!("[resilience.retry] max_attempts must be at least 1");
        }
        if self.security.max_burst < 1.0 || self.security.max_requests_per_second <= 0.0 {
            anyhow::bail!("[security] rate limits must be positive");
        }
        Ok(())
    }

    /// Key store settings, with the root key taken from the configured
    /// environment variable when set.
    pub fn keystore(&self) -> KeyStoreConfig {
        self.keystore_with(|name| std::env::var(name).ok())
    }

    fn keystore_with(&self, lookup: impl Fn(&str) -> Option<String>) -> KeyStoreConfig {
        KeyStoreConfig {
            snapshot_path: Some(self.in_data_dir(&self.security.keystore_path)),
            root_key_hex: lookup(&self.security.root_key_env).filter(|v| !v.trim().is_empty()),
            root_key_path: Some(self.in_data_dir(&self.security.root_key_path)),
        }
    }

    /// Where the audit log is written.
    pub fn audit_dir(&self) -> PathBuf {
        self.data_dir.join("audit")
    }

    fn in_data_dir(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }
}
