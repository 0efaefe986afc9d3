//! Injected configuration and runtime context.
//!
//! Nothing in the core reads process-wide state: the cache name, the
//! online/offline signal and the clock all arrive through [`CoreContext`].

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::capabilities::{validate_version_name, ValidatedUrl, MAX_TIMEOUT_MS};
use crate::time::{Clock, SystemClock};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct NotificationConfig {
    pub title: String,
    pub default_message: String,
    /// Navigation target for the "view" action; the alert id is appended as `?alert=`.
    pub view_path: String,
    pub vibrate_pattern: Vec<u32>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            title: "Emergency Alert".into(),
            default_message: "Emergency alert received".into(),
            view_path: "/emergency".into(),
            vibrate_pattern: vec![200, 100, 200],
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    /// Origin every relative path is resolved against.
    pub origin: String,
    /// Name of the cache version produced by this build.
    pub cache_name: String,
    pub offline_page: String,
    pub critical_resources: Vec<String>,
    /// Requests whose path contains this are emergency submissions.
    pub emergency_path: String,
    pub sync_path: String,
    pub record_kind: String,
    pub fetch_timeout_ms: u64,
    pub delivery_timeout_ms: u64,
    pub sync_interval_secs: u64,
    pub max_concurrent_deliveries: usize,
    /// Keep at most this many synced records; `None` keeps everything.
    pub synced_retention: Option<usize>,
    pub lookup_memo_capacity: usize,
    pub capture_vibrate_pattern: Vec<u32>,
    pub notification: NotificationConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            origin: "https://localhost/".into(),
            cache_name: "lifeline-v1.0.0".into(),
            offline_page: "/offline".into(),
            critical_resources: [
                "/",
                "/offline",
                "/record",
                "/ai-assistant",
                "/emergency-contacts",
                "/manifest.json",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            emergency_path: "/api/emergency".into(),
            sync_path: "/api/emergency/sync".into(),
            record_kind: "emergency_alert".into(),
            fetch_timeout_ms: 30_000,
            delivery_timeout_ms: 15_000,
            sync_interval_secs: 300,
            max_concurrent_deliveries: 4,
            synced_retention: None,
            lookup_memo_capacity: 256,
            capture_vibrate_pattern: vec![200, 100, 200, 100, 200],
            notification: NotificationConfig::default(),
        }
    }
}

impl CoreConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ValidatedUrl::new(self.origin.as_str())
            .map_err(|e| ConfigError::Invalid(format!("origin: {e}")))?;
        validate_version_name(&self.cache_name)
            .map_err(|e| ConfigError::Invalid(format!("cache_name: {e}")))?;

        for (field, path) in [
            ("offline_page", &self.offline_page),
            ("emergency_path", &self.emergency_path),
            ("sync_path", &self.sync_path),
            ("notification.view_path", &self.notification.view_path),
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "{field} must be an absolute path, got '{path}'"
                )));
            }
        }

        if !self.critical_resources.iter().any(|r| r == &self.offline_page) {
            return Err(ConfigError::Invalid(
                "critical_resources must include the offline page".into(),
            ));
        }
        if self.record_kind.trim().is_empty() {
            return Err(ConfigError::Invalid("record_kind must not be empty".into()));
        }
        for (field, ms) in [
            ("fetch_timeout_ms", self.fetch_timeout_ms),
            ("delivery_timeout_ms", self.delivery_timeout_ms),
        ] {
            if ms == 0 || ms > MAX_TIMEOUT_MS {
                return Err(ConfigError::Invalid(format!(
                    "{field} must be in 1..={MAX_TIMEOUT_MS}"
                )));
            }
        }
        if self.sync_interval_secs == 0 {
            return Err(ConfigError::Invalid("sync_interval_secs must be > 0".into()));
        }
        if self.max_concurrent_deliveries == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_deliveries must be > 0".into(),
            ));
        }
        if self.lookup_memo_capacity == 0 {
            return Err(ConfigError::Invalid("lookup_memo_capacity must be > 0".into()));
        }
        Ok(())
    }

    pub fn origin_url(&self) -> Result<ValidatedUrl, ConfigError> {
        ValidatedUrl::new(self.origin.as_str())
            .map_err(|e| ConfigError::Invalid(format!("origin: {e}")))
    }

    /// Resolves a configured path against the origin.
    pub fn resolve(&self, path: &str) -> Result<ValidatedUrl, ConfigError> {
        ValidatedUrl::join(&self.origin_url()?, path)
            .map_err(|e| ConfigError::Invalid(format!("{path}: {e}")))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

/// Shared online/offline signal. Cloning shares the same flag.
#[derive(Debug, Clone)]
pub struct Connectivity {
    online: Arc<AtomicBool>,
}

impl Connectivity {
    #[must_use]
    pub fn new(online: bool) -> Self {
        Self {
            online: Arc::new(AtomicBool::new(online)),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub fn set_online(&self, online: bool) -> bool {
        self.online.swap(online, Ordering::SeqCst)
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

#[derive(Clone)]
pub struct CoreContext {
    pub config: Arc<CoreConfig>,
    pub connectivity: Connectivity,
    pub clock: Arc<dyn Clock>,
}

impl CoreContext {
    pub fn new(config: CoreConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            connectivity: Connectivity::default(),
            clock: Arc::new(SystemClock),
        })
    }

    #[must_use]
    pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl std::fmt::Debug for CoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreContext")
            .field("config", &self.config)
            .field("online", &self.connectivity.is_online())
            .field("now", &self.clock.now())
            .finish()
    }
}
