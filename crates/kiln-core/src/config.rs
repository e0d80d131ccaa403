//! kiln.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating `kiln.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid pool {pool}: {reason}")]
    InvalidPool { pool: String, reason: String },

    #[error("invalid setting {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KilnConfig {
    #[serde(default)]
    pub fleet: FleetConfig,
    #[serde(default)]
    pub pki: PkiConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pools: Vec<PoolConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identities: Vec<IdentityConfig>,
}

/// Worker fleet scheduling knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FleetConfig {
    /// Provisioning workers older than this are treated as stuck.
    #[serde(default = "default_stuck_threshold", with = "humantime_serde")]
    pub stuck_threshold: Duration,

    /// Jitter tolerance around scale-to-zero fire times.
    #[serde(default = "default_schedule_window", with = "humantime_serde")]
    pub schedule_window: Duration,

    /// How often the daemon runs a reconciliation tick per pool.
    #[serde(default = "default_reconcile_interval", with = "humantime_serde")]
    pub reconcile_interval: Duration,
}

impl FleetConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("fleet.reconcile_interval", self.reconcile_interval)
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            stuck_threshold: default_stuck_threshold(),
            schedule_window: default_schedule_window(),
            reconcile_interval: default_reconcile_interval(),
        }
    }
}

fn default_stuck_threshold() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_schedule_window() -> Duration {
    Duration::from_secs(2 * 60)
}

fn default_reconcile_interval() -> Duration {
    Duration::from_secs(30)
}

/// Certificate authority and leaf certificate settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PkiConfig {
    /// Secret holding `ca.crt` / `ca.key` in each namespace.
    #[serde(default = "default_ca_secret_name")]
    pub ca_secret_name: String,

    /// Organization written into the CA subject.
    #[serde(default = "default_ca_organization")]
    pub ca_organization: String,

    #[serde(default = "default_ca_validity", with = "humantime_serde")]
    pub ca_validity: Duration,

    #[serde(default = "default_leaf_duration", with = "humantime_serde")]
    pub server_cert_duration: Duration,

    #[serde(default = "default_leaf_duration", with = "humantime_serde")]
    pub client_cert_duration: Duration,

    /// Reissue this long before a leaf certificate expires.
    #[serde(default = "default_renewal_window", with = "humantime_serde")]
    pub renewal_window: Duration,
}

impl PkiConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ca_secret_name.trim().is_empty() {
            return Err(ConfigError::InvalidSetting {
                field: "pki.ca_secret_name",
                reason: "must not be empty".to_string(),
            });
        }
        non_zero("pki.ca_validity", self.ca_validity)?;
        non_zero("pki.server_cert_duration", self.server_cert_duration)?;
        non_zero("pki.client_cert_duration", self.client_cert_duration)
    }
}

fn non_zero(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::InvalidSetting {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

impl Default for PkiConfig {
    fn default() -> Self {
        Self {
            ca_secret_name: default_ca_secret_name(),
            ca_organization: default_ca_organization(),
            ca_validity: default_ca_validity(),
            server_cert_duration: default_leaf_duration(),
            client_cert_duration: default_leaf_duration(),
            renewal_window: default_renewal_window(),
        }
    }
}

fn default_ca_secret_name() -> String {
    "kiln-ca".to_string()
}

fn default_ca_organization() -> String {
    "kiln".to_string()
}

fn default_ca_validity() -> Duration {
    Duration::from_secs(87_600 * 3600)
}

fn default_leaf_duration() -> Duration {
    Duration::from_secs(8_760 * 3600)
}

fn default_renewal_window() -> Duration {
    Duration::from_secs(720 * 3600)
}

/// A pool declared in the config file and seeded into the store at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub min_idle: u32,
    /// Five-field cron expression opening a scale-to-zero window.
    pub scale_down_schedule: Option<String>,
    #[serde(default, with = "humantime_serde::option")]
    pub server_cert_duration: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub client_cert_duration: Option<Duration>,
    /// Additional DNS names or IPs for the gateway certificate.
    #[serde(default)]
    pub extra_sans: Vec<String>,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl PoolConfig {
    /// Reject pools that could never be stored or addressed.
    ///
    /// Schedule expressions are not checked; an unparseable one keeps the
    /// pool at its minimum at reconcile time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidPool {
            pool: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.namespace.trim().is_empty() {
            return Err(invalid("namespace must not be empty"));
        }
        if self.name.contains('/') || self.namespace.contains('/') {
            return Err(invalid("name and namespace must not contain '/'"));
        }
        if matches!(self.server_cert_duration, Some(d) if d.is_zero())
            || matches!(self.client_cert_duration, Some(d) if d.is_zero())
        {
            return Err(invalid("certificate durations must be positive"));
        }
        Ok(())
    }
}

/// Pre-authenticated subject and the pools it may reach.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentityConfig {
    pub subject: String,
    #[serde(default)]
    pub pools: Vec<String>,
}

impl KilnConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: KilnConfig = toml::from_str(content)?;
        config.fleet.validate()?;
        config.pki.validate()?;
        for pool in &config.pools {
            pool.validate()?;
        }
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
