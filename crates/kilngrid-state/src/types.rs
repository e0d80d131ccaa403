//! Domain types for the kiln state store.
//!
//! These types represent the persisted state of pools, their workers,
//! fleet and certificate status, and secrets. All types are serializable
//! to/from JSON for storage in redb tables.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Pool ──────────────────────────────────────────────────────────

/// Namespace-scoped reference to a pool. Used as the owner of workers
/// and certificate secrets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolRef {
    pub namespace: String,
    pub name: String,
}

impl PoolRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Composite key for pool-keyed tables.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for PoolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Declared desired state for a pool of build workers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolSpec {
    pub name: String,
    pub namespace: String,
    /// Idle workers to keep warm outside scale-to-zero windows.
    pub min_idle: u32,
    /// Five-field cron expression; each fire time opens a scale-to-zero window.
    #[serde(default)]
    pub scale_down_schedule: Option<String>,
    #[serde(default)]
    pub certificates: CertificateOverrides,
}

impl PoolSpec {
    pub fn pool_ref(&self) -> PoolRef {
        PoolRef::new(&self.namespace, &self.name)
    }

    pub fn table_key(&self) -> String {
        self.pool_ref().table_key()
    }
}

/// Per-pool certificate settings that override controller defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CertificateOverrides {
    pub server_duration: Option<Duration>,
    pub client_duration: Option<Duration>,
    /// Extra SANs for the gateway certificate (DNS names or IPs).
    #[serde(default)]
    pub extra_sans: Vec<String>,
}

// ── Worker ────────────────────────────────────────────────────────

/// Declared lifecycle phase of a worker, set by allocation and execution
/// processes outside the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Provisioning,
    Idle,
    Allocated,
    Failed,
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Provisioning => "provisioning",
            Self::Idle => "idle",
            Self::Allocated => "allocated",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One ephemeral build executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerRecord {
    pub name: String,
    /// Owning pool. Deleting the pool deletes the worker.
    pub owner: PoolRef,
    pub phase: WorkerPhase,
    pub created_at: DateTime<Utc>,
    /// Last time the phase was written.
    pub updated_at: DateTime<Utc>,
}

impl WorkerRecord {
    /// A freshly created worker: provisioning, owned by `owner`.
    pub fn provisioning(name: impl Into<String>, owner: PoolRef, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            owner,
            phase: WorkerPhase::Provisioning,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn worker_ref(&self) -> WorkerRef {
        WorkerRef {
            pool: self.owner.clone(),
            name: self.name.clone(),
        }
    }

    pub fn table_key(&self) -> String {
        self.worker_ref().table_key()
    }
}

/// Addresses a single worker record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerRef {
    pub pool: PoolRef,
    pub name: String,
}

impl WorkerRef {
    pub fn table_key(&self) -> String {
        format!("{}/{}/{}", self.pool.namespace, self.pool.name, self.name)
    }
}

impl fmt::Display for WorkerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pool, self.name)
    }
}

// ── Status ────────────────────────────────────────────────────────

/// Observed fleet state of a pool, rewritten by the scaling controller.
///
/// Resource builders read these counts; they are re-derived from the
/// worker table every tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PoolStatus {
    pub idle: u32,
    pub allocated: u32,
    pub provisioning: u32,
    pub stuck: u32,
    pub failed: u32,
    /// Idle target in effect for the last tick (0 inside a scale-to-zero window).
    pub desired_idle: u32,
    pub scale_to_zero_active: bool,
    /// When any of the fields above last changed.
    pub last_changed: Option<DateTime<Utc>>,
}

impl PoolStatus {
    /// Compare everything except the change timestamp.
    pub fn same_observation(&self, other: &PoolStatus) -> bool {
        self.idle == other.idle
            && self.allocated == other.allocated
            && self.provisioning == other.provisioning
            && self.stuck == other.stuck
            && self.failed == other.failed
            && self.desired_idle == other.desired_idle
            && self.scale_to_zero_active == other.scale_to_zero_active
    }
}

/// Validity metadata for an issued leaf certificate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CertificateInfo {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Absent for certificates recorded before renewal tracking; callers
    /// recompute it from the validity window.
    #[serde(default)]
    pub renewal_time: Option<DateTime<Utc>>,
}

/// Where a pool's certificate lives and when it is due for renewal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CertificateStatus {
    pub secret_name: String,
    pub info: CertificateInfo,
}

/// Certificate state of a pool, rewritten by the certificate lifecycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PoolCertificates {
    pub server: Option<CertificateStatus>,
    pub client: Option<CertificateStatus>,
}

// ── Secret ────────────────────────────────────────────────────────

/// Opaque keyed byte blob, the unit of the secret store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretBlob {
    pub namespace: String,
    pub name: String,
    pub data: BTreeMap<String, Vec<u8>>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Pool that owns this secret, if any. Shared CA secrets have no owner.
    #[serde(default)]
    pub owner: Option<PoolRef>,
}

impl SecretBlob {
    pub fn table_key(&self) -> String {
        secret_key(&self.namespace, &self.name)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data
            .get(key)
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
    }
}

/// Composite key for the secrets table.
pub fn secret_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}
