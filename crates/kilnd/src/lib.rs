//! kilnd — the kiln daemon.
//!
//! Assembles the state store, the fleet controller and the certificate
//! lifecycle into one reconciliation loop. The binary in `main.rs` is a
//! thin CLI over this library.

pub mod reconciler;
pub mod settings;
pub mod status;

use std::path::Path;

use anyhow::{Context, bail};
use tracing::info;

use kiln_core::KilnConfig;
use kilngrid_state::{PoolRef, StateStore, WorkerPhase, WorkerRef};

pub use reconciler::{PoolTick, Reconciler};

/// File name of the state database inside the data directory.
pub const DB_FILE: &str = "kiln.redb";

/// Open (or create) the state store under `data_dir`.
pub fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let db_path = data_dir.join(DB_FILE);
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

/// Write every configured pool into the store. Pools already stored but
/// absent from the config are left alone.
pub fn seed_pools(store: &StateStore, config: &KilnConfig) -> anyhow::Result<usize> {
    for pool in &config.pools {
        let spec = settings::pool_spec(pool);
        store.put_pool(&spec)?;
        info!(pool = %spec.pool_ref(), min_idle = spec.min_idle, "pool seeded");
    }
    Ok(config.pools.len())
}

/// Parse `<namespace>/<pool>/<worker>`.
pub fn parse_worker_ref(s: &str) -> anyhow::Result<WorkerRef> {
    let parts: Vec<&str> = s.split('/').collect();
    let [namespace, pool, name] = parts[..] else {
        bail!("expected <namespace>/<pool>/<worker>, got {s:?}");
    };
    if namespace.is_empty() || pool.is_empty() || name.is_empty() {
        bail!("empty segment in worker reference {s:?}");
    }
    Ok(WorkerRef {
        pool: PoolRef::new(namespace, pool),
        name: name.to_string(),
    })
}

pub fn parse_phase(s: &str) -> anyhow::Result<WorkerPhase> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "provisioning" => WorkerPhase::Provisioning,
        "idle" => WorkerPhase::Idle,
        "allocated" => WorkerPhase::Allocated,
        "failed" => WorkerPhase::Failed,
        other => bail!("unknown worker phase {other:?}"),
    })
}
