//! StateStore — redb-backed state persistence for kiln.
//!
//! Provides typed CRUD operations over pools, workers, status records and
//! secrets. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableHandle};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::stores::{PoolStore, SecretStore, WorkerStore};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// How a keyed write treats an existing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    /// Insert or overwrite.
    Upsert,
    /// Fail with `AlreadyExists` if the key is present.
    CreateOnly,
    /// Fail with `NotFound` if the key is absent.
    UpdateOnly,
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [POOLS, POOL_STATUS, CERT_STATUS, WORKERS, SECRETS] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic row access ─────────────────────────────────────────

    fn write_json<T: Serialize>(
        &self,
        table_def: JsonTable,
        key: &str,
        value: &T,
        mode: WriteMode,
    ) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            let exists = table.get(key).map_err(map_err!(Read))?.is_some();
            match mode {
                WriteMode::CreateOnly if exists => {
                    return Err(StateError::AlreadyExists(key.to_string()));
                }
                WriteMode::UpdateOnly if !exists => {
                    return Err(StateError::NotFound(key.to_string()));
                }
                _ => {}
            }
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn read_json<T: DeserializeOwned>(&self, table_def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Decode every row whose key starts with `prefix`. Rows that fail to
    /// decode are skipped and logged rather than failing the whole scan.
    fn scan_json<T: DeserializeOwned>(&self, table_def: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                continue;
            }
            match serde_json::from_slice(value.value()) {
                Ok(decoded) => results.push(decoded),
                Err(e) => {
                    warn!(table = table_def.name(), key = %key.value(), error = %e, "skipping malformed record");
                }
            }
        }
        Ok(results)
    }

    fn remove_keys(&self, table_def: JsonTable, keys: &[String]) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut removed = 0;
        {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            for key in keys {
                if table.remove(key.as_str()).map_err(map_err!(Write))?.is_some() {
                    removed += 1;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(removed)
    }

    // ── Pools ──────────────────────────────────────────────────────

    /// Insert or update a pool spec.
    pub fn put_pool(&self, spec: &PoolSpec) -> StateResult<()> {
        let key = spec.table_key();
        self.write_json(POOLS, &key, spec, WriteMode::Upsert)?;
        debug!(%key, "pool stored");
        Ok(())
    }

    /// Delete a pool and everything it owns: workers, status records and
    /// owned secrets. Returns true if the pool existed.
    pub fn delete_pool(&self, pool: &PoolRef) -> StateResult<bool> {
        let key = pool.table_key();
        let existed = self.remove_keys(POOLS, std::slice::from_ref(&key))? > 0;
        self.remove_keys(POOL_STATUS, std::slice::from_ref(&key))?;
        self.remove_keys(CERT_STATUS, std::slice::from_ref(&key))?;

        let worker_keys: Vec<String> = self
            .list_workers(pool)?
            .iter()
            .map(WorkerRecord::table_key)
            .collect();
        let workers = self.remove_keys(WORKERS, &worker_keys)?;

        let secret_keys: Vec<String> = self
            .scan_json::<SecretBlob>(SECRETS, &format!("{}/", pool.namespace))?
            .into_iter()
            .filter(|s| s.owner.as_ref() == Some(pool))
            .map(|s| s.table_key())
            .collect();
        let secrets = self.remove_keys(SECRETS, &secret_keys)?;

        debug!(%key, existed, workers, secrets, "pool deleted");
        Ok(existed)
    }

    // ── Workers ────────────────────────────────────────────────────

    /// Record a phase transition reported by the allocation or execution
    /// side. The controller itself only creates and deletes workers.
    pub fn set_worker_phase(
        &self,
        worker: &WorkerRef,
        phase: WorkerPhase,
        now: chrono::DateTime<chrono::Utc>,
    ) -> StateResult<WorkerRecord> {
        let key = worker.table_key();
        let mut record: WorkerRecord = self
            .read_json(WORKERS, &key)?
            .ok_or_else(|| StateError::NotFound(key.clone()))?;
        record.phase = phase;
        record.updated_at = now;
        self.write_json(WORKERS, &key, &record, WriteMode::UpdateOnly)?;
        debug!(%key, %phase, "worker phase updated");
        Ok(record)
    }

    // ── Secrets ────────────────────────────────────────────────────

    /// Delete a secret. Returns true if it existed.
    pub fn delete_secret(&self, namespace: &str, name: &str) -> StateResult<bool> {
        Ok(self.remove_keys(SECRETS, &[secret_key(namespace, name)])? > 0)
    }
}

impl WorkerStore for StateStore {
    fn list_workers(&self, pool: &PoolRef) -> StateResult<Vec<WorkerRecord>> {
        let prefix = format!("{}/", pool.table_key());
        self.scan_json(WORKERS, &prefix)
    }

    fn create_worker(&self, worker: &WorkerRecord) -> StateResult<()> {
        self.write_json(WORKERS, &worker.table_key(), worker, WriteMode::CreateOnly)
    }

    fn delete_worker(&self, worker: &WorkerRef) -> StateResult<()> {
        let key = worker.table_key();
        match self.remove_keys(WORKERS, std::slice::from_ref(&key))? {
            0 => Err(StateError::NotFound(key)),
            _ => Ok(()),
        }
    }
}

impl SecretStore for StateStore {
    fn get_secret(&self, namespace: &str, name: &str) -> StateResult<Option<SecretBlob>> {
        self.read_json(SECRETS, &secret_key(namespace, name))
    }

    fn create_secret(&self, secret: &SecretBlob) -> StateResult<()> {
        self.write_json(SECRETS, &secret.table_key(), secret, WriteMode::CreateOnly)
    }

    fn update_secret(&self, secret: &SecretBlob) -> StateResult<()> {
        self.write_json(SECRETS, &secret.table_key(), secret, WriteMode::UpdateOnly)
    }
}

impl PoolStore for StateStore {
    fn list_pools(&self) -> StateResult<Vec<PoolSpec>> {
        self.scan_json(POOLS, "")
    }

    fn get_pool(&self, pool: &PoolRef) -> StateResult<Option<PoolSpec>> {
        self.read_json(POOLS, &pool.table_key())
    }

    fn get_pool_status(&self, pool: &PoolRef) -> StateResult<Option<PoolStatus>> {
        self.read_json(POOL_STATUS, &pool.table_key())
    }

    fn put_pool_status(&self, pool: &PoolRef, status: &PoolStatus) -> StateResult<()> {
        self.write_json(POOL_STATUS, &pool.table_key(), status, WriteMode::Upsert)
    }

    fn get_pool_certificates(&self, pool: &PoolRef) -> StateResult<Option<PoolCertificates>> {
        self.read_json(CERT_STATUS, &pool.table_key())
    }

    fn put_pool_certificates(&self, pool: &PoolRef, certs: &PoolCertificates) -> StateResult<()> {
        self.write_json(CERT_STATUS, &pool.table_key(), certs, WriteMode::Upsert)
    }
}
