//! Store traits consumed by the controllers.
//!
//! Create operations report [`StateError::AlreadyExists`] and delete/update
//! operations report [`StateError::NotFound`] instead of silently
//! succeeding; callers decide whether those count as success.
//!
//! [`StateError::AlreadyExists`]: crate::StateError::AlreadyExists
//! [`StateError::NotFound`]: crate::StateError::NotFound

use crate::error::StateResult;
use crate::types::*;

/// Worker records, selected by owning pool.
pub trait WorkerStore: Send + Sync {
    fn list_workers(&self, pool: &PoolRef) -> StateResult<Vec<WorkerRecord>>;

    fn create_worker(&self, worker: &WorkerRecord) -> StateResult<()>;

    fn delete_worker(&self, worker: &WorkerRef) -> StateResult<()>;
}

/// Keyed secret blobs.
pub trait SecretStore: Send + Sync {
    fn get_secret(&self, namespace: &str, name: &str) -> StateResult<Option<SecretBlob>>;

    fn create_secret(&self, secret: &SecretBlob) -> StateResult<()>;

    fn update_secret(&self, secret: &SecretBlob) -> StateResult<()>;
}

/// Pool specs and the status records written back for them.
pub trait PoolStore: Send + Sync {
    fn list_pools(&self) -> StateResult<Vec<PoolSpec>>;

    fn get_pool(&self, pool: &PoolRef) -> StateResult<Option<PoolSpec>>;

    fn get_pool_status(&self, pool: &PoolRef) -> StateResult<Option<PoolStatus>>;

    fn put_pool_status(&self, pool: &PoolRef, status: &PoolStatus) -> StateResult<()>;

    fn get_pool_certificates(&self, pool: &PoolRef) -> StateResult<Option<PoolCertificates>>;

    fn put_pool_certificates(&self, pool: &PoolRef, certs: &PoolCertificates) -> StateResult<()>;
}
