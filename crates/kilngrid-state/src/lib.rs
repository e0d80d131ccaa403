//! kilngrid-state — the object and secret store behind the kiln control plane.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for pools, worker records, pool status, and certificate secrets.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{namespace}/{pool}`, `{namespace}/{pool}/{worker}`)
//! enable prefix scans over a pool's dependents.
//!
//! Controllers never talk to [`StateStore`] directly; they go through the
//! [`WorkerStore`], [`SecretStore`] and [`PoolStore`] traits so tests can
//! substitute counting or failing doubles.

pub mod error;
pub mod store;
pub mod stores;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use stores::{PoolStore, SecretStore, WorkerStore};
pub use types::*;
