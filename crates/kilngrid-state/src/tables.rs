//! redb table definitions for the kiln state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Pool specs keyed by `{namespace}/{pool}`.
pub const POOLS: TableDefinition<&str, &[u8]> = TableDefinition::new("pools");

/// Fleet status keyed by `{namespace}/{pool}`.
pub const POOL_STATUS: TableDefinition<&str, &[u8]> = TableDefinition::new("pool_status");

/// Certificate status keyed by `{namespace}/{pool}`.
pub const CERT_STATUS: TableDefinition<&str, &[u8]> = TableDefinition::new("cert_status");

/// Worker records keyed by `{namespace}/{pool}/{worker}`.
pub const WORKERS: TableDefinition<&str, &[u8]> = TableDefinition::new("workers");

/// Secrets keyed by `{namespace}/{name}`.
pub const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");

/// Shape shared by every table above.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;
