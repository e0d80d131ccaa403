//! kiln-core — shared configuration for the kiln control plane.
//!
//! Parses `kiln.toml` into [`KilnConfig`] and exposes the identity
//! directory used to answer "may this subject use pool X".

pub mod config;
pub mod identity;

pub use config::{
    ConfigError, FleetConfig, IdentityConfig, KilnConfig, PkiConfig, PoolConfig,
};
pub use identity::IdentityDirectory;
