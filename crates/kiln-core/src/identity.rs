//! Pool authorization for already-authenticated subjects.
//!
//! Token verification happens elsewhere; this only answers whether a
//! verified subject may use a given pool.

use std::collections::{BTreeSet, HashMap};

use crate::config::IdentityConfig;

/// Grants access to every pool.
const ANY_POOL: &str = "*";

#[derive(Debug, Clone, Default)]
pub struct IdentityDirectory {
    grants: HashMap<String, BTreeSet<String>>,
}

impl IdentityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from config entries. Repeated subjects accumulate their pools.
    pub fn from_config(identities: &[IdentityConfig]) -> Self {
        let mut directory = Self::new();
        for identity in identities {
            directory.grant(&identity.subject, identity.pools.iter().cloned());
        }
        directory
    }

    pub fn grant(&mut self, subject: &str, pools: impl IntoIterator<Item = String>) {
        self.grants
            .entry(subject.to_string())
            .or_default()
            .extend(pools);
    }

    /// Unknown subjects are denied.
    pub fn is_permitted(&self, subject: &str, pool: &str) -> bool {
        self.grants
            .get(subject)
            .is_some_and(|pools| pools.contains(ANY_POOL) || pools.contains(pool))
    }

    pub fn pools_for(&self, subject: &str) -> Vec<String> {
        self.grants
            .get(subject)
            .map(|pools| pools.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(subject: &str, pools: &[&str]) -> IdentityConfig {
        IdentityConfig {
            subject: subject.to_string(),
            pools: pools.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn permits_listed_pool_only() {
        let dir = IdentityDirectory::from_config(&[identity("alice", &["builders"])]);
        assert!(dir.is_permitted("alice", "builders"));
        assert!(!dir.is_permitted("alice", "release"));
    }

    #[test]
    fn unknown_subject_denied() {
        let dir = IdentityDirectory::from_config(&[identity("alice", &["builders"])]);
        assert!(!dir.is_permitted("mallory", "builders"));
    }

    #[test]
    fn wildcard_grants_everything() {
        let dir = IdentityDirectory::from_config(&[identity("ops", &["*"])]);
        assert!(dir.is_permitted("ops", "anything"));
    }

    #[test]
    fn repeated_subjects_merge() {
        let dir = IdentityDirectory::from_config(&[
            identity("ci", &["a"]),
            identity("ci", &["b"]),
        ]);
        assert_eq!(dir.pools_for("ci"), vec!["a".to_string(), "b".to_string()]);
        assert!(dir.pools_for("nobody").is_empty());
    }
}
