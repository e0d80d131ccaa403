//! Certificate secret reconciliation.
//!
//! Writes are diff-before-write: every update notifies the secret's
//! watchers, so byte-identical content is never rewritten. The comparison
//! is a pure function over the stored blob and the desired secret.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use kilngrid_state::{PoolRef, SecretBlob, SecretStore};

use crate::error::PkiResult;

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "kiln";
pub const POOL_LABEL: &str = "kiln.dev/pool";
pub const COMPONENT_LABEL: &str = "kiln.dev/component";

/// Data key for the CA bundle shipped next to leaf certificates.
pub const CA_BUNDLE_KEY: &str = "ca.crt";

/// Which fixed data keys a secret uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    Ca,
    Server,
    Client,
}

impl SecretKind {
    pub fn cert_key(self) -> &'static str {
        match self {
            Self::Ca => "ca.crt",
            Self::Server => "tls.crt",
            Self::Client => "client.crt",
        }
    }

    pub fn key_key(self) -> &'static str {
        match self {
            Self::Ca => "ca.key",
            Self::Server => "tls.key",
            Self::Client => "client.key",
        }
    }
}

/// Labels carried by every secret of `pool`.
pub fn pool_labels(pool: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
        (POOL_LABEL.to_string(), pool.to_string()),
    ])
}

pub fn ca_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
        (COMPONENT_LABEL.to_string(), "ca".to_string()),
    ])
}

/// Desired content of a certificate secret.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateSecret {
    pub namespace: String,
    pub name: String,
    pub kind: SecretKind,
    pub cert_pem: String,
    pub key_pem: String,
    /// CA bundle, for leaf secrets.
    pub ca_pem: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub owner: Option<PoolRef>,
}

impl std::fmt::Debug for CertificateSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateSecret")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("labels", &self.labels)
            .finish_non_exhaustive()
    }
}

impl CertificateSecret {
    fn entries(&self) -> Vec<(&'static str, &str)> {
        let mut entries = vec![
            (self.kind.cert_key(), self.cert_pem.as_str()),
            (self.kind.key_key(), self.key_pem.as_str()),
        ];
        if let Some(ca) = &self.ca_pem {
            entries.push((CA_BUNDLE_KEY, ca.as_str()));
        }
        entries
    }

    /// A fresh blob holding exactly this secret's content.
    pub fn to_blob(&self) -> SecretBlob {
        SecretBlob {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            data: self
                .entries()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
                .collect(),
            labels: self.labels.clone(),
            owner: self.owner.clone(),
        }
    }

    /// `existing` with this secret's entries, labels and owner applied.
    /// Keys and labels this secret does not manage are kept.
    fn merged_into(&self, existing: &SecretBlob) -> SecretBlob {
        let mut blob = existing.clone();
        for (k, v) in self.entries() {
            blob.data.insert(k.to_string(), v.as_bytes().to_vec());
        }
        blob.labels
            .extend(self.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        if self.owner.is_some() {
            blob.owner = self.owner.clone();
        }
        blob
    }
}

/// Whether storing `desired` over `existing` would change anything.
///
/// Compares certificate, key and CA bytes, the managed labels, and the
/// owner. Entries and labels written by someone else are not a difference.
pub fn write_needed(existing: &SecretBlob, desired: &CertificateSecret) -> bool {
    let data_differs = desired
        .entries()
        .into_iter()
        .any(|(k, v)| existing.data.get(k).map(Vec::as_slice) != Some(v.as_bytes()));
    let labels_differ = desired
        .labels
        .iter()
        .any(|(k, v)| existing.labels.get(k) != Some(v));
    let owner_differs = desired.owner.is_some() && existing.owner != desired.owner;
    data_differs || labels_differ || owner_differs
}

/// What [`SecretReconciler::store`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Writes certificate secrets only when their content changes.
pub struct SecretReconciler<S> {
    store: Arc<S>,
}

impl<S: SecretStore> SecretReconciler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self, desired: &CertificateSecret) -> PkiResult<StoreOutcome> {
        let existing = match self.store.get_secret(&desired.namespace, &desired.name)? {
            Some(existing) => existing,
            None => match self.store.create_secret(&desired.to_blob()) {
                Ok(()) => {
                    info!(namespace = %desired.namespace, secret = %desired.name, "secret created");
                    return Ok(StoreOutcome::Created);
                }
                Err(e) if e.is_already_exists() => {
                    match self.store.get_secret(&desired.namespace, &desired.name)? {
                        Some(existing) => existing,
                        // Created and deleted again between our calls.
                        None => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            },
        };

        if !write_needed(&existing, desired) {
            debug!(namespace = %desired.namespace, secret = %desired.name, "secret unchanged, skipping write");
            return Ok(StoreOutcome::Unchanged);
        }

        self.store.update_secret(&desired.merged_into(&existing))?;
        info!(namespace = %desired.namespace, secret = %desired.name, "secret updated");
        Ok(StoreOutcome::Updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use kilngrid_state::{StateResult, StateStore};

    fn desired() -> CertificateSecret {
        CertificateSecret {
            namespace: "ci".to_string(),
            name: "builders-server-tls".to_string(),
            kind: SecretKind::Server,
            cert_pem: "CERT".to_string(),
            key_pem: "KEY".to_string(),
            ca_pem: Some("CA".to_string()),
            labels: pool_labels("builders"),
            owner: Some(PoolRef::new("ci", "builders")),
        }
    }

    /// Counts writes reaching the wrapped store.
    struct CountingStore {
        inner: StateStore,
        creates: AtomicU32,
        updates: AtomicU32,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: StateStore::open_in_memory().unwrap(),
                creates: AtomicU32::new(0),
                updates: AtomicU32::new(0),
            }
        }

        fn writes(&self) -> u32 {
            self.creates.load(Ordering::SeqCst) + self.updates.load(Ordering::SeqCst)
        }
    }

    impl SecretStore for CountingStore {
        fn get_secret(&self, namespace: &str, name: &str) -> StateResult<Option<SecretBlob>> {
            self.inner.get_secret(namespace, name)
        }

        fn create_secret(&self, secret: &SecretBlob) -> StateResult<()> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            self.inner.create_secret(secret)
        }

        fn update_secret(&self, secret: &SecretBlob) -> StateResult<()> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            self.inner.update_secret(secret)
        }
    }

    #[test]
    fn data_keys_per_kind() {
        assert_eq!(SecretKind::Ca.cert_key(), "ca.crt");
        assert_eq!(SecretKind::Server.key_key(), "tls.key");
        assert_eq!(SecretKind::Client.cert_key(), "client.crt");

        let blob = desired().to_blob();
        let keys: Vec<&str> = blob.data.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["ca.crt", "tls.crt", "tls.key"]);
    }

    #[test]
    fn identical_content_needs_no_write() {
        let blob = desired().to_blob();
        assert!(!write_needed(&blob, &desired()));
    }

    #[test]
    fn each_field_change_needs_a_write() {
        let blob = desired().to_blob();

        let mut changed = desired();
        changed.cert_pem = "CERT2".to_string();
        assert!(write_needed(&blob, &changed));

        let mut changed = desired();
        changed.key_pem = "KEY2".to_string();
        assert!(write_needed(&blob, &changed));

        let mut changed = desired();
        changed.ca_pem = Some("CA2".to_string());
        assert!(write_needed(&blob, &changed));

        let mut changed = desired();
        changed.labels.insert(POOL_LABEL.to_string(), "other".to_string());
        assert!(write_needed(&blob, &changed));
    }

    #[test]
    fn foreign_keys_and_labels_are_not_a_difference() {
        let mut blob = desired().to_blob();
        blob.data.insert("extra".to_string(), b"x".to_vec());
        blob.labels.insert("team".to_string(), "infra".to_string());
        assert!(!write_needed(&blob, &desired()));
    }

    #[test]
    fn byte_identical_store_issues_zero_writes() {
        let store = Arc::new(CountingStore::new());
        store.inner.create_secret(&desired().to_blob()).unwrap();
        let secrets = SecretReconciler::new(store.clone());

        let outcome = secrets.store(&desired()).unwrap();

        assert_eq!(outcome, StoreOutcome::Unchanged);
        assert_eq!(store.writes(), 0);
    }

    #[test]
    fn absent_secret_is_created_then_left_alone() {
        let store = Arc::new(CountingStore::new());
        let secrets = SecretReconciler::new(store.clone());

        assert_eq!(secrets.store(&desired()).unwrap(), StoreOutcome::Created);
        assert_eq!(secrets.store(&desired()).unwrap(), StoreOutcome::Unchanged);
        assert_eq!(store.creates.load(Ordering::SeqCst), 1);
        assert_eq!(store.updates.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn update_keeps_unmanaged_entries() {
        let store = Arc::new(CountingStore::new());
        let mut blob = desired().to_blob();
        blob.data.insert("extra".to_string(), b"x".to_vec());
        store.inner.create_secret(&blob).unwrap();
        let secrets = SecretReconciler::new(store.clone());

        let mut rotated = desired();
        rotated.cert_pem = "CERT2".to_string();
        assert_eq!(secrets.store(&rotated).unwrap(), StoreOutcome::Updated);

        let stored = store.get_secret("ci", "builders-server-tls").unwrap().unwrap();
        assert_eq!(stored.get_str("tls.crt"), Some("CERT2"));
        assert_eq!(stored.get_str("extra"), Some("x"));
        assert_eq!(store.updates.load(Ordering::SeqCst), 1);
    }
}
