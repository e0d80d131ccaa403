//! CA bootstrap, race and recovery behaviour against the redb store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use rcgen::KeyPair;

use kilngrid_pki::*;
use kilngrid_state::*;

const RSA_CA_CERT: &str = include_str!("fixtures/rsa-ca.crt");
const RSA_CA_KEY: &str = include_str!("fixtures/rsa-ca.key");

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
}

fn ca_blob(namespace: &str, cert: &str, key: &str) -> SecretBlob {
    SecretBlob {
        namespace: namespace.to_string(),
        name: "kiln-ca".to_string(),
        data: BTreeMap::from([
            ("ca.crt".to_string(), cert.as_bytes().to_vec()),
            ("ca.key".to_string(), key.as_bytes().to_vec()),
        ]),
        labels: BTreeMap::new(),
        owner: None,
    }
}

#[test]
fn rsa_ca_is_replaced_with_p256() {
    let store = Arc::new(StateStore::open_in_memory().unwrap());
    store.create_secret(&ca_blob("ci", RSA_CA_CERT, RSA_CA_KEY)).unwrap();
    let cas = CaManager::new(store.clone(), CaSettings::default());

    assert!(cas.get_ca("ci").unwrap_err().is_corrupt_material());

    let ca = cas.ensure_ca("ci", now()).unwrap();
    assert_ne!(ca.cert_pem(), RSA_CA_CERT);

    let reloaded = cas.get_ca("ci").unwrap();
    let key = KeyPair::from_pem(reloaded.key_pem()).unwrap();
    assert_eq!(key.algorithm(), &rcgen::PKCS_ECDSA_P256_SHA256);

    // The replacement carries the managed labels.
    let secret = store.get_secret("ci", "kiln-ca").unwrap().unwrap();
    assert_eq!(
        secret.labels.get("app.kubernetes.io/managed-by").map(String::as_str),
        Some("kiln")
    );
}

#[test]
fn leaves_issued_after_recovery_chain_to_new_ca() {
    let store = Arc::new(StateStore::open_in_memory().unwrap());
    store.create_secret(&ca_blob("ci", RSA_CA_CERT, RSA_CA_KEY)).unwrap();
    let certs = CertificateLifecycle::new(store.clone(), CaSettings::default(), IssuerSettings::default());
    let pool = PoolSpec {
        name: "builders".to_string(),
        namespace: "ci".to_string(),
        min_idle: 0,
        scale_down_schedule: None,
        certificates: CertificateOverrides::default(),
    };
    let (_tx, cancel) = tokio::sync::watch::channel(false);

    certs.reconcile(&pool, now(), &cancel).unwrap();

    let ca = store.get_secret("ci", "kiln-ca").unwrap().unwrap();
    let server = store.get_secret("ci", "builders-server-tls").unwrap().unwrap();
    assert_ne!(ca.get_str("ca.crt"), Some(RSA_CA_CERT));
    assert_eq!(server.get_str("ca.crt"), ca.get_str("ca.crt"));
}

#[test]
fn mismatched_certificate_and_key_are_regenerated() {
    let a = CertificateAuthority::generate(&CaSettings::default(), now()).unwrap();
    let b = CertificateAuthority::generate(&CaSettings::default(), now()).unwrap();
    let store = Arc::new(StateStore::open_in_memory().unwrap());
    store.create_secret(&ca_blob("ci", a.cert_pem(), b.key_pem())).unwrap();
    let cas = CaManager::new(store.clone(), CaSettings::default());

    assert!(matches!(cas.get_ca("ci").unwrap_err(), PkiError::InvalidPem(_)));

    let ca = cas.ensure_ca("ci", now()).unwrap();
    assert_ne!(ca.cert_pem(), a.cert_pem());
    assert_ne!(ca.key_pem(), b.key_pem());

    // The replacement pair loads cleanly.
    let reloaded = cas.get_ca("ci").unwrap();
    assert_eq!(reloaded.cert_pem(), ca.cert_pem());
}

#[test]
fn rsa_certificate_with_p256_key_is_regenerated() {
    let key = KeyPair::generate().unwrap();
    let store = Arc::new(StateStore::open_in_memory().unwrap());
    store
        .create_secret(&ca_blob("ci", RSA_CA_CERT, &key.serialize_pem()))
        .unwrap();
    let cas = CaManager::new(store.clone(), CaSettings::default());

    assert!(matches!(
        cas.get_ca("ci").unwrap_err(),
        PkiError::UnsupportedKeyAlgorithm(_)
    ));

    let ca = cas.ensure_ca("ci", now()).unwrap();
    assert_ne!(ca.cert_pem(), RSA_CA_CERT);
    cas.get_ca("ci").unwrap();
}

/// Hides the CA from the first read, as if another reconciler created it
/// between our read and our create.
struct LateCaStore {
    inner: StateStore,
    hidden: AtomicBool,
}

impl SecretStore for LateCaStore {
    fn get_secret(&self, namespace: &str, name: &str) -> StateResult<Option<SecretBlob>> {
        if self.hidden.swap(false, Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.get_secret(namespace, name)
    }

    fn create_secret(&self, secret: &SecretBlob) -> StateResult<()> {
        self.inner.create_secret(secret)
    }

    fn update_secret(&self, secret: &SecretBlob) -> StateResult<()> {
        self.inner.update_secret(secret)
    }
}

#[test]
fn concurrent_bootstrap_keeps_the_winner() {
    let inner = StateStore::open_in_memory().unwrap();
    let winner = CaManager::new(Arc::new(inner.clone()), CaSettings::default())
        .ensure_ca("ci", now())
        .unwrap();

    let racing = Arc::new(LateCaStore {
        inner: inner.clone(),
        hidden: AtomicBool::new(true),
    });
    let loser = CaManager::new(racing, CaSettings::default())
        .ensure_ca("ci", now())
        .unwrap();

    assert_eq!(loser.cert_pem(), winner.cert_pem());
    let stored = inner.get_secret("ci", "kiln-ca").unwrap().unwrap();
    assert_eq!(stored.get_str("ca.crt"), Some(winner.cert_pem()));
}

#[test]
fn ca_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kiln.redb");

    let original = {
        let store = Arc::new(StateStore::open(&path).unwrap());
        CaManager::new(store, CaSettings::default())
            .ensure_ca("ci", now())
            .unwrap()
    };

    let store = Arc::new(StateStore::open(&path).unwrap());
    let reloaded = CaManager::new(store, CaSettings::default()).get_ca("ci").unwrap();
    assert_eq!(reloaded.cert_pem(), original.cert_pem());
}

/// Serves an outdated copy of the CA secret on the first read, as if
/// another reconciler replaced it right after we looked.
struct StaleCaStore {
    inner: StateStore,
    stale: Mutex<Option<SecretBlob>>,
}

impl SecretStore for StaleCaStore {
    fn get_secret(&self, namespace: &str, name: &str) -> StateResult<Option<SecretBlob>> {
        if let Some(stale) = self.stale.lock().unwrap().take() {
            return Ok(Some(stale));
        }
        self.inner.get_secret(namespace, name)
    }

    fn create_secret(&self, secret: &SecretBlob) -> StateResult<()> {
        self.inner.create_secret(secret)
    }

    fn update_secret(&self, secret: &SecretBlob) -> StateResult<()> {
        self.inner.update_secret(secret)
    }
}

#[test]
fn concurrent_recovery_keeps_the_winner() {
    let inner = StateStore::open_in_memory().unwrap();
    inner
        .create_secret(&ca_blob("ci", "not a certificate", "not a key"))
        .unwrap();
    let winner = CaManager::new(Arc::new(inner.clone()), CaSettings::default())
        .ensure_ca("ci", now())
        .unwrap();

    let racing = Arc::new(StaleCaStore {
        inner: inner.clone(),
        stale: Mutex::new(Some(ca_blob("ci", "not a certificate", "not a key"))),
    });
    let loser = CaManager::new(racing, CaSettings::default())
        .ensure_ca("ci", now())
        .unwrap();

    assert_eq!(loser.cert_pem(), winner.cert_pem());
    let stored = inner.get_secret("ci", "kiln-ca").unwrap().unwrap();
    assert_eq!(stored.get_str("ca.crt"), Some(winner.cert_pem()));
}

#[test]
fn pools_sharing_a_namespace_recover_to_one_ca() {
    let store = Arc::new(StateStore::open_in_memory().unwrap());
    store
        .create_secret(&ca_blob("ci", RSA_CA_CERT, RSA_CA_KEY))
        .unwrap();
    let certs = CertificateLifecycle::new(store.clone(), CaSettings::default(), IssuerSettings::default());
    let (_tx, cancel) = tokio::sync::watch::channel(false);
    let pools: Vec<PoolSpec> = (0..6)
        .map(|i| PoolSpec {
            name: format!("pool-{i}"),
            namespace: "ci".to_string(),
            min_idle: 0,
            scale_down_schedule: None,
            certificates: CertificateOverrides::default(),
        })
        .collect();

    std::thread::scope(|scope| {
        for pool in &pools {
            let (certs, cancel) = (&certs, &cancel);
            scope.spawn(move || certs.reconcile(pool, now(), cancel).unwrap());
        }
    });

    let ca = store.get_secret("ci", "kiln-ca").unwrap().unwrap();
    for pool in &pools {
        for suffix in ["server-tls", "client-tls"] {
            let leaf = store
                .get_secret("ci", &format!("{}-{suffix}", pool.name))
                .unwrap()
                .unwrap();
            assert_eq!(leaf.get_str("ca.crt"), ca.get_str("ca.crt"), "{}", pool.name);
        }
    }
}
