//! Shared certificate authority.
//!
//! One CA per namespace, stored as a secret holding `ca.crt` and `ca.key`.
//! The CA is created lazily by the first certificate tick that needs it and
//! is never mutated afterwards; replacing it is a separate, explicit
//! operation.
//!
//! Stored material that cannot be used (unparseable, not a CA, or not a
//! P-256 key) is replaced like an absent CA, but loudly: every certificate
//! signed by the old CA stops being trusted.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};
use tracing::{error, info, warn};
use x509_parser::oid_registry::{OID_EC_P256, OID_KEY_TYPE_EC_PUBLIC_KEY};
use x509_parser::pem::parse_x509_pem;

use kilngrid_state::{SecretBlob, SecretStore};

use crate::error::{PkiError, PkiResult};
use crate::issuer::{from_offset, to_offset};
use crate::secrets::{CertificateSecret, SecretKind, SecretReconciler, StoreOutcome, ca_labels};

/// How the CA is named and how long it lives.
#[derive(Debug, Clone)]
pub struct CaSettings {
    /// Secret holding the CA in each namespace.
    pub secret_name: String,
    pub organization: String,
    pub validity: Duration,
}

impl Default for CaSettings {
    fn default() -> Self {
        Self {
            secret_name: "kiln-ca".to_string(),
            organization: "kiln".to_string(),
            validity: Duration::from_secs(87_600 * 3600),
        }
    }
}

/// A loaded CA: its PEM material plus the signer used to issue leaves.
///
/// Passed by reference to whatever issues certificates; there is no
/// process-wide CA.
pub struct CertificateAuthority {
    cert_pem: String,
    key_pem: String,
    key: KeyPair,
    signer: Certificate,
    not_after: DateTime<Utc>,
}

impl CertificateAuthority {
    /// Generate a fresh self-signed P-256 CA valid from `now`.
    pub fn generate(settings: &CaSettings, now: DateTime<Utc>) -> PkiResult<Self> {
        let key = KeyPair::generate().map_err(|e| PkiError::KeyGeneration(e.to_string()))?;

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyCertSign];

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, settings.organization.as_str());
        dn.push(DnType::CommonName, format!("{} CA", settings.organization));
        params.distinguished_name = dn;

        let validity = TimeDelta::from_std(settings.validity)
            .map_err(|e| PkiError::InvalidRequest(format!("CA validity: {e}")))?;
        let not_after = now
            .checked_add_signed(validity)
            .ok_or_else(|| PkiError::InvalidRequest("CA validity out of range".to_string()))?;
        params.not_before = to_offset(now)?;
        params.not_after = to_offset(not_after)?;
        let params_not_after = params.not_after;

        let signer = params
            .self_signed(&key)
            .map_err(|e| PkiError::Signing(e.to_string()))?;

        Ok(Self {
            cert_pem: signer.pem(),
            key_pem: key.serialize_pem(),
            not_after: from_offset(params_not_after),
            key,
            signer,
        })
    }

    /// Load stored CA material, rejecting anything that is not a P-256 CA.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> PkiResult<Self> {
        let key =
            KeyPair::from_pem(key_pem).map_err(|e| PkiError::InvalidPem(format!("CA key: {e}")))?;
        if key.algorithm() != &rcgen::PKCS_ECDSA_P256_SHA256 {
            return Err(PkiError::UnsupportedKeyAlgorithm(format!("{:?}", key.algorithm())));
        }
        check_certificate_key(cert_pem, &key)?;

        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| PkiError::InvalidPem(format!("CA certificate: {e}")))?;
        if !matches!(params.is_ca, IsCa::Ca(_)) {
            return Err(PkiError::InvalidPem(
                "certificate does not carry CA basic constraints".to_string(),
            ));
        }

        // rcgen signs with a `Certificate`; rebuilding it from the stored
        // params keeps the subject and key, which is all a leaf references.
        let not_after = from_offset(params.not_after);
        let signer = params
            .self_signed(&key)
            .map_err(|e| PkiError::Signing(e.to_string()))?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            key,
            signer,
            not_after,
        })
    }

    /// The stored certificate, as distributed in `ca.crt`.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub(crate) fn signer(&self) -> (&Certificate, &KeyPair) {
        (&self.signer, &self.key)
    }
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// The certificate must carry a P-256 public key, and it must be `key`'s.
/// Otherwise leaves signed with `key` would not verify against `ca.crt`.
fn check_certificate_key(cert_pem: &str, key: &KeyPair) -> PkiResult<()> {
    let (_, pem) = parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| PkiError::InvalidPem(format!("CA certificate: {e}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| PkiError::InvalidPem(format!("CA certificate: {e}")))?;

    let spki = cert.public_key();
    let curve = spki
        .algorithm
        .parameters
        .as_ref()
        .and_then(|params| params.as_oid().ok());
    if spki.algorithm.algorithm != OID_KEY_TYPE_EC_PUBLIC_KEY || curve != Some(OID_EC_P256) {
        return Err(PkiError::UnsupportedKeyAlgorithm(format!(
            "CA certificate key {}",
            spki.algorithm.algorithm
        )));
    }
    if &*spki.subject_public_key.data != key.public_key_raw() {
        return Err(PkiError::InvalidPem(
            "CA certificate does not match the stored key".to_string(),
        ));
    }
    Ok(())
}

/// What is currently stored under the CA secret name.
enum Stored {
    Absent,
    Valid(CertificateAuthority),
    Unusable(PkiError),
}

/// Bootstraps, loads and replaces the CA stored in a namespace.
///
/// Bootstrap and replacement are serialized per namespace, so pools that
/// share a namespace and tick concurrently end up signing with the same CA.
pub struct CaManager<S> {
    store: Arc<S>,
    secrets: SecretReconciler<S>,
    settings: CaSettings,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<S: SecretStore> CaManager<S> {
    pub fn new(store: Arc<S>, settings: CaSettings) -> Self {
        Self {
            secrets: SecretReconciler::new(store.clone()),
            store,
            settings,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &CaSettings {
        &self.settings
    }

    /// Return the namespace's CA, creating it if absent and replacing it
    /// if the stored material is unusable.
    pub fn ensure_ca(&self, namespace: &str, now: DateTime<Utc>) -> PkiResult<CertificateAuthority> {
        let lock = self.namespace_lock(namespace);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        match self.load(namespace)? {
            Stored::Valid(ca) => Ok(ca),
            Stored::Absent => self.bootstrap(namespace, now),
            Stored::Unusable(reason) => {
                error!(
                    alert = true,
                    namespace,
                    secret = %self.settings.secret_name,
                    error = %reason,
                    "stored CA is unusable, regenerating; certificates signed by it are no longer trusted"
                );
                let ca = CertificateAuthority::generate(&self.settings, now)?;
                // Another writer may have replaced it since the first read.
                if let Stored::Valid(current) = self.load(namespace)? {
                    info!(namespace, "CA replaced concurrently, using stored copy");
                    return Ok(current);
                }
                self.persist(namespace, &ca)?;
                Ok(ca)
            }
        }
    }

    /// Strict read: never generates.
    pub fn get_ca(&self, namespace: &str) -> PkiResult<CertificateAuthority> {
        match self.load(namespace)? {
            Stored::Valid(ca) => Ok(ca),
            Stored::Absent => Err(PkiError::CaNotFound {
                namespace: namespace.to_string(),
                secret: self.settings.secret_name.clone(),
            }),
            Stored::Unusable(reason) => Err(reason),
        }
    }

    /// Replace the CA unconditionally. Every leaf in the namespace is
    /// reissued on its next certificate tick.
    pub fn regenerate_ca(&self, namespace: &str, now: DateTime<Utc>) -> PkiResult<CertificateAuthority> {
        let lock = self.namespace_lock(namespace);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let ca = CertificateAuthority::generate(&self.settings, now)?;
        self.persist(namespace, &ca)?;
        warn!(
            namespace,
            secret = %self.settings.secret_name,
            not_after = %ca.not_after(),
            "CA regenerated"
        );
        Ok(ca)
    }

    fn namespace_lock(&self, namespace: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(namespace.to_string()).or_default().clone()
    }

    fn load(&self, namespace: &str) -> PkiResult<Stored> {
        let Some(secret) = self.store.get_secret(namespace, &self.settings.secret_name)? else {
            return Ok(Stored::Absent);
        };
        Ok(match stored_material(&secret) {
            Ok((cert, key)) => match CertificateAuthority::from_pem(cert, key) {
                Ok(ca) => Stored::Valid(ca),
                Err(e) if e.is_corrupt_material() => Stored::Unusable(e),
                Err(e) => return Err(e),
            },
            Err(e) => Stored::Unusable(e),
        })
    }

    fn bootstrap(&self, namespace: &str, now: DateTime<Utc>) -> PkiResult<CertificateAuthority> {
        let ca = CertificateAuthority::generate(&self.settings, now)?;
        let blob = self.ca_secret(namespace, &ca).to_blob();
        match self.store.create_secret(&blob) {
            Ok(()) => {
                info!(
                    namespace,
                    secret = %self.settings.secret_name,
                    not_after = %ca.not_after(),
                    "CA bootstrapped"
                );
                Ok(ca)
            }
            Err(e) if e.is_already_exists() => {
                // Another reconciler won the race; its CA is the one.
                info!(namespace, "CA created concurrently, using stored copy");
                self.get_ca(namespace)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn persist(&self, namespace: &str, ca: &CertificateAuthority) -> PkiResult<StoreOutcome> {
        self.secrets.store(&self.ca_secret(namespace, ca))
    }

    fn ca_secret(&self, namespace: &str, ca: &CertificateAuthority) -> CertificateSecret {
        CertificateSecret {
            namespace: namespace.to_string(),
            name: self.settings.secret_name.clone(),
            kind: SecretKind::Ca,
            cert_pem: ca.cert_pem().to_string(),
            key_pem: ca.key_pem().to_string(),
            ca_pem: None,
            labels: ca_labels(),
            owner: None,
        }
    }
}

fn stored_material(secret: &SecretBlob) -> PkiResult<(&str, &str)> {
    let cert = secret
        .get_str(SecretKind::Ca.cert_key())
        .ok_or_else(|| PkiError::InvalidPem(format!("{} missing or not UTF-8", SecretKind::Ca.cert_key())))?;
    let key = secret
        .get_str(SecretKind::Ca.key_key())
        .ok_or_else(|| PkiError::InvalidPem(format!("{} missing or not UTF-8", SecretKind::Ca.key_key())))?;
    Ok((cert, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    use kilngrid_state::StateStore;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    fn manager(store: &Arc<StateStore>) -> CaManager<StateStore> {
        CaManager::new(store.clone(), CaSettings::default())
    }

    fn raw_ca_secret(cert: &str, key: &str) -> SecretBlob {
        let mut data = BTreeMap::new();
        data.insert("ca.crt".to_string(), cert.as_bytes().to_vec());
        data.insert("ca.key".to_string(), key.as_bytes().to_vec());
        SecretBlob {
            namespace: "ci".to_string(),
            name: "kiln-ca".to_string(),
            data,
            labels: BTreeMap::new(),
            owner: None,
        }
    }

    #[test]
    fn generated_ca_round_trips_through_pem() {
        let ca = CertificateAuthority::generate(&CaSettings::default(), now()).unwrap();
        let loaded = CertificateAuthority::from_pem(ca.cert_pem(), ca.key_pem()).unwrap();

        assert_eq!(loaded.cert_pem(), ca.cert_pem());
        assert_eq!(loaded.not_after(), now() + TimeDelta::hours(87_600));
    }

    #[test]
    fn ensure_ca_bootstraps_once() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let cas = manager(&store);

        let first = cas.ensure_ca("ci", now()).unwrap();
        let second = cas.ensure_ca("ci", now()).unwrap();

        assert_eq!(first.cert_pem(), second.cert_pem());
        let secret = store.get_secret("ci", "kiln-ca").unwrap().unwrap();
        assert_eq!(secret.labels.get("kiln.dev/component").map(String::as_str), Some("ca"));
        assert!(secret.owner.is_none());
    }

    #[test]
    fn get_ca_never_generates() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let err = manager(&store).get_ca("ci").unwrap_err();

        assert!(matches!(err, PkiError::CaNotFound { .. }));
        assert!(store.get_secret("ci", "kiln-ca").unwrap().is_none());
    }

    #[test]
    fn namespaces_have_independent_cas() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let cas = manager(&store);

        let ci = cas.ensure_ca("ci", now()).unwrap();
        let release = cas.ensure_ca("release", now()).unwrap();
        assert_ne!(ci.cert_pem(), release.cert_pem());
    }

    #[test]
    fn non_p256_ca_is_replaced() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let ed_key = KeyPair::generate_for(&rcgen::PKCS_ED25519).unwrap();
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ed_cert = params.self_signed(&ed_key).unwrap();
        store
            .create_secret(&raw_ca_secret(&ed_cert.pem(), &ed_key.serialize_pem()))
            .unwrap();
        let cas = manager(&store);

        assert!(matches!(
            cas.get_ca("ci").unwrap_err(),
            PkiError::UnsupportedKeyAlgorithm(_)
        ));

        let ca = cas.ensure_ca("ci", now()).unwrap();
        assert_ne!(ca.cert_pem(), ed_cert.pem());

        let reloaded = cas.get_ca("ci").unwrap();
        assert_eq!(reloaded.cert_pem(), ca.cert_pem());
        let key = KeyPair::from_pem(reloaded.key_pem()).unwrap();
        assert_eq!(key.algorithm(), &rcgen::PKCS_ECDSA_P256_SHA256);
    }

    #[test]
    fn garbage_ca_is_replaced() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        store
            .create_secret(&raw_ca_secret("not a certificate", "not a key"))
            .unwrap();

        let ca = manager(&store).ensure_ca("ci", now()).unwrap();

        let secret = store.get_secret("ci", "kiln-ca").unwrap().unwrap();
        assert_eq!(secret.get_str("ca.crt"), Some(ca.cert_pem()));
    }

    #[test]
    fn missing_key_entry_is_replaced() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let mut secret = raw_ca_secret("x", "y");
        secret.data.remove("ca.key");
        store.create_secret(&secret).unwrap();
        let cas = manager(&store);

        assert!(cas.get_ca("ci").unwrap_err().is_corrupt_material());
        cas.ensure_ca("ci", now()).unwrap();
        cas.get_ca("ci").unwrap();
    }

    #[test]
    fn non_ca_certificate_is_rejected() {
        let key = KeyPair::generate().unwrap();
        let leaf = CertificateParams::default().self_signed(&key).unwrap();

        let err = CertificateAuthority::from_pem(&leaf.pem(), &key.serialize_pem()).unwrap_err();
        assert!(matches!(err, PkiError::InvalidPem(_)));
    }

    #[test]
    fn certificate_must_match_key() {
        let a = CertificateAuthority::generate(&CaSettings::default(), now()).unwrap();
        let b = CertificateAuthority::generate(&CaSettings::default(), now()).unwrap();

        let err = CertificateAuthority::from_pem(a.cert_pem(), b.key_pem()).unwrap_err();
        assert!(matches!(err, PkiError::InvalidPem(_)));
        assert!(err.is_corrupt_material());
    }

    #[test]
    fn regenerate_replaces_valid_ca() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let cas = manager(&store);
        let original = cas.ensure_ca("ci", now()).unwrap();

        let replacement = cas.regenerate_ca("ci", now()).unwrap();

        assert_ne!(original.cert_pem(), replacement.cert_pem());
        assert_eq!(cas.get_ca("ci").unwrap().cert_pem(), replacement.cert_pem());
    }
}
