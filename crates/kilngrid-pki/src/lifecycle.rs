//! Per-pool certificate tick.
//!
//! Each pool gets a gateway (server) certificate and a client certificate,
//! both signed by the namespace CA. A tick ensures the CA, then for each
//! certificate decides whether it must be (re)issued, stores the secret,
//! and records the validity metadata in the pool's certificate status.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{info, warn};

use kilngrid_state::{
    CertificateStatus, PoolCertificates, PoolRef, PoolSpec, PoolStore, SecretBlob, SecretStore,
};

use crate::ca::{CaManager, CaSettings, CertificateAuthority};
use crate::error::PkiResult;
use crate::issuer::{CertificateIssuer, CertificateRequest, IssuerSettings};
use crate::secrets::{CA_BUNDLE_KEY, CertificateSecret, SecretKind, SecretReconciler, pool_labels};

/// The two certificates every pool carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafKind {
    Server,
    Client,
}

impl LeafKind {
    pub const ALL: [LeafKind; 2] = [LeafKind::Server, LeafKind::Client];

    pub fn secret_name(self, pool: &str) -> String {
        match self {
            Self::Server => format!("{pool}-server-tls"),
            Self::Client => format!("{pool}-client-tls"),
        }
    }

    fn secret_kind(self) -> SecretKind {
        match self {
            Self::Server => SecretKind::Server,
            Self::Client => SecretKind::Client,
        }
    }

    /// Subject, SANs and validity for `pool`.
    pub fn request(self, pool: &PoolSpec) -> CertificateRequest {
        match self {
            Self::Server => {
                let (name, ns) = (&pool.name, &pool.namespace);
                let mut sans = vec![
                    name.clone(),
                    format!("{name}.{ns}"),
                    format!("{name}.{ns}.svc"),
                    format!("{name}.{ns}.svc.cluster.local"),
                ];
                for extra in &pool.certificates.extra_sans {
                    if !sans.contains(extra) {
                        sans.push(extra.clone());
                    }
                }
                CertificateRequest::server(name.as_str(), sans)
                    .with_duration(pool.certificates.server_duration)
            }
            Self::Client => CertificateRequest::client(format!("{}-client", pool.name))
                .with_duration(pool.certificates.client_duration),
        }
    }

    fn status(self, certs: &PoolCertificates) -> Option<&CertificateStatus> {
        match self {
            Self::Server => certs.server.as_ref(),
            Self::Client => certs.client.as_ref(),
        }
    }

    fn status_mut(self, certs: &mut PoolCertificates) -> &mut Option<CertificateStatus> {
        match self {
            Self::Server => &mut certs.server,
            Self::Client => &mut certs.client,
        }
    }
}

impl fmt::Display for LeafKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Server => "server",
            Self::Client => "client",
        })
    }
}

/// Why a certificate was (re)issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationReason {
    /// No secret, or the secret lacks the certificate or key.
    Missing,
    /// No validity metadata recorded for the secret.
    Untracked,
    /// Renewal time reached.
    Due,
    /// Signed by a CA other than the current one.
    CaChanged,
}

/// Result of one certificate within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafOutcome {
    Current,
    Issued(RotationReason),
    /// Issuance or storage failed; retried next tick.
    Failed,
    /// The tick was cancelled before this certificate was looked at.
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CertTickOutcome {
    pub server: LeafOutcome,
    pub client: LeafOutcome,
    pub cancelled: bool,
    pub certificates: PoolCertificates,
}

impl CertTickOutcome {
    fn set(&mut self, kind: LeafKind, outcome: LeafOutcome) {
        match kind {
            LeafKind::Server => self.server = outcome,
            LeafKind::Client => self.client = outcome,
        }
    }
}

/// Decide whether the certificate in `secret` must be reissued.
pub fn rotation_reason(
    kind: LeafKind,
    secret: Option<&SecretBlob>,
    status: Option<&CertificateStatus>,
    ca: &CertificateAuthority,
    issuer: &CertificateIssuer,
    now: DateTime<Utc>,
) -> Option<RotationReason> {
    let Some(secret) = secret else {
        return Some(RotationReason::Missing);
    };
    let secret_kind = kind.secret_kind();
    if !secret.data.contains_key(secret_kind.cert_key()) || !secret.data.contains_key(secret_kind.key_key()) {
        return Some(RotationReason::Missing);
    }
    if secret.get_str(CA_BUNDLE_KEY) != Some(ca.cert_pem()) {
        return Some(RotationReason::CaChanged);
    }
    let Some(status) = status.filter(|s| s.secret_name == secret.name) else {
        return Some(RotationReason::Untracked);
    };
    if issuer.should_rotate(Some(&status.info), now) {
        return Some(RotationReason::Due);
    }
    None
}

/// Keeps each pool's certificates issued, current, and stored.
pub struct CertificateLifecycle<S> {
    store: Arc<S>,
    cas: CaManager<S>,
    issuer: CertificateIssuer,
    secrets: SecretReconciler<S>,
}

impl<S: SecretStore + PoolStore> CertificateLifecycle<S> {
    pub fn new(store: Arc<S>, ca: CaSettings, issuer: IssuerSettings) -> Self {
        Self {
            cas: CaManager::new(store.clone(), ca),
            issuer: CertificateIssuer::new(issuer),
            secrets: SecretReconciler::new(store.clone()),
            store,
        }
    }

    pub fn ca_manager(&self) -> &CaManager<S> {
        &self.cas
    }

    pub fn issuer(&self) -> &CertificateIssuer {
        &self.issuer
    }

    /// Run one certificate tick for `pool`.
    ///
    /// CA and store read failures abort the tick. A failure issuing or
    /// storing one certificate is logged and does not affect the other.
    pub fn reconcile(
        &self,
        pool: &PoolSpec,
        now: DateTime<Utc>,
        cancel: &watch::Receiver<bool>,
    ) -> PkiResult<CertTickOutcome> {
        let pool_ref = pool.pool_ref();
        let previous = self.store.get_pool_certificates(&pool_ref)?.unwrap_or_default();
        let mut outcome = CertTickOutcome {
            server: LeafOutcome::Skipped,
            client: LeafOutcome::Skipped,
            cancelled: false,
            certificates: previous.clone(),
        };
        if *cancel.borrow() {
            outcome.cancelled = true;
            return Ok(outcome);
        }

        let ca = self.cas.ensure_ca(&pool.namespace, now)?;

        for kind in LeafKind::ALL {
            if *cancel.borrow() {
                outcome.cancelled = true;
                break;
            }
            let (leaf, status) = self.reconcile_leaf(pool, &pool_ref, kind, &ca, &previous, now)?;
            outcome.set(kind, leaf);
            if let Some(status) = status {
                *kind.status_mut(&mut outcome.certificates) = Some(status);
            }
        }

        if outcome.certificates != previous {
            self.store.put_pool_certificates(&pool_ref, &outcome.certificates)?;
        }
        Ok(outcome)
    }

    fn reconcile_leaf(
        &self,
        pool: &PoolSpec,
        pool_ref: &PoolRef,
        kind: LeafKind,
        ca: &CertificateAuthority,
        previous: &PoolCertificates,
        now: DateTime<Utc>,
    ) -> PkiResult<(LeafOutcome, Option<CertificateStatus>)> {
        let secret_name = kind.secret_name(&pool.name);
        let existing = self.store.get_secret(&pool.namespace, &secret_name)?;
        let Some(reason) = rotation_reason(
            kind,
            existing.as_ref(),
            kind.status(previous),
            ca,
            &self.issuer,
            now,
        ) else {
            return Ok((LeafOutcome::Current, None));
        };

        let issued = match self.issuer.issue(&kind.request(pool), ca, now) {
            Ok(issued) => issued,
            Err(e) => {
                warn!(pool = %pool_ref, certificate = %kind, error = %e, "certificate issuance failed");
                return Ok((LeafOutcome::Failed, None));
            }
        };

        let secret = CertificateSecret {
            namespace: pool.namespace.clone(),
            name: secret_name.clone(),
            kind: kind.secret_kind(),
            cert_pem: issued.cert_pem,
            key_pem: issued.key_pem,
            ca_pem: Some(ca.cert_pem().to_string()),
            labels: pool_labels(&pool.name),
            owner: Some(pool_ref.clone()),
        };
        if let Err(e) = self.secrets.store(&secret) {
            warn!(pool = %pool_ref, secret = %secret_name, error = %e, "failed to store certificate");
            return Ok((LeafOutcome::Failed, None));
        }

        info!(
            pool = %pool_ref,
            certificate = %kind,
            reason = ?reason,
            not_after = %issued.info.not_after,
            "certificate issued"
        );
        Ok((
            LeafOutcome::Issued(reason),
            Some(CertificateStatus {
                secret_name,
                info: issued.info,
            }),
        ))
    }
}
