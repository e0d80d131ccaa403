//! kilngrid-pki — certificate authority and leaf certificate lifecycle for
//! worker pools.
//!
//! Each namespace has one P-256 CA stored as a secret. Every pool gets a
//! gateway (server) certificate and a client certificate signed by it,
//! renewed ahead of expiry and reissued whenever the CA changes.
//!
//! # Renewal
//!
//! ```text
//! validity = not_after - not_before
//! renewal  = not_after - window            if validity >= window
//!          = not_after - 0.8 * validity    otherwise
//! renewal  = max(renewal, not_before)
//! ```

pub mod ca;
pub mod error;
pub mod issuer;
pub mod lifecycle;
pub mod renewal;
pub mod secrets;

pub use ca::{CaManager, CaSettings, CertificateAuthority};
pub use error::{PkiError, PkiResult};
pub use issuer::{CertificateIssuer, CertificateRequest, IssuedCertificate, IssuerSettings};
pub use lifecycle::{CertTickOutcome, CertificateLifecycle, LeafKind, LeafOutcome, RotationReason};
pub use renewal::{renewal_time, should_rotate};
pub use secrets::{CertificateSecret, SecretKind, SecretReconciler, StoreOutcome, write_needed};
