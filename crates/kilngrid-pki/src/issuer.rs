//! Leaf certificate issuance.
//!
//! Every issuance generates a fresh P-256 key pair and signs it with the
//! current CA. Failures are returned as-is; retrying is up to the caller.

use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, SanType,
};
use time::OffsetDateTime;
use tracing::debug;

use kilngrid_state::CertificateInfo;

use crate::ca::CertificateAuthority;
use crate::error::{PkiError, PkiResult};
use crate::renewal::{renewal_time, should_rotate};

/// Subject and usage of a certificate to issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    pub common_name: String,
    /// DNS names or IP addresses.
    pub sans: Vec<String>,
    /// Validity; the issuer's default for the usage when unset.
    pub duration: Option<Duration>,
    pub is_server: bool,
    pub is_client: bool,
}

impl CertificateRequest {
    pub fn server(common_name: impl Into<String>, sans: Vec<String>) -> Self {
        Self {
            common_name: common_name.into(),
            sans,
            duration: None,
            is_server: true,
            is_client: false,
        }
    }

    pub fn client(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            sans: Vec::new(),
            duration: None,
            is_server: false,
            is_client: true,
        }
    }

    pub fn with_duration(mut self, duration: Option<Duration>) -> Self {
        self.duration = duration;
        self
    }
}

#[derive(Debug, Clone)]
pub struct IssuerSettings {
    pub server_duration: Duration,
    pub client_duration: Duration,
    /// Reissue this long before expiry.
    pub renewal_window: Duration,
}

impl Default for IssuerSettings {
    fn default() -> Self {
        Self {
            server_duration: Duration::from_secs(8_760 * 3600),
            client_duration: Duration::from_secs(8_760 * 3600),
            renewal_window: Duration::from_secs(720 * 3600),
        }
    }
}

/// PEM-encoded certificate and key with their validity metadata.
#[derive(Clone)]
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    pub info: CertificateInfo,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CertificateIssuer {
    settings: IssuerSettings,
}

impl CertificateIssuer {
    pub fn new(settings: IssuerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &IssuerSettings {
        &self.settings
    }

    /// Issue a certificate valid from `now`.
    pub fn issue(
        &self,
        request: &CertificateRequest,
        ca: &CertificateAuthority,
        now: DateTime<Utc>,
    ) -> PkiResult<IssuedCertificate> {
        let duration = self.duration_for(request);
        if duration.as_secs() == 0 {
            return Err(PkiError::InvalidRequest(format!(
                "{}: validity must be at least one second",
                request.common_name
            )));
        }

        // X.509 validity has second precision; keep the metadata aligned
        // with what ends up in the certificate.
        let not_before = DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now);
        let lifetime = i64::try_from(duration.as_secs())
            .ok()
            .and_then(TimeDelta::try_seconds)
            .ok_or_else(|| PkiError::InvalidRequest(format!("validity {duration:?} out of range")))?;
        let not_after = not_before
            .checked_add_signed(lifetime)
            .ok_or_else(|| PkiError::InvalidRequest(format!("validity {duration:?} out of range")))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, request.common_name.as_str());
        params.distinguished_name = dn;
        params.subject_alt_names = subject_alt_names(&request.sans)?;
        params.not_before = to_offset(not_before)?;
        params.not_after = to_offset(not_after)?;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        if request.is_server {
            params.extended_key_usages.push(ExtendedKeyUsagePurpose::ServerAuth);
        }
        if request.is_client {
            params.extended_key_usages.push(ExtendedKeyUsagePurpose::ClientAuth);
        }
        params.use_authority_key_identifier_extension = true;

        let key = KeyPair::generate().map_err(|e| PkiError::KeyGeneration(e.to_string()))?;
        let (ca_cert, ca_key) = ca.signer();
        let cert = params
            .signed_by(&key, ca_cert, ca_key)
            .map_err(|e| PkiError::Signing(e.to_string()))?;

        let info = CertificateInfo {
            not_before,
            not_after,
            renewal_time: Some(renewal_time(not_before, not_after, self.settings.renewal_window)),
        };
        debug!(
            common_name = %request.common_name,
            sans = request.sans.len(),
            not_after = %not_after,
            "certificate signed"
        );

        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            info,
        })
    }

    /// Whether `info` is due for reissue under this issuer's window.
    pub fn should_rotate(&self, info: Option<&CertificateInfo>, now: DateTime<Utc>) -> bool {
        should_rotate(info, self.settings.renewal_window, now)
    }

    fn duration_for(&self, request: &CertificateRequest) -> Duration {
        match request.duration {
            Some(d) => d,
            None if request.is_server => self.settings.server_duration,
            None => self.settings.client_duration,
        }
    }
}

fn subject_alt_names(sans: &[String]) -> PkiResult<Vec<SanType>> {
    sans.iter()
        .map(|san| match san.parse::<IpAddr>() {
            Ok(ip) => Ok(SanType::IpAddress(ip)),
            Err(_) => san
                .clone()
                .try_into()
                .map(SanType::DnsName)
                .map_err(|e| PkiError::InvalidRequest(format!("SAN {san:?}: {e}"))),
        })
        .collect()
}

pub(crate) fn to_offset(at: DateTime<Utc>) -> PkiResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| PkiError::InvalidRequest(format!("timestamp {at}: {e}")))
}

pub(crate) fn from_offset(at: OffsetDateTime) -> DateTime<Utc> {
    DateTime::from_timestamp(at.unix_timestamp(), 0).unwrap_or_default()
}
