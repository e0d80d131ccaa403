//! Mapping from `kiln.toml` sections to controller settings.

use std::path::Path;

use anyhow::Context;

use kiln_core::{FleetConfig, KilnConfig, PkiConfig, PoolConfig};
use kilngrid_fleet::FleetSettings;
use kilngrid_pki::{CaSettings, IssuerSettings};
use kilngrid_state::{CertificateOverrides, PoolSpec};

/// Load `path`, or the built-in defaults when no file was given.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<KilnConfig> {
    match path {
        Some(path) => KilnConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(KilnConfig::default()),
    }
}

pub fn fleet_settings(config: &FleetConfig) -> FleetSettings {
    FleetSettings {
        stuck_threshold: config.stuck_threshold,
        schedule_window: config.schedule_window,
    }
}

pub fn ca_settings(config: &PkiConfig) -> CaSettings {
    CaSettings {
        secret_name: config.ca_secret_name.clone(),
        organization: config.ca_organization.clone(),
        validity: config.ca_validity,
    }
}

pub fn issuer_settings(config: &PkiConfig) -> IssuerSettings {
    IssuerSettings {
        server_duration: config.server_cert_duration,
        client_duration: config.client_cert_duration,
        renewal_window: config.renewal_window,
    }
}

pub fn pool_spec(pool: &PoolConfig) -> PoolSpec {
    PoolSpec {
        name: pool.name.clone(),
        namespace: pool.namespace.clone(),
        min_idle: pool.min_idle,
        scale_down_schedule: pool.scale_down_schedule.clone(),
        certificates: CertificateOverrides {
            server_duration: pool.server_cert_duration,
            client_duration: pool.client_cert_duration,
            extra_sans: pool.extra_sans.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn defaults_map_through() {
        let config = KilnConfig::default();

        let fleet = fleet_settings(&config.fleet);
        assert_eq!(fleet.stuck_threshold, Duration::from_secs(600));
        assert_eq!(fleet.schedule_window, Duration::from_secs(120));

        let ca = ca_settings(&config.pki);
        assert_eq!(ca.secret_name, "kiln-ca");

        let issuer = issuer_settings(&config.pki);
        assert_eq!(issuer.renewal_window, Duration::from_secs(720 * 3600));
    }

    #[test]
    fn pool_config_becomes_spec() {
        let config = KilnConfig::from_toml(
            r#"
            [[pools]]
            name = "builders"
            namespace = "ci"
            min_idle = 3
            scale_down_schedule = "0 22 * * 1-5"
            server_cert_duration = "72h"
            extra_sans = ["10.0.0.9"]
            "#,
        )
        .unwrap();

        let spec = pool_spec(&config.pools[0]);
        assert_eq!(spec.pool_ref().to_string(), "ci/builders");
        assert_eq!(spec.min_idle, 3);
        assert_eq!(spec.scale_down_schedule.as_deref(), Some("0 22 * * 1-5"));
        assert_eq!(spec.certificates.server_duration, Some(Duration::from_secs(72 * 3600)));
        assert_eq!(spec.certificates.client_duration, None);
        assert_eq!(spec.certificates.extra_sans, vec!["10.0.0.9"]);
    }

    #[test]
    fn missing_config_path_uses_defaults() {
        let config = load_config(None).unwrap();
        assert!(config.pools.is_empty());
    }

    #[test]
    fn unreadable_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(err.to_string().contains("absent.toml"));
    }
}
