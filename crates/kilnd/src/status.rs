//! Pool status report for `kilnd status`.

use serde::Serialize;

use kilngrid_state::{PoolCertificates, PoolSpec, PoolStatus, PoolStore};

#[derive(Debug, Serialize)]
pub struct PoolReport {
    pub pool: PoolSpec,
    pub status: Option<PoolStatus>,
    pub certificates: Option<PoolCertificates>,
}

/// Every stored pool with what the controllers last wrote for it.
pub fn collect<S: PoolStore>(store: &S) -> anyhow::Result<Vec<PoolReport>> {
    let mut pools = store.list_pools()?;
    pools.sort_by_key(PoolSpec::table_key);
    pools
        .into_iter()
        .map(|pool| {
            let pool_ref = pool.pool_ref();
            Ok(PoolReport {
                status: store.get_pool_status(&pool_ref)?,
                certificates: store.get_pool_certificates(&pool_ref)?,
                pool,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kilngrid_state::{CertificateOverrides, StateStore};

    fn pool(name: &str) -> PoolSpec {
        PoolSpec {
            name: name.to_string(),
            namespace: "ci".to_string(),
            min_idle: 1,
            scale_down_schedule: None,
            certificates: CertificateOverrides::default(),
        }
    }

    #[test]
    fn reports_pools_in_key_order() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_pool(&pool("zeta")).unwrap();
        store.put_pool(&pool("alpha")).unwrap();
        store
            .put_pool_status(
                &pool("alpha").pool_ref(),
                &PoolStatus {
                    idle: 1,
                    desired_idle: 1,
                    ..PoolStatus::default()
                },
            )
            .unwrap();

        let report = collect(&store).unwrap();

        assert_eq!(report.len(), 2);
        assert_eq!(report[0].pool.name, "alpha");
        assert_eq!(report[0].status.as_ref().map(|s| s.idle), Some(1));
        assert!(report[1].status.is_none());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json[0]["status"]["desired_idle"], 1);
    }
}
