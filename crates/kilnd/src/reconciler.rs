//! Reconciliation loop — drives the fleet and certificate ticks for every
//! pool on a fixed interval.
//!
//! Each pool's tick runs on the blocking pool because store calls are
//! synchronous. A round waits for every pool before the next one starts,
//! so a pool never has two ticks in flight.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use kilngrid_fleet::{FleetController, FleetSettings, TickOutcome};
use kilngrid_pki::{CaSettings, CertTickOutcome, CertificateLifecycle, IssuerSettings};
use kilngrid_state::{PoolRef, PoolSpec, PoolStore, SecretStore, WorkerStore};

/// Everything one pool's tick did. A `None` half failed and was logged.
#[derive(Debug)]
pub struct PoolTick {
    pub pool: PoolRef,
    pub fleet: Option<TickOutcome>,
    pub certificates: Option<CertTickOutcome>,
}

pub struct Reconciler<S> {
    store: Arc<S>,
    fleet: Arc<FleetController<S>>,
    certs: Arc<CertificateLifecycle<S>>,
}

impl<S> Reconciler<S>
where
    S: WorkerStore + SecretStore + PoolStore + 'static,
{
    pub fn new(store: Arc<S>, fleet: FleetSettings, ca: CaSettings, issuer: IssuerSettings) -> Self {
        Self {
            fleet: Arc::new(FleetController::new(store.clone(), fleet)),
            certs: Arc::new(CertificateLifecycle::new(store.clone(), ca, issuer)),
            store,
        }
    }

    pub fn certificates(&self) -> &CertificateLifecycle<S> {
        &self.certs
    }

    /// Run one round over every stored pool at `now`.
    pub async fn tick_all(
        &self,
        now: DateTime<Utc>,
        cancel: &watch::Receiver<bool>,
    ) -> anyhow::Result<Vec<PoolTick>> {
        let store = self.store.clone();
        let pools = tokio::task::spawn_blocking(move || store.list_pools()).await??;

        let mut tasks = JoinSet::new();
        for pool in pools {
            let fleet = self.fleet.clone();
            let certs = self.certs.clone();
            let cancel = cancel.clone();
            tasks.spawn_blocking(move || tick_pool(&fleet, &certs, &pool, now, &cancel));
        }

        let mut ticks = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(tick) => ticks.push(tick),
                Err(e) => error!(error = %e, "pool tick panicked"),
            }
        }
        ticks.sort_by(|a, b| a.pool.cmp(&b.pool));
        Ok(ticks)
    }

    /// Tick every `interval` until `shutdown` flips to true.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "reconciler started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick_all(Utc::now(), &shutdown).await {
                        Ok(ticks) => debug!(pools = ticks.len(), "reconcile round finished"),
                        Err(e) => error!(error = %e, "reconcile round failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("reconciler shutting down");
                    break;
                }
            }
        }
    }
}

fn tick_pool<S>(
    fleet: &FleetController<S>,
    certs: &CertificateLifecycle<S>,
    pool: &PoolSpec,
    now: DateTime<Utc>,
    cancel: &watch::Receiver<bool>,
) -> PoolTick
where
    S: WorkerStore + SecretStore + PoolStore,
{
    let pool_ref = pool.pool_ref();
    let fleet = match fleet.reconcile(pool, now, cancel) {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            warn!(pool = %pool_ref, error = %e, "fleet tick failed");
            None
        }
    };
    let certificates = match certs.reconcile(pool, now, cancel) {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            warn!(pool = %pool_ref, error = %e, "certificate tick failed");
            None
        }
    };
    PoolTick {
        pool: pool_ref,
        fleet,
        certificates,
    }
}
