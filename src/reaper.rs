//! Idle reaper — stops services whose idle window elapsed with no traffic
//!
//! A fixed-interval ticker scans every service; those that are online with
//! zero active connections and stale last-access are stopped concurrently.
//! The eligibility check re-runs under the service's runtime lock when the
//! transition happens, so a request racing the sweep wins.

use crate::gateway::Gateway;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Interval between sweeps
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(3);

/// Run the reaper until shutdown
pub async fn run(gateway: Arc<Gateway>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(interval_secs = SWEEP_INTERVAL.as_secs(), "idle reaper started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweep(&gateway).await;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!("idle reaper shutting down");
                    break;
                }
            }
        }
    }
}

/// Stop every idle service; a service being swept does not block another
pub async fn sweep(gateway: &Arc<Gateway>) {
    let mut stops = Vec::new();

    for service in gateway.services.values() {
        if service.proxy_only {
            continue;
        }
        if service.status() != crate::service::ServiceStatus::Online {
            continue;
        }
        if service.active_connections() > 0 {
            continue;
        }
        let idle = service.idle_for();
        if idle <= service.idle_timeout {
            continue;
        }

        info!(
            service = %service.name,
            idle_secs = idle.as_secs(),
            "idle timeout reached"
        );

        let manager = Arc::clone(&gateway.manager);
        let service = Arc::clone(service);
        stops.push(async move {
            manager.reap(&service).await;
        });
    }

    futures_util::future::join_all(stops).await;
}
