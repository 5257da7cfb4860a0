//! Background health reporter
//!
//! Periodically walks the active hosts and refreshes their status through
//! the connection manager, so the stored health picture stays current even
//! for hosts nobody is talking to. The reporter adds no policy of its own:
//! it calls `get_client` and lets the manager's breaker, cache and status
//! accounting do the work. A sweep never fails the loop; individual host
//! errors are logged and the sweep moves on.

use crate::config::HealthConfig;
use crate::connection::ConnectionManager;
use crate::host::HostStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Periodic health sweeper over all active hosts
pub struct HealthReporter {
    manager: Arc<ConnectionManager>,
    store: Arc<dyn HostStore>,
    config: HealthConfig,
    /// Hosts verified within this window are skipped; live traffic
    /// already keeps their status fresh
    skip_window: Duration,
}

impl HealthReporter {
    /// Create a reporter over the manager and store
    pub fn new(
        manager: Arc<ConnectionManager>,
        store: Arc<dyn HostStore>,
        config: HealthConfig,
        skip_window: Duration,
    ) -> Self {
        Self {
            manager,
            store,
            config,
            skip_window,
        }
    }

    /// Run sweeps until the shutdown signal flips
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.probe_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            "health reporter started (interval {:?})",
            self.config.probe_interval()
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("health reporter stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One pass over every active host
    pub async fn sweep(&self) {
        let hosts = match self.store.list_hosts() {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!("health sweep could not list hosts: {}", e);
                return;
            }
        };

        for host in hosts {
            if !host.is_active {
                continue;
            }
            if self.manager.validated_within(&host.id, self.skip_window) {
                debug!("host {} recently verified, skipping probe", host.id);
                continue;
            }

            match self.manager.get_client(&host.id).await {
                // success and ordinary failures were already recorded by
                // the manager; nothing more to write
                Ok(_) => {}
                Err(e) if e.is_unavailable() => {
                    // breaker short-circuit: nothing was learned about the
                    // host, so the last known status stands and only the
                    // probe timestamp moves
                    if let Err(e) = self.store.touch_health_check(&host.id) {
                        warn!("failed to touch health check for {}: {}", host.id, e);
                    }
                }
                Err(e) => {
                    debug!("health probe failed for host {}: {}", host.id, e);
                }
            }
        }
    }
}
