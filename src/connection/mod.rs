//! Connection manager
//!
//! The single entry point to remote engines. Callers never construct
//! clients themselves; they ask the manager, which consults the per-host
//! circuit breaker, serves from the verified-client cache when it is
//! fresh, and otherwise runs at most one build per host at a time. Every
//! concurrent caller of a building host shares the one outcome, success
//! or failure alike.
//!
//! Builds run in a detached task: a caller abandoning its wait cannot
//! cancel the build mid-way, so followers always get an answer and
//! partially created tunnels are always either installed or released.

pub mod breaker;

pub use breaker::{BreakerStatus, CircuitBreaker, CircuitState, Permit};

use crate::config::{BreakerConfig, ConnectionConfig};
use crate::engine::{EngineClient, EngineVersion};
use crate::error::{
    ConnectionError, ConnectionFailure, HostUnavailableError, Result, StoreError, TransportError,
};
use crate::host::HostStore;
use crate::transport::{ClientBuilder, TransportResources};
use crate::vault::{CredentialSet, CredentialVault};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Outcome of one build, shared by every waiting caller
type BuildOutcome = std::result::Result<EngineClient, ConnectionError>;

/// A verified client plus the resources backing it
struct CachedClient {
    client: EngineClient,
    engine: EngineVersion,
    resources: TransportResources,
    validated_at: Instant,
}

/// Per-host coordination state
struct HostSlot {
    breaker: Mutex<CircuitBreaker>,
    cache: Mutex<Option<CachedClient>>,
    /// Receiver for the in-flight build, when one exists
    building: tokio::sync::Mutex<Option<watch::Receiver<Option<BuildOutcome>>>>,
}

impl HostSlot {
    fn new(config: BreakerConfig) -> Self {
        Self {
            breaker: Mutex::new(CircuitBreaker::new(config)),
            cache: Mutex::new(None),
            building: tokio::sync::Mutex::new(None),
        }
    }
}

/// Hands out verified engine clients
pub struct ConnectionManager {
    store: Arc<dyn HostStore>,
    vault: Arc<CredentialVault>,
    builder: Arc<dyn ClientBuilder>,
    connection: ConnectionConfig,
    breaker: BreakerConfig,
    slots: RwLock<HashMap<String, Arc<HostSlot>>>,
}

impl ConnectionManager {
    /// Create a manager over a store, vault and transport builder
    pub fn new(
        store: Arc<dyn HostStore>,
        vault: Arc<CredentialVault>,
        builder: Arc<dyn ClientBuilder>,
        connection: ConnectionConfig,
        breaker: BreakerConfig,
    ) -> Self {
        Self {
            store,
            vault,
            builder,
            connection,
            breaker,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Get a verified client for a host.
    ///
    /// Order of checks: breaker first (an open breaker rejects before any
    /// cache or store work), then the fresh cache, then join or lead the
    /// single in-flight build.
    pub async fn get_client(&self, host_id: &str) -> Result<EngineClient> {
        let slot = self.slot(host_id);

        let permit = slot
            .breaker
            .lock()
            .expect("breaker lock poisoned")
            .try_acquire(Instant::now())
            .map_err(|reason| {
                ConnectionError::new(host_id, HostUnavailableError { reason })
            })?;

        if permit == Permit::Normal {
            if let Some(client) = self.fresh_cached(&slot) {
                return Ok(client);
            }
        }

        let mut building = slot.building.lock().await;
        if let Some(rx) = building.as_ref() {
            // a half-open probe is never shared, but a probe leader is
            // also the only caller the breaker lets through, so anyone
            // arriving here holds a Normal permit
            let rx = rx.clone();
            drop(building);
            return join_build(host_id, rx).await;
        }

        let (tx, rx) = watch::channel(None);
        *building = Some(rx.clone());
        drop(building);

        self.spawn_build(host_id.to_string(), slot, tx);
        join_build(host_id, rx).await
    }

    /// Drop the cached client for a host and release its resources.
    ///
    /// Idempotent. Callers use this when a request through a cached
    /// client fails; the next `get_client` rebuilds from scratch.
    pub async fn invalidate(&self, host_id: &str) {
        let Some(slot) = self.existing_slot(host_id) else {
            return;
        };
        let cached = slot.cache.lock().expect("cache lock poisoned").take();
        if let Some(mut cached) = cached {
            debug!("invalidating cached connection for host {}", host_id);
            cached.resources.release().await;
        }
    }

    /// Breaker snapshot for a host
    pub fn breaker_status(&self, host_id: &str) -> BreakerStatus {
        self.slot(host_id)
            .breaker
            .lock()
            .expect("breaker lock poisoned")
            .status(Instant::now())
    }

    /// Operator override: force a host's breaker closed
    pub fn reset_breaker(&self, host_id: &str) {
        info!("breaker reset for host {}", host_id);
        self.slot(host_id)
            .breaker
            .lock()
            .expect("breaker lock poisoned")
            .reset();
    }

    /// Remove a host entirely: connection state, breaker, store record
    pub async fn remove_host(&self, host_id: &str) -> Result<()> {
        self.invalidate(host_id).await;
        self.slots
            .write()
            .expect("slot map lock poisoned")
            .remove(host_id);
        self.store
            .delete_host(host_id)
            .map_err(|e| ConnectionError::new(host_id, e))
    }

    /// True if the host's cached client was verified within `window`.
    /// Used by the health reporter to skip hosts with recent traffic.
    pub fn validated_within(&self, host_id: &str, window: Duration) -> bool {
        let Some(slot) = self.existing_slot(host_id) else {
            return false;
        };
        let cache = slot.cache.lock().expect("cache lock poisoned");
        cache
            .as_ref()
            .is_some_and(|c| c.validated_at.elapsed() <= window)
    }

    /// Release every cached connection. Called once on daemon shutdown so
    /// no tunnel process or key file outlives the control plane.
    pub async fn shutdown(&self) {
        let slots: Vec<(String, Arc<HostSlot>)> = {
            let map = self.slots.read().expect("slot map lock poisoned");
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        for (host_id, slot) in slots {
            let cached = slot.cache.lock().expect("cache lock poisoned").take();
            if let Some(mut cached) = cached {
                debug!("releasing connection for host {} on shutdown", host_id);
                cached.resources.release().await;
            }
        }
        info!("connection manager shut down");
    }

    fn slot(&self, host_id: &str) -> Arc<HostSlot> {
        if let Some(slot) = self.existing_slot(host_id) {
            return slot;
        }
        let mut map = self.slots.write().expect("slot map lock poisoned");
        map.entry(host_id.to_string())
            .or_insert_with(|| Arc::new(HostSlot::new(self.breaker.clone())))
            .clone()
    }

    fn existing_slot(&self, host_id: &str) -> Option<Arc<HostSlot>> {
        self.slots
            .read()
            .expect("slot map lock poisoned")
            .get(host_id)
            .cloned()
    }

    fn fresh_cached(&self, slot: &HostSlot) -> Option<EngineClient> {
        let cache = slot.cache.lock().expect("cache lock poisoned");
        cache
            .as_ref()
            .filter(|c| c.validated_at.elapsed() <= self.connection.cache_freshness())
            .map(|c| c.client.clone())
    }

    fn spawn_build(
        &self,
        host_id: String,
        slot: Arc<HostSlot>,
        tx: watch::Sender<Option<BuildOutcome>>,
    ) {
        let store = self.store.clone();
        let vault = self.vault.clone();
        let builder = self.builder.clone();
        let connection = self.connection.clone();

        tokio::spawn(async move {
            let outcome =
                run_build(&store, &vault, &builder, &connection, &slot, &host_id).await;

            // clear the in-flight marker before publishing so late
            // arrivals start a fresh build instead of joining a dead one
            let mut building = slot.building.lock().await;
            *building = None;
            let _ = tx.send(Some(outcome));
        });
    }
}

/// Wait for a build outcome on the shared channel
async fn join_build(
    host_id: &str,
    mut rx: watch::Receiver<Option<BuildOutcome>>,
) -> Result<EngineClient> {
    loop {
        if let Some(outcome) = rx.borrow().as_ref() {
            return outcome.clone();
        }
        if rx.changed().await.is_err() {
            return Err(ConnectionError::new(
                host_id,
                ConnectionFailure::Internal("build task dropped its result".to_string()),
            ));
        }
    }
}

/// One full build attempt, with breaker and store accounting
async fn run_build(
    store: &Arc<dyn HostStore>,
    vault: &CredentialVault,
    builder: &Arc<dyn ClientBuilder>,
    connection: &ConnectionConfig,
    slot: &Arc<HostSlot>,
    host_id: &str,
) -> BuildOutcome {
    // a stale cached client may still be alive (long-lived tunnels
    // usually are): re-verify it before paying for a rebuild
    if let Some(client) = revalidate_cached(store, slot, host_id).await {
        return Ok(client);
    }

    let result = attempt_build(store, vault, builder, connection, host_id).await;

    match result {
        Ok(built) => {
            let client = built.client.clone();
            let engine = built.engine.clone();
            let previous = {
                let mut cache = slot.cache.lock().expect("cache lock poisoned");
                cache.replace(CachedClient {
                    client: built.client,
                    engine: built.engine,
                    resources: built.resources,
                    validated_at: Instant::now(),
                })
            };
            if let Some(mut previous) = previous {
                previous.resources.release().await;
            }

            slot.breaker
                .lock()
                .expect("breaker lock poisoned")
                .record_success();
            if let Err(e) = store.record_connection_success(host_id, &engine) {
                warn!("failed to record success for host {}: {}", host_id, e);
            }
            info!(
                "host {} connected (engine {} api {})",
                host_id, engine.version, engine.api_version
            );
            Ok(client)
        }
        Err(failure) => {
            let mut breaker = slot.breaker.lock().expect("breaker lock poisoned");
            match &failure {
                // remote failures: count in the breaker and move the
                // stored status per the failure policy
                ConnectionFailure::Transport(_) => {
                    breaker.record_failure(Instant::now());
                    drop(breaker);
                    if let Err(e) = store.record_connection_failure(host_id) {
                        warn!("failed to record failure for host {}: {}", host_id, e);
                    }
                }
                // undecryptable credentials will fail every attempt; the
                // breaker stops the hammering, but the host itself was
                // never contacted so its status stands
                ConnectionFailure::Vault(_) => {
                    breaker.record_failure(Instant::now());
                }
                // local lookup or config problems: free the probe slot
                // without counting a remote failure
                _ => breaker.abandon_probe(),
            }
            warn!("host {} connection failed: {}", host_id, failure);
            Err(ConnectionError::new(host_id, failure))
        }
    }
}

/// Ping a stale cached client; keep it if the engine still answers
async fn revalidate_cached(
    store: &Arc<dyn HostStore>,
    slot: &Arc<HostSlot>,
    host_id: &str,
) -> Option<EngineClient> {
    let (client, engine) = {
        let cache = slot.cache.lock().expect("cache lock poisoned");
        let cached = cache.as_ref()?;
        (cached.client.clone(), cached.engine.clone())
    };

    if client.ping().await.is_ok() {
        let mut cache = slot.cache.lock().expect("cache lock poisoned");
        if let Some(cached) = cache.as_mut() {
            cached.validated_at = Instant::now();
        }
        drop(cache);
        slot.breaker
            .lock()
            .expect("breaker lock poisoned")
            .record_success();
        if let Err(e) = store.record_connection_success(host_id, &engine) {
            warn!("failed to record success for host {}: {}", host_id, e);
        }
        debug!("host {} cached connection revalidated", host_id);
        return Some(client);
    }

    // dead cached connection: release before the rebuild
    let cached = slot.cache.lock().expect("cache lock poisoned").take();
    if let Some(mut cached) = cached {
        cached.resources.release().await;
    }
    None
}

/// Load, decrypt and build, bounded by the total timeout
async fn attempt_build(
    store: &Arc<dyn HostStore>,
    vault: &CredentialVault,
    builder: &Arc<dyn ClientBuilder>,
    connection: &ConnectionConfig,
    host_id: &str,
) -> std::result::Result<crate::transport::BuiltConnection, ConnectionFailure> {
    let host = store
        .get_host(host_id)?
        .ok_or_else(|| ConnectionFailure::Store(StoreError::HostNotFound(host_id.to_string())))?;
    if !host.is_active {
        return Err(ConnectionFailure::HostInactive);
    }

    let credentials = store.credentials(host_id)?;
    let set = CredentialSet::decrypt_all(vault, &credentials)?;

    tokio::time::timeout(connection.total_timeout(), builder.build(&host, set))
        .await
        .map_err(|_| {
            ConnectionFailure::Transport(TransportError::timeout(format!(
                "connection build exceeded {:?}",
                connection.total_timeout()
            )))
        })?
}
