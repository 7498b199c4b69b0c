//! Connection pooling for the mywire MySQL client.
//!
//! A [`PoolManager`] keys bounded [`Pool`]s by the canonical settings
//! string. Each pool enforces admission through a counter separate from its
//! collection lock, probes idle sessions on checkout, retires sessions past
//! their lifetime, and pins sessions enlisted in ambient transactions to
//! their originating transaction. One background reaper thread, shared by
//! every pool of the manager, sweeps idle sessions on a fixed interval —
//! never below a pool's configured minimum.
//!
//! The manager is an explicitly constructed object handed around by
//! reference; there is no process-global registry. Its reaper stops when
//! [`PoolManager::shutdown`] runs (or the manager drops).

pub mod connector;
pub mod pool;

pub use connector::{Connector, ManagedSession, SessionConnector};
pub use pool::{Pool, PooledSession};

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use mywire::ConnectionSettings;
use mywire_core::error::{PoolErrorKind, pool_error};
use mywire_core::{AmbientTransaction, Result};

/// How often the shared reaper sweeps every pool.
pub const REAP_INTERVAL: Duration = Duration::from_secs(180);

struct ManagerShared<C: Connector> {
    connector: Arc<C>,
    pools: Mutex<HashMap<String, Arc<Pool<C>>>>,
    stop: Mutex<bool>,
    wake: Condvar,
}

/// Keyed registry of pools plus the shared idle reaper.
pub struct PoolManager<C: Connector = SessionConnector> {
    shared: Arc<ManagerShared<C>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl PoolManager<SessionConnector> {
    /// Manager over real protocol sessions.
    pub fn new() -> Self {
        Self::with_connector(SessionConnector)
    }
}

impl Default for PoolManager<SessionConnector> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connector> PoolManager<C> {
    /// Manager over a custom connector (the test seam).
    pub fn with_connector(connector: C) -> Self {
        Self::with_connector_and_interval(connector, REAP_INTERVAL)
    }

    fn with_connector_and_interval(connector: C, interval: Duration) -> Self {
        let shared = Arc::new(ManagerShared {
            connector: Arc::new(connector),
            pools: Mutex::new(HashMap::new()),
            stop: Mutex::new(false),
            wake: Condvar::new(),
        });
        let reaper_shared = shared.clone();
        let reaper = std::thread::Builder::new()
            .name("mywire-pool-reaper".to_string())
            .spawn(move || reaper_loop(&reaper_shared, interval))
            .expect("spawn pool reaper");
        Self {
            shared,
            reaper: Mutex::new(Some(reaper)),
        }
    }

    /// Check a session out of the pool for these settings, creating the
    /// pool on first use. Non-pooling settings open a direct session that
    /// closes on drop.
    pub fn acquire(
        &self,
        settings: &Arc<ConnectionSettings>,
        transaction: Option<&Arc<AmbientTransaction>>,
    ) -> Result<PooledSession<C>> {
        if *self.shared.stop.lock().expect("manager poisoned") {
            return Err(pool_error(
                PoolErrorKind::Closed,
                "pool manager has been shut down",
            ));
        }
        if !settings.pooling {
            let session = self.shared.connector.open(settings)?;
            return Ok(PooledSession::unpooled(session));
        }
        let pool = self.pool_for(settings);
        pool.acquire(settings.connect_timeout, transaction)
    }

    fn pool_for(&self, settings: &Arc<ConnectionSettings>) -> Arc<Pool<C>> {
        let key = settings.cache_key();
        let mut pools = self.shared.pools.lock().expect("manager poisoned");
        pools
            .entry(key)
            .or_insert_with(|| {
                tracing::debug!(endpoint = %settings.endpoint(), "creating pool");
                Arc::new(Pool::new(self.shared.connector.clone(), settings.clone()))
            })
            .clone()
    }

    /// The pool registered for these settings, if one exists.
    pub fn existing_pool(&self, settings: &ConnectionSettings) -> Option<Arc<Pool<C>>> {
        self.shared
            .pools
            .lock()
            .expect("manager poisoned")
            .get(&settings.cache_key())
            .cloned()
    }

    /// Drain and unregister the pool for these settings: idle sessions are
    /// closed now, in-flight releases close instead of re-idling.
    pub fn clear(&self, settings: &ConnectionSettings) {
        let pool = self
            .shared
            .pools
            .lock()
            .expect("manager poisoned")
            .remove(&settings.cache_key());
        if let Some(pool) = pool {
            tracing::debug!(endpoint = %settings.endpoint(), "clearing pool");
            pool.drain();
        }
    }

    /// Drain and unregister every pool.
    pub fn clear_all(&self) {
        let pools: Vec<_> = {
            let mut map = self.shared.pools.lock().expect("manager poisoned");
            map.drain().map(|(_, p)| p).collect()
        };
        for pool in pools {
            pool.drain();
        }
    }

    /// Run one reaper sweep synchronously (the background thread does this
    /// on its own every [`REAP_INTERVAL`]).
    pub fn sweep_now(&self) {
        sweep(&self.shared);
    }

    /// Stop the reaper and drain every pool.
    pub fn shutdown(&self) {
        {
            let mut stop = self.shared.stop.lock().expect("manager poisoned");
            *stop = true;
        }
        self.shared.wake.notify_all();
        if let Some(handle) = self.reaper.lock().expect("manager poisoned").take() {
            let _ = handle.join();
        }
        self.clear_all();
    }
}

impl<C: Connector> Drop for PoolManager<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn reaper_loop<C: Connector>(shared: &Arc<ManagerShared<C>>, interval: Duration) {
    let mut stop = shared.stop.lock().expect("manager poisoned");
    loop {
        if *stop {
            return;
        }
        let (guard, _) = shared
            .wake
            .wait_timeout(stop, interval)
            .expect("manager poisoned");
        stop = guard;
        if *stop {
            return;
        }
        drop(stop);
        sweep(shared);
        stop = shared.stop.lock().expect("manager poisoned");
    }
}

fn sweep<C: Connector>(shared: &ManagerShared<C>) {
    let pools: Vec<(String, Arc<Pool<C>>)> = {
        let map = shared.pools.lock().expect("manager poisoned");
        map.iter().map(|(k, p)| (k.clone(), p.clone())).collect()
    };
    let mut empty_drained = Vec::new();
    for (key, pool) in pools {
        pool.reap();
        if pool.is_drained() {
            empty_drained.push(key);
        }
    }
    if !empty_drained.is_empty() {
        let mut map = shared.pools.lock().expect("manager poisoned");
        for key in empty_drained {
            map.remove(&key);
        }
    }
}
