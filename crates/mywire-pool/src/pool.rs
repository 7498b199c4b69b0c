//! One bounded pool of sessions for a single settings key.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use mywire::ConnectionSettings;
use mywire_core::error::{PoolErrorKind, pool_error};
use mywire_core::{AmbientTransaction, Result};

use crate::connector::{Connector, ManagedSession};

/// Bounded admission counter, deliberately separate from the collection
/// lock: blocked acquirers wait here, releasers only touch it briefly, and
/// neither ever holds it while doing session I/O.
#[derive(Debug)]
pub(crate) struct AdmissionGate {
    permits: Mutex<usize>,
    freed: Condvar,
}

impl AdmissionGate {
    fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            freed: Condvar::new(),
        }
    }

    /// Take one permit, waiting up to `timeout`. False on expiry.
    fn acquire(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock().expect("admission gate poisoned");
        loop {
            if *permits > 0 {
                *permits -= 1;
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _) = self
                .freed
                .wait_timeout(permits, remaining)
                .expect("admission gate poisoned");
            permits = guard;
        }
    }

    fn release(&self) {
        let mut permits = self.permits.lock().expect("admission gate poisoned");
        *permits += 1;
        drop(permits);
        self.freed.notify_one();
    }
}

struct PoolInner<S> {
    idle: VecDeque<S>,
    /// Sessions parked between uses of their ambient transaction,
    /// keyed by transaction id. They keep their admission permit.
    enlisted: HashMap<u64, S>,
    /// Transactions whose pinned session is currently checked out.
    pinned_busy: HashSet<u64>,
    /// Transactions completed while their session was checked out.
    completed: HashSet<u64>,
    in_use: usize,
    draining: bool,
}

/// A bounded pool of sessions sharing one settings bundle.
///
/// Invariant: `idle + in_use <= max_pool_size`, enforced by the admission
/// gate — a permit is taken before a session is obtained and returned when
/// one is idled, removed, or fails to open.
pub struct Pool<C: Connector> {
    connector: Arc<C>,
    settings: Arc<ConnectionSettings>,
    gate: AdmissionGate,
    inner: Mutex<PoolInner<C::Session>>,
}

impl<C: Connector> Pool<C> {
    pub(crate) fn new(connector: Arc<C>, settings: Arc<ConnectionSettings>) -> Self {
        let max = settings.max_pool_size.max(1);
        Self {
            connector,
            settings,
            gate: AdmissionGate::new(max),
            inner: Mutex::new(PoolInner {
                idle: VecDeque::new(),
                enlisted: HashMap::new(),
                pinned_busy: HashSet::new(),
                completed: HashSet::new(),
                in_use: 0,
                draining: false,
            }),
        }
    }

    pub fn settings(&self) -> &Arc<ConnectionSettings> {
        &self.settings
    }

    /// Current idle count.
    pub fn idle_count(&self) -> usize {
        self.inner.lock().expect("pool poisoned").idle.len()
    }

    /// Sessions currently checked out.
    pub fn in_use_count(&self) -> usize {
        self.inner.lock().expect("pool poisoned").in_use
    }

    /// Check a session out, waiting up to `timeout` for admission.
    pub fn acquire(
        self: &Arc<Self>,
        timeout: Duration,
        transaction: Option<&Arc<AmbientTransaction>>,
    ) -> Result<PooledSession<C>> {
        {
            let inner = self.inner.lock().expect("pool poisoned");
            if inner.draining {
                return Err(pool_error(
                    PoolErrorKind::Draining,
                    format!("pool for {} is draining", self.settings.endpoint()),
                ));
            }
        }

        // A session pinned to this transaction must be reused; a second
        // concurrent user is rejected rather than silently given its own
        // physical session.
        if let Some(txn) = transaction {
            let mut inner = self.inner.lock().expect("pool poisoned");
            if let Some(mut session) = inner.enlisted.remove(&txn.id()) {
                inner.pinned_busy.insert(txn.id());
                inner.in_use += 1;
                drop(inner);
                session.restore_command_timeout();
                return Ok(PooledSession {
                    session: Some(session),
                    pool: Some(self.clone()),
                });
            }
            if inner.pinned_busy.contains(&txn.id()) {
                return Err(pool_error(
                    PoolErrorKind::EnlistedBusy,
                    format!(
                        "the session enlisted in transaction {} is already in use",
                        txn.id()
                    ),
                ));
            }
        }

        if !self.gate.acquire(timeout) {
            return Err(pool_error(
                PoolErrorKind::Exhausted,
                format!(
                    "no pool slot for {} within {:?} (max {})",
                    self.settings.endpoint(),
                    timeout,
                    self.settings.max_pool_size
                ),
            ));
        }

        match self.checkout() {
            Ok(mut session) => {
                if let Some(txn) = transaction {
                    if let Err(e) = session.enlist(txn.id()) {
                        self.dispose(session);
                        return Err(e);
                    }
                    self.register_unpin_hook(txn);
                    let mut inner = self.inner.lock().expect("pool poisoned");
                    inner.pinned_busy.insert(txn.id());
                }
                self.inner.lock().expect("pool poisoned").in_use += 1;
                Ok(PooledSession {
                    session: Some(session),
                    pool: Some(self.clone()),
                })
            }
            Err(e) => {
                self.gate.release();
                Err(e)
            }
        }
    }

    /// Pop a usable idle session or open a fresh one. Runs with the permit
    /// already held and never inside the collection lock while doing I/O.
    fn checkout(&self) -> Result<C::Session> {
        loop {
            let candidate = {
                let mut inner = self.inner.lock().expect("pool poisoned");
                inner.idle.pop_front()
            };
            let Some(mut session) = candidate else {
                tracing::debug!(endpoint = %self.settings.endpoint(), "opening fresh pooled session");
                return self.connector.open(&self.settings);
            };

            if self.lifetime_expired(&session) {
                self.dispose(session);
                continue;
            }
            session.restore_command_timeout();
            if !session.probe() {
                tracing::debug!(
                    endpoint = %self.settings.endpoint(),
                    "idle session failed its liveness probe; discarding"
                );
                self.dispose(session);
                continue;
            }
            if self.settings.connection_reset {
                if let Err(e) = session.resync() {
                    tracing::warn!(error = %e, "session reset failed on checkout; discarding");
                    self.dispose(session);
                    continue;
                }
            }
            return Ok(session);
        }
    }

    fn lifetime_expired(&self, session: &C::Session) -> bool {
        !self.settings.connection_lifetime.is_zero()
            && session.age() > self.settings.connection_lifetime
    }

    /// Return a session after use.
    pub(crate) fn release(self: &Arc<Self>, mut session: C::Session) {
        // A session still pinned to a live transaction parks instead of
        // idling; it keeps its permit until the transaction completes.
        if let Some(txn_id) = session.enlistment() {
            let mut inner = self.inner.lock().expect("pool poisoned");
            inner.pinned_busy.remove(&txn_id);
            inner.in_use = inner.in_use.saturating_sub(1);
            if inner.completed.remove(&txn_id) {
                // The transaction finished while the session was out.
                drop(inner);
                session.clear_enlistment();
            } else {
                inner.enlisted.insert(txn_id, session);
                return;
            }
        } else {
            let mut inner = self.inner.lock().expect("pool poisoned");
            inner.in_use = inner.in_use.saturating_sub(1);
        }

        let draining = self.inner.lock().expect("pool poisoned").draining;
        if draining || !session.is_healthy() || self.lifetime_expired(&session) {
            self.dispose(session);
            return;
        }
        session.mark_idle();
        self.inner
            .lock()
            .expect("pool poisoned")
            .idle
            .push_back(session);
        self.gate.release();
    }

    /// Close a session instead of idling it, freeing its permit.
    pub(crate) fn discard(self: &Arc<Self>, session: C::Session) {
        {
            let mut inner = self.inner.lock().expect("pool poisoned");
            inner.in_use = inner.in_use.saturating_sub(1);
            if let Some(txn_id) = session.enlistment() {
                inner.pinned_busy.remove(&txn_id);
            }
        }
        self.dispose(session);
    }

    /// Close with permit release, outside any lock.
    fn dispose(&self, mut session: C::Session) {
        session.close();
        self.gate.release();
    }

    fn register_unpin_hook(self: &Arc<Self>, txn: &Arc<AmbientTransaction>) {
        let weak: Weak<Pool<C>> = Arc::downgrade(self);
        let txn_id = txn.id();
        txn.on_complete(move |_outcome| {
            if let Some(pool) = weak.upgrade() {
                pool.unpin(txn_id);
            }
        });
    }

    /// Called when an ambient transaction completes: the parked session (if
    /// any) loses its pin and goes back through the normal release path.
    fn unpin(self: &Arc<Self>, txn_id: u64) {
        let parked = {
            let mut inner = self.inner.lock().expect("pool poisoned");
            match inner.enlisted.remove(&txn_id) {
                Some(session) => Some(session),
                None => {
                    // Session is checked out; release() finishes the job.
                    inner.completed.insert(txn_id);
                    None
                }
            }
        };
        if let Some(mut session) = parked {
            session.clear_enlistment();
            // Parked sessions kept their permit and were not counted
            // in-use; re-enter through the idle/close disposition.
            let draining = self.inner.lock().expect("pool poisoned").draining;
            if draining || !session.is_healthy() || self.lifetime_expired(&session) {
                self.dispose(session);
            } else {
                session.mark_idle();
                self.inner
                    .lock()
                    .expect("pool poisoned")
                    .idle
                    .push_back(session);
                self.gate.release();
            }
        }
    }

    /// One reaper sweep: close idle sessions past the idle timeout, never
    /// shrinking below the configured minimum. Transports are closed after
    /// the lock is dropped.
    pub(crate) fn reap(&self) {
        let idle_timeout = self.settings.idle_timeout;
        let min = self.settings.min_pool_size;
        let mut removed = Vec::new();
        {
            let mut inner = self.inner.lock().expect("pool poisoned");
            while inner.idle.len() > min {
                // Oldest idles sit at the front of the queue.
                match inner.idle.front() {
                    Some(s) if s.idle_for() > idle_timeout => {
                        removed.push(inner.idle.pop_front().expect("front checked"));
                    }
                    _ => break,
                }
            }
        }
        if !removed.is_empty() {
            tracing::debug!(
                endpoint = %self.settings.endpoint(),
                count = removed.len(),
                "reaping idle sessions"
            );
        }
        for session in removed {
            self.dispose(session);
        }
    }

    /// Mark the pool draining and close everything currently idle. In-use
    /// sessions close as they come back.
    pub(crate) fn drain(&self) {
        let idle = {
            let mut inner = self.inner.lock().expect("pool poisoned");
            inner.draining = true;
            std::mem::take(&mut inner.idle)
        };
        for session in idle {
            self.dispose(session);
        }
    }

    /// Whether a draining pool has fully emptied out.
    pub(crate) fn is_drained(&self) -> bool {
        let inner = self.inner.lock().expect("pool poisoned");
        inner.draining && inner.idle.is_empty() && inner.in_use == 0 && inner.enlisted.is_empty()
    }
}

impl<C: Connector> std::fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("pool poisoned");
        f.debug_struct("Pool")
            .field("endpoint", &self.settings.endpoint())
            .field("idle", &inner.idle.len())
            .field("in_use", &inner.in_use)
            .field("draining", &inner.draining)
            .finish()
    }
}

/// A checked-out session that returns to its pool on drop.
pub struct PooledSession<C: Connector> {
    session: Option<C::Session>,
    /// None for unpooled (direct) sessions, which simply close on drop.
    pool: Option<Arc<Pool<C>>>,
}

impl<C: Connector> std::fmt::Debug for PooledSession<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("active", &self.session.is_some())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

impl<C: Connector> PooledSession<C> {
    pub(crate) fn unpooled(session: C::Session) -> Self {
        Self {
            session: Some(session),
            pool: None,
        }
    }

    /// Close the session instead of returning it to the pool.
    pub fn remove(mut self) {
        if let Some(mut session) = self.session.take() {
            match &self.pool {
                Some(pool) => pool.discard(session),
                None => session.close(),
            }
        }
    }
}

impl<C: Connector> Deref for PooledSession<C> {
    type Target = C::Session;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref().expect("session taken")
    }
}

impl<C: Connector> DerefMut for PooledSession<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut().expect("session taken")
    }
}

impl<C: Connector> Drop for PooledSession<C> {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            match &self.pool {
                Some(pool) => pool.release(session),
                None => session.close(),
            }
        }
    }
}
