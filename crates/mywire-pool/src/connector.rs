//! The seam between the pool and the sessions it manages.
//!
//! The pool never talks to the wire itself; it goes through a [`Connector`]
//! that opens sessions and a [`ManagedSession`] view of their lifecycle.
//! Production uses [`SessionConnector`] over [`mywire::Session`]; tests plug
//! in fakes.

use std::sync::Arc;
use std::time::Duration;

use mywire::ConnectionSettings;
use mywire_core::Result;

/// Pool-facing view of one pooled session.
pub trait ManagedSession: Send + 'static {
    /// Lightweight liveness probe (checkout health check).
    fn probe(&mut self) -> bool;

    /// Re-synchronize server-side session state (the reset-on-return path).
    fn resync(&mut self) -> Result<()>;

    /// Tear the session down. Must be safe to call outside pool locks.
    fn close(&mut self);

    /// Whether the session may be returned to the idle set at all.
    fn is_healthy(&self) -> bool;

    /// Time since the session was opened.
    fn age(&self) -> Duration;

    /// Time since the session was last parked idle.
    fn idle_for(&self) -> Duration;

    /// Stamp the session as idle-from-now.
    fn mark_idle(&mut self);

    /// Re-arm the per-command deadline for a fresh checkout.
    fn restore_command_timeout(&mut self);

    /// Ambient transaction this session is pinned to, if any.
    fn enlistment(&self) -> Option<u64>;

    /// Pin the session to an ambient transaction.
    fn enlist(&mut self, transaction_id: u64) -> Result<()>;

    /// Drop the pin after the transaction completes.
    fn clear_enlistment(&mut self);
}

/// Opens sessions for a pool.
pub trait Connector: Send + Sync + 'static {
    type Session: ManagedSession;

    fn open(&self, settings: &Arc<ConnectionSettings>) -> Result<Self::Session>;
}

impl ManagedSession for mywire::Session {
    fn probe(&mut self) -> bool {
        self.ping()
    }

    fn resync(&mut self) -> Result<()> {
        self.reset()
    }

    fn close(&mut self) {
        mywire::Session::close(self);
    }

    fn is_healthy(&self) -> bool {
        !self.is_broken() && self.state() != mywire::SessionState::Closed
    }

    fn age(&self) -> Duration {
        mywire::Session::age(self)
    }

    fn idle_for(&self) -> Duration {
        mywire::Session::idle_for(self)
    }

    fn mark_idle(&mut self) {
        mywire::Session::mark_idle(self);
    }

    fn restore_command_timeout(&mut self) {
        let timeout = self.settings().command_timeout;
        self.reset_timeout(timeout);
    }

    fn enlistment(&self) -> Option<u64> {
        mywire::Session::enlistment(self)
    }

    fn enlist(&mut self, transaction_id: u64) -> Result<()> {
        mywire::Session::enlist(self, transaction_id)
    }

    fn clear_enlistment(&mut self) {
        mywire::Session::clear_enlistment(self);
    }
}

/// The production connector: opens real protocol sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionConnector;

impl Connector for SessionConnector {
    type Session = mywire::Session;

    fn open(&self, settings: &Arc<ConnectionSettings>) -> Result<Self::Session> {
        mywire::Session::open_with(settings.clone())
    }
}
