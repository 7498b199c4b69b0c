//! External (ambient) transaction tokens.
//!
//! A session can be enlisted in a transaction whose lifetime is controlled
//! outside the driver. The token carries an identity the pool pins physical
//! sessions against, plus completion callbacks so the pool can unpin when the
//! coordinator finishes.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, UsageErrorKind, usage_error};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// How an ambient transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Committed,
    RolledBack,
}

type CompletionHook = Box<dyn FnOnce(TransactionOutcome) + Send>;

/// A token identifying one externally-coordinated transaction.
///
/// The driver only needs enlist/pin/release semantics: sessions bound to a
/// token must be reused for its whole lifetime, and observers (the pool)
/// register hooks that fire exactly once on completion.
pub struct AmbientTransaction {
    id: u64,
    state: Mutex<TokenState>,
}

struct TokenState {
    outcome: Option<TransactionOutcome>,
    hooks: Vec<CompletionHook>,
}

impl AmbientTransaction {
    /// Create a fresh token with a process-unique id.
    pub fn new() -> Self {
        Self {
            id: NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(TokenState {
                outcome: None,
                hooks: Vec::new(),
            }),
        }
    }

    /// Process-unique identity, used as the pinning key.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the coordinator has already completed this transaction.
    pub fn is_complete(&self) -> bool {
        self.state.lock().expect("transaction state poisoned").outcome.is_some()
    }

    /// Register a hook invoked once at completion. If the transaction is
    /// already complete the hook runs immediately.
    pub fn on_complete(&self, hook: impl FnOnce(TransactionOutcome) + Send + 'static) {
        let run_now = {
            let mut state = self.state.lock().expect("transaction state poisoned");
            match state.outcome {
                Some(outcome) => Some(outcome),
                None => {
                    state.hooks.push(Box::new(hook));
                    return;
                }
            }
        };
        if let Some(outcome) = run_now {
            hook(outcome);
        }
    }

    /// Mark the transaction committed and fire hooks.
    pub fn commit(&self) -> Result<()> {
        self.complete(TransactionOutcome::Committed)
    }

    /// Mark the transaction rolled back and fire hooks.
    pub fn rollback(&self) -> Result<()> {
        self.complete(TransactionOutcome::RolledBack)
    }

    fn complete(&self, outcome: TransactionOutcome) -> Result<()> {
        let hooks = {
            let mut state = self.state.lock().expect("transaction state poisoned");
            if state.outcome.is_some() {
                return Err(usage_error(
                    UsageErrorKind::Transaction,
                    format!("transaction {} completed twice", self.id),
                ));
            }
            state.outcome = Some(outcome);
            std::mem::take(&mut state.hooks)
        };
        for hook in hooks {
            hook(outcome);
        }
        Ok(())
    }
}

impl Default for AmbientTransaction {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AmbientTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmbientTransaction")
            .field("id", &self.id)
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn ids_are_unique() {
        let a = AmbientTransaction::new();
        let b = AmbientTransaction::new();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn hooks_fire_once_on_commit() {
        let txn = AmbientTransaction::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        txn.on_complete(move |outcome| {
            assert_eq!(outcome, TransactionOutcome::Committed);
            f.fetch_add(1, Ordering::SeqCst);
        });
        txn.commit().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(txn.is_complete());
        assert!(txn.commit().is_err());
    }

    #[test]
    fn late_hook_runs_immediately() {
        let txn = AmbientTransaction::new();
        txn.rollback().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        txn.on_complete(move |outcome| {
            assert_eq!(outcome, TransactionOutcome::RolledBack);
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
