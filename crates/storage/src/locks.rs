//! Per-channel locking.
//!
//! Every read-then-decide-then-write section runs under the lock of the
//! channel it mutates, which guarantees at most one in-progress crank per
//! channel globally. Cranks that touch an application channel and its
//! funding ledger channel take both locks up front through
//! [`ChannelLocks::with_channels`], always application first, so all
//! callers agree on acquisition order and cannot deadlock.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use sluice_state::state::ChannelId;

/// Table of per-channel mutexes, created on first use and never dropped.
///
/// The per-channel count is bounded by the number of channels this wallet
/// has ever touched, which is fine for the intended deployment sizes.
#[derive(Default)]
pub struct ChannelLocks {
    locks: Mutex<HashMap<ChannelId, Arc<Mutex<()>>>>,
}

impl ChannelLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, id: ChannelId) -> Arc<Mutex<()>> {
        self.locks.lock().entry(id).or_default().clone()
    }

    /// Runs `f` holding the lock for one channel.
    pub fn with_channel<R>(&self, id: ChannelId, f: impl FnOnce() -> R) -> R {
        let lock = self.lock_for(id);
        let _guard = lock.lock();
        f()
    }

    /// Runs `f` holding the locks for an application channel and its
    /// funding ledger channel. The application lock is always taken first;
    /// this is the canonical order and every nested crank must use it.
    pub fn with_channels<R>(
        &self,
        app_id: ChannelId,
        ledger_id: ChannelId,
        f: impl FnOnce() -> R,
    ) -> R {
        debug_assert_ne!(app_id, ledger_id, "a channel cannot fund itself");
        let app_lock = self.lock_for(app_id);
        let ledger_lock = self.lock_for(ledger_id);
        let _app_guard = app_lock.lock();
        let _ledger_guard = ledger_lock.lock();
        f()
    }
}
