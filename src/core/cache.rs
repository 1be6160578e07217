//! Process-local registry of live accounts.
//!
//! The cache never owns an account: it maps ids to weak handles, and each
//! account removes its own entry when it is dropped. Accounts materialised
//! only to deliver a broadcast are additionally pinned for a short while so
//! that event listeners can still look them up.

use std::collections::HashMap;
use std::rc::Weak;
use std::time::{Duration, Instant};

use crate::core::account::{Account, AccountId, AccountInner};

/// How long a foreign account stays alive without other holders.
pub const DEFAULT_FOREIGN_PIN: Duration = Duration::from_secs(2);

#[derive(Debug)]
struct Entry {
    serial: u64,
    account: Weak<AccountInner>,
}

/// Weak id → account map plus timed strong pins.
#[derive(Debug, Default)]
pub struct AccountCache {
    entries: HashMap<AccountId, Entry>,
    pins: Vec<(Instant, Account)>,
}

impl AccountCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The live account for `id`, if any.
    #[must_use]
    pub fn get(&self, id: AccountId) -> Option<Account> {
        self.entries
            .get(&id)
            .and_then(|entry| entry.account.upgrade())
            .map(Account::from_inner)
    }

    /// Register `account` under its id, replacing any stale entry.
    pub fn insert(&mut self, account: &Account) {
        let id = account.id();
        if id == 0 {
            return;
        }
        tracing::trace!(account_id = id, "Account cached");
        self.entries.insert(
            id,
            Entry {
                serial: account.serial(),
                account: account.downgrade(),
            },
        );
    }

    /// Drop the entry for `id` if it still belongs to instance `serial`.
    pub fn remove_if_serial(&mut self, id: AccountId, serial: u64) -> bool {
        if self.entries.get(&id).is_some_and(|e| e.serial == serial) {
            self.entries.remove(&id);
            tracing::trace!(account_id = id, "Account evicted");
            return true;
        }
        false
    }

    /// Keep `account` alive until `pin` has elapsed.
    pub fn pin(&mut self, account: Account, pin: Duration) {
        self.pins.push((Instant::now() + pin, account));
    }

    /// Release pins whose deadline passed.
    ///
    /// The released handles are returned so the caller can drop them once
    /// it no longer borrows the cache.
    #[must_use]
    pub fn expire_pins(&mut self, now: Instant) -> Vec<Account> {
        let (expired, kept): (Vec<_>, Vec<_>) =
            self.pins.drain(..).partition(|(deadline, _)| *deadline <= now);
        self.pins = kept;
        expired.into_iter().map(|(_, account)| account).collect()
    }

    /// Number of pins not yet released.
    #[must_use]
    pub fn pinned(&self) -> usize {
        self.pins.len()
    }

    /// Whether an account object for `id` is alive in this process.
    #[must_use]
    pub fn resident(&self, id: AccountId) -> bool {
        self.entries
            .get(&id)
            .is_some_and(|entry| entry.account.strong_count() > 0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every pinned account, releasing them immediately.
    pub(crate) fn take_pins(&mut self) -> Vec<Account> {
        self.pins.drain(..).map(|(_, account)| account).collect()
    }
}
