//! Events raised by accounts and managers, and their listener lists.

use std::fmt;
use std::rc::Rc;

use crate::core::account::AccountId;
use crate::error::{AccountsError, Result};

/// Something that happened to one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountEvent {
    /// The account (`service: None`) or one of its services changed its
    /// enabled flag.
    Enabled {
        service: Option<String>,
        enabled: bool,
    },
    /// The display name changed.
    DisplayNameChanged(Option<String>),
    /// The account was deleted; it stays usable in memory but cannot be stored.
    Deleted,
    /// Settings changed after a local commit or a remote broadcast.
    Changed,
}

/// Account lifecycle notifications delivered to manager listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerEvent {
    AccountCreated(AccountId),
    AccountDeleted(AccountId),
    /// Settings relevant to the manager's service type changed.
    AccountUpdated(AccountId),
    /// An enabled flag changed somewhere on the account.
    EnabledEvent(AccountId),
}

impl ManagerEvent {
    #[must_use]
    pub const fn account_id(&self) -> AccountId {
        match self {
            Self::AccountCreated(id)
            | Self::AccountDeleted(id)
            | Self::AccountUpdated(id)
            | Self::EnabledEvent(id) => *id,
        }
    }
}

/// Handle returned when connecting a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// Ordered list of callbacks.
///
/// Emission works on a snapshot so callbacks may connect or disconnect
/// listeners while being invoked.
pub struct Listeners<F: ?Sized> {
    next_id: u64,
    entries: Vec<(ListenerId, Rc<F>)>,
}

impl<F: ?Sized> Default for Listeners<F> {
    fn default() -> Self {
        Self {
            next_id: 1,
            entries: Vec::new(),
        }
    }
}

impl<F: ?Sized> fmt::Debug for Listeners<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.entries.len())
            .finish()
    }
}

impl<F: ?Sized> Listeners<F> {
    pub fn connect(&mut self, callback: Rc<F>) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, callback));
        id
    }

    /// # Errors
    /// Returns `UnknownListener` if `id` is not connected.
    pub fn disconnect(&mut self, id: ListenerId) -> Result<()> {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        if self.entries.len() == before {
            return Err(AccountsError::UnknownListener(id));
        }
        Ok(())
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<Rc<F>> {
        self.entries.iter().map(|(_, cb)| Rc::clone(cb)).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn disconnect_removes_only_that_listener() {
        let hits = Rc::new(Cell::new(0));
        let mut listeners: Listeners<dyn Fn(u32)> = Listeners::default();

        let h1 = Rc::clone(&hits);
        let first = listeners.connect(Rc::new(move |n| h1.set(h1.get() + n)));
        let h2 = Rc::clone(&hits);
        listeners.connect(Rc::new(move |n| h2.set(h2.get() + n * 10)));

        listeners.disconnect(first).unwrap();
        for cb in listeners.snapshot() {
            cb(1);
        }
        assert_eq!(hits.get(), 10);
        assert!(matches!(
            listeners.disconnect(first),
            Err(AccountsError::UnknownListener(_))
        ));
    }

    #[test]
    fn manager_event_exposes_account_id() {
        assert_eq!(ManagerEvent::AccountUpdated(4).account_id(), 4);
        assert_eq!(ManagerEvent::EnabledEvent(9).account_id(), 9);
    }
}
