//! Per-account watches on setting keys and key prefixes.

use std::collections::HashSet;
use std::fmt;

use crate::error::{AccountsError, Result};

/// Opaque handle returned when a watch is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watch#{}", self.0)
    }
}

/// What a watch listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    /// One exact key.
    Key(String),
    /// Every key starting with the prefix.
    Prefix(String),
}

impl WatchTarget {
    fn matches(&self, key: &str) -> bool {
        match self {
            Self::Key(k) => k == key,
            Self::Prefix(prefix) => key.starts_with(prefix.as_str()),
        }
    }

    /// The key or prefix the watch was registered with.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Key(k) | Self::Prefix(k) => k,
        }
    }
}

#[derive(Debug)]
struct WatchEntry<C> {
    id: WatchId,
    scope: String,
    target: WatchTarget,
    callback: C,
}

/// A callback due to run after a change was merged.
#[derive(Debug)]
pub struct PendingWatch<C> {
    pub id: WatchId,
    pub scope: String,
    /// Key or prefix the watch was registered with.
    pub target: String,
    pub callback: C,
}

/// Registry of watches for one account, keyed by settings scope.
#[derive(Debug)]
pub struct WatchRegistry<C> {
    next_id: u64,
    entries: Vec<WatchEntry<C>>,
}

impl<C> Default for WatchRegistry<C> {
    fn default() -> Self {
        Self {
            next_id: 1,
            entries: Vec::new(),
        }
    }
}

impl<C: Clone> WatchRegistry<C> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, scope: &str, target: WatchTarget, callback: C) -> WatchId {
        let id = WatchId(self.next_id);
        self.next_id += 1;
        tracing::trace!(%id, scope, target = target.as_str(), "Watch added");
        self.entries.push(WatchEntry {
            id,
            scope: scope.to_string(),
            target,
            callback,
        });
        id
    }

    /// # Errors
    /// Returns `UnknownWatch` if `id` is not registered here.
    pub fn remove(&mut self, id: WatchId) -> Result<()> {
        let index = self
            .entries
            .iter()
            .position(|e| e.id == id)
            .ok_or(AccountsError::UnknownWatch(id))?;
        self.entries.remove(index);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Watches matched by the changed `(scope, key)` pairs, in registration
    /// order, each at most once however many of its keys changed.
    pub fn matching<'a, I>(&self, changed: I) -> Vec<PendingWatch<C>>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let changed: Vec<(&str, &str)> = changed.into_iter().collect();
        let mut seen = HashSet::new();

        self.entries
            .iter()
            .filter(|entry| {
                changed
                    .iter()
                    .any(|(scope, key)| *scope == entry.scope && entry.target.matches(key))
            })
            .filter(|entry| seen.insert(entry.id))
            .map(|entry| PendingWatch {
                id: entry.id,
                scope: entry.scope.clone(),
                target: entry.target.as_str().to_string(),
                callback: entry.callback.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (WatchRegistry<&'static str>, WatchId, WatchId, WatchId) {
        let mut reg = WatchRegistry::new();
        let host = reg.add("global", WatchTarget::Key("host".into()), "host");
        let net = reg.add("global", WatchTarget::Prefix("net/".into()), "net");
        let mail = reg.add("mail", WatchTarget::Key("host".into()), "mail-host");
        (reg, host, net, mail)
    }

    #[test]
    fn prefix_watch_fires_once_for_many_keys() {
        let (reg, _, net, _) = registry();
        let hits = reg.matching([("global", "net/port"), ("global", "net/host")]);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, net);
        assert_eq!(hits[0].target, "net/");
    }

    #[test]
    fn watches_are_scoped() {
        let (reg, host, _, mail) = registry();
        let global = reg.matching([("global", "host")]);
        assert_eq!(global.iter().map(|w| w.id).collect::<Vec<_>>(), vec![host]);

        let service = reg.matching([("mail", "host")]);
        assert_eq!(service.iter().map(|w| w.id).collect::<Vec<_>>(), vec![mail]);
        assert_eq!(service[0].callback, "mail-host");
    }

    #[test]
    fn unrelated_keys_match_nothing() {
        let (reg, ..) = registry();
        assert!(reg.matching([("global", "hostname"), ("other", "host")]).is_empty());
    }

    #[test]
    fn removing_unknown_watch_fails() {
        let (mut reg, host, _, _) = registry();
        reg.remove(host).unwrap();
        assert_eq!(reg.len(), 2);
        assert!(matches!(reg.remove(host), Err(AccountsError::UnknownWatch(id)) if id == host));
    }
}
