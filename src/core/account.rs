//! Accounts: settings resolution, pending edits and commit entry points.
//!
//! An [`Account`] is a cheap handle to shared per-process state. Settings
//! are cached per scope (the global scope or one service) and only change
//! when a commit succeeds or a broadcast is applied; edits accumulate in a
//! [`ChangeSet`] until [`Account::store`] or [`Account::store_blocking`].

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use crate::core::catalog::{GLOBAL_SCOPE, GLOBAL_SERVICE_TYPE, ServiceDescriptor};
use crate::core::changes::{ChangeSet, GLOBAL_SERVICE_ID, KEY_ENABLED, KEY_NAME, ServiceChanges};
use crate::core::events::{AccountEvent, ListenerId, Listeners};
use crate::core::manager::{Manager, ManagerInner};
use crate::core::value::{Value, ValueType};
use crate::core::watch::{WatchId, WatchRegistry, WatchTarget};
use crate::error::{AccountsError, Result};

/// Database id of an account; `0` until the first successful store.
pub type AccountId = u32;

/// Callback invoked when a watched key (or a key under a watched prefix)
/// changes. Receives the key for key watches and the prefix for prefix
/// watches.
pub type WatchCallback = Rc<dyn Fn(&Account, &str)>;

/// Listener for [`AccountEvent`]s.
pub type AccountListener = dyn Fn(&Account, &AccountEvent);

/// Completion callback of a non-blocking store.
pub type StoreCallback = Box<dyn FnOnce(Result<()>)>;

/// Where a value returned by [`Account::get_value`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingSource {
    /// No value anywhere.
    None,
    /// Stored on the account.
    Account,
    /// Default of the selected service.
    Profile,
}

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Default)]
pub(crate) struct AccountState {
    pub(crate) id: AccountId,
    pub(crate) provider: Option<String>,
    pub(crate) display_name: Option<String>,
    pub(crate) enabled: bool,
    /// Set once a deletion has been committed.
    pub(crate) deleted: bool,
    /// Materialised from a broadcast rather than loaded or created here.
    pub(crate) foreign: bool,
    selected: Option<Arc<ServiceDescriptor>>,
    /// Scope name to cached settings. A scope absent from the map was never
    /// loaded.
    settings: HashMap<String, BTreeMap<String, Value>>,
    changes: Option<ChangeSet>,
    in_flight: Option<ChangeSet>,
}

impl AccountState {
    /// State of a brand-new account.
    pub(crate) fn unstored(provider: Option<&str>) -> Self {
        let mut state = Self {
            provider: provider.map(str::to_string),
            changes: Some(ChangeSet::for_new_account()),
            ..Self::default()
        };
        state.settings.insert(GLOBAL_SCOPE.to_string(), BTreeMap::new());
        state
    }

    /// State of an account read from the `Accounts` table.
    pub(crate) fn loaded(
        id: AccountId,
        display_name: Option<String>,
        provider: Option<String>,
        enabled: bool,
        global: BTreeMap<String, Value>,
    ) -> Self {
        let mut state = Self {
            id,
            provider,
            display_name,
            enabled,
            ..Self::default()
        };
        state.settings.insert(GLOBAL_SCOPE.to_string(), global);
        state
    }

    /// State of an account announced by a broadcast.
    ///
    /// A `foreign` account takes every scope the broadcast carries.
    pub(crate) fn announced(id: AccountId, provider: Option<String>, foreign: bool) -> Self {
        let mut state = Self {
            id,
            provider,
            foreign,
            ..Self::default()
        };
        state.settings.insert(GLOBAL_SCOPE.to_string(), BTreeMap::new());
        state
    }

    fn scope_name(&self) -> &str {
        self.selected
            .as_ref()
            .map_or(GLOBAL_SCOPE, |service| service.name.as_str())
    }
}

pub(crate) struct AccountInner {
    serial: u64,
    manager: Weak<ManagerInner>,
    state: RefCell<AccountState>,
    watches: RefCell<WatchRegistry<WatchCallback>>,
    listeners: RefCell<Listeners<AccountListener>>,
}

impl Drop for AccountInner {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            let id = self.state.get_mut().id;
            Manager::from_inner(manager).account_dropped(id, self.serial);
        }
    }
}

// =============================================================================
// Account
// =============================================================================

/// Handle to an account. Clones share the same object.
#[derive(Clone)]
pub struct Account {
    inner: Rc<AccountInner>,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Account")
            .field("id", &state.id)
            .field("provider", &state.provider)
            .field("foreign", &state.foreign)
            .field("deleted", &state.deleted)
            .finish_non_exhaustive()
    }
}

impl Account {
    pub(crate) fn new(manager: Weak<ManagerInner>, serial: u64, state: AccountState) -> Self {
        Self {
            inner: Rc::new(AccountInner {
                serial,
                manager,
                state: RefCell::new(state),
                watches: RefCell::new(WatchRegistry::new()),
                listeners: RefCell::new(Listeners::default()),
            }),
        }
    }

    pub(crate) const fn from_inner(inner: Rc<AccountInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<AccountInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn serial(&self) -> u64 {
        self.inner.serial
    }

    pub(crate) fn set_id(&self, id: AccountId) {
        self.inner.state.borrow_mut().id = id;
    }

    fn manager_or_disposed(&self) -> Result<Manager> {
        self.manager().ok_or(AccountsError::Disposed)
    }

    // ===== Identity =====

    #[must_use]
    pub fn id(&self) -> AccountId {
        self.inner.state.borrow().id
    }

    #[must_use]
    pub fn provider(&self) -> Option<String> {
        self.inner.state.borrow().provider.clone()
    }

    /// The owning manager, unless it has been dropped.
    #[must_use]
    pub fn manager(&self) -> Option<Manager> {
        self.inner.manager.upgrade().map(Manager::from_inner)
    }

    #[must_use]
    pub fn is_foreign(&self) -> bool {
        self.inner.state.borrow().foreign
    }

    /// Whether a deletion of this account has been committed.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.inner.state.borrow().deleted
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    // ===== Scope selection =====

    #[must_use]
    pub fn selected_service(&self) -> Option<Arc<ServiceDescriptor>> {
        self.inner.state.borrow().selected.clone()
    }

    /// Make `service` (or the global scope for `None`) the target of
    /// subsequent reads and writes.
    ///
    /// Settings of a scope are loaded from the database the first time it is
    /// selected, except on foreign accounts, which hold everything in memory.
    ///
    /// # Errors
    /// Returns an error if the scope cannot be loaded.
    pub fn select_service(&self, service: Option<&Arc<ServiceDescriptor>>) -> Result<()> {
        let (scope, load_from) = {
            let mut state = self.inner.state.borrow_mut();
            state.selected = service.cloned();
            let scope = state.scope_name().to_string();
            let resident = state.settings.contains_key(&scope);
            let load_from = (!resident && !state.foreign && state.id != 0).then_some(state.id);
            if !resident && load_from.is_none() {
                state.settings.insert(scope.clone(), BTreeMap::new());
            }
            (scope, load_from)
        };

        if let Some(id) = load_from {
            let manager = self.manager_or_disposed()?;
            let settings = manager.load_scope(id, service.map(|s| s.name.as_str()))?;
            tracing::debug!(account_id = id, scope = %scope, keys = settings.len(), "Loaded scope");
            self.inner
                .state
                .borrow_mut()
                .settings
                .insert(scope, settings);
        }
        Ok(())
    }

    // ===== Reading =====

    /// Effective value of `key` in the selected scope.
    #[must_use]
    pub fn get_value(&self, key: &str) -> (SettingSource, Option<Value>) {
        let state = self.inner.state.borrow();
        if let Some(value) = state
            .settings
            .get(state.scope_name())
            .and_then(|settings| settings.get(key))
        {
            return (SettingSource::Account, Some(value.clone()));
        }
        if let Some(value) = state
            .selected
            .as_ref()
            .and_then(|service| service.default_setting(key))
        {
            return (SettingSource::Profile, Some(value.clone()));
        }
        (SettingSource::None, None)
    }

    /// Like [`Account::get_value`], converting the value to `value_type`.
    ///
    /// # Errors
    /// Returns `ValueConversion` when the stored value cannot be converted.
    pub fn get_value_as(
        &self,
        key: &str,
        value_type: ValueType,
    ) -> Result<(SettingSource, Option<Value>)> {
        match self.get_value(key) {
            (source, Some(value)) => Ok((source, Some(value.coerce(value_type)?))),
            unset => Ok(unset),
        }
    }

    /// Account-wide enabled flag combined with the selected service's own
    /// `enabled` setting (which defaults to off).
    #[must_use]
    pub fn enabled(&self) -> bool {
        let state = self.inner.state.borrow();
        if !state.enabled {
            return false;
        }
        match &state.selected {
            None => true,
            Some(service) => state
                .settings
                .get(&service.name)
                .and_then(|settings| settings.get(KEY_ENABLED))
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }

    #[must_use]
    pub fn display_name(&self) -> Option<String> {
        self.inner.state.borrow().display_name.clone()
    }

    /// Iterate over the selected scope's settings under `prefix`.
    #[must_use]
    pub fn settings_iter(&self, prefix: Option<&str>) -> SettingsIter {
        SettingsIter::new(self.clone(), prefix.unwrap_or_default())
    }

    // ===== Writing =====

    /// Record an assignment (or, for `None`, a removal) of `key` in the
    /// selected scope. Nothing is written until the account is stored.
    ///
    /// # Errors
    /// Returns an error if the selected service cannot be registered in the
    /// database.
    pub fn set_value(&self, key: &str, value: Option<Value>) -> Result<()> {
        let selected = self.selected_service();
        let service_id = match &selected {
            Some(service) => self.manager_or_disposed()?.service_id(service)?,
            None => GLOBAL_SERVICE_ID,
        };
        let (name, service_type) = selected
            .as_ref()
            .map_or((GLOBAL_SCOPE, GLOBAL_SERVICE_TYPE), |s| {
                (s.name.as_str(), s.service_type.as_str())
            });

        let mut state = self.inner.state.borrow_mut();
        state
            .changes
            .get_or_insert_with(ChangeSet::new)
            .scope_mut(name, service_type, service_id)
            .set(key, value);
        Ok(())
    }

    /// Enable or disable the selected scope.
    ///
    /// # Errors
    /// Same as [`Account::set_value`].
    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.set_value(KEY_ENABLED, Some(Value::Bool(enabled)))
    }

    /// Change the display name; applies to the global scope whatever service
    /// is selected.
    pub fn set_display_name(&self, name: Option<&str>) {
        let mut state = self.inner.state.borrow_mut();
        state
            .changes
            .get_or_insert_with(ChangeSet::new)
            .global_mut()
            .set(KEY_NAME, name.map(Value::from));
    }

    /// Mark the account for deletion on the next store.
    pub fn delete(&self) {
        let mut state = self.inner.state.borrow_mut();
        state.changes.get_or_insert_with(ChangeSet::new).deleted = true;
    }

    /// Whether edits are waiting to be stored.
    #[must_use]
    pub fn has_pending_changes(&self) -> bool {
        self.inner
            .state
            .borrow()
            .changes
            .as_ref()
            .is_some_and(|c| !c.is_empty())
    }

    // ===== Committing =====

    /// Commit pending edits without blocking.
    ///
    /// If the database is busy the commit is queued and retried on every
    /// [`Manager::process_pending`] tick. `callback` runs once the commit
    /// finished; without one, failures are logged.
    pub fn store(&self, callback: Option<StoreCallback>) {
        match self.take_changes() {
            Err(e) => complete_store(self.id(), callback, Err(e)),
            Ok(None) => complete_store(self.id(), callback, Ok(())),
            Ok(Some((manager, changes))) => manager.submit_commit(self, changes, callback),
        }
    }

    /// Commit pending edits, waiting for the database lock with backoff.
    ///
    /// # Errors
    /// Returns `AccountDeleted` for deleted accounts, `DbLocked` when the lock
    /// could not be taken in time, or the database error.
    pub fn store_blocking(&self) -> Result<()> {
        match self.take_changes()? {
            None => Ok(()),
            Some((manager, changes)) => manager.commit_blocking(self, changes),
        }
    }

    fn take_changes(&self) -> Result<Option<(Manager, ChangeSet)>> {
        let manager = self.manager_or_disposed()?;
        let mut state = self.inner.state.borrow_mut();
        if state.deleted {
            return Err(AccountsError::AccountDeleted {
                id: state.id,
                name: state.display_name.clone().unwrap_or_default(),
            });
        }
        Ok(state
            .changes
            .take()
            .filter(|c| !c.is_empty())
            .map(|c| (manager, c)))
    }

    // ===== Watches =====

    /// Watch one key of the selected scope.
    pub fn watch_key(&self, key: &str, callback: impl Fn(&Self, &str) + 'static) -> WatchId {
        self.add_watch(WatchTarget::Key(key.to_string()), Rc::new(callback))
    }

    /// Watch every key under `prefix` in the selected scope.
    pub fn watch_dir(&self, prefix: &str, callback: impl Fn(&Self, &str) + 'static) -> WatchId {
        self.add_watch(WatchTarget::Prefix(prefix.to_string()), Rc::new(callback))
    }

    fn add_watch(&self, target: WatchTarget, callback: WatchCallback) -> WatchId {
        let scope = self.inner.state.borrow().scope_name().to_string();
        self.inner.watches.borrow_mut().add(&scope, target, callback)
    }

    /// # Errors
    /// Returns `UnknownWatch` if `id` was not registered on this account.
    pub fn remove_watch(&self, id: WatchId) -> Result<()> {
        self.inner.watches.borrow_mut().remove(id)
    }

    /// Changes of `scope` being dispatched to watches right now.
    ///
    /// Only available from inside a watch callback.
    #[must_use]
    pub fn changes_in_flight(&self, scope: &str) -> Option<ServiceChanges> {
        self.inner
            .state
            .borrow()
            .in_flight
            .as_ref()
            .and_then(|changes| changes.service(scope).cloned())
    }

    // ===== Events =====

    pub fn connect(&self, listener: impl Fn(&Self, &AccountEvent) + 'static) -> ListenerId {
        self.inner.listeners.borrow_mut().connect(Rc::new(listener))
    }

    /// # Errors
    /// Returns `UnknownListener` if `id` is not connected.
    pub fn disconnect(&self, id: ListenerId) -> Result<()> {
        self.inner.listeners.borrow_mut().disconnect(id)
    }

    fn emit(&self, event: &AccountEvent) {
        let listeners = self.inner.listeners.borrow().snapshot();
        for listener in listeners {
            listener(self, event);
        }
    }

    // ===== Services =====

    /// Services offered by the account's provider.
    #[must_use]
    pub fn list_services(&self) -> Vec<Arc<ServiceDescriptor>> {
        self.provider_services(None)
    }

    #[must_use]
    pub fn list_services_by_type(&self, service_type: &str) -> Vec<Arc<ServiceDescriptor>> {
        self.provider_services(Some(service_type))
    }

    /// Whether the provider offers a service of `service_type`.
    #[must_use]
    pub fn supports_service(&self, service_type: &str) -> bool {
        !self.provider_services(Some(service_type)).is_empty()
    }

    /// Services whose own `enabled` setting is on.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub fn list_enabled_services(&self) -> Result<Vec<Arc<ServiceDescriptor>>> {
        let manager = self.manager_or_disposed()?;
        let (id, foreign) = {
            let state = self.inner.state.borrow();
            (state.id, state.foreign)
        };

        let names: Vec<String> = if foreign || id == 0 {
            let state = self.inner.state.borrow();
            state
                .settings
                .iter()
                .filter(|(scope, settings)| {
                    scope.as_str() != GLOBAL_SCOPE
                        && settings
                            .get(KEY_ENABLED)
                            .and_then(Value::as_bool)
                            .unwrap_or(false)
                })
                .map(|(scope, _)| scope.clone())
                .collect()
        } else {
            manager.enabled_service_names(id)?
        };

        let catalog = manager.catalog();
        let mut services: Vec<_> = names.iter().filter_map(|n| catalog.service(n)).collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(services)
    }

    fn provider_services(&self, service_type: Option<&str>) -> Vec<Arc<ServiceDescriptor>> {
        let Some(manager) = self.manager() else {
            return Vec::new();
        };
        let provider = self.provider();
        manager
            .catalog()
            .list_services(service_type)
            .into_iter()
            .filter(|service| service.provider == provider)
            .collect()
    }

    // ===== Applying committed changes =====

    /// Merge a committed change set into the cached settings, then fire
    /// account events and watches.
    pub(crate) fn apply_changes(&self, changes: &ChangeSet) {
        let mut events = Vec::new();
        let mut changed: Vec<(String, String)> = Vec::new();

        {
            let mut guard = self.inner.state.borrow_mut();
            let state = &mut *guard;
            let foreign = state.foreign;

            for scope in changes.services() {
                if scope.is_global() {
                    if let Some(value) = scope.get(KEY_NAME) {
                        state.display_name =
                            value.as_ref().and_then(Value::as_str).map(str::to_string);
                        events.push(AccountEvent::DisplayNameChanged(state.display_name.clone()));
                    }
                    if let Some(value) = scope.get(KEY_ENABLED) {
                        state.enabled = value.as_ref().and_then(Value::as_bool).unwrap_or(false);
                        events.push(AccountEvent::Enabled {
                            service: None,
                            enabled: state.enabled,
                        });
                    }
                }

                let settings = if foreign {
                    Some(state.settings.entry(scope.service_name.clone()).or_default())
                } else {
                    // Scopes never selected here have nothing to update.
                    state.settings.get_mut(&scope.service_name)
                };
                let Some(settings) = settings else {
                    continue;
                };

                for (key, value) in scope.settings() {
                    match value {
                        Some(value) => {
                            settings.insert(key.clone(), value.clone());
                        }
                        None => {
                            settings.remove(key);
                        }
                    }
                    if !scope.is_global() && key == KEY_ENABLED {
                        events.push(AccountEvent::Enabled {
                            service: Some(scope.service_name.clone()),
                            enabled: value.as_ref().and_then(Value::as_bool).unwrap_or(false),
                        });
                    }
                    changed.push((scope.service_name.clone(), key.clone()));
                }
            }
        }

        for event in &events {
            self.emit(event);
        }

        let due = self
            .inner
            .watches
            .borrow()
            .matching(changed.iter().map(|(scope, key)| (scope.as_str(), key.as_str())));
        if !due.is_empty() {
            self.inner.state.borrow_mut().in_flight = Some(changes.clone());
            for watch in due {
                tracing::trace!(id = %watch.id, scope = %watch.scope, "Invoking watch");
                (watch.callback)(self, &watch.target);
            }
            self.inner.state.borrow_mut().in_flight = None;
        }

        if changes.deleted {
            {
                let mut state = self.inner.state.borrow_mut();
                state.deleted = true;
                state.enabled = false;
            }
            self.emit(&AccountEvent::Enabled {
                service: None,
                enabled: false,
            });
            self.emit(&AccountEvent::Deleted);
        }

        self.emit(&AccountEvent::Changed);
    }
}

/// Deliver a store result to its callback, or log failures nobody asked for.
pub(crate) fn complete_store(id: AccountId, callback: Option<StoreCallback>, result: Result<()>) {
    match callback {
        Some(callback) => callback(result),
        None => {
            if let Err(e) = result {
                tracing::warn!(account_id = id, error = %e, code = e.error_code(), "Store failed");
            }
        }
    }
}

// =============================================================================
// Settings iteration
// =============================================================================

/// Settings of one scope: account values first, then service defaults not
/// overridden by the account. Keys are reported relative to the prefix.
#[derive(Debug)]
pub struct SettingsIter {
    account: Account,
    prefix: String,
    overrides: std::vec::IntoIter<(String, Value)>,
    defaults: std::vec::IntoIter<(String, Value)>,
}

impl SettingsIter {
    fn new(account: Account, prefix: &str) -> Self {
        let mut iter = Self {
            account,
            prefix: prefix.to_string(),
            overrides: Vec::new().into_iter(),
            defaults: Vec::new().into_iter(),
        };
        iter.restart();
        iter
    }

    /// Start over from the first setting, picking up the current state.
    pub fn restart(&mut self) {
        let state = self.account.inner.state.borrow();
        let prefix = self.prefix.as_str();
        let strip = |key: &str| key.strip_prefix(prefix).map(str::to_string);

        let stored = state.settings.get(state.scope_name());
        let overrides: Vec<(String, Value)> = stored
            .into_iter()
            .flatten()
            .filter_map(|(key, value)| strip(key).map(|k| (k, value.clone())))
            .collect();

        let defaults: Vec<(String, Value)> = state
            .selected
            .iter()
            .flat_map(|service| service.default_settings.iter())
            .filter(|(key, _)| stored.is_none_or(|s| !s.contains_key(key.as_str())))
            .filter_map(|(key, value)| strip(key).map(|k| (k, value.clone())))
            .collect();

        self.overrides = overrides.into_iter();
        self.defaults = defaults.into_iter();
    }
}

impl Iterator for SettingsIter {
    type Item = (String, Value);

    fn next(&mut self) -> Option<Self::Item> {
        self.overrides.next().or_else(|| self.defaults.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestEnv;
    use std::cell::Cell;

    #[test]
    fn new_account_reads_nothing() {
        let env = TestEnv::new();
        let manager = env.manager();
        let account = manager.create_account(Some("example"));

        assert_eq!(account.id(), 0);
        assert_eq!(account.get_value("host"), (SettingSource::None, None));
        assert!(!account.enabled());
        assert!(account.has_pending_changes());
    }

    #[test]
    fn defaults_come_from_the_selected_service() {
        let env = TestEnv::new();
        let manager = env.manager();
        let account = manager.create_account(Some("example"));
        let chat = manager.service("example-chat").unwrap();

        account.select_service(Some(&chat)).unwrap();
        assert_eq!(
            account.get_value("parameters/port"),
            (SettingSource::Profile, Some(Value::UInt32(5223)))
        );
        assert_eq!(
            account.get_value_as("parameters/port", ValueType::String).unwrap(),
            (SettingSource::Profile, Some(Value::from("5223")))
        );
        assert!(matches!(
            account.get_value_as("parameters/port", ValueType::StringList),
            Err(AccountsError::ValueConversion { .. })
        ));
    }

    #[test]
    fn edits_are_invisible_until_stored() {
        let env = TestEnv::new();
        let manager = env.manager();
        let account = manager.create_account(Some("example"));
        account.set_value("host", Some(Value::from("imap.example.com"))).unwrap();
        assert_eq!(account.get_value("host").0, SettingSource::None);

        account.store_blocking().unwrap();
        assert_ne!(account.id(), 0);
        assert_eq!(
            account.get_value("host"),
            (SettingSource::Account, Some(Value::from("imap.example.com")))
        );
        assert!(!account.has_pending_changes());
    }

    #[test]
    fn enabled_requires_account_and_service() {
        let env = TestEnv::new();
        let manager = env.manager();
        let mail = manager.service("example-mail").unwrap();
        let account = manager.create_account(Some("example"));
        account.set_enabled(true).unwrap();
        account.store_blocking().unwrap();
        assert!(account.enabled());

        account.select_service(Some(&mail)).unwrap();
        assert!(!account.enabled(), "service flag defaults to off");

        account.set_enabled(true).unwrap();
        account.store_blocking().unwrap();
        assert!(account.enabled());

        account.select_service(None).unwrap();
        account.set_enabled(false).unwrap();
        account.store_blocking().unwrap();
        account.select_service(Some(&mail)).unwrap();
        assert!(!account.enabled());
    }

    #[test]
    fn iteration_puts_overrides_first_and_hides_shadowed_defaults() {
        let env = TestEnv::new();
        let manager = env.manager();
        let chat = manager.service("example-chat").unwrap();
        let account = manager.create_account(Some("example"));
        account.select_service(Some(&chat)).unwrap();
        account.set_value("parameters/port", Some(Value::UInt32(99))).unwrap();
        account.set_value("other", Some(Value::Bool(true))).unwrap();
        account.store_blocking().unwrap();

        let mut iter = account.settings_iter(Some("parameters/"));
        let items: Vec<_> = iter.by_ref().collect();
        assert_eq!(
            items,
            vec![
                ("port".to_string(), Value::UInt32(99)),
                ("host".to_string(), Value::from("x")),
            ]
        );

        assert_eq!(iter.next(), None);
        iter.restart();
        assert_eq!(iter.count(), 2);
    }

    #[test]
    fn deleted_accounts_refuse_further_stores() {
        let env = TestEnv::new();
        let manager = env.manager();
        let account = manager.create_account(Some("example"));
        account.set_display_name(Some("Work"));
        account.store_blocking().unwrap();

        account.delete();
        account.store_blocking().unwrap();
        assert!(account.is_deleted());
        assert!(!account.enabled());

        account.set_display_name(Some("Again"));
        assert!(matches!(
            account.store_blocking(),
            Err(AccountsError::AccountDeleted { ref name, .. }) if name == "Work"
        ));
    }

    #[test]
    fn store_without_changes_completes_immediately() {
        let env = TestEnv::new();
        let manager = env.manager();
        let account = manager.create_account(Some("example"));
        account.store_blocking().unwrap();

        let done = Rc::new(Cell::new(false));
        let flag = Rc::clone(&done);
        account.store(Some(Box::new(move |result| {
            assert!(result.is_ok());
            flag.set(true);
        })));
        assert!(done.get());
    }

    #[test]
    fn events_follow_a_commit() {
        let env = TestEnv::new();
        let manager = env.manager();
        let account = manager.create_account(Some("example"));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        account.connect(move |_, event| sink.borrow_mut().push(event.clone()));

        account.set_display_name(Some("Home"));
        account.set_enabled(true).unwrap();
        account.store_blocking().unwrap();

        let events = seen.borrow();
        assert!(events.contains(&AccountEvent::DisplayNameChanged(Some("Home".into()))));
        assert!(events.contains(&AccountEvent::Enabled {
            service: None,
            enabled: true
        }));
        assert_eq!(events.last(), Some(&AccountEvent::Changed));
    }

    #[test]
    fn watches_see_post_change_state_and_changed_keys() {
        let env = TestEnv::new();
        let manager = env.manager();
        let account = manager.create_account(Some("example"));
        account.store_blocking().unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        account.watch_dir("net/", move |account, prefix| {
            let changed = account.changes_in_flight(GLOBAL_SCOPE).unwrap();
            let value = account.get_value("net/port").1;
            sink.borrow_mut()
                .push((prefix.to_string(), changed.settings().len(), value));
        });

        account.set_value("net/port", Some(Value::UInt32(25))).unwrap();
        account.set_value("net/host", Some(Value::from("smtp"))).unwrap();
        account.store_blocking().unwrap();

        assert_eq!(
            *seen.borrow(),
            vec![("net/".to_string(), 2, Some(Value::UInt32(25)))]
        );
        assert!(account.changes_in_flight(GLOBAL_SCOPE).is_none());
    }

    #[test]
    fn removed_watch_stays_quiet() {
        let env = TestEnv::new();
        let manager = env.manager();
        let account = manager.create_account(Some("example"));
        let hits = Rc::new(Cell::new(0));
        let counter = Rc::clone(&hits);
        let id = account.watch_key("host", move |_, _| counter.set(counter.get() + 1));
        account.remove_watch(id).unwrap();

        account.set_value("host", Some(Value::from("a"))).unwrap();
        account.store_blocking().unwrap();
        assert_eq!(hits.get(), 0);
        assert!(matches!(
            account.remove_watch(id),
            Err(AccountsError::UnknownWatch(_))
        ));
    }

    #[test]
    fn provider_services_are_listed() {
        let env = TestEnv::new();
        let manager = env.manager();
        let account = manager.create_account(Some("example"));
        let names: Vec<_> = account.list_services().iter().map(|s| s.name.clone()).collect();
        assert_eq!(names, vec!["example-chat".to_string(), "example-mail".to_string()]);
        assert!(account.supports_service("e-mail"));
        assert!(!account.supports_service("calendar"));

        let mail = manager.service("example-mail").unwrap();
        account.select_service(Some(&mail)).unwrap();
        account.set_enabled(true).unwrap();
        account.store_blocking().unwrap();
        let enabled: Vec<_> = account
            .list_enabled_services()
            .unwrap()
            .iter()
            .map(|s| s.name.clone())
            .collect();
        assert_eq!(enabled, vec!["example-mail".to_string()]);
    }
}
