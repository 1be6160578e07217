//! The per-process context: database, catalog, caches and the change bus.
//!
//! A [`Manager`] owns everything that would otherwise be process-global. It
//! hands out [`Account`]s, runs their commits, broadcasts committed changes
//! and applies changes broadcast by other processes.
//!
//! All of it is single-threaded. Work arriving from outside (bus frames,
//! commits that found the database busy, expiring pins) is picked up either
//! by calling [`Manager::process_pending`] from the host's own loop or by
//! driving [`Manager::run`] on a current-thread `tokio` runtime.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::params;
use tokio::time::MissedTickBehavior;

use crate::bus::{BroadcastMessage, Bus, BusFrame, LocalBus, SpoolBus, Subscription};
use crate::core::account::{
    Account, AccountId, AccountInner, AccountState, StoreCallback, complete_store,
};
use crate::core::cache::{AccountCache, DEFAULT_FOREIGN_PIN};
use crate::core::catalog::{
    Catalog, ProviderDescriptor, ServiceDescriptor, ServiceTypeDescriptor,
};
use crate::core::changes::{ChangeSet, KEY_ENABLED, StoreBatch};
use crate::core::events::{ListenerId, Listeners, ManagerEvent};
use crate::core::notifier::{ChangeNotifier, Disposition};
use crate::core::value::Value;
use crate::error::{AccountsError, Result};
use crate::storage::config::{BusKind, ResolvedConfig};
use crate::storage::db::Store;

/// Default period of the scheduler tick in [`Manager::run`].
pub const DEFAULT_TICK: Duration = Duration::from_millis(10);

const MIN_TICK: Duration = Duration::from_millis(1);

/// Listener for [`ManagerEvent`]s.
pub type ManagerListener = dyn Fn(&Manager, &ManagerEvent);

// =============================================================================
// Options
// =============================================================================

/// Options for constructing a [`Manager`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Restrict listings and notifications to one service type.
    pub service_type: Option<String>,
    /// Lifetime of accounts materialised from broadcasts.
    pub foreign_pin: Duration,
    /// Period of the scheduler tick.
    pub tick: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            service_type: None,
            foreign_pin: DEFAULT_FOREIGN_PIN,
            tick: DEFAULT_TICK,
        }
    }
}

impl ManagerOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_service_type(mut self, service_type: impl Into<String>) -> Self {
        self.service_type = Some(service_type.into());
        self
    }

    #[must_use]
    pub fn with_foreign_pin(mut self, pin: Duration) -> Self {
        self.foreign_pin = pin;
        self
    }

    #[must_use]
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    #[must_use]
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            service_type: None,
            foreign_pin: config.foreign_pin,
            tick: config.tick,
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

/// A commit that found the database locked and waits for the next tick.
struct PendingCommit {
    serial: u64,
    account: Weak<AccountInner>,
    changes: ChangeSet,
    callback: Option<StoreCallback>,
    queued_at: Instant,
}

pub(crate) struct ManagerInner {
    store: Store,
    catalog: Arc<dyn Catalog>,
    bus: Arc<dyn Bus>,
    subscription: RefCell<Option<Subscription>>,
    service_type: Option<String>,
    foreign_pin: Duration,
    tick: Duration,
    cache: RefCell<AccountCache>,
    notifier: RefCell<ChangeNotifier>,
    pending: RefCell<VecDeque<PendingCommit>>,
    service_ids: RefCell<HashMap<String, i64>>,
    listeners: RefCell<Listeners<ManagerListener>>,
    next_serial: Cell<u64>,
}

/// Handle to the accounts context of this process. Clones share it.
#[derive(Clone)]
pub struct Manager {
    inner: Rc<ManagerInner>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("db", &self.inner.store.path())
            .field("service_type", &self.inner.service_type)
            .field("resident", &self.inner.cache.borrow().len())
            .field("pending_commits", &self.inner.pending.borrow().len())
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Create a manager over an open store, subscribing to the bus.
    ///
    /// # Errors
    /// Returns an error if the bus subscription fails.
    pub fn new(
        store: Store,
        catalog: Arc<dyn Catalog>,
        bus: Arc<dyn Bus>,
        options: ManagerOptions,
    ) -> Result<Self> {
        let notifier = ChangeNotifier::new(options.service_type.as_deref());
        let subscription = bus.subscribe(notifier.subscribed_paths())?;
        tracing::debug!(
            db = ?store.path(),
            service_type = ?options.service_type,
            paths = ?subscription.paths(),
            "Created account manager"
        );

        Ok(Self {
            inner: Rc::new(ManagerInner {
                store,
                catalog,
                bus,
                subscription: RefCell::new(Some(subscription)),
                service_type: options.service_type,
                foreign_pin: options.foreign_pin,
                tick: options.tick,
                cache: RefCell::new(AccountCache::new()),
                notifier: RefCell::new(notifier),
                pending: RefCell::new(VecDeque::new()),
                service_ids: RefCell::new(HashMap::new()),
                listeners: RefCell::new(Listeners::default()),
                next_serial: Cell::new(1),
            }),
        })
    }

    /// Open the database and bus described by `config`.
    ///
    /// # Errors
    /// Returns an error if the database or the bus cannot be opened.
    pub fn open(
        config: &ResolvedConfig,
        catalog: Arc<dyn Catalog>,
        service_type: Option<&str>,
    ) -> Result<Self> {
        let store = Store::open_in_dir(&config.db_dir, config.store_options())?;
        let bus: Arc<dyn Bus> = match config.bus_kind {
            BusKind::Spool => Arc::new(SpoolBus::new(&config.bus_dir)?),
            BusKind::Local => Arc::new(LocalBus::new()),
        };
        let mut options = ManagerOptions::from_config(config);
        options.service_type = service_type.map(str::to_string);
        Self::new(store, catalog, bus, options)
    }

    pub(crate) const fn from_inner(inner: Rc<ManagerInner>) -> Self {
        Self { inner }
    }

    fn next_serial(&self) -> u64 {
        let serial = self.inner.next_serial.get();
        self.inner.next_serial.set(serial + 1);
        serial
    }

    // ===== Accessors =====

    /// Service type this manager is restricted to.
    #[must_use]
    pub fn service_type(&self) -> Option<&str> {
        self.inner.service_type.as_deref()
    }

    #[must_use]
    pub fn catalog(&self) -> Arc<dyn Catalog> {
        Arc::clone(&self.inner.catalog)
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    #[must_use]
    pub fn db_timeout(&self) -> Duration {
        self.inner.store.db_timeout()
    }

    pub fn set_db_timeout(&self, timeout: Duration) {
        self.inner.store.set_db_timeout(timeout);
    }

    #[must_use]
    pub fn abort_on_db_timeout(&self) -> bool {
        self.inner.store.abort_on_db_timeout()
    }

    pub fn set_abort_on_db_timeout(&self, abort: bool) {
        self.inner.store.set_abort_on_db_timeout(abort);
    }

    /// Whether an account object for `id` is alive in this process.
    #[must_use]
    pub fn is_resident(&self, id: AccountId) -> bool {
        self.inner.cache.borrow().resident(id)
    }

    /// Commits waiting for the database lock.
    #[must_use]
    pub fn pending_commits(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    /// Copy the database to `dest`.
    ///
    /// # Errors
    /// Returns an error if `dest` exists or the copy fails.
    pub fn backup(&self, dest: &Path) -> Result<()> {
        self.inner.store.backup_to(dest)
    }

    // ===== Accounts =====

    /// A new, unstored account for `provider`.
    #[must_use]
    pub fn create_account(&self, provider: Option<&str>) -> Account {
        tracing::debug!(?provider, "Creating account");
        Account::new(
            Rc::downgrade(&self.inner),
            self.next_serial(),
            AccountState::unstored(provider),
        )
    }

    /// The account with `id`, from the cache or the database.
    ///
    /// # Errors
    /// Returns `NotFound` if no such account exists (or its deletion was
    /// committed), or the database error.
    pub fn load_account(&self, id: AccountId) -> Result<Account> {
        if let Some(account) = self.cached(id) {
            if account.is_deleted() {
                return Err(AccountsError::NotFound(id));
            }
            return Ok(account);
        }

        let rows = self.inner.store.query(
            "SELECT name, provider, enabled FROM Accounts WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<bool>>(2)?.unwrap_or(false),
                ))
            },
        )?;
        let Some((name, provider, enabled)) = rows.into_iter().next() else {
            return Err(AccountsError::NotFound(id));
        };

        let global = self.load_scope(id, None)?;
        let account = Account::new(
            Rc::downgrade(&self.inner),
            self.next_serial(),
            AccountState::loaded(id, name, provider, enabled, global),
        );
        self.inner.cache.borrow_mut().insert(&account);
        tracing::debug!(account_id = id, "Loaded account");
        Ok(account)
    }

    /// Like [`Manager::load_account`], logging failures instead of
    /// returning them.
    #[must_use]
    pub fn get_account(&self, id: AccountId) -> Option<Account> {
        match self.load_account(id) {
            Ok(account) => Some(account),
            Err(e) => {
                tracing::warn!(account_id = id, error = %e, "Could not get account");
                None
            }
        }
    }

    fn cached(&self, id: AccountId) -> Option<Account> {
        self.inner.cache.borrow().get(id)
    }

    // ===== Listing =====

    /// Ids of all accounts; for a typed manager, those supporting its type.
    ///
    /// # Errors
    /// Returns the database error.
    pub fn list(&self) -> Result<Vec<AccountId>> {
        match &self.inner.service_type {
            Some(service_type) => self.list_by_service_type(service_type),
            None => self
                .inner
                .store
                .query("SELECT id FROM Accounts ORDER BY id", &[], |row| row.get(0)),
        }
    }

    /// Ids of accounts whose provider offers a service of `service_type`.
    ///
    /// # Errors
    /// Returns the database error.
    pub fn list_by_service_type(&self, service_type: &str) -> Result<Vec<AccountId>> {
        let providers: HashSet<String> = self
            .inner
            .catalog
            .list_services(Some(service_type))
            .iter()
            .filter_map(|service| service.provider.clone())
            .collect();
        let rows: Vec<(AccountId, Option<String>)> = self.inner.store.query(
            "SELECT id, provider FROM Accounts ORDER BY id",
            &[],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(rows
            .into_iter()
            .filter(|(_, provider)| provider.as_ref().is_some_and(|p| providers.contains(p)))
            .map(|(id, _)| id)
            .collect())
    }

    /// Ids of enabled accounts; for a typed manager, those with an enabled
    /// service of its type.
    ///
    /// # Errors
    /// Returns the database error.
    pub fn list_enabled(&self) -> Result<Vec<AccountId>> {
        match &self.inner.service_type {
            Some(service_type) => self.list_enabled_by_service_type(service_type),
            None => self.inner.store.query(
                "SELECT id FROM Accounts WHERE enabled = 1 ORDER BY id",
                &[],
                |row| row.get(0),
            ),
        }
    }

    /// Ids of enabled accounts having an enabled service of `service_type`.
    ///
    /// # Errors
    /// Returns the database error.
    pub fn list_enabled_by_service_type(&self, service_type: &str) -> Result<Vec<AccountId>> {
        let (_, enabled) = Value::Bool(true).to_db();
        self.inner.store.query(
            "SELECT DISTINCT Settings.account FROM Settings \
             JOIN Services ON Settings.service = Services.id \
             JOIN Accounts ON Accounts.id = Settings.account \
             WHERE Settings.key = ?1 AND Settings.value = ?2 \
             AND Services.type = ?3 AND Accounts.enabled = 1 \
             ORDER BY Settings.account",
            params![KEY_ENABLED, enabled, service_type],
            |row| row.get(0),
        )
    }

    /// Known services; for a typed manager, only those of its type.
    #[must_use]
    pub fn list_services(&self) -> Vec<Arc<ServiceDescriptor>> {
        self.inner
            .catalog
            .list_services(self.inner.service_type.as_deref())
    }

    #[must_use]
    pub fn list_services_by_type(&self, service_type: &str) -> Vec<Arc<ServiceDescriptor>> {
        self.inner.catalog.list_services(Some(service_type))
    }

    #[must_use]
    pub fn list_providers(&self) -> Vec<Arc<ProviderDescriptor>> {
        self.inner.catalog.list_providers()
    }

    #[must_use]
    pub fn provider(&self, name: &str) -> Option<Arc<ProviderDescriptor>> {
        self.inner.catalog.provider(name)
    }

    #[must_use]
    pub fn service(&self, name: &str) -> Option<Arc<ServiceDescriptor>> {
        self.inner.catalog.service(name)
    }

    #[must_use]
    pub fn service_type_info(&self, name: &str) -> Option<Arc<ServiceTypeDescriptor>> {
        self.inner.catalog.service_type(name)
    }

    // ===== Events =====

    pub fn connect(&self, listener: impl Fn(&Self, &ManagerEvent) + 'static) -> ListenerId {
        self.inner.listeners.borrow_mut().connect(Rc::new(listener))
    }

    /// # Errors
    /// Returns `UnknownListener` if `id` is not connected.
    pub fn disconnect(&self, id: ListenerId) -> Result<()> {
        self.inner.listeners.borrow_mut().disconnect(id)
    }

    fn emit(&self, event: ManagerEvent) {
        tracing::trace!(?event, "Manager event");
        let listeners = self.inner.listeners.borrow().snapshot();
        for listener in listeners {
            listener(self, &event);
        }
    }

    fn emit_events(&self, id: AccountId, updated: bool, enabled: bool, changes: &ChangeSet) {
        if updated {
            self.emit(ManagerEvent::AccountUpdated(id));
        }
        if enabled {
            self.emit(ManagerEvent::EnabledEvent(id));
        }
        if changes.deleted {
            self.emit(ManagerEvent::AccountDeleted(id));
        }
        if changes.created {
            self.emit(ManagerEvent::AccountCreated(id));
        }
    }

    /// Only typed managers hear about updates, and only for their type.
    fn must_emit_updated(&self, changes: &ChangeSet) -> bool {
        if changes.created || changes.deleted {
            return false;
        }
        self.inner
            .service_type
            .as_deref()
            .is_some_and(|service_type| changes.has_service_type(service_type))
    }

    /// Any scope touching `enabled` counts on a typed manager; listeners
    /// re-query anyway.
    fn must_emit_enabled(&self, changes: &ChangeSet) -> bool {
        self.inner.service_type.is_some() && changes.has_enabled()
    }

    // ===== Database helpers used by accounts =====

    /// Settings of one scope of a stored account.
    pub(crate) fn load_scope(
        &self,
        account_id: AccountId,
        service: Option<&str>,
    ) -> Result<BTreeMap<String, Value>> {
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        };
        let rows = match service {
            None => self.inner.store.query(
                "SELECT key, type, value FROM Settings WHERE account = ?1 AND service = 0",
                params![account_id],
                map_row,
            )?,
            Some(name) => self.inner.store.query(
                "SELECT key, type, value FROM Settings WHERE account = ?1 AND service = \
                 (SELECT id FROM Services WHERE name = ?2)",
                params![account_id, name],
                map_row,
            )?,
        };

        let mut settings = BTreeMap::new();
        for (key, type_sig, text) in rows {
            match Value::from_db(&type_sig, &text) {
                Ok(value) => {
                    settings.insert(key, value);
                }
                Err(e) => {
                    tracing::warn!(
                        account_id,
                        key = %key,
                        error = %e,
                        "Skipping unreadable setting"
                    );
                }
            }
        }
        Ok(settings)
    }

    /// Database id of `service`, registering it on first use.
    pub(crate) fn service_id(&self, service: &ServiceDescriptor) -> Result<i64> {
        if let Some(id) = self.inner.service_ids.borrow().get(&service.name) {
            return Ok(*id);
        }

        let mut ids = self.lookup_service_id(&service.name)?;
        if ids.is_empty() {
            self.inner.store.execute(
                "INSERT OR IGNORE INTO Services (name, display, provider, type) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    service.name,
                    service.display_name,
                    service.provider,
                    service.service_type
                ],
            )?;
            tracing::debug!(service = %service.name, "Registered service");
            ids = self.lookup_service_id(&service.name)?;
        }

        let id = ids.first().copied().ok_or_else(|| {
            AccountsError::Db(format!("service '{}' could not be registered", service.name))
        })?;
        self.inner
            .service_ids
            .borrow_mut()
            .insert(service.name.clone(), id);
        Ok(id)
    }

    fn lookup_service_id(&self, name: &str) -> Result<Vec<i64>> {
        self.inner
            .store
            .query("SELECT id FROM Services WHERE name = ?1", params![name], |row| {
                row.get(0)
            })
    }

    /// Names of the services enabled on a stored account.
    pub(crate) fn enabled_service_names(&self, account_id: AccountId) -> Result<Vec<String>> {
        let (_, enabled) = Value::Bool(true).to_db();
        self.inner.store.query(
            "SELECT Services.name FROM Settings \
             JOIN Services ON Settings.service = Services.id \
             WHERE Settings.account = ?1 AND Settings.key = ?2 AND Settings.value = ?3",
            params![account_id, KEY_ENABLED, enabled],
            |row| row.get(0),
        )
    }

    // ===== Commits =====

    /// Run a commit now if the lock is free, otherwise queue it.
    pub(crate) fn submit_commit(
        &self,
        account: &Account,
        changes: ChangeSet,
        callback: Option<StoreCallback>,
    ) {
        let serial = account.serial();
        let queued_ahead = self.inner.pending.borrow().iter().any(|c| c.serial == serial);
        if !queued_ahead {
            match self.try_commit(account, &changes) {
                Ok(Some(id)) => {
                    self.commit_completed(account, &changes, id);
                    complete_store(id, callback, Ok(()));
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    complete_store(account.id(), callback, Err(e));
                    return;
                }
            }
        }

        tracing::debug!(account_id = account.id(), "Database busy, commit queued");
        self.inner.pending.borrow_mut().push_back(PendingCommit {
            serial,
            account: account.downgrade(),
            changes,
            callback,
            queued_at: Instant::now(),
        });
    }

    /// Commit, waiting for the lock with the store's backoff policy.
    ///
    /// Commits of the same account still queued from [`Account::store`] are
    /// written first, in order. If one of them runs out of lock budget it is
    /// queued again with the rest and the new commit is not attempted.
    pub(crate) fn commit_blocking(&self, account: &Account, changes: ChangeSet) -> Result<()> {
        let mut queued = self.take_queued(account.serial());
        while let Some(commit) = queued.pop_front() {
            match self.commit_now(account, &commit.changes) {
                Ok(id) => complete_store(id, commit.callback, Ok(())),
                Err(e) if e.is_retryable() => {
                    queued.push_front(commit);
                    let mut pending = self.inner.pending.borrow_mut();
                    for commit in queued.into_iter().rev() {
                        pending.push_front(commit);
                    }
                    return Err(e);
                }
                Err(e) => complete_store(account.id(), commit.callback, Err(e)),
            }
        }
        self.commit_now(account, &changes)?;
        Ok(())
    }

    fn commit_now(&self, account: &Account, changes: &ChangeSet) -> Result<AccountId> {
        let tx = self.inner.store.begin_transaction_blocking()?;
        let provider = account.provider();
        let id = tx.execute(|conn| {
            StoreBatch::new(account.id(), provider.as_deref(), changes).apply(conn)
        })?;
        self.commit_completed(account, changes, id);
        Ok(id)
    }

    /// Remove the queued commits of account instance `serial`, oldest first.
    fn take_queued(&self, serial: u64) -> VecDeque<PendingCommit> {
        let mut pending = self.inner.pending.borrow_mut();
        let (mine, rest): (VecDeque<PendingCommit>, VecDeque<PendingCommit>) =
            pending.drain(..).partition(|c| c.serial == serial);
        *pending = rest;
        mine
    }

    /// `Ok(None)` when the lock is held elsewhere.
    fn try_commit(&self, account: &Account, changes: &ChangeSet) -> Result<Option<AccountId>> {
        let Some(tx) = self.inner.store.begin_transaction()? else {
            return Ok(None);
        };
        let provider = account.provider();
        let id = tx.execute(|conn| {
            StoreBatch::new(account.id(), provider.as_deref(), changes).apply(conn)
        })?;
        Ok(Some(id))
    }

    /// Bring memory in line with a successful commit and tell everyone.
    fn commit_completed(&self, account: &Account, changes: &ChangeSet, id: AccountId) {
        if id == 0 {
            // Deleting an account that never reached the database.
            account.apply_changes(changes);
            return;
        }
        if account.id() == 0 {
            account.set_id(id);
            self.inner.cache.borrow_mut().insert(account);
        }
        tracing::debug!(
            account_id = id,
            created = changes.created,
            deleted = changes.deleted,
            "Commit succeeded"
        );

        let provider = account.provider();
        self.inner
            .notifier
            .borrow_mut()
            .publish(self.inner.bus.as_ref(), id, provider.as_deref(), changes);

        let updated = self.must_emit_updated(changes);
        let enabled = self.must_emit_enabled(changes);
        account.apply_changes(changes);
        if changes.deleted {
            self.inner
                .cache
                .borrow_mut()
                .remove_if_serial(id, account.serial());
        }
        self.emit_events(id, updated, enabled, changes);
    }

    fn retry_pending_commits(&self) {
        loop {
            let next = self.inner.pending.borrow_mut().pop_front();
            let Some(commit) = next else {
                break;
            };
            let Some(account) = commit.account.upgrade().map(Account::from_inner) else {
                complete_store(0, commit.callback, Err(AccountsError::Disposed));
                continue;
            };

            match self.try_commit(&account, &commit.changes) {
                Ok(Some(id)) => {
                    tracing::debug!(
                        account_id = id,
                        waited_ms = u64::try_from(commit.queued_at.elapsed().as_millis())
                            .unwrap_or(u64::MAX),
                        "Queued commit succeeded"
                    );
                    self.commit_completed(&account, &commit.changes, id);
                    complete_store(id, commit.callback, Ok(()));
                }
                Ok(None) => {
                    self.inner.pending.borrow_mut().push_front(commit);
                    break;
                }
                Err(e) => complete_store(account.id(), commit.callback, Err(e)),
            }
        }
    }

    /// Called from an account's destructor.
    pub(crate) fn account_dropped(&self, id: AccountId, serial: u64) {
        if id != 0 {
            if let Ok(mut cache) = self.inner.cache.try_borrow_mut() {
                cache.remove_if_serial(id, serial);
            }
        }

        // A queued commit of a dead account is found by the next retry
        // otherwise.
        let cancelled: Vec<PendingCommit> = match self.inner.pending.try_borrow_mut() {
            Ok(mut pending) => {
                let (cancelled, kept): (Vec<PendingCommit>, Vec<PendingCommit>) =
                    pending.drain(..).partition(|c| c.serial == serial);
                *pending = kept.into();
                cancelled
            }
            Err(_) => Vec::new(),
        };
        for commit in cancelled {
            tracing::debug!(account_id = id, "Account dropped with a queued commit");
            complete_store(id, commit.callback, Err(AccountsError::Disposed));
        }
    }

    // ===== Incoming broadcasts =====

    fn handle_frame(&self, frame: &BusFrame) {
        let message = match BroadcastMessage::decode(&frame.payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(path = %frame.path, error = %e, "Ignoring malformed broadcast");
                return;
            }
        };
        self.handle_message(&message);
    }

    fn handle_message(&self, message: &BroadcastMessage) {
        let id = message.account_id;
        let disposition = self.inner.notifier.borrow_mut().classify(message.timestamp);
        let ours = match disposition {
            Disposition::SelfEcho => {
                tracing::trace!(account_id = id, ts = %message.timestamp, "Own broadcast");
                return;
            }
            Disposition::Duplicate => {
                tracing::trace!(account_id = id, ts = %message.timestamp, "Duplicate broadcast");
                return;
            }
            Disposition::Apply { ours } => ours,
        };

        let changes = match message.to_changes() {
            Ok(changes) => changes,
            Err(e) => {
                tracing::warn!(account_id = id, error = %e, "Ignoring malformed broadcast");
                return;
            }
        };
        tracing::debug!(
            account_id = id,
            ours,
            created = changes.created,
            deleted = changes.deleted,
            "Applying broadcast"
        );

        let mut account = self.cached(id);
        if account.is_none() && (changes.created || changes.deleted) && !ours {
            account = Some(self.materialize(id, message.provider.clone(), changes.created));
        }

        let updated = self.must_emit_updated(&changes);
        let enabled = self.must_emit_enabled(&changes);
        if let Some(account) = &account {
            account.apply_changes(&changes);
            if changes.deleted {
                self.inner
                    .cache
                    .borrow_mut()
                    .remove_if_serial(id, account.serial());
            }
        }
        self.emit_events(id, updated, enabled, &changes);
    }

    /// An account announced by another process, kept alive for a while so
    /// listeners can look it up.
    fn materialize(&self, id: AccountId, provider: Option<String>, foreign: bool) -> Account {
        let account = Account::new(
            Rc::downgrade(&self.inner),
            self.next_serial(),
            AccountState::announced(id, provider, foreign),
        );
        let mut cache = self.inner.cache.borrow_mut();
        cache.insert(&account);
        cache.pin(account.clone(), self.inner.foreign_pin);
        tracing::debug!(account_id = id, foreign, "Materialised announced account");
        account
    }

    // ===== Scheduling =====

    /// Handle everything that is ready now: queued bus frames, queued
    /// commits and expired pins. Returns the number of frames handled.
    pub fn process_pending(&self) -> usize {
        let mut handled = 0;
        loop {
            let frame = self
                .inner
                .subscription
                .borrow_mut()
                .as_mut()
                .and_then(Subscription::try_recv);
            let Some(frame) = frame else {
                break;
            };
            self.handle_frame(&frame);
            handled += 1;
        }
        self.tick();
        handled
    }

    fn tick(&self) {
        self.retry_pending_commits();
        let expired = self.inner.cache.borrow_mut().expire_pins(Instant::now());
        if !expired.is_empty() {
            tracing::trace!(count = expired.len(), "Released pinned accounts");
        }
        drop(expired);
    }

    /// Drive the manager until the bus goes away.
    ///
    /// Must run on a current-thread runtime (or inside a `LocalSet`): the
    /// manager is not `Send`.
    ///
    /// # Errors
    /// Returns `Bus` if the manager is already running.
    pub async fn run(&self) -> Result<()> {
        let subscription = self
            .inner
            .subscription
            .borrow_mut()
            .take()
            .ok_or_else(|| AccountsError::Bus("manager is already running".to_string()))?;
        let mut lease = SubscriptionLease {
            slot: &self.inner.subscription,
            subscription: Some(subscription),
        };

        let mut ticker = tokio::time::interval(self.inner.tick.max(MIN_TICK));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(tick = ?self.inner.tick, "Manager loop started");

        loop {
            tokio::select! {
                frame = lease.recv() => match frame {
                    Some(frame) => self.handle_frame(&frame),
                    None => {
                        tracing::debug!("Bus closed, manager loop finished");
                        return Ok(());
                    }
                },
                _ = ticker.tick() => self.tick(),
            }
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let pinned = self.cache.get_mut().take_pins();
        let pending: Vec<PendingCommit> = self.pending.get_mut().drain(..).collect();
        for commit in pending {
            complete_store(0, commit.callback, Err(AccountsError::Disposed));
        }
        drop(pinned);
    }
}

/// Hands the subscription back to the manager when [`Manager::run`] ends.
struct SubscriptionLease<'a> {
    slot: &'a RefCell<Option<Subscription>>,
    subscription: Option<Subscription>,
}

impl SubscriptionLease<'_> {
    async fn recv(&mut self) -> Option<BusFrame> {
        match self.subscription.as_mut() {
            Some(subscription) => subscription.recv().await,
            None => None,
        }
    }
}

impl Drop for SubscriptionLease<'_> {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            if let Ok(mut slot) = self.slot.try_borrow_mut() {
                *slot = Some(subscription);
            }
        }
    }
}
