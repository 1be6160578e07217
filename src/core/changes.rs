//! Pending modifications of one account, and the SQL that persists them.

use std::collections::{BTreeMap, BTreeSet};

use rusqlite::{Connection, params};

use crate::core::account::AccountId;
use crate::core::catalog::{GLOBAL_SCOPE, GLOBAL_SERVICE_TYPE};
use crate::core::value::Value;
use crate::error::{AccountsError, Result};

/// Setting key mapped to the account display name in the global scope.
pub const KEY_NAME: &str = "name";
/// Setting key holding the enabled flag, in the global scope and per service.
pub const KEY_ENABLED: &str = "enabled";

/// Database id of the global scope in `Settings.service`.
pub const GLOBAL_SERVICE_ID: i64 = 0;

/// Changes to a single settings scope.
///
/// A key maps to `Some(value)` for an assignment and `None` for a removal;
/// whichever was written last wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceChanges {
    pub service_name: String,
    pub service_type: String,
    pub service_id: i64,
    settings: BTreeMap<String, Option<Value>>,
}

impl ServiceChanges {
    #[must_use]
    pub fn new(
        service_name: impl Into<String>,
        service_type: impl Into<String>,
        service_id: i64,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            service_type: service_type.into(),
            service_id,
            settings: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn global() -> Self {
        Self::new(GLOBAL_SCOPE, GLOBAL_SERVICE_TYPE, GLOBAL_SERVICE_ID)
    }

    #[must_use]
    pub fn is_global(&self) -> bool {
        self.service_name == GLOBAL_SCOPE
    }

    pub fn set(&mut self, key: impl Into<String>, value: Option<Value>) {
        self.settings.insert(key.into(), value);
    }

    /// `Some(None)` means the key is pending removal.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Option<Value>> {
        self.settings.get(key)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.settings.contains_key(key)
    }

    #[must_use]
    pub const fn settings(&self) -> &BTreeMap<String, Option<Value>> {
        &self.settings
    }

    pub fn assigned(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.settings
            .iter()
            .filter_map(|(k, v)| v.as_ref().map(|v| (k.as_str(), v)))
    }

    pub fn removed(&self) -> impl Iterator<Item = &str> {
        self.settings
            .iter()
            .filter(|(_, v)| v.is_none())
            .map(|(k, _)| k.as_str())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }
}

/// Everything an account will write on its next store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub created: bool,
    pub deleted: bool,
    services: BTreeMap<String, ServiceChanges>,
}

impl ChangeSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The change set of an account that does not exist in the database yet.
    #[must_use]
    pub fn for_new_account() -> Self {
        Self {
            created: true,
            ..Self::default()
        }
    }

    /// Changes for a scope, creating an empty entry on first use.
    pub fn scope_mut(
        &mut self,
        service_name: &str,
        service_type: &str,
        service_id: i64,
    ) -> &mut ServiceChanges {
        self.services
            .entry(service_name.to_string())
            .or_insert_with(|| ServiceChanges::new(service_name, service_type, service_id))
    }

    pub fn global_mut(&mut self) -> &mut ServiceChanges {
        self.services
            .entry(GLOBAL_SCOPE.to_string())
            .or_insert_with(ServiceChanges::global)
    }

    /// Insert a fully formed scope, replacing any previous entry.
    pub fn insert_scope(&mut self, changes: ServiceChanges) {
        self.services.insert(changes.service_name.clone(), changes);
    }

    #[must_use]
    pub fn service(&self, service_name: &str) -> Option<&ServiceChanges> {
        self.services.get(service_name)
    }

    #[must_use]
    pub fn global(&self) -> Option<&ServiceChanges> {
        self.services.get(GLOBAL_SCOPE)
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceChanges> {
        self.services.values()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.created && !self.deleted && self.services.values().all(ServiceChanges::is_empty)
    }

    /// Distinct service types touched; the global type is always included
    /// for creations and deletions.
    #[must_use]
    pub fn service_types(&self) -> BTreeSet<String> {
        let mut types: BTreeSet<String> = self
            .services
            .values()
            .map(|s| s.service_type.clone())
            .collect();
        if self.created || self.deleted {
            types.insert(GLOBAL_SERVICE_TYPE.to_string());
        }
        types
    }

    #[must_use]
    pub fn has_service_type(&self, service_type: &str) -> bool {
        self.services
            .values()
            .any(|s| s.service_type == service_type)
    }

    /// Whether any scope touched its `enabled` key.
    #[must_use]
    pub fn has_enabled(&self) -> bool {
        self.services.values().any(|s| s.contains(KEY_ENABLED))
    }

    /// New value of the account-wide enabled flag, if it changed.
    #[must_use]
    pub fn enabled(&self) -> Option<bool> {
        self.global()
            .and_then(|g| g.get(KEY_ENABLED))
            .map(|v| v.as_ref().and_then(Value::as_bool).unwrap_or(false))
    }

    /// New display name, if it changed. `Some(None)` clears it.
    #[must_use]
    pub fn display_name(&self) -> Option<Option<String>> {
        self.global()
            .and_then(|g| g.get(KEY_NAME))
            .map(|v| v.as_ref().and_then(Value::as_str).map(str::to_string))
    }
}

// =============================================================================
// Store batch
// =============================================================================

/// The write plan for one [`ChangeSet`].
#[derive(Debug)]
pub struct StoreBatch<'a> {
    account_id: AccountId,
    provider: Option<&'a str>,
    changes: &'a ChangeSet,
}

impl<'a> StoreBatch<'a> {
    #[must_use]
    pub const fn new(
        account_id: AccountId,
        provider: Option<&'a str>,
        changes: &'a ChangeSet,
    ) -> Self {
        Self {
            account_id,
            provider,
            changes,
        }
    }

    /// Run the plan inside an already open transaction.
    ///
    /// Returns the account id, freshly assigned for new accounts.
    ///
    /// # Errors
    /// Returns the first failing statement's error.
    pub fn apply(&self, conn: &Connection) -> Result<AccountId> {
        let changes = self.changes;

        if changes.deleted {
            if self.account_id != 0 {
                conn.prepare_cached("DELETE FROM Accounts WHERE id = ?1")?
                    .execute([self.account_id])?;
                conn.prepare_cached("DELETE FROM Settings WHERE account = ?1")?
                    .execute([self.account_id])?;
            }
            return Ok(self.account_id);
        }

        let account_id = if self.account_id == 0 {
            self.insert_account(conn)?
        } else {
            self.update_account(conn)?;
            self.account_id
        };

        for scope in changes.services() {
            for (key, value) in scope.assigned() {
                let (type_sig, text) = value.to_db();
                conn.prepare_cached(
                    "INSERT OR REPLACE INTO Settings (account, service, key, type, value) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?
                .execute(params![account_id, scope.service_id, key, type_sig, text])?;
            }

            if self.account_id != 0 {
                for key in scope.removed() {
                    conn.prepare_cached(
                        "DELETE FROM Settings WHERE account = ?1 AND service = ?2 AND key = ?3",
                    )?
                    .execute(params![account_id, scope.service_id, key])?;
                }
            }
        }

        Ok(account_id)
    }

    fn insert_account(&self, conn: &Connection) -> Result<AccountId> {
        let name = self.changes.display_name().flatten();
        let enabled = self.changes.enabled().unwrap_or(false);
        conn.prepare_cached("INSERT INTO Accounts (name, provider, enabled) VALUES (?1, ?2, ?3)")?
            .execute(params![name, self.provider, enabled])?;

        let rowid = conn.last_insert_rowid();
        AccountId::try_from(rowid)
            .map_err(|_| AccountsError::from(rusqlite::Error::IntegralValueOutOfRange(0, rowid)))
    }

    fn update_account(&self, conn: &Connection) -> Result<()> {
        if let Some(name) = self.changes.display_name() {
            conn.prepare_cached("UPDATE Accounts SET name = ?1 WHERE id = ?2")?
                .execute(params![name, self.account_id])?;
        }
        if let Some(enabled) = self.changes.enabled() {
            conn.prepare_cached("UPDATE Accounts SET enabled = ?1 WHERE id = ?2")?
                .execute(params![enabled, self.account_id])?;
        }
        Ok(())
    }
}
