//! The change broadcast and its JSON wire form.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::account::AccountId;
use crate::core::changes::{ChangeSet, ServiceChanges};
use crate::core::value::Value;
use crate::error::{AccountsError, Result};
use crate::util::Timestamp;

/// Changes of one scope as carried on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireService {
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: String,
    pub id: i64,
    /// Assigned keys with values in annotated text form.
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    #[serde(default)]
    pub removed: Vec<String>,
}

/// Notification that an account was committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub timestamp: Timestamp,
    pub account_id: AccountId,
    pub created: bool,
    pub deleted: bool,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub services: Vec<WireService>,
}

impl BroadcastMessage {
    #[must_use]
    pub fn from_changes(
        timestamp: Timestamp,
        account_id: AccountId,
        provider: Option<&str>,
        changes: &ChangeSet,
    ) -> Self {
        let services = changes
            .services()
            .map(|scope| WireService {
                name: scope.service_name.clone(),
                service_type: scope.service_type.clone(),
                id: scope.service_id,
                settings: scope
                    .assigned()
                    .map(|(key, value)| (key.to_string(), value.to_wire()))
                    .collect(),
                removed: scope.removed().map(str::to_string).collect(),
            })
            .collect();

        Self {
            timestamp,
            account_id,
            created: changes.created,
            deleted: changes.deleted,
            provider: provider.map(str::to_string),
            services,
        }
    }

    /// Rebuild the change set.
    ///
    /// # Errors
    /// Returns `MalformedMessage` if any value fails to decode.
    pub fn to_changes(&self) -> Result<ChangeSet> {
        let mut changes = ChangeSet::new();
        changes.created = self.created;
        changes.deleted = self.deleted;

        for wire in &self.services {
            let mut scope = ServiceChanges::new(&wire.name, &wire.service_type, wire.id);
            for (key, text) in &wire.settings {
                let value = Value::from_wire(text).map_err(|e| {
                    AccountsError::MalformedMessage(format!("setting '{key}': {e}"))
                })?;
                scope.set(key.clone(), Some(value));
            }
            for key in &wire.removed {
                scope.set(key.clone(), None);
            }
            changes.insert_scope(scope);
        }
        Ok(changes)
    }

    /// # Errors
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// # Errors
    /// Returns `MalformedMessage` if `payload` is not a broadcast.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| AccountsError::MalformedMessage(e.to_string()))
    }
}
