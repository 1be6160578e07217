//! Publishing committed changes and recognising their echoes.
//!
//! Every commit is broadcast on the catalog path and on one path per service
//! type it touched. Publishers also receive their own broadcasts, and a
//! broadcast may arrive twice when a manager listens on two of its paths.
//! The notifier keeps two short ledgers to sort incoming messages:
//!
//! - **emitted**: timestamps of our own broadcasts not yet echoed back, each
//!   with a `must_process` flag raised when a foreign message arrived in
//!   between (our echo then has to be re-applied on top of it);
//! - **processed**: the last few timestamps already handled.

use std::collections::VecDeque;

use crate::bus::{BroadcastMessage, Bus, CATALOG_PATH, service_type_path};
use crate::core::account::AccountId;
use crate::core::catalog::GLOBAL_SERVICE_TYPE;
use crate::core::changes::ChangeSet;
use crate::util::Timestamp;

/// Number of handled timestamps remembered for duplicate detection.
pub const PROCESSED_CAPACITY: usize = 2;

/// Upper bound on own broadcasts awaiting their echo.
const EMITTED_CAPACITY: usize = 64;

/// What to do with an incoming broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Our own broadcast, already applied locally.
    SelfEcho,
    /// Second delivery of a message already handled.
    Duplicate,
    /// Apply the message; `ours` when it is our own echo that must be
    /// re-applied.
    Apply { ours: bool },
}

#[derive(Debug, Clone, Copy)]
struct Emitted {
    timestamp: Timestamp,
    must_process: bool,
}

/// Broadcast ledger of one manager.
#[derive(Debug)]
pub struct ChangeNotifier {
    subscribed: Vec<String>,
    emitted: Vec<Emitted>,
    processed: VecDeque<Timestamp>,
}

impl ChangeNotifier {
    /// Ledger for a manager listening on the paths of `service_type`.
    #[must_use]
    pub fn new(service_type: Option<&str>) -> Self {
        Self {
            subscribed: subscription_paths(service_type),
            emitted: Vec::new(),
            processed: VecDeque::with_capacity(PROCESSED_CAPACITY + 1),
        }
    }

    /// Paths the owning manager subscribes to.
    #[must_use]
    pub fn subscribed_paths(&self) -> &[String] {
        &self.subscribed
    }

    /// Broadcast a committed change set.
    ///
    /// Transport failures are logged; the commit itself already succeeded.
    pub fn publish(
        &mut self,
        bus: &dyn Bus,
        account_id: AccountId,
        provider: Option<&str>,
        changes: &ChangeSet,
    ) -> Timestamp {
        let timestamp = Timestamp::now();
        let message = BroadcastMessage::from_changes(timestamp, account_id, provider, changes);
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(account_id, error = %e, "Failed to encode broadcast");
                return timestamp;
            }
        };

        let paths = publish_paths(changes);
        if paths.iter().any(|p| self.subscribed.contains(p)) {
            if self.emitted.len() >= EMITTED_CAPACITY {
                self.emitted.remove(0);
            }
            self.emitted.push(Emitted {
                timestamp,
                must_process: false,
            });
        }

        for path in &paths {
            if let Err(e) = bus.publish(path, &payload) {
                tracing::warn!(account_id, path, error = %e, "Failed to publish change");
            }
        }
        tracing::debug!(account_id, %timestamp, ?paths, "Broadcast change");
        timestamp
    }

    /// Sort an incoming broadcast and update the ledgers.
    pub fn classify(&mut self, timestamp: Timestamp) -> Disposition {
        let mut ours = false;

        if let Some(index) = self.emitted.iter().position(|e| e.timestamp == timestamp) {
            let entry = self.emitted.remove(index);
            if !entry.must_process {
                self.record_processed(timestamp);
                return Disposition::SelfEcho;
            }
            ours = true;
        } else if let Some(index) = self.processed.iter().position(|t| *t == timestamp) {
            // A manager hears a message at most twice, so one hit settles it.
            self.processed.remove(index);
            return Disposition::Duplicate;
        }

        for entry in &mut self.emitted {
            entry.must_process = true;
        }
        self.record_processed(timestamp);
        Disposition::Apply { ours }
    }

    /// Own broadcasts still awaiting their echo.
    #[must_use]
    pub fn pending_echoes(&self) -> usize {
        self.emitted.len()
    }

    fn record_processed(&mut self, timestamp: Timestamp) {
        self.processed.push_back(timestamp);
        while self.processed.len() > PROCESSED_CAPACITY {
            self.processed.pop_front();
        }
    }
}

/// Paths a manager listens on.
#[must_use]
pub fn subscription_paths(service_type: Option<&str>) -> Vec<String> {
    match service_type {
        None => vec![CATALOG_PATH.to_string()],
        Some(service_type) => {
            let mut paths = vec![service_type_path(service_type)];
            if service_type != GLOBAL_SERVICE_TYPE {
                paths.push(service_type_path(GLOBAL_SERVICE_TYPE));
            }
            paths
        }
    }
}

/// Paths a change set is published on.
#[must_use]
pub fn publish_paths(changes: &ChangeSet) -> Vec<String> {
    std::iter::once(CATALOG_PATH.to_string())
        .chain(changes.service_types().iter().map(|t| service_type_path(t)))
        .collect()
}
