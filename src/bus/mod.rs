//! Transport for change broadcasts between processes.
//!
//! A bus carries opaque payloads on named paths. Publishers do not know who
//! listens; subscribers receive every payload published on their paths,
//! including their own.
//!
//! - [`LocalBus`]: in-process fan-out, for embedding several managers in one
//!   process and for tests.
//! - [`SpoolBus`]: cross-process delivery through a shared directory watched
//!   with `notify`.

pub mod local;
pub mod message;
pub mod spool;

use std::fmt;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::util::escape_identifier;

pub use local::LocalBus;
pub use message::{BroadcastMessage, WireService};
pub use spool::SpoolBus;

/// Path carrying every change, listened to by managers without a service type.
pub const CATALOG_PATH: &str = "/accounts";

/// Path carrying changes that touch `service_type`.
#[must_use]
pub fn service_type_path(service_type: &str) -> String {
    format!("{CATALOG_PATH}/service/{}", escape_identifier(service_type))
}

/// One delivered payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusFrame {
    pub path: String,
    pub payload: Vec<u8>,
}

/// A message transport.
pub trait Bus {
    /// Deliver `payload` to every subscriber of `path`.
    ///
    /// # Errors
    /// Returns an error if the payload could not be handed to the transport.
    fn publish(&self, path: &str, payload: &[u8]) -> Result<()>;

    /// Start receiving payloads published on any of `paths`.
    ///
    /// # Errors
    /// Returns an error if the transport cannot register the subscription.
    fn subscribe(&self, paths: &[String]) -> Result<Subscription>;
}

/// Receiving end of a bus subscription.
///
/// Dropping it unsubscribes.
pub struct Subscription {
    paths: Vec<String>,
    rx: mpsc::UnboundedReceiver<BusFrame>,
    _guard: Option<Box<dyn std::any::Any>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    #[must_use]
    pub const fn new(paths: Vec<String>, rx: mpsc::UnboundedReceiver<BusFrame>) -> Self {
        Self {
            paths,
            rx,
            _guard: None,
        }
    }

    /// Keep `guard` alive as long as the subscription.
    #[must_use]
    pub fn with_guard(mut self, guard: impl std::any::Any) -> Self {
        self._guard = Some(Box::new(guard));
        self
    }

    #[must_use]
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// Next frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<BusFrame> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next frame; `None` once the transport has gone away.
    pub async fn recv(&mut self) -> Option<BusFrame> {
        self.rx.recv().await
    }
}
