//! In-process bus.

use std::sync::Mutex;

use tokio::sync::mpsc;

use super::{Bus, BusFrame, Subscription};
use crate::error::{AccountsError, Result};

#[derive(Debug)]
struct Subscriber {
    paths: Vec<String>,
    tx: mpsc::UnboundedSender<BusFrame>,
}

/// Fan-out to subscriptions living in the same process.
///
/// Delivery is synchronous: a frame is queued on every matching subscription
/// before `publish` returns.
#[derive(Debug, Default)]
pub struct LocalBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl LocalBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }
}

impl Bus for LocalBus {
    fn publish(&self, path: &str, payload: &[u8]) -> Result<()> {
        let mut subscribers = self
            .subscribers
            .lock()
            .map_err(|_| AccountsError::Bus("local bus lock poisoned".to_string()))?;
        subscribers.retain(|s| !s.tx.is_closed());

        let mut delivered = 0usize;
        for subscriber in subscribers.iter().filter(|s| s.paths.iter().any(|p| p == path)) {
            let frame = BusFrame {
                path: path.to_string(),
                payload: payload.to_vec(),
            };
            if subscriber.tx.send(frame).is_ok() {
                delivered += 1;
            }
        }
        tracing::trace!(path, delivered, "Published on local bus");
        Ok(())
    }

    fn subscribe(&self, paths: &[String]) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .map_err(|_| AccountsError::Bus("local bus lock poisoned".to_string()))?
            .push(Subscriber {
                paths: paths.to_vec(),
                tx,
            });
        Ok(Subscription::new(paths.to_vec(), rx))
    }
}
