//! Common helpers for integration tests.
//!
//! # Modules
//!
//! - `log_capture`: in-test capture of `tracing` events

#![allow(dead_code)]

pub mod log_capture;

use std::cell::RefCell;
use std::rc::Rc;

use accounts_core::{Manager, ManagerEvent};

/// Record every event `manager` emits.
pub fn record_events(manager: &Manager) -> Rc<RefCell<Vec<ManagerEvent>>> {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&events);
    manager.connect(move |_, event| sink.borrow_mut().push(*event));
    events
}
