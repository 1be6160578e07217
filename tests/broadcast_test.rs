//! Integration tests for change broadcasts between managers.
//!
//! Managers share one in-process bus; `TestEnv::pump` lets each of them
//! handle what was delivered, as a process's event loop would.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use accounts_core::core::account::SettingSource;
use accounts_core::test_utils::TestEnv;
use accounts_core::{Account, AccountsError, Manager, ManagerEvent, ManagerOptions, Value};

mod common;
use common::record_events;

/// An IM manager that forgets announced accounts as soon as it has handled
/// them.
fn unpinned_reader(env: &TestEnv) -> Manager {
    env.manager_with(
        ManagerOptions::default()
            .with_service_type("IM")
            .with_foreign_pin(Duration::ZERO),
    )
}

/// Like [`unpinned_reader`], without a service type.
fn unpinned_untyped_reader(env: &TestEnv) -> Manager {
    env.manager_with(ManagerOptions::default().with_foreign_pin(Duration::ZERO))
}

fn counter() -> (Rc<Cell<u32>>, impl Fn(&Account, &str) + 'static) {
    let hits = Rc::new(Cell::new(0));
    let sink = Rc::clone(&hits);
    (hits, move |_: &Account, _: &str| sink.set(sink.get() + 1))
}

// =============================================================================
// Creation
// =============================================================================

#[test]
fn created_account_is_visible_from_the_event_listener() {
    let env = TestEnv::new();
    let writer = env.manager();
    let reader = env.manager();

    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    reader.connect(move |manager, event| {
        if let ManagerEvent::AccountCreated(id) = event {
            let account = manager.get_account(*id).expect("announced account");
            sink.borrow_mut()
                .push((account.is_foreign(), account.enabled(), account.display_name()));
        }
    });

    let account = writer.create_account(Some("example"));
    account.set_display_name(Some("Remote"));
    account.set_enabled(true).unwrap();
    account.store_blocking().unwrap();
    env.pump(&[&reader]);

    assert_eq!(
        *seen.borrow(),
        vec![(true, true, Some("Remote".to_string()))]
    );
}

#[test]
fn creation_events_are_ordered() {
    let env = TestEnv::new();
    let writer = env.manager();
    let reader = env.manager_for_type("IM");
    let events = record_events(&reader);

    let account = writer.create_account(Some("example"));
    account.set_enabled(true).unwrap();
    account.store_blocking().unwrap();
    env.pump(&[&reader]);

    let id = account.id();
    assert_eq!(
        *events.borrow(),
        vec![ManagerEvent::EnabledEvent(id), ManagerEvent::AccountCreated(id)]
    );
}

#[test]
fn foreign_accounts_expire_after_their_pin() {
    let env = TestEnv::new();
    let writer = env.manager();
    let reader =
        env.manager_with(ManagerOptions::default().with_foreign_pin(Duration::from_millis(50)));

    let account = writer.create_account(Some("example"));
    account.store_blocking().unwrap();
    env.pump(&[&reader]);
    assert!(reader.is_resident(account.id()));

    thread::sleep(Duration::from_millis(80));
    reader.process_pending();
    assert!(!reader.is_resident(account.id()));

    let loaded = reader.load_account(account.id()).unwrap();
    assert!(!loaded.is_foreign());
}

// =============================================================================
// Echo and duplicate suppression
// =============================================================================

#[test]
fn own_broadcasts_are_not_applied_twice() {
    let env = TestEnv::new();
    let manager = env.manager();
    let events = record_events(&manager);

    let account = manager.create_account(Some("example"));
    account.set_enabled(true).unwrap();
    account.store_blocking().unwrap();
    assert_eq!(
        *events.borrow(),
        vec![ManagerEvent::AccountCreated(account.id())]
    );

    events.borrow_mut().clear();
    assert_eq!(manager.process_pending(), 1);
    assert!(events.borrow().is_empty());
}

#[test]
fn typed_manager_applies_a_doubly_delivered_change_once() {
    let env = TestEnv::new();
    let writer = env.manager();
    let reader = env.manager_for_type("IM");
    let events = record_events(&reader);
    let chat = writer.service("example-chat").unwrap();

    let account = writer.create_account(Some("example"));
    account.select_service(Some(&chat)).unwrap();
    account.set_enabled(true).unwrap();
    account.store_blocking().unwrap();

    // Published on both the IM path and the global path.
    assert_eq!(reader.process_pending(), 2);
    let id = account.id();
    assert_eq!(
        *events.borrow(),
        vec![ManagerEvent::EnabledEvent(id), ManagerEvent::AccountCreated(id)]
    );
}

#[test]
fn typed_manager_ignores_unrelated_updates() {
    let env = TestEnv::new();
    let writer = env.manager();
    let reader = env.manager_for_type("IM");
    let mail = writer.service("example-mail").unwrap();

    let account = writer.create_account(Some("example"));
    account.store_blocking().unwrap();
    env.pump(&[&reader]);

    let events = record_events(&reader);
    account.select_service(Some(&mail)).unwrap();
    account.set_value("host", Some(Value::from("imap"))).unwrap();
    account.store_blocking().unwrap();
    assert_eq!(reader.process_pending(), 0);
    assert!(events.borrow().is_empty());
}

// =============================================================================
// Updates and deletion of resident accounts
// =============================================================================

#[test]
fn remote_update_reaches_resident_account_and_watches() {
    let env = TestEnv::new();
    let writer = env.manager();
    let reader = unpinned_reader(&env);
    let chat = writer.service("example-chat").unwrap();

    let account = writer.create_account(Some("example"));
    account.select_service(Some(&chat)).unwrap();
    account.set_value("parameters/port", Some(Value::UInt32(99))).unwrap();
    account.store_blocking().unwrap();
    env.pump(&[&reader]);
    assert!(!reader.is_resident(account.id()));

    let mirror = reader.load_account(account.id()).unwrap();
    assert!(!mirror.is_foreign());
    mirror.select_service(Some(&chat)).unwrap();
    let (hits, on_port) = counter();
    mirror.watch_key("parameters/port", on_port);
    let events = record_events(&reader);

    account.set_value("parameters/port", Some(Value::UInt32(100))).unwrap();
    account.store_blocking().unwrap();
    env.pump(&[&reader]);
    assert_eq!(
        mirror.get_value("parameters/port"),
        (SettingSource::Account, Some(Value::UInt32(100)))
    );
    assert_eq!(hits.get(), 1);
    assert_eq!(
        *events.borrow(),
        vec![ManagerEvent::AccountUpdated(account.id())]
    );

    account.set_value("parameters/port", None).unwrap();
    account.store_blocking().unwrap();
    env.pump(&[&reader]);
    assert_eq!(
        mirror.get_value("parameters/port"),
        (SettingSource::Profile, Some(Value::UInt32(5223)))
    );
    assert_eq!(hits.get(), 2);
}

#[test]
fn remote_deletion_marks_resident_account_deleted() {
    let env = TestEnv::new();
    let writer = env.manager();
    let reader = unpinned_reader(&env);

    let account = writer.create_account(Some("example"));
    account.set_enabled(true).unwrap();
    account.store_blocking().unwrap();
    env.pump(&[&reader]);
    let id = account.id();

    let mirror = reader.load_account(id).unwrap();
    let events = record_events(&reader);
    account.delete();
    account.store_blocking().unwrap();
    env.pump(&[&reader]);

    assert!(mirror.is_deleted());
    assert!(!mirror.enabled());
    assert_eq!(*events.borrow(), vec![ManagerEvent::AccountDeleted(id)]);
    assert!(matches!(
        reader.load_account(id),
        Err(AccountsError::NotFound(_))
    ));
    assert!(matches!(
        mirror.store_blocking(),
        Err(AccountsError::AccountDeleted { .. })
    ));
}

#[test]
fn updates_to_accounts_nobody_holds_only_raise_events() {
    let env = TestEnv::new();
    let writer = env.manager();
    let reader = unpinned_reader(&env);
    let chat = writer.service("example-chat").unwrap();

    let account = writer.create_account(Some("example"));
    account.store_blocking().unwrap();
    env.pump(&[&reader]);
    assert!(!reader.is_resident(account.id()));

    let events = record_events(&reader);
    account.select_service(Some(&chat)).unwrap();
    account.set_value("nick", Some(Value::from("me"))).unwrap();
    account.store_blocking().unwrap();
    env.pump(&[&reader]);
    assert_eq!(
        *events.borrow(),
        vec![ManagerEvent::AccountUpdated(account.id())]
    );
    assert!(!reader.is_resident(account.id()));
}

#[test]
fn untyped_manager_hears_only_creation_and_deletion() {
    let env = TestEnv::new();
    let writer = env.manager();
    let reader = unpinned_untyped_reader(&env);
    let events = record_events(&reader);
    let chat = writer.service("example-chat").unwrap();

    let account = writer.create_account(Some("example"));
    account.store_blocking().unwrap();
    env.pump(&[&reader]);
    let id = account.id();

    account.set_enabled(true).unwrap();
    account.select_service(Some(&chat)).unwrap();
    account.set_value("nick", Some(Value::from("me"))).unwrap();
    account.set_enabled(true).unwrap();
    account.store_blocking().unwrap();
    env.pump(&[&reader]);

    account.delete();
    account.store_blocking().unwrap();
    env.pump(&[&reader]);

    assert_eq!(
        *events.borrow(),
        vec![ManagerEvent::AccountCreated(id), ManagerEvent::AccountDeleted(id)]
    );
}

#[test]
fn doubly_delivered_change_fires_each_watch_once() {
    let env = TestEnv::new();
    let writer = env.manager();
    let reader = unpinned_reader(&env);
    let chat = writer.service("example-chat").unwrap();

    let account = writer.create_account(Some("example"));
    account.store_blocking().unwrap();
    env.pump(&[&reader]);

    let mirror = reader.load_account(account.id()).unwrap();
    let (nick_hits, on_nick) = counter();
    mirror.watch_key("nick", on_nick);
    mirror.select_service(Some(&chat)).unwrap();
    let (port_hits, on_port) = counter();
    mirror.watch_key("parameters/port", on_port);
    let (dir_hits, on_dir) = counter();
    mirror.watch_dir("parameters/", on_dir);

    // Touching the global scope and an IM service sends the change to both
    // paths the reader listens on.
    account.set_value("nick", Some(Value::from("me"))).unwrap();
    account.select_service(Some(&chat)).unwrap();
    account.set_value("parameters/port", Some(Value::UInt32(100))).unwrap();
    account.set_value("parameters/host", Some(Value::from("h"))).unwrap();
    account.store_blocking().unwrap();

    assert_eq!(reader.process_pending(), 2);
    assert_eq!(nick_hits.get(), 1);
    assert_eq!(port_hits.get(), 1);
    assert_eq!(dir_hits.get(), 1);
    assert_eq!(
        mirror.get_value("parameters/port"),
        (SettingSource::Account, Some(Value::UInt32(100)))
    );
    assert_eq!(
        mirror.get_value("parameters/host"),
        (SettingSource::Account, Some(Value::from("h")))
    );
}

// =============================================================================
// Reprocessing own broadcasts
// =============================================================================

#[test]
fn own_change_is_reapplied_after_an_earlier_remote_change() {
    let env = TestEnv::new();
    let local = env.manager();
    let remote = unpinned_untyped_reader(&env);

    let account = local.create_account(Some("example"));
    account.store_blocking().unwrap();
    env.pump(&[&local, &remote]);
    let (hits, on_host) = counter();
    account.watch_key("host", on_host);

    // The remote write commits first, so its broadcast is queued ahead of
    // our own echo.
    let copy = remote.load_account(account.id()).unwrap();
    copy.set_value("host", Some(Value::from("remote"))).unwrap();
    copy.store_blocking().unwrap();
    account.set_value("host", Some(Value::from("local"))).unwrap();
    account.store_blocking().unwrap();
    assert_eq!(hits.get(), 1);

    assert_eq!(local.process_pending(), 2);
    assert_eq!(hits.get(), 3);
    assert_eq!(
        account.get_value("host"),
        (SettingSource::Account, Some(Value::from("local")))
    );

    let fresh = env.manager().load_account(account.id()).unwrap();
    assert_eq!(fresh.get_value("host").1, Some(Value::from("local")));
}

#[test]
fn reapplied_own_creation_is_not_materialized() {
    let env = TestEnv::new();
    let local = env.manager();
    let remote = env.manager();
    let events = record_events(&local);

    let theirs = remote.create_account(Some("example"));
    theirs.store_blocking().unwrap();
    let ours = local.create_account(Some("example"));
    ours.store_blocking().unwrap();
    let (their_id, our_id) = (theirs.id(), ours.id());
    drop(ours);
    assert!(!local.is_resident(our_id));

    assert_eq!(local.process_pending(), 2);
    assert!(local.is_resident(their_id), "remote creation is materialized");
    assert!(!local.is_resident(our_id), "own creation stays unmaterialized");
    assert_eq!(
        *events.borrow(),
        vec![
            ManagerEvent::AccountCreated(our_id),
            ManagerEvent::AccountCreated(their_id),
            ManagerEvent::AccountCreated(our_id),
        ]
    );
}
