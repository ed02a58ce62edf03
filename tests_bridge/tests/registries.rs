//! Registry Tests
//!
//! These tests verify listener and handler bookkeeping across process
//! lifetimes: the protected process-wide registry, per-peer registries and
//! their cleanup when the peer goes away.

use core_types::ProcessRole;
use ipc::Value;
use message_bridge::{BridgeError, CONTEXT_RELEASE_CHANNEL};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tests_bridge::{local_bridge, settle, test_host};

/// Test: The process-wide registry cannot be wiped
///
/// This validates that:
/// 1. Removing every listener of every channel is refused
/// 2. Removing the listeners of one channel is allowed
/// 3. A peer scope may be wiped entirely
#[test]
fn test_protected_registry() {
    let host = test_host();
    let controller = local_bridge(&host, ProcessRole::Controller);
    let content = local_bridge(&host, ProcessRole::Content);

    controller.on("a", |_, _| Ok(())).expect("Failed to listen");
    controller.on("b", |_, _| Ok(())).expect("Failed to listen");
    assert!(matches!(
        controller.remove_all_listeners(None),
        Err(BridgeError::ProtectedRegistryMutation)
    ));
    assert_eq!(controller.event_names(), vec!["a", "b"]);

    controller
        .remove_all_listeners(Some("a"))
        .expect("Failed to remove channel listeners");
    assert_eq!(controller.event_names(), vec!["b"]);

    let scope = controller.scope(content.process());
    scope.on("a", |_, _| Ok(())).expect("Failed to listen");
    scope.on("c", |_, _| Ok(())).expect("Failed to listen");
    scope
        .remove_all_listeners(None)
        .expect("Scoped registry should allow full removal");
    assert_eq!(scope.listener_count("a"), 0);
    assert_eq!(scope.listener_count("c"), 0);
}

/// Test: Reserved channels are off limits to applications
///
/// This validates that:
/// 1. Listening on a framework channel fails
/// 2. Sending on one fails before anything is queued
#[test]
fn test_reserved_channels_are_rejected() {
    let host = test_host();
    let controller = local_bridge(&host, ProcessRole::Controller);
    let content = local_bridge(&host, ProcessRole::Content);

    assert!(matches!(
        controller.on(CONTEXT_RELEASE_CHANNEL, |_, _| Ok(())),
        Err(BridgeError::ReservedChannel(_))
    ));
    assert!(matches!(
        content.send(controller.process(), CONTEXT_RELEASE_CHANNEL, &[]),
        Err(BridgeError::ReservedChannel(_))
    ));
    assert_eq!(host.queued(controller.process()), 0);
}

/// Test: Per-peer registrations go away with the peer
///
/// This validates that:
/// 1. A scoped handler serves its peer ahead of the process-wide one
/// 2. Other peers still reach the process-wide handler
/// 3. The scope is dropped when the peer terminates, and registering on it
///    afterwards fails with `PeerGone`
#[test]
fn test_scoped_registry_follows_peer_lifetime() {
    let host = test_host();
    let controller = local_bridge(&host, ProcessRole::Controller);
    let first = local_bridge(&host, ProcessRole::Content);
    let second = local_bridge(&host, ProcessRole::Content);
    let all = [&controller, &first, &second];

    controller
        .handle("who", |_, _| Ok(Value::from("anyone")))
        .expect("Failed to register handler");
    let scope = controller.scope(first.process());
    scope
        .handle("who", |_, _| Ok(Value::from("first")))
        .expect("Failed to register scoped handler");
    scope.on("ping", |_, _| Ok(())).expect("Failed to listen");

    let mut from_first = first.invoke(controller.process(), "who", &[]).expect("Failed to invoke");
    let mut from_second = second
        .invoke(controller.process(), "who", &[])
        .expect("Failed to invoke");
    settle(&all);
    assert_eq!(from_first.try_result().expect("Unsettled").expect("Failed"), Value::from("first"));
    assert_eq!(from_second.try_result().expect("Unsettled").expect("Failed"), Value::from("anyone"));

    host.terminate(first.process());
    controller.pump().expect("Failed to pump");
    assert_eq!(scope.listener_count("ping"), 0);
    assert!(matches!(
        scope.on("ping", |_, _| Ok(())),
        Err(BridgeError::PeerGone(_))
    ));
}

/// Test: Releasing a context drops its scope on the other side
///
/// This validates that:
/// 1. `release_context` reaches the peer as a framework message
/// 2. Scoped listeners stop firing; process-wide ones keep working
#[test]
fn test_context_release_drops_scope() {
    let host = test_host();
    let controller = local_bridge(&host, ProcessRole::Controller);
    let content = local_bridge(&host, ProcessRole::Content);

    let scoped_hits = Rc::new(Cell::new(0));
    let global_hits = Rc::new(Cell::new(0));
    let counter = Rc::clone(&scoped_hits);
    controller
        .scope(content.process())
        .on("log", move |_, _| {
            counter.set(counter.get() + 1);
            Ok(())
        })
        .expect("Failed to listen");
    let counter = Rc::clone(&global_hits);
    controller
        .on("log", move |_, _| {
            counter.set(counter.get() + 1);
            Ok(())
        })
        .expect("Failed to listen");

    content.send(controller.process(), "log", &[]).expect("Failed to send");
    content
        .release_context(controller.process())
        .expect("Failed to release context");
    content.send(controller.process(), "log", &[]).expect("Failed to send");
    settle(&[&controller, &content]);

    assert_eq!(scoped_hits.get(), 1);
    assert_eq!(global_hits.get(), 2);
}

/// Test: Once-listeners and failing listeners
///
/// This validates that:
/// 1. A once-listener fires a single time
/// 2. A failing or panicking listener does not stop the ones after it
#[test]
fn test_listener_lifecycles() {
    let host = test_host();
    let controller = local_bridge(&host, ProcessRole::Controller);
    let content = local_bridge(&host, ProcessRole::Content);

    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    controller
        .once("boot", move |_, _| {
            sink.borrow_mut().push("once");
            Ok(())
        })
        .expect("Failed to listen");
    controller
        .on("boot", |_, _| Err(ipc::ErrorValue::msg("listener failed")))
        .expect("Failed to listen");
    controller
        .on("boot", |_, _| panic!("listener panicked"))
        .expect("Failed to listen");
    let sink = Rc::clone(&seen);
    controller
        .on("boot", move |_, _| {
            sink.borrow_mut().push("last");
            Ok(())
        })
        .expect("Failed to listen");

    content.send(controller.process(), "boot", &[]).expect("Failed to send");
    content.send(controller.process(), "boot", &[]).expect("Failed to send");
    settle(&[&controller, &content]);

    assert_eq!(*seen.borrow(), vec!["once", "last", "last"]);
    assert_eq!(controller.listener_count("boot"), 3);
}

/// Test: Closing a bridge settles everything it owes
///
/// This validates that:
/// 1. Calls the closed bridge was waiting on are rejected with `Closed`
/// 2. Its unfinished async handlers answer `reply was never sent`
/// 3. Further operations fail with `Closed`
#[test]
fn test_close_settles_outstanding_work() {
    let host = test_host();
    let controller = local_bridge(&host, ProcessRole::Controller);
    let content = local_bridge(&host, ProcessRole::Content);

    controller
        .handle_async("hang", |_, _| futures::future::pending())
        .expect("Failed to register handler");
    content
        .handle("later", |_, _| Ok(Value::Null))
        .expect("Failed to register handler");

    let mut hanging = content.invoke(controller.process(), "hang", &[]).expect("Failed to invoke");
    let mut outgoing = controller
        .invoke(content.process(), "never-pumped", &[])
        .expect("Failed to invoke");
    controller.pump().expect("Failed to pump");
    assert_eq!(controller.handlers_in_flight(), 1);

    controller.close();
    assert!(controller.is_closed());
    assert!(matches!(
        outgoing.try_result(),
        Some(Err(BridgeError::Closed))
    ));
    assert!(matches!(
        controller.send(content.process(), "later", &[]),
        Err(BridgeError::Closed)
    ));

    content.pump().expect("Failed to pump");
    let error = hanging
        .try_result()
        .expect("Unsettled")
        .expect_err("Call should fail");
    assert_eq!(
        error.remote_error().map(|e| e.message.as_str()),
        Some("reply was never sent")
    );
}
