//! Ordering Tests
//!
//! These tests verify that messages between two processes are handled in
//! the order they were sent, whatever their kind, and that a blocking call
//! does not let unrelated traffic run early.

use core_types::ProcessRole;
use ipc::{ErrorValue, Value};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use tests_bridge::{local_bridge, spawn_process, test_host};

/// Test: Mixed message kinds keep their send order
///
/// This validates that:
/// 1. An event, a sync call, an invoke and another event from one sender
///    reach the receiver in that order
/// 2. The reply to the pending invoke survives the later sync call
#[test]
fn test_mixed_kinds_are_handled_in_send_order() {
    let host = test_host();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);

    let controller = spawn_process(&host, ProcessRole::Controller, move |bridge| {
        for channel in ["a", "d"] {
            let record = Arc::clone(&record);
            bridge
                .on(channel, move |event, _| {
                    record.lock().push(event.channel().to_string());
                    Ok(())
                })
                .expect("Failed to register listener");
        }
        for channel in ["b", "c"] {
            let record = Arc::clone(&record);
            bridge
                .handle(channel, move |event, _| {
                    record.lock().push(event.channel().to_string());
                    Ok(Value::from(event.channel()))
                })
                .expect("Failed to register handler");
        }
        let record = Arc::clone(&record);
        bridge
            .handle("order", move |_, _| {
                Ok(Value::list(record.lock().iter().map(|c| Value::from(c.as_str()))))
            })
            .expect("Failed to register handler");
    });

    let content = local_bridge(&host, ProcessRole::Content);
    let peer = controller.process;

    content.send(peer, "a", &[]).expect("Failed to send a");
    let b = content.send_sync(peer, "b", &[]).expect("Sync call failed");
    assert_eq!(b, Value::from("b"));
    let c = content.invoke(peer, "c", &[]).expect("Failed to invoke c");
    content.send(peer, "d", &[]).expect("Failed to send d");

    let order = content
        .send_sync(peer, "order", &[])
        .expect("Failed to query order");
    let order: Vec<String> = order
        .as_list()
        .expect("order should be a list")
        .to_vec()
        .iter()
        .filter_map(|value| value.as_str().map(str::to_string))
        .collect();
    assert_eq!(order, vec!["a", "b", "c", "d"]);
    assert_eq!(*seen.lock(), vec!["a", "b", "c", "d"]);

    assert_eq!(content.wait_for(c).expect("Invoke failed"), Value::from("c"));
    controller.stop();
}

/// Test: Traffic arriving during a sync call waits for the next pump
///
/// This validates that:
/// 1. An event the callee sends before replying is not delivered while the
///    caller is blocked
/// 2. The event is delivered, in order, on the caller's next pump
#[test]
fn test_events_during_sync_call_are_deferred() {
    let host = test_host();
    let controller = spawn_process(&host, ProcessRole::Controller, |bridge| {
        bridge
            .handle("ask", |event, _| {
                event
                    .reply("note", &[Value::from(1)])
                    .map_err(|e| ErrorValue::from_error(&e))?;
                event
                    .reply("note", &[Value::from(2)])
                    .map_err(|e| ErrorValue::from_error(&e))?;
                Ok(Value::from("done"))
            })
            .expect("Failed to register handler");
    });

    let content = local_bridge(&host, ProcessRole::Content);
    let notes = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&notes);
    content
        .on("note", move |_, args| {
            sink.borrow_mut().push(args[0].as_i64().unwrap_or(-1));
            Ok(())
        })
        .expect("Failed to register listener");

    let answer = content
        .send_sync(controller.process, "ask", &[])
        .expect("Sync call failed");
    assert_eq!(answer, Value::from("done"));
    assert!(notes.borrow().is_empty(), "listener ran inside the sync call");

    assert_eq!(content.pump().expect("Failed to pump"), 2);
    assert_eq!(*notes.borrow(), vec![1, 2]);
    controller.stop();
}

/// Test: Events from one sender are delivered in order under load
///
/// This validates that:
/// 1. A long burst of events arrives in send order
/// 2. Nothing is dropped
#[test]
fn test_event_burst_keeps_order() {
    let host = test_host();
    let controller = local_bridge(&host, ProcessRole::Controller);
    let content = local_bridge(&host, ProcessRole::Content);

    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    controller
        .on("tick", move |_, args| {
            sink.borrow_mut().push(args[0].as_i64().unwrap_or(-1));
            Ok(())
        })
        .expect("Failed to register listener");

    for i in 0..500i64 {
        content
            .send(controller.process(), "tick", &[Value::from(i)])
            .expect("Failed to send");
    }
    controller.pump().expect("Failed to pump");

    let expected: Vec<i64> = (0..500).collect();
    assert_eq!(*seen.borrow(), expected);
}
