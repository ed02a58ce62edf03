//! Boundary Tests
//!
//! These tests verify what may cross from a content process to the
//! controller: the curated API surface, the controller-side policy derived
//! from the same manifest, error redaction, and capability discovery.

use boundary_policy::{AllowListPolicy, ChannelRule};
use core_types::ProcessRole;
use ipc::{ErrorValue, MessageKind, Value};
use message_bridge::{
    BridgeError, CapabilityRegistry, ExposedApi, ExposedApiError, ExposedApiManifest,
    ExposedEntry, ExposedKind, MessageBridge,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use tests_bridge::{local_bridge, settle, test_host};

fn manifest() -> ExposedApiManifest {
    ExposedApiManifest::new()
        .with_entry(
            ExposedEntry::new("sum", &[ExposedKind::Invoke, ExposedKind::SendSync]).with_max_args(2),
        )
        .with_entry(ExposedEntry::new("log", &[ExposedKind::Send]))
        .with_entry(ExposedEntry::new("theme-changed", &[ExposedKind::Listen]))
}

fn guarded_pair() -> (Arc<sim_host::ProcessHost>, MessageBridge, MessageBridge) {
    let host = test_host();
    let controller = local_bridge(&host, ProcessRole::Controller)
        .with_policy(Arc::new(manifest().to_policy()));
    let content = local_bridge(&host, ProcessRole::Content);
    controller
        .handle("sum", |_, args| {
            Ok(Value::from(args.iter().filter_map(Value::as_i64).sum::<i64>()))
        })
        .expect("Failed to register handler");
    controller
        .handle("secret", |_, _| Ok(Value::from("classified")))
        .expect("Failed to register handler");
    (host, controller, content)
}

/// Test: The curated API only reaches exposed channels
///
/// This validates that:
/// 1. Exposed calls go through and resolve
/// 2. Unexposed channels and kinds fail locally with `NotExposed`
/// 3. Argument limits are checked before anything is sent
#[test]
fn test_exposed_api_limits_surface() {
    let (host, controller, content) = guarded_pair();
    let api = ExposedApi::new(content.clone(), controller.process(), manifest());

    let mut sum = api
        .invoke("sum", &[Value::from(2), Value::from(40)])
        .expect("Failed to invoke");
    settle(&[&controller, &content]);
    assert_eq!(sum.try_result().expect("Unsettled").expect("Failed"), Value::from(42));

    assert!(matches!(
        api.invoke("secret", &[]),
        Err(ExposedApiError::NotExposed { kind: ExposedKind::Invoke, .. })
    ));
    assert!(matches!(
        api.send("sum", &[]),
        Err(ExposedApiError::NotExposed { kind: ExposedKind::Send, .. })
    ));
    assert!(matches!(
        api.invoke("sum", &[Value::from(1), Value::from(2), Value::from(3)]),
        Err(ExposedApiError::TooManyArguments { max: 2, got: 3, .. })
    ));
    assert_eq!(host.queued(controller.process()), 0);
    assert_eq!(api.channels(), vec!["sum", "log", "theme-changed"]);
}

/// Test: The controller refuses what the manifest does not allow
///
/// This validates that:
/// 1. A raw invoke on an unlisted channel is answered with `AccessDenied`
/// 2. The handler never runs
/// 3. The denial reaches content without a stack
#[test]
fn test_controller_policy_denies_raw_calls() {
    let (_host, controller, content) = guarded_pair();

    let mut call = content
        .invoke(controller.process(), "secret", &[])
        .expect("Failed to invoke");
    settle(&[&controller, &content]);

    let error = call
        .try_result()
        .expect("Unsettled")
        .expect_err("Call should be denied");
    let remote = error.remote_error().expect("Remote error missing");
    assert_eq!(remote.name, "AccessDenied");
    assert!(remote.message.starts_with("Access to 'secret' denied"));
    assert_eq!(remote.stack, None);

    // Right channel, wrong kind.
    let seen = Rc::new(RefCell::new(0));
    let counter = Rc::clone(&seen);
    controller
        .on("sum", move |_, _| {
            *counter.borrow_mut() += 1;
            Ok(())
        })
        .expect("Failed to register listener");
    content
        .send(controller.process(), "sum", &[])
        .expect("Failed to send");
    settle(&[&controller, &content]);
    assert_eq!(*seen.borrow(), 0);
}

/// Test: Errors travelling to less privileged processes are redacted
///
/// This validates that:
/// 1. Name and message of a handler error reach content
/// 2. The stack does not
/// 3. A controller configured for full errors keeps the stack
#[test]
fn test_handler_errors_are_redacted_downward() {
    for full in [false, true] {
        let host = test_host();
        let mut policy = AllowListPolicy::new()
            .with_rule(ChannelRule::new("parse").with_kind(MessageKind::Invoke));
        if full {
            policy = policy.with_full_errors();
        }
        let controller =
            local_bridge(&host, ProcessRole::Controller).with_policy(Arc::new(policy));
        let content = local_bridge(&host, ProcessRole::Content);
        controller
            .handle("parse", |_, _| {
                Err(ErrorValue::new("SyntaxError", "unexpected token")
                    .with_stack("SyntaxError: unexpected token\n    at parser.rs:12"))
            })
            .expect("Failed to register handler");

        let mut call = content
            .invoke(controller.process(), "parse", &[])
            .expect("Failed to invoke");
        settle(&[&controller, &content]);

        let error = call.try_result().expect("Unsettled").expect_err("Call should fail");
        let remote = error.remote_error().expect("Remote error missing");
        assert_eq!(remote.name, "SyntaxError");
        assert_eq!(remote.message, "unexpected token");
        assert_eq!(remote.stack.is_some(), full);
    }
}

/// Test: A sender-side policy refuses before sending
///
/// This validates that:
/// 1. An outbound check fails with `Denied`
/// 2. Nothing reaches the receiver's inbox
#[test]
fn test_outbound_policy_refuses_locally() {
    let host = test_host();
    let controller = local_bridge(&host, ProcessRole::Controller);
    let content = local_bridge(&host, ProcessRole::Content)
        .with_policy(Arc::new(manifest().to_policy()));

    match content.send(controller.process(), "secret", &[]) {
        Err(BridgeError::Denied { channel, policy, .. }) => {
            assert_eq!(channel, "secret");
            assert_eq!(policy, "AllowListPolicy");
        }
        other => panic!("expected Denied, got {:?}", other),
    }
    assert_eq!(host.queued(controller.process()), 0);
    assert!(content.send(controller.process(), "log", &[]).is_ok());
}

/// Test: Exposed listeners only hear the controller
///
/// This validates that:
/// 1. A listener registered through the API receives controller events
/// 2. The same channel sent by another process is not delivered to it
#[test]
fn test_exposed_listener_is_scoped_to_controller() {
    let (host, controller, content) = guarded_pair();
    let worker = local_bridge(&host, ProcessRole::Worker);
    let api = ExposedApi::new(content.clone(), controller.process(), manifest());

    let themes = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&themes);
    api.on("theme-changed", move |event, args| {
        sink.borrow_mut()
            .push((event.sender_role(), args[0].as_str().unwrap_or("").to_string()));
        Ok(())
    })
    .expect("Failed to listen");
    assert!(matches!(
        api.on("sum", |_, _| Ok(())),
        Err(ExposedApiError::NotExposed { kind: ExposedKind::Listen, .. })
    ));

    controller
        .send(content.process(), "theme-changed", &[Value::from("dark")])
        .expect("Failed to send");
    worker
        .send(content.process(), "theme-changed", &[Value::from("spoofed")])
        .expect("Failed to send");
    settle(&[&controller, &content, &worker]);

    assert_eq!(
        *themes.borrow(),
        vec![(ProcessRole::Controller, "dark".to_string())]
    );
}

/// Test: Capability discovery
///
/// This validates that:
/// 1. A process reports the capabilities it registered, sorted
/// 2. The query uses a framework channel the policy lets through
/// 3. A process without capabilities answers with an error
#[test]
fn test_capability_query() {
    let (_host, controller, content) = guarded_pair();
    let capabilities = CapabilityRegistry::builder()
        .register("storage", || 1u32)
        .and_then(|builder| builder.register("clipboard", || String::from("clip")))
        .expect("Failed to register capabilities")
        .build();
    let controller = controller
        .with_capabilities(capabilities)
        .expect("Failed to install capabilities");

    let mut query = content
        .query_capabilities(controller.process())
        .expect("Failed to query");
    let mut none = controller
        .query_capabilities(content.process())
        .expect("Failed to query");
    settle(&[&controller, &content]);

    let names: Vec<String> = query
        .try_result()
        .expect("Unsettled")
        .expect("Query failed")
        .as_list()
        .expect("Expected a list")
        .to_vec()
        .iter()
        .filter_map(|value| value.as_str().map(str::to_string))
        .collect();
    assert_eq!(names, vec!["clipboard", "storage"]);
    assert!(none.try_result().expect("Unsettled").is_err());
}
