//! Event emission tests: typed events, custom events, reserved-name guards
//! and apply callbacks, both from handlers and through `Service::with`.

mod common;

use common::{assert_error_code, payload_json, serve};
use rebus::{delete_action, Handler, Ref, Service};
use serde_json::{json, Map, Value};

fn service() -> Service {
    Service::new("test").unwrap()
}

fn values(entries: &[(&str, Value)]) -> Map<String, Value> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn test_custom_event_before_response() {
    let mut s = service();
    s.handle(
        "model",
        Handler::new().call("method", |r| {
            r.event("foo", Some(json!({"bar": 42})));
            r.ok(());
        }),
    )
    .unwrap();
    let ts = serve(s).await;

    let inbox = ts.request_raw("call.test.model.method");
    let msg = ts.next_message().await;
    assert_eq!(msg.subject, "event.test.model.foo");
    assert_eq!(payload_json(&msg), json!({"bar": 42}));
    let msg = ts.next_message().await;
    assert_eq!(msg.subject, inbox);
    ts.stop().await;
}

#[tokio::test]
async fn test_custom_event_without_payload() {
    let mut s = service();
    s.handle("model", Handler::new()).unwrap();
    let ts = serve(s).await;

    ts.service
        .with("test.model", |r| r.event("ping", None))
        .unwrap();
    let msg = ts.next_message().await;
    assert_eq!(msg.subject, "event.test.model.ping");
    assert!(msg.payload.is_empty());
    ts.stop().await;
}

#[tokio::test]
async fn test_custom_event_using_with() {
    let mut s = service();
    s.handle("model", Handler::new()).unwrap();
    let ts = serve(s).await;

    ts.service
        .with("test.model", |r| r.event("foo", Some(json!(["bar", 42]))))
        .unwrap();
    let msg = ts.next_message().await;
    assert_eq!(msg.subject, "event.test.model.foo");
    assert_eq!(payload_json(&msg), json!(["bar", 42]));
    ts.stop().await;
}

#[tokio::test]
async fn test_reserved_event_name_is_internal_error() {
    let mut s = service();
    s.handle(
        "model",
        Handler::new().call("method", |r| {
            r.event("unsubscribe", None);
            r.ok(());
        }),
    )
    .unwrap();
    let ts = serve(s).await;

    let inbox = ts.request_raw("call.test.model.method");
    let msg = ts.next_message().await;
    assert_eq!(msg.subject, inbox);
    assert_error_code(&msg, "system.internalError");

    // The service keeps serving.
    let inbox = ts.request_raw("call.test.model.method");
    let msg = ts.next_message().await;
    assert_eq!(msg.subject, inbox);
    ts.stop().await;
}

#[tokio::test]
async fn test_invalid_event_name_is_internal_error() {
    for name in ["foo.bar", "foo>", "*", "?foo", ""] {
        let mut s = service();
        let event = name.to_string();
        s.handle(
            "model",
            Handler::new().call("method", move |r| {
                r.event(&event, None);
                r.ok(());
            }),
        )
        .unwrap();
        let ts = serve(s).await;

        let inbox = ts.request_raw("call.test.model.method");
        let msg = ts.next_message().await;
        assert_eq!(msg.subject, inbox, "event name {:?}", name);
        assert_error_code(&msg, "system.internalError");
        ts.stop().await;
    }
}

#[tokio::test]
async fn test_change_event() {
    let mut s = service();
    s.handle(
        "model",
        Handler::new()
            .model_get(|r| r.not_found())
            .call("method", |r| {
                r.change_event(values(&[("foo", json!(42)), ("bar", json!(true))]));
                r.ok(());
            }),
    )
    .unwrap();
    let ts = serve(s).await;

    let inbox = ts.request_raw("call.test.model.method");
    let msg = ts.next_message().await;
    assert_eq!(msg.subject, "event.test.model.change");
    assert_eq!(
        payload_json(&msg),
        json!({"values": {"foo": 42, "bar": true}})
    );
    let msg = ts.next_message().await;
    assert_eq!(msg.subject, inbox);
    ts.stop().await;
}

#[tokio::test]
async fn test_change_event_with_ref_and_delete_action() {
    let mut s = service();
    s.handle(
        "model",
        Handler::new()
            .model_get(|r| r.not_found())
            .call("method", |r| {
                r.change_event(values(&[
                    ("child", serde_json::to_value(Ref::new("test.model.bar")).unwrap()),
                    ("removed", delete_action()),
                ]));
                r.ok(());
            }),
    )
    .unwrap();
    let ts = serve(s).await;

    ts.request_raw("call.test.model.method");
    let msg = ts.next_message().await;
    assert_eq!(msg.subject, "event.test.model.change");
    assert_eq!(
        payload_json(&msg),
        json!({"values": {
            "child": {"rid": "test.model.bar"},
            "removed": {"action": "delete"}
        }})
    );
    ts.stop().await;
}

#[tokio::test]
async fn test_empty_change_event_is_noop() {
    let mut s = service();
    s.handle(
        "model",
        Handler::new()
            .model_get(|r| r.not_found())
            .call("method", |r| {
                r.change_event(Map::new());
                r.ok(());
            }),
    )
    .unwrap();
    let ts = serve(s).await;

    let inbox = ts.request_raw("call.test.model.method");
    // Only the response, no change event.
    let msg = ts.next_message().await;
    assert_eq!(msg.subject, inbox);
    ts.stop().await;
}

#[tokio::test]
async fn test_change_event_on_collection_is_internal_error() {
    let mut s = service();
    s.handle(
        "collection",
        Handler::new()
            .collection_get(|r| r.not_found())
            .call("method", |r| {
                r.change_event(values(&[("x", json!(1))]));
                r.ok(());
            }),
    )
    .unwrap();
    let ts = serve(s).await;

    let inbox = ts.request_raw("call.test.collection.method");
    let msg = ts.next_message().await;
    assert_eq!(msg.subject, inbox);
    assert_error_code(&msg, "system.internalError");

    // The service keeps serving.
    let inbox = ts.request_raw("call.test.collection.method");
    let msg = ts.next_message().await;
    assert_eq!(msg.subject, inbox);
    ts.stop().await;
}

#[tokio::test]
async fn test_change_event_on_untyped_is_internal_error() {
    let mut s = service();
    s.handle(
        "bar",
        Handler::new().call("method", |r| {
            r.change_event(values(&[("x", json!(1))]));
            r.ok(());
        }),
    )
    .unwrap();
    let ts = serve(s).await;

    let inbox = ts.request_raw("call.test.bar.method");
    let msg = ts.next_message().await;
    assert_eq!(msg.subject, inbox);
    assert_error_code(&msg, "system.internalError");
    ts.stop().await;
}

#[tokio::test]
async fn test_change_event_using_with() {
    let mut s = service();
    s.handle("model", Handler::new().model_get(|r| r.not_found()))
        .unwrap();
    let ts = serve(s).await;

    ts.service
        .with("test.model", |r| {
            r.change_event(
                [("foo".to_string(), json!("bar"))].into_iter().collect(),
            )
        })
        .unwrap();
    let msg = ts.next_message().await;
    assert_eq!(msg.subject, "event.test.model.change");
    assert_eq!(payload_json(&msg), json!({"values": {"foo": "bar"}}));
    ts.stop().await;
}

#[tokio::test]
async fn test_add_and_remove_events() {
    let mut s = service();
    s.handle(
        "collection",
        Handler::new()
            .collection_get(|r| r.not_found())
            .call("push", |r| {
                r.add_event(Ref::new("test.model.bar"), 4);
                r.ok(());
            })
            .call("pop", |r| {
                r.remove_event(0);
                r.ok(());
            }),
    )
    .unwrap();
    let ts = serve(s).await;

    ts.request_raw("call.test.collection.push");
    let msg = ts.next_message().await;
    assert_eq!(msg.subject, "event.test.collection.add");
    assert_eq!(
        payload_json(&msg),
        json!({"value": {"rid": "test.model.bar"}, "idx": 4})
    );
    let _ = ts.next_message().await;

    ts.request_raw("call.test.collection.pop");
    let msg = ts.next_message().await;
    assert_eq!(msg.subject, "event.test.collection.remove");
    assert_eq!(payload_json(&msg), json!({"idx": 0}));
    ts.stop().await;
}

#[tokio::test]
async fn test_add_event_on_model_is_internal_error() {
    let mut s = service();
    s.handle(
        "model",
        Handler::new()
            .model_get(|r| r.not_found())
            .call("method", |r| {
                r.add_event(json!("foo"), 0);
                r.ok(());
            }),
    )
    .unwrap();
    let ts = serve(s).await;

    let inbox = ts.request_raw("call.test.model.method");
    let msg = ts.next_message().await;
    assert_eq!(msg.subject, inbox);
    assert_error_code(&msg, "system.internalError");
    ts.stop().await;
}

#[tokio::test]
async fn test_create_and_delete_events_have_no_payload() {
    let mut s = service();
    s.handle(
        "model",
        Handler::new()
            .call("create", |r| {
                r.create_event(json!({"message": "new"}));
                r.ok(());
            })
            .call("delete", |r| {
                r.delete_event();
                r.ok(());
            }),
    )
    .unwrap();
    let ts = serve(s).await;

    ts.request_raw("call.test.model.create");
    let msg = ts.next_message().await;
    assert_eq!(msg.subject, "event.test.model.create");
    assert!(msg.payload.is_empty());
    let _ = ts.next_message().await;

    ts.request_raw("call.test.model.delete");
    let msg = ts.next_message().await;
    assert_eq!(msg.subject, "event.test.model.delete");
    assert!(msg.payload.is_empty());
    ts.stop().await;
}

#[tokio::test]
async fn test_reaccess_event() {
    let mut s = service();
    s.handle(
        "model",
        Handler::new().call("method", |r| {
            r.reaccess_event();
            r.ok(());
        }),
    )
    .unwrap();
    let ts = serve(s).await;

    let inbox = ts.request_raw("call.test.model.method");
    let msg = ts.next_message().await;
    assert_eq!(msg.subject, "event.test.model.reaccess");
    assert!(msg.payload.is_empty());
    let msg = ts.next_message().await;
    assert_eq!(msg.subject, inbox);
    ts.stop().await;
}

#[tokio::test]
async fn test_apply_change_suppresses_unchanged_event() {
    let mut s = service();
    s.handle(
        "model",
        Handler::new()
            .model_get(|r| r.not_found())
            .apply_change(|_r, changes| {
                // Nothing actually changed.
                assert!(changes.contains_key("foo"));
                Ok(Map::new())
            })
            .call("method", |r| {
                r.change_event(values(&[("foo", json!(42))]));
                r.ok(());
            }),
    )
    .unwrap();
    let ts = serve(s).await;

    let inbox = ts.request_raw("call.test.model.method");
    let msg = ts.next_message().await;
    assert_eq!(msg.subject, inbox);
    ts.stop().await;
}

#[tokio::test]
async fn test_apply_callbacks_run_before_events() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let applied = Arc::new(AtomicUsize::new(0));
    let a = Arc::clone(&applied);
    let b = Arc::clone(&applied);

    let mut s = service();
    s.handle(
        "collection",
        Handler::new()
            .collection_get(|r| r.not_found())
            .apply_add(move |_r, value, idx| {
                assert_eq!(value, &json!("foo"));
                assert_eq!(idx, 1);
                a.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .apply_remove(move |_r, idx| {
                assert_eq!(idx, 1);
                b.fetch_add(1, Ordering::SeqCst);
                Ok(json!("foo"))
            })
            .call("method", |r| {
                r.add_event(json!("foo"), 1);
                r.remove_event(1);
                r.ok(());
            }),
    )
    .unwrap();
    let ts = serve(s).await;

    ts.request_raw("call.test.collection.method");
    let msg = ts.next_message().await;
    assert_eq!(msg.subject, "event.test.collection.add");
    let msg = ts.next_message().await;
    assert_eq!(msg.subject, "event.test.collection.remove");
    let _ = ts.next_message().await;
    assert_eq!(applied.load(std::sync::atomic::Ordering::SeqCst), 2);
    ts.stop().await;
}

#[tokio::test]
async fn test_failing_apply_callback_is_internal_error() {
    let mut s = service();
    s.handle(
        "collection",
        Handler::new()
            .collection_get(|r| r.not_found())
            .apply_remove(|_r, _idx| Err(rebus::Error::new("system.custom", "storage gone")))
            .call("method", |r| {
                r.remove_event(0);
                r.ok(());
            }),
    )
    .unwrap();
    let ts = serve(s).await;

    let inbox = ts.request_raw("call.test.collection.method");
    let msg = ts.next_message().await;
    assert_eq!(msg.subject, inbox);
    assert_error_code(&msg, "system.internalError");
    ts.stop().await;
}
