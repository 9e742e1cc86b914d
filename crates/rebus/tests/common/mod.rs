//! Shared test infrastructure: a service served over an in-process bus,
//! with helpers for sending requests and asserting recorded bus messages.

#![allow(dead_code)]

use rebus::{BusMessage, MemBus, ServeError, Service};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Connection ID used by default test requests.
pub const CID: &str = "testcid";

/// A service running against a [`MemBus`], with the startup reset broadcast
/// already consumed.
pub struct TestService {
    pub service: Arc<Service>,
    pub bus: MemBus,
    handle: JoinHandle<Result<(), ServeError>>,
}

/// Start serving and swallow the initial `system.reset` broadcast.
pub async fn serve(service: Service) -> TestService {
    let (ts, reset) = serve_with_reset(service).await;
    assert_eq!(reset.subject, "system.reset");
    ts
}

/// Start serving and return the initial `system.reset` broadcast for
/// inspection.
pub async fn serve_with_reset(service: Service) -> (TestService, BusMessage) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let service = Arc::new(service);
    let bus = MemBus::new();
    let handle = {
        let service = Arc::clone(&service);
        let bus = bus.clone();
        tokio::spawn(async move { service.serve(Arc::new(bus)).await })
    };
    let reset = bus
        .next_message()
        .await
        .expect("expected a message on startup");
    (
        TestService {
            service,
            bus,
            handle,
        },
        reset,
    )
}

impl TestService {
    /// Send a request with a JSON payload, returning the reply inbox.
    pub fn request(&self, subject: &str, payload: Value) -> String {
        self.bus
            .request(subject, serde_json::to_vec(&payload).expect("payload"))
    }

    /// Send a request with an empty payload, returning the reply inbox.
    pub fn request_raw(&self, subject: &str) -> String {
        self.bus.request(subject, Vec::new())
    }

    /// The next message the service published.
    pub async fn next_message(&self) -> BusMessage {
        self.bus
            .next_message()
            .await
            .expect("expected a published message")
    }

    /// Stop the service and assert serving ended cleanly.
    pub async fn stop(self) {
        self.service.stop().await;
        self.handle
            .await
            .expect("serve task panicked")
            .expect("serve returned an error");
    }
}

/// A request envelope with the default connection fields set.
pub fn default_request() -> Value {
    serde_json::json!({
        "cid": CID,
        "host": "local",
        "remoteAddr": "127.0.0.1",
        "uri": "/api/test/model",
    })
}

/// Decode a message payload as JSON.
pub fn payload_json(msg: &BusMessage) -> Value {
    serde_json::from_slice(&msg.payload)
        .unwrap_or_else(|e| panic!("non-JSON payload on {}: {}", msg.subject, e))
}

/// Assert the message is an error envelope with the given code.
pub fn assert_error_code(msg: &BusMessage, code: &str) {
    let payload = payload_json(msg);
    assert_eq!(
        payload["error"]["code"],
        Value::String(code.to_string()),
        "unexpected error envelope: {}",
        payload
    );
}
