//! # rebus
//!
//! A framework for writing [RES protocol](https://resgate.io) services over a
//! subject-addressed message bus.
//!
//! A service exposes named resources (models, collections, or untyped) to a
//! gateway that forwards client RPC and subscription traffic. Handlers are
//! registered against resource patterns with wildcards; the engine matches
//! inbound request subjects to the most specific pattern, serializes all work
//! per resource while running different resources in parallel, enforces the
//! protocol's exactly-one-response semantics, and broadcasts typed
//! state-change events.
//!
//! ## Example
//!
//! ```no_run
//! use rebus::{Handler, Service};
//! use serde_json::json;
//! use std::sync::{Arc, Mutex};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let message = Arc::new(Mutex::new("Hello, world".to_string()));
//!
//! let mut service = Service::new("example")?;
//! let m = Arc::clone(&message);
//! service.handle(
//!     "greeting",
//!     Handler::new()
//!         .access_granted()
//!         .model_get(move |r| {
//!             let message = m.lock().unwrap().clone();
//!             r.model(&json!({"message": message}))
//!         }),
//! )?;
//! service.listen_and_serve("nats://127.0.0.1:4222").await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency model
//!
//! Requests and events for the same resource are executed in arrival order
//! on a single worker; different resources run concurrently. A handler's
//! `group` option colocates related resources onto a shared worker. All
//! outbound messages flow through one writer, so a handler's pre-responses,
//! events and terminal response reach the bus in emission order.

pub mod bus;
mod error;
mod event;
mod handler;
mod membus;
mod nats;
mod pattern;
mod request;
mod service;
mod subject;
mod worker;

pub use bus::{Bus, BusError, BusMessage, BusResult};
pub use error::{
    Error, RegistrationError, ServeError, ServiceError, CODE_ACCESS_DENIED, CODE_INTERNAL_ERROR,
    CODE_INVALID_PARAMS, CODE_INVALID_QUERY, CODE_METHOD_NOT_FOUND, CODE_NOT_FOUND, CODE_TIMEOUT,
};
pub use event::{delete_action, is_reserved_event, DeleteAction, Ref, RESERVED_EVENTS};
pub use handler::{Handler, HandlerSet, ResourceType};
pub use membus::MemBus;
pub use nats::NatsBus;
pub use request::{AccessRequest, AuthRequest, CallRequest, GetRequest, Resource};
pub use service::{Service, DEFAULT_WORKER_IDLE_TIMEOUT};
pub use subject::{
    event_subject, is_valid_cid, is_valid_event_name, is_valid_rid, parse_inbound, split_query,
    Inbound, RequestKind,
};
