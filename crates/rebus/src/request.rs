//! Request contexts and the resource view.
//!
//! Every inbound request is wrapped in a typed context: [`CallRequest`],
//! [`AuthRequest`], [`AccessRequest`] or [`GetRequest`]. A context holds the
//! decoded request envelope and the reply subject, enforces the
//! exactly-one-terminal-response contract, and dereferences to [`Resource`],
//! the view used for event emission both inside handlers and from
//! [`Service::with`](crate::Service::with).
//!
//! Misusing a context is a programming error and panics: a second terminal
//! response, an illegal event for the resource type, a reserved or invalid
//! custom event name, or an invalid resource ID in
//! [`CallRequest::resource`]. The worker engine catches these panics, logs
//! them, and answers `system.internalError` when no terminal response was
//! issued yet.

use crate::error::Error;
use crate::event::{
    is_reserved_event, AddPayload, ChangePayload, RemovePayload,
};
use crate::handler::{HandlerSet, ResourceType};
use crate::service::{Outbox, Outgoing};
use crate::subject;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Decoded inbound request payload.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct RequestEnvelope {
    pub cid: Option<String>,
    pub params: Option<Value>,
    pub token: Option<Value>,
    pub header: Option<HashMap<String, Vec<String>>>,
    pub host: Option<String>,
    pub remote_addr: Option<String>,
    pub uri: Option<String>,
    pub query: Option<String>,
    pub is_http: bool,
}

/// A handle to one resource: identity, path parameters and event emission.
///
/// Obtained from a request context (all contexts deref to `Resource`) or
/// through [`Service::with`](crate::Service::with).
#[derive(Clone)]
pub struct Resource {
    pub(crate) service: Arc<str>,
    pub(crate) name: String,
    pub(crate) query: Option<String>,
    pub(crate) params: HashMap<String, String>,
    pub(crate) handlers: Arc<HandlerSet>,
    pub(crate) outbox: Outbox,
}

impl Resource {
    /// The service name.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The resource name, without query.
    pub fn resource_name(&self) -> &str {
        &self.name
    }

    /// The full resource ID, including any query.
    pub fn rid(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.name, q),
            None => self.name.clone(),
        }
    }

    /// The query part of the resource ID, if any.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// A path parameter captured by a `$name` pattern token.
    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// The resource type of the matched handler set.
    pub fn resource_type(&self) -> ResourceType {
        self.handlers.resource_type()
    }

    /// Send a custom event on the resource.
    ///
    /// # Panics
    ///
    /// Panics if `event` is a reserved event name or not a valid name token.
    pub fn event(&self, event: &str, payload: Option<Value>) {
        if is_reserved_event(event) {
            panic!("custom event uses reserved event name '{}'", event);
        }
        if !subject::is_valid_event_name(event) {
            panic!("invalid event name '{}'", event);
        }
        let payload = payload.map(|v| encode(&v));
        self.send_event(event, payload);
    }

    /// Send a change event with the changed properties and their new values.
    /// An empty map is a no-op. When an `apply_change` callback is
    /// registered it runs first; an empty revert map suppresses the event.
    ///
    /// # Panics
    ///
    /// Panics if the resource is not a model, or if the apply callback fails.
    pub fn change_event(&self, values: Map<String, Value>) {
        if self.handlers.resource_type() != ResourceType::Model {
            panic!("change event on non-model resource {}", self.rid());
        }
        if values.is_empty() {
            return;
        }
        if let Some(apply) = &self.handlers.apply_change {
            let revert = match apply(self, &values) {
                Ok(revert) => revert,
                Err(err) => panic!("failed to apply change event: {}", err),
            };
            if revert.is_empty() {
                return;
            }
        }
        self.send_event("change", Some(encode(&ChangePayload { values })));
    }

    /// Send an add event for the value inserted at `idx`.
    ///
    /// # Panics
    ///
    /// Panics if the resource is not a collection, or if the apply callback
    /// fails.
    pub fn add_event(&self, value: impl Serialize, idx: usize) {
        if self.handlers.resource_type() != ResourceType::Collection {
            panic!("add event on non-collection resource {}", self.rid());
        }
        let value = to_value(value);
        if let Some(apply) = &self.handlers.apply_add {
            if let Err(err) = apply(self, &value, idx) {
                panic!("failed to apply add event: {}", err);
            }
        }
        self.send_event("add", Some(encode(&AddPayload { value, idx })));
    }

    /// Send a remove event for the value removed from `idx`.
    ///
    /// # Panics
    ///
    /// Panics if the resource is not a collection, or if the apply callback
    /// fails.
    pub fn remove_event(&self, idx: usize) {
        if self.handlers.resource_type() != ResourceType::Collection {
            panic!("remove event on non-collection resource {}", self.rid());
        }
        if let Some(apply) = &self.handlers.apply_remove {
            if let Err(err) = apply(self, idx) {
                panic!("failed to apply remove event: {}", err);
            }
        }
        self.send_event("remove", Some(encode(&RemovePayload { idx })));
    }

    /// Send a create event to signal the resource now exists. `data` is the
    /// created resource data, forwarded to the `apply_create` callback; the
    /// event itself carries no payload.
    pub fn create_event(&self, data: impl Serialize) {
        if let Some(apply) = &self.handlers.apply_create {
            let data = to_value(data);
            if let Err(err) = apply(self, &data) {
                panic!("failed to apply create event: {}", err);
            }
        }
        self.send_event("create", None);
    }

    /// Send a delete event to signal the resource no longer exists.
    pub fn delete_event(&self) {
        if let Some(apply) = &self.handlers.apply_delete {
            if let Err(err) = apply(self) {
                panic!("failed to apply delete event: {}", err);
            }
        }
        self.send_event("delete", None);
    }

    /// Send a reaccess event, telling the gateway to renew access checks for
    /// all subscribers of the resource.
    pub fn reaccess_event(&self) {
        self.send_event("reaccess", None);
    }

    fn send_event(&self, event: &str, payload: Option<Vec<u8>>) {
        self.send_raw(
            subject::event_subject(&self.name, event),
            payload.unwrap_or_default(),
        );
    }

    pub(crate) fn send_raw(&self, subject: String, payload: Vec<u8>) {
        if self.outbox.send(Outgoing { subject, payload }).is_err() {
            tracing::debug!("dropping outbound message, service is shutting down");
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    match serde_json::to_vec(value) {
        Ok(bytes) => bytes,
        Err(err) => panic!("failed to encode payload: {}", err),
    }
}

fn to_value(value: impl Serialize) -> Value {
    match serde_json::to_value(value) {
        Ok(v) => v,
        Err(err) => panic!("failed to encode value: {}", err),
    }
}

#[derive(Serialize)]
struct ResultEnvelope<'a, T: Serialize> {
    result: &'a T,
}

#[derive(Serialize)]
struct ResourceEnvelope<'a> {
    resource: RidField<'a>,
}

#[derive(Serialize)]
struct RidField<'a> {
    rid: &'a str,
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    error: &'a Error,
}

/// Encode an `{"error": ...}` response envelope.
pub(crate) fn encode_error(error: &Error) -> Vec<u8> {
    encode(&ErrorEnvelope { error })
}

#[derive(Serialize)]
pub(crate) struct TokenPayload<'a> {
    pub token: &'a Option<Value>,
}

#[derive(Serialize)]
struct AccessResult<'a> {
    get: bool,
    #[serde(skip_serializing_if = "str::is_empty")]
    call: &'a str,
}

#[derive(Serialize)]
struct ModelResult<'a, T: Serialize> {
    model: &'a T,
}

#[derive(Serialize)]
struct CollectionResult<'a, T: Serialize> {
    collection: &'a T,
}

/// State shared by all request context types.
pub(crate) struct RequestCore {
    pub(crate) resource: Resource,
    pub(crate) reply: String,
    pub(crate) env: RequestEnvelope,
    pub(crate) method: Option<String>,
    pub(crate) responded: Arc<AtomicBool>,
}

impl RequestCore {
    fn send_reply(&self, payload: Vec<u8>) {
        if self.responded.swap(true, Ordering::SeqCst) {
            panic!("multiple responses to request on {}", self.resource.rid());
        }
        self.resource.send_raw(self.reply.clone(), payload);
    }

    fn reply_result<T: Serialize>(&self, result: &T) {
        self.send_reply(encode(&ResultEnvelope { result }));
    }

    pub(crate) fn reply_error(&self, error: Error) {
        self.send_reply(encode_error(&error));
    }

    fn reply_resource(&self, rid: &str) {
        if !subject::is_valid_rid(rid, true) {
            panic!("invalid resource ID: {}", rid);
        }
        self.send_reply(encode(&ResourceEnvelope {
            resource: RidField { rid },
        }));
    }

    fn pre_timeout(&self, duration: Duration) {
        if self.responded.load(Ordering::SeqCst) {
            panic!(
                "timeout pre-response after terminal response on {}",
                self.resource.rid()
            );
        }
        // Protocol quirk: the pre-response is raw bytes, not JSON.
        let payload = format!("timeout:\"{}\"", duration.as_millis());
        self.resource
            .send_raw(self.reply.clone(), payload.into_bytes());
    }

    fn parse_params<T: DeserializeOwned + Default>(&self) -> Result<T, Error> {
        match &self.env.params {
            None => Ok(T::default()),
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| Error::invalid_params(&e.to_string())),
        }
    }

    fn parse_token<T: DeserializeOwned + Default>(&self) -> Result<T, Error> {
        match &self.env.token {
            None => Ok(T::default()),
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| Error::internal_error(&e.to_string())),
        }
    }
}

macro_rules! common_accessors {
    () => {
        /// The connection ID of the client, or an empty string when absent.
        pub fn cid(&self) -> &str {
            self.core.env.cid.as_deref().unwrap_or_default()
        }

        /// The raw, unparsed token, or `None` when the connection has no
        /// token.
        pub fn raw_token(&self) -> Option<&Value> {
            self.core.env.token.as_ref()
        }

        /// Deserialize the token into `T`, falling back to `T::default()`
        /// when no token is set.
        pub fn parse_token<T: DeserializeOwned + Default>(&self) -> Result<T, Error> {
            self.core.parse_token()
        }

        /// HTTP headers of the client request, when forwarded by the
        /// gateway.
        pub fn header(&self) -> Option<&HashMap<String, Vec<String>>> {
            self.core.env.header.as_ref()
        }

        /// Host header of the client request, or an empty string.
        pub fn host(&self) -> &str {
            self.core.env.host.as_deref().unwrap_or_default()
        }

        /// Network address of the client, or an empty string.
        pub fn remote_addr(&self) -> &str {
            self.core.env.remote_addr.as_deref().unwrap_or_default()
        }

        /// Unmodified request URI of the client request, or an empty string.
        pub fn uri(&self) -> &str {
            self.core.env.uri.as_deref().unwrap_or_default()
        }

        /// Whether the request originated over HTTP.
        pub fn is_http(&self) -> bool {
            self.core.env.is_http
        }

        /// Send the error as the terminal response.
        pub fn error(&self, error: Error) {
            self.core.reply_error(error);
        }

        /// Respond `system.notFound`.
        pub fn not_found(&self) {
            self.core.reply_error(Error::not_found());
        }

        /// Respond `system.invalidQuery`. An empty message uses the default.
        pub fn invalid_query(&self, message: &str) {
            self.core.reply_error(Error::invalid_query(message));
        }

        /// Send a `timeout:"<ms>"` pre-response, extending the gateway's
        /// deadline for this request. May be called repeatedly before the
        /// terminal response.
        pub fn timeout(&self, duration: Duration) {
            self.core.pre_timeout(duration);
        }
    };
}

macro_rules! method_accessors {
    () => {
        /// The method name of the request.
        pub fn method(&self) -> &str {
            self.core.method.as_deref().unwrap_or_default()
        }

        /// The raw, unparsed parameters, or `None` when absent.
        pub fn raw_params(&self) -> Option<&Value> {
            self.core.env.params.as_ref()
        }

        /// Deserialize the parameters into `T`, falling back to
        /// `T::default()` when no parameters were sent.
        pub fn parse_params<T: DeserializeOwned + Default>(&self) -> Result<T, Error> {
            self.core.parse_params()
        }

        /// Respond with a successful result. Use `()` for a null result.
        pub fn ok(&self, result: impl Serialize) {
            self.core.reply_result(&result);
        }

        /// Respond with a reference to another resource.
        ///
        /// # Panics
        ///
        /// Panics if `rid` is not a valid resource ID.
        pub fn resource(&self, rid: &str) {
            self.core.reply_resource(rid);
        }

        /// Respond `system.methodNotFound`.
        pub fn method_not_found(&self) {
            self.core.reply_error(Error::method_not_found());
        }

        /// Respond `system.invalidParams`. An empty message uses the
        /// default.
        pub fn invalid_params(&self, message: &str) {
            self.core.reply_error(Error::invalid_params(message));
        }
    };
}

/// Context of a `call.<rid>.<method>` request.
pub struct CallRequest {
    pub(crate) core: RequestCore,
}

impl CallRequest {
    common_accessors!();
    method_accessors!();
}

impl Deref for CallRequest {
    type Target = Resource;

    fn deref(&self) -> &Resource {
        &self.core.resource
    }
}

/// Context of an `auth.<rid>.<method>` request.
pub struct AuthRequest {
    pub(crate) core: RequestCore,
}

impl AuthRequest {
    common_accessors!();
    method_accessors!();

    /// Set or clear the connection token, publishing a token event on
    /// `conn.<cid>.token`.
    pub fn token_event(&self, token: Option<Value>) {
        let cid = self.cid();
        if cid.is_empty() {
            panic!("auth request without connection ID");
        }
        let subject = format!("conn.{}.token", cid);
        self.core
            .resource
            .send_raw(subject, encode(&TokenPayload { token: &token }));
    }
}

impl Deref for AuthRequest {
    type Target = Resource;

    fn deref(&self) -> &Resource {
        &self.core.resource
    }
}

/// Context of an `access.<rid>` request.
pub struct AccessRequest {
    pub(crate) core: RequestCore,
}

impl AccessRequest {
    common_accessors!();

    /// Respond with the client's access permissions: `get` grants
    /// subscription access, `call` lists callable methods (`"*"` for all,
    /// empty for none). Denying both responds `system.accessDenied`.
    pub fn access(&self, get: bool, call: &str) {
        if !get && call.is_empty() {
            self.core.reply_error(Error::access_denied());
        } else {
            self.core.reply_result(&AccessResult { get, call });
        }
    }

    /// Grant full access.
    pub fn access_granted(&self) {
        self.access(true, "*");
    }

    /// Deny all access.
    pub fn access_denied(&self) {
        self.access(false, "");
    }
}

impl Deref for AccessRequest {
    type Target = Resource;

    fn deref(&self) -> &Resource {
        &self.core.resource
    }
}

/// Context of a `get.<rid>` request.
pub struct GetRequest {
    pub(crate) core: RequestCore,
}

impl GetRequest {
    /// Respond with the model data.
    ///
    /// # Panics
    ///
    /// Panics if the handler set serves a collection.
    pub fn model(&self, model: impl Serialize) {
        if self.core.resource.handlers.resource_type() == ResourceType::Collection {
            panic!("model response on collection resource {}", self.rid());
        }
        self.core.reply_result(&ModelResult { model: &model });
    }

    /// Respond with the collection data.
    ///
    /// # Panics
    ///
    /// Panics if the handler set serves a model.
    pub fn collection(&self, collection: impl Serialize) {
        if self.core.resource.handlers.resource_type() == ResourceType::Model {
            panic!("collection response on model resource {}", self.rid());
        }
        self.core.reply_result(&CollectionResult {
            collection: &collection,
        });
    }

    /// Send the error as the terminal response.
    pub fn error(&self, error: Error) {
        self.core.reply_error(error);
    }

    /// Respond `system.notFound`.
    pub fn not_found(&self) {
        self.core.reply_error(Error::not_found());
    }

    /// Respond `system.invalidQuery`. An empty message uses the default.
    pub fn invalid_query(&self, message: &str) {
        self.core.reply_error(Error::invalid_query(message));
    }

    /// Send a `timeout:"<ms>"` pre-response.
    pub fn timeout(&self, duration: Duration) {
        self.core.pre_timeout(duration);
    }
}

impl Deref for GetRequest {
    type Target = Resource;

    fn deref(&self) -> &Resource {
        &self.core.resource
    }
}
