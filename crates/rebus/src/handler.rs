//! Handler declaration and the immutable handler set.
//!
//! Handlers are declared with the chainable [`Handler`] builder and bound to
//! a pattern through [`Service::handle`](crate::Service::handle). Builder
//! misuse (setting an option twice, duplicate method names, conflicting get
//! handlers) is recorded in the builder and surfaced as a
//! [`RegistrationError`] when the handler is mounted, so every registration
//! error is raised before the service starts serving.

use crate::error::{Error, RegistrationError};
use crate::pattern::{parse_pattern, Token};
use crate::request::{AccessRequest, AuthRequest, CallRequest, GetRequest, Resource};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) type AccessHandlerFn = Arc<dyn Fn(AccessRequest) + Send + Sync>;
pub(crate) type GetHandlerFn = Arc<dyn Fn(GetRequest) + Send + Sync>;
pub(crate) type CallHandlerFn = Arc<dyn Fn(CallRequest) + Send + Sync>;
pub(crate) type AuthHandlerFn = Arc<dyn Fn(AuthRequest) + Send + Sync>;

pub(crate) type ApplyChangeFn =
    Arc<dyn Fn(&Resource, &Map<String, Value>) -> Result<Map<String, Value>, Error> + Send + Sync>;
pub(crate) type ApplyAddFn =
    Arc<dyn Fn(&Resource, &Value, usize) -> Result<(), Error> + Send + Sync>;
pub(crate) type ApplyRemoveFn = Arc<dyn Fn(&Resource, usize) -> Result<Value, Error> + Send + Sync>;
pub(crate) type ApplyCreateFn = Arc<dyn Fn(&Resource, &Value) -> Result<(), Error> + Send + Sync>;
pub(crate) type ApplyDeleteFn = Arc<dyn Fn(&Resource) -> Result<Value, Error> + Send + Sync>;

/// The kind of resource a handler set serves. Fixed for the life of the
/// service; inferred from the get handler declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResourceType {
    #[default]
    Untyped,
    Model,
    Collection,
}

#[derive(Default)]
struct Parts {
    typ: Option<ResourceType>,
    access: Option<AccessHandlerFn>,
    get: Option<GetHandlerFn>,
    calls: HashMap<String, CallHandlerFn>,
    auths: HashMap<String, AuthHandlerFn>,
    group: Option<String>,
    apply_change: Option<ApplyChangeFn>,
    apply_add: Option<ApplyAddFn>,
    apply_remove: Option<ApplyRemoveFn>,
    apply_create: Option<ApplyCreateFn>,
    apply_delete: Option<ApplyDeleteFn>,
}

/// Chainable declaration of the callbacks bound to one pattern.
///
/// # Example
///
/// ```no_run
/// use rebus::{Handler, Service};
/// use serde_json::json;
///
/// # fn main() -> Result<(), rebus::RegistrationError> {
/// let mut service = Service::new("example")?;
/// service.handle(
///     "counter",
///     Handler::new()
///         .access_granted()
///         .model_get(|r| r.model(&json!({"count": 0})))
///         .call("inc", |r| r.ok(())),
/// )?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct Handler {
    parts: Parts,
    err: Option<RegistrationError>,
}

impl Handler {
    pub fn new() -> Self {
        Self::default()
    }

    fn fail(&mut self, err: RegistrationError) {
        if self.err.is_none() {
            self.err = Some(err);
        }
    }

    /// Set the access handler.
    pub fn access(mut self, f: impl Fn(AccessRequest) + Send + Sync + 'static) -> Self {
        if self.parts.access.is_some() {
            self.fail(RegistrationError::AlreadySet("access"));
        } else {
            self.parts.access = Some(Arc::new(f));
        }
        self
    }

    /// Register an access handler granting full access.
    pub fn access_granted(self) -> Self {
        self.access(|r| r.access_granted())
    }

    /// Register an access handler denying all access.
    pub fn access_denied(self) -> Self {
        self.access(|r| r.access_denied())
    }

    /// Set the get handler for a model resource. Fixes the resource type to
    /// [`ResourceType::Model`].
    pub fn model_get(mut self, f: impl Fn(GetRequest) + Send + Sync + 'static) -> Self {
        self = self.set_get(Arc::new(f));
        self.set_type(ResourceType::Model)
    }

    /// Set the get handler for a collection resource. Fixes the resource
    /// type to [`ResourceType::Collection`].
    pub fn collection_get(mut self, f: impl Fn(GetRequest) + Send + Sync + 'static) -> Self {
        self = self.set_get(Arc::new(f));
        self.set_type(ResourceType::Collection)
    }

    /// Set a get handler without fixing the resource type.
    pub fn get(self, f: impl Fn(GetRequest) + Send + Sync + 'static) -> Self {
        self.set_get(Arc::new(f))
    }

    fn set_get(mut self, f: GetHandlerFn) -> Self {
        if self.parts.get.is_some() {
            self.fail(RegistrationError::AlreadySet("get"));
        } else {
            self.parts.get = Some(f);
        }
        self
    }

    fn set_type(mut self, typ: ResourceType) -> Self {
        if self.parts.typ.is_some() {
            self.fail(RegistrationError::AlreadySet("resource type"));
        } else {
            self.parts.typ = Some(typ);
        }
        self
    }

    /// Register a call method handler. Method names are unique per pattern.
    pub fn call(
        mut self,
        method: &str,
        f: impl Fn(CallRequest) + Send + Sync + 'static,
    ) -> Self {
        if !crate::subject::is_valid_token(method) {
            self.fail(RegistrationError::InvalidMethodName(method.to_string()));
        } else if self.parts.calls.contains_key(method) {
            self.fail(RegistrationError::DuplicateMethod {
                kind: "call",
                method: method.to_string(),
            });
        } else {
            self.parts.calls.insert(method.to_string(), Arc::new(f));
        }
        self
    }

    /// Register the `set` call method.
    pub fn set(self, f: impl Fn(CallRequest) + Send + Sync + 'static) -> Self {
        self.call("set", f)
    }

    /// Register an auth method handler. Method names are unique per pattern.
    pub fn auth(
        mut self,
        method: &str,
        f: impl Fn(AuthRequest) + Send + Sync + 'static,
    ) -> Self {
        if !crate::subject::is_valid_token(method) {
            self.fail(RegistrationError::InvalidMethodName(method.to_string()));
        } else if self.parts.auths.contains_key(method) {
            self.fail(RegistrationError::DuplicateMethod {
                kind: "auth",
                method: method.to_string(),
            });
        } else {
            self.parts.auths.insert(method.to_string(), Arc::new(f));
        }
        self
    }

    /// Set the worker affinity group. The group may be a static key or a
    /// template interpolating pattern parameters, e.g. `"library.$bookId"`.
    pub fn group(mut self, group: &str) -> Self {
        if self.parts.group.is_some() {
            self.fail(RegistrationError::AlreadySet("group"));
        } else {
            self.parts.group = Some(group.to_string());
        }
        self
    }

    /// Set the callback applying a change event to the underlying data.
    /// Returns the map of old values; an empty map suppresses the event.
    pub fn apply_change(
        mut self,
        f: impl Fn(&Resource, &Map<String, Value>) -> Result<Map<String, Value>, Error>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        if self.parts.apply_change.is_some() {
            self.fail(RegistrationError::AlreadySet("apply_change"));
        } else {
            self.parts.apply_change = Some(Arc::new(f));
        }
        self
    }

    /// Set the callback applying an add event to the underlying data.
    pub fn apply_add(
        mut self,
        f: impl Fn(&Resource, &Value, usize) -> Result<(), Error> + Send + Sync + 'static,
    ) -> Self {
        if self.parts.apply_add.is_some() {
            self.fail(RegistrationError::AlreadySet("apply_add"));
        } else {
            self.parts.apply_add = Some(Arc::new(f));
        }
        self
    }

    /// Set the callback applying a remove event to the underlying data.
    /// Returns the removed value.
    pub fn apply_remove(
        mut self,
        f: impl Fn(&Resource, usize) -> Result<Value, Error> + Send + Sync + 'static,
    ) -> Self {
        if self.parts.apply_remove.is_some() {
            self.fail(RegistrationError::AlreadySet("apply_remove"));
        } else {
            self.parts.apply_remove = Some(Arc::new(f));
        }
        self
    }

    /// Set the callback applying a create event to the underlying data.
    pub fn apply_create(
        mut self,
        f: impl Fn(&Resource, &Value) -> Result<(), Error> + Send + Sync + 'static,
    ) -> Self {
        if self.parts.apply_create.is_some() {
            self.fail(RegistrationError::AlreadySet("apply_create"));
        } else {
            self.parts.apply_create = Some(Arc::new(f));
        }
        self
    }

    /// Set the callback applying a delete event to the underlying data.
    /// Returns the deleted resource data.
    pub fn apply_delete(
        mut self,
        f: impl Fn(&Resource) -> Result<Value, Error> + Send + Sync + 'static,
    ) -> Self {
        if self.parts.apply_delete.is_some() {
            self.fail(RegistrationError::AlreadySet("apply_delete"));
        } else {
            self.parts.apply_delete = Some(Arc::new(f));
        }
        self
    }
}

/// A worker group key template, split on `.` with `$name` segments
/// interpolated from path parameters.
#[derive(Debug)]
pub(crate) struct GroupTemplate {
    segments: Vec<GroupSegment>,
}

#[derive(Debug)]
enum GroupSegment {
    Literal(String),
    Param(String),
}

impl GroupTemplate {
    fn parse(group: &str) -> Result<Self, String> {
        if group.is_empty() {
            return Err("group is empty".to_string());
        }
        let mut segments = Vec::new();
        for seg in group.split('.') {
            if let Some(name) = seg.strip_prefix('$') {
                if !crate::subject::is_valid_token(name) {
                    return Err(format!("invalid parameter name '{}'", seg));
                }
                segments.push(GroupSegment::Param(name.to_string()));
            } else {
                if !crate::subject::is_valid_token(seg) {
                    return Err(format!("invalid token '{}'", seg));
                }
                segments.push(GroupSegment::Literal(seg.to_string()));
            }
        }
        Ok(Self { segments })
    }

    /// Render the group key for a set of path parameters.
    pub fn apply(&self, params: &HashMap<String, String>) -> String {
        let rendered: Vec<&str> = self
            .segments
            .iter()
            .map(|seg| match seg {
                GroupSegment::Literal(s) => s.as_str(),
                GroupSegment::Param(name) => {
                    params.get(name).map(String::as_str).unwrap_or_default()
                }
            })
            .collect();
        rendered.join(".")
    }

    fn params(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|seg| match seg {
            GroupSegment::Param(name) => Some(name.as_str()),
            GroupSegment::Literal(_) => None,
        })
    }
}

/// The immutable callbacks and routing metadata bound to one pattern.
pub struct HandlerSet {
    pattern: String,
    tokens: Vec<Token>,
    typ: ResourceType,
    pub(crate) access: Option<AccessHandlerFn>,
    pub(crate) get: Option<GetHandlerFn>,
    pub(crate) calls: HashMap<String, CallHandlerFn>,
    pub(crate) auths: HashMap<String, AuthHandlerFn>,
    pub(crate) group: Option<GroupTemplate>,
    pub(crate) apply_change: Option<ApplyChangeFn>,
    pub(crate) apply_add: Option<ApplyAddFn>,
    pub(crate) apply_remove: Option<ApplyRemoveFn>,
    pub(crate) apply_create: Option<ApplyCreateFn>,
    pub(crate) apply_delete: Option<ApplyDeleteFn>,
}

impl std::fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSet")
            .field("pattern", &self.pattern)
            .field("tokens", &self.tokens)
            .field("typ", &self.typ)
            .field("access", &self.access.is_some())
            .field("get", &self.get.is_some())
            .field("calls", &self.calls.keys().collect::<Vec<_>>())
            .field("auths", &self.auths.keys().collect::<Vec<_>>())
            .field("group", &self.group)
            .field("apply_change", &self.apply_change.is_some())
            .field("apply_add", &self.apply_add.is_some())
            .field("apply_remove", &self.apply_remove.is_some())
            .field("apply_create", &self.apply_create.is_some())
            .field("apply_delete", &self.apply_delete.is_some())
            .finish()
    }
}

impl HandlerSet {
    /// Validate the declaration against `pattern` and freeze it.
    pub(crate) fn build(
        handler: Handler,
        pattern: &str,
    ) -> Result<Arc<HandlerSet>, RegistrationError> {
        if let Some(err) = handler.err {
            return Err(err);
        }
        let parts = handler.parts;
        let tokens = parse_pattern(pattern)?;

        let group = match parts.group {
            None => None,
            Some(raw) => {
                let template =
                    GroupTemplate::parse(&raw).map_err(|reason| RegistrationError::InvalidGroup {
                        group: raw.clone(),
                        reason,
                    })?;
                let names: Vec<&str> = tokens
                    .iter()
                    .filter_map(|t| match t {
                        Token::Wildcard(Some(name)) => Some(name.as_str()),
                        _ => None,
                    })
                    .collect();
                for param in template.params() {
                    if !names.contains(&param) {
                        return Err(RegistrationError::InvalidGroup {
                            group: raw.clone(),
                            reason: format!("parameter '${}' not found in pattern", param),
                        });
                    }
                }
                Some(template)
            }
        };

        Ok(Arc::new(HandlerSet {
            pattern: pattern.to_string(),
            tokens,
            typ: parts.typ.unwrap_or_default(),
            access: parts.access,
            get: parts.get,
            calls: parts.calls,
            auths: parts.auths,
            group,
            apply_change: parts.apply_change,
            apply_add: parts.apply_add,
            apply_remove: parts.apply_remove,
            apply_create: parts.apply_create,
            apply_delete: parts.apply_delete,
        }))
    }

    /// The full pattern this set is registered under.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The resource type served by this set.
    pub fn resource_type(&self) -> ResourceType {
        self.typ
    }

    pub(crate) fn tokens(&self) -> &[Token] {
        &self.tokens
    }
}
