//! Event payload types and validity rules.
//!
//! Events are published on `event.<rid>.<event>` subjects. The reserved
//! event names carry protocol semantics and can never be used for custom
//! events; `change` is legal only on model resources and `add`/`remove` only
//! on collections.

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

/// Event names with protocol-defined meaning.
pub const RESERVED_EVENTS: &[&str] = &[
    "change",
    "delete",
    "add",
    "remove",
    "patch",
    "reaccess",
    "unsubscribe",
    "create",
];

/// Whether `name` is a reserved event name.
pub fn is_reserved_event(name: &str) -> bool {
    RESERVED_EVENTS.contains(&name)
}

/// A resource reference value, serialized as `{"rid": "..."}`.
///
/// Used inside model property values and collection values to point at
/// another resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ref(pub String);

impl Ref {
    pub fn new(rid: impl Into<String>) -> Self {
        Self(rid.into())
    }
}

impl Serialize for Ref {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("Ref", 1)?;
        s.serialize_field("rid", &self.0)?;
        s.end()
    }
}

/// The delete action marker for change events, serialized as
/// `{"action": "delete"}`. Assign it to a model property to signal the
/// property was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteAction;

impl Serialize for DeleteAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("DeleteAction", 1)?;
        s.serialize_field("action", "delete")?;
        s.end()
    }
}

/// The delete action as a plain JSON value, for building change maps.
pub fn delete_action() -> Value {
    let mut m = Map::new();
    m.insert("action".to_string(), Value::String("delete".to_string()));
    Value::Object(m)
}

/// Wire payload of a `change` event.
#[derive(Debug, Serialize)]
pub(crate) struct ChangePayload {
    pub values: Map<String, Value>,
}

/// Wire payload of an `add` event.
#[derive(Debug, Serialize)]
pub(crate) struct AddPayload {
    pub value: Value,
    pub idx: usize,
}

/// Wire payload of a `remove` event.
#[derive(Debug, Serialize)]
pub(crate) struct RemovePayload {
    pub idx: usize,
}
