//! Client-side mirrors of tracked server objects.
//!
//! A [`RemoteObject`] is the local stand-in for one server object ID. The
//! client keeps one mirror per ID for the life of the connection, so two
//! references to the same server object always resolve to the same
//! [`RemoteObject`], and updates pushed for that ID land on every holder of
//! the mirror at once.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value as Json;
use tracing::warn;

use crate::error::{Error, Result};
use crate::protocol::{CallArg, FunctionRef};
use crate::structure::{ComplexStructure, ObjectId, ObjectUpdate, WireValue};

use super::ClientShared;

/// A value observed through the client: plain data, or a mirror of a
/// tracked server object.
#[derive(Debug, Clone)]
pub enum ClientValue {
    Data(Json),
    Remote(RemoteObject),
}

impl ClientValue {
    pub fn as_json(&self) -> Option<&Json> {
        match self {
            ClientValue::Data(json) => Some(json),
            ClientValue::Remote(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.as_json().and_then(Json::as_bool)
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_json().and_then(Json::as_f64)
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_json().and_then(Json::as_str)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ClientValue::Data(Json::Null))
    }

    pub fn as_remote(&self) -> Option<&RemoteObject> {
        match self {
            ClientValue::Remote(remote) => Some(remote),
            ClientValue::Data(_) => None,
        }
    }
}

/// An argument for a remote call: inline data or a reference to a mirror
/// the server already tracks.
#[derive(Debug, Clone)]
pub enum ClientArg {
    Data(Json),
    Remote(RemoteObject),
}

impl ClientArg {
    pub(crate) fn to_wire(&self) -> CallArg {
        match self {
            ClientArg::Data(json) => CallArg::Raw { arg: json.clone() },
            ClientArg::Remote(remote) => CallArg::Reference {
                object_id: remote.object_id(),
            },
        }
    }
}

impl From<Json> for ClientArg {
    fn from(v: Json) -> Self {
        ClientArg::Data(v)
    }
}

impl From<bool> for ClientArg {
    fn from(v: bool) -> Self {
        ClientArg::Data(Json::Bool(v))
    }
}

impl From<f64> for ClientArg {
    fn from(v: f64) -> Self {
        ClientArg::Data(v.into())
    }
}

impl From<i32> for ClientArg {
    fn from(v: i32) -> Self {
        ClientArg::Data(v.into())
    }
}

impl From<&str> for ClientArg {
    fn from(v: &str) -> Self {
        ClientArg::Data(Json::String(v.to_string()))
    }
}

impl From<String> for ClientArg {
    fn from(v: String) -> Self {
        ClientArg::Data(Json::String(v))
    }
}

impl From<&RemoteObject> for ClientArg {
    fn from(v: &RemoteObject) -> Self {
        ClientArg::Remote(v.clone())
    }
}

impl From<ClientValue> for ClientArg {
    fn from(v: ClientValue) -> Self {
        match v {
            ClientValue::Data(json) => ClientArg::Data(json),
            ClientValue::Remote(remote) => ClientArg::Remote(remote),
        }
    }
}

/// What kind of server value a mirror reflects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    Object,
    Array,
    Function,
}

struct RemoteInner {
    object_id: ObjectId,
    kind: RemoteKind,
    /// Callable names: instance/own funcs for objects, constructible
    /// instance funcs for class functions.
    funcs: Mutex<Vec<String>>,
    props: Mutex<BTreeMap<String, ClientValue>>,
    elements: Mutex<Vec<ClientValue>>,
    client: Weak<ClientShared>,
}

/// Mirror of one tracked server object.
#[derive(Clone)]
pub struct RemoteObject {
    inner: Arc<RemoteInner>,
}

impl RemoteObject {
    /// An empty mirror for `id`. Created for every new structure before any
    /// of them is populated, so reference cycles resolve.
    pub(crate) fn shell(
        id: ObjectId,
        structure: &ComplexStructure,
        client: Weak<ClientShared>,
    ) -> Self {
        let kind = match structure {
            ComplexStructure::Function { .. } => RemoteKind::Function,
            ComplexStructure::Object { array: Some(_), .. } => RemoteKind::Array,
            ComplexStructure::Object { .. } => RemoteKind::Object,
        };
        RemoteObject {
            inner: Arc::new(RemoteInner {
                object_id: id,
                kind,
                funcs: Mutex::new(Vec::new()),
                props: Mutex::new(BTreeMap::new()),
                elements: Mutex::new(Vec::new()),
                client,
            }),
        }
    }

    /// Fill the mirror from its structure, resolving references through the
    /// registry of already-created shells.
    pub(crate) fn populate(
        &self,
        structure: &ComplexStructure,
        registry: &HashMap<ObjectId, RemoteObject>,
    ) {
        match structure {
            ComplexStructure::Object { map, funcs, array } => {
                {
                    let mut props = self.inner.props.lock().unwrap();
                    for (name, wire) in map {
                        props.insert(name.clone(), resolve_in(wire, registry));
                    }
                }
                *self.inner.funcs.lock().unwrap() = funcs.clone();
                if let Some(elements) = array {
                    *self.inner.elements.lock().unwrap() = elements
                        .iter()
                        .map(|wire| resolve_in(wire, registry))
                        .collect();
                }
            }
            ComplexStructure::Function {
                map,
                instance_funcs,
            } => {
                {
                    let mut props = self.inner.props.lock().unwrap();
                    for (name, wire) in map {
                        props.insert(name.clone(), resolve_in(wire, registry));
                    }
                }
                *self.inner.funcs.lock().unwrap() = instance_funcs.clone();
            }
        }
    }

    /// Apply a pushed property update. Numeric keys on array mirrors address
    /// elements.
    pub(crate) fn apply_update(
        &self,
        update: &ObjectUpdate,
        registry: &HashMap<ObjectId, RemoteObject>,
    ) {
        for (name, wire) in &update.map {
            let value = resolve_in(wire, registry);
            if self.inner.kind == RemoteKind::Array {
                if let Ok(index) = name.parse::<usize>() {
                    let mut elements = self.inner.elements.lock().unwrap();
                    while elements.len() <= index {
                        elements.push(ClientValue::Data(Json::Null));
                    }
                    elements[index] = value;
                    continue;
                }
            }
            self.inner.props.lock().unwrap().insert(name.clone(), value);
        }
        for name in &update.deleted {
            self.inner.props.lock().unwrap().remove(name);
        }
    }

    pub fn object_id(&self) -> ObjectId {
        self.inner.object_id
    }

    pub fn kind(&self) -> RemoteKind {
        self.inner.kind
    }

    pub fn get(&self, key: &str) -> Option<ClientValue> {
        self.inner.props.lock().unwrap().get(key).cloned()
    }

    pub fn props(&self) -> BTreeMap<String, ClientValue> {
        self.inner.props.lock().unwrap().clone()
    }

    /// Callable names announced by the server for this mirror.
    pub fn function_names(&self) -> Vec<String> {
        self.inner.funcs.lock().unwrap().clone()
    }

    pub fn element(&self, index: usize) -> Option<ClientValue> {
        self.inner.elements.lock().unwrap().get(index).cloned()
    }

    pub fn elements(&self) -> Vec<ClientValue> {
        self.inner.elements.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.elements.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn same_identity(&self, other: &RemoteObject) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Call a named function on this object, server-side.
    pub async fn call(&self, name: &str, args: Vec<ClientArg>) -> Result<ClientValue> {
        let client = self.client()?;
        ClientShared::call_func(
            &client,
            FunctionRef::Property {
                object_id: self.inner.object_id,
                func_name: name.to_string(),
            },
            args,
        )
        .await
    }

    /// Invoke this mirror itself, when it reflects a function.
    pub async fn invoke(&self, args: Vec<ClientArg>) -> Result<ClientValue> {
        let client = self.client()?;
        ClientShared::call_func(
            &client,
            FunctionRef::Object {
                func_object_id: self.inner.object_id,
            },
            args,
        )
        .await
    }

    /// Construct a server-side instance of the class this mirror reflects.
    pub async fn construct(&self, args: Vec<ClientArg>) -> Result<RemoteObject> {
        let client = self.client()?;
        ClientShared::create_instance(
            &client,
            FunctionRef::Object {
                func_object_id: self.inner.object_id,
            },
            args,
        )
        .await
    }

    fn client(&self) -> Result<Arc<ClientShared>> {
        self.inner.client.upgrade().ok_or(Error::ConnectionClosed)
    }
}

impl fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteObject")
            .field("object_id", &self.inner.object_id)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

/// Resolve a wire value against already-materialized mirrors. A dangling
/// reference collapses to null; the server should never produce one.
pub(crate) fn resolve_in(
    wire: &WireValue,
    registry: &HashMap<ObjectId, RemoteObject>,
) -> ClientValue {
    match wire {
        WireValue::Simple { value } => ClientValue::Data(value.clone()),
        WireValue::Reference { object_id } => match registry.get(object_id) {
            Some(remote) => ClientValue::Remote(remote.clone()),
            None => {
                warn!(object_id, "reference to an unknown object");
                ClientValue::Data(Json::Null)
            }
        },
    }
}
