//! Host-side value model.
//!
//! The embedder exposes an explicit graph of [`HostValue`]s instead of
//! relying on language-native reflection: plain objects, instances backed by
//! a shared [`MethodTable`], ordered arrays, and async callables that may
//! also act as constructors. Handles are `Arc`-shared; pointer identity is
//! what the tracker keys object IDs on, so cloning a handle never forks the
//! underlying value.
//!
//! Mutation synchronization is an explicit opt-in: [`sync_value`] marks a
//! subgraph synchronized, and once the tracker tracks a synchronized object
//! it installs a mutation observer so `set`/`remove` calls feed the pending
//! update bundle.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value as Json;

use crate::error::Result;
use crate::structure::ObjectId;

/// Boxed future used by async callables.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of invoking a host callable.
pub type CallResult = Result<HostValue>;

type CallFn = Arc<dyn Fn(Vec<HostValue>) -> BoxFuture<'static, CallResult> + Send + Sync>;
type MethodFn =
    Arc<dyn Fn(ObjectHandle, Vec<HostValue>) -> BoxFuture<'static, CallResult> + Send + Sync>;
type CtorFn =
    Arc<dyn Fn(ObjectHandle, Vec<HostValue>) -> BoxFuture<'static, Result<()>> + Send + Sync>;
type ConstructFn =
    Arc<dyn Fn(Vec<HostValue>) -> BoxFuture<'static, Result<ObjectHandle>> + Send + Sync>;

/// Sink for intercepted property writes/deletes on synchronized objects.
/// Implemented by the tracker.
pub(crate) trait MutationSink: Send + Sync {
    fn property_set(self: Arc<Self>, object_id: ObjectId, prop: &str, value: &HostValue);
    fn property_deleted(self: Arc<Self>, object_id: ObjectId, prop: &str);
}

/// Observer installed by the tracker on a synchronized tracked object.
#[derive(Clone)]
pub(crate) struct MutationObserver {
    pub(crate) sink: Weak<dyn MutationSink>,
    pub(crate) object_id: ObjectId,
}

impl MutationObserver {
    fn set(&self, prop: &str, value: &HostValue) {
        if let Some(sink) = self.sink.upgrade() {
            sink.property_set(self.object_id, prop, value);
        }
    }

    fn deleted(&self, prop: &str) {
        if let Some(sink) = self.sink.upgrade() {
            sink.property_deleted(self.object_id, prop);
        }
    }
}

/// A live value exposed to remote peers.
#[derive(Clone)]
pub enum HostValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Object(ObjectHandle),
    Array(ArrayHandle),
    Function(FunctionHandle),
}

impl HostValue {
    /// Build an async callable from a plain closure.
    pub fn function<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<HostValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        HostValue::Function(FunctionHandle::new(f))
    }

    /// Whether this value is an object/array/function (trackable) rather
    /// than an inline scalar.
    pub fn is_composite(&self) -> bool {
        matches!(
            self,
            HostValue::Object(_) | HostValue::Array(_) | HostValue::Function(_)
        )
    }

    /// Stable address of the shared allocation, for composites.
    pub(crate) fn addr(&self) -> Option<usize> {
        match self {
            HostValue::Object(o) => Some(Arc::as_ptr(&o.inner) as usize),
            HostValue::Array(a) => Some(Arc::as_ptr(&a.inner) as usize),
            HostValue::Function(f) => Some(Arc::as_ptr(&f.inner) as usize),
            _ => None,
        }
    }

    /// Per-value tracking override, if the embedder set one.
    pub(crate) fn tracked_override(&self) -> Option<bool> {
        match self {
            HostValue::Object(o) => *o.inner.track_override.lock().unwrap(),
            HostValue::Array(a) => *a.inner.track_override.lock().unwrap(),
            HostValue::Function(f) => *f.inner.track_override.lock().unwrap(),
            _ => None,
        }
    }

    pub(crate) fn is_synchronized(&self) -> bool {
        match self {
            HostValue::Object(o) => o.inner.synchronized.load(Ordering::Relaxed),
            HostValue::Array(a) => a.inner.synchronized.load(Ordering::Relaxed),
            _ => false,
        }
    }

    fn mark_synchronized(&self) {
        match self {
            HostValue::Object(o) => o.inner.synchronized.store(true, Ordering::Relaxed),
            HostValue::Array(a) => a.inner.synchronized.store(true, Ordering::Relaxed),
            _ => {}
        }
    }

    pub(crate) fn install_observer(&self, sink: Weak<dyn MutationSink>, object_id: ObjectId) {
        let observer = MutationObserver { sink, object_id };
        match self {
            HostValue::Object(o) => *o.inner.observer.lock().unwrap() = Some(observer),
            HostValue::Array(a) => *a.inner.observer.lock().unwrap() = Some(observer),
            _ => {}
        }
    }

    pub(crate) fn clear_observer(&self) {
        match self {
            HostValue::Object(o) => *o.inner.observer.lock().unwrap() = None,
            HostValue::Array(a) => *a.inner.observer.lock().unwrap() = None,
            _ => {}
        }
    }

    /// Snapshot this value as plain JSON. Composites are deep-copied,
    /// callables become null, cycles collapse to null.
    pub fn to_json(&self) -> Json {
        self.to_json_guarded(&mut Vec::new())
    }

    fn to_json_guarded(&self, visiting: &mut Vec<usize>) -> Json {
        if let Some(addr) = self.addr() {
            if visiting.contains(&addr) {
                return Json::Null;
            }
            visiting.push(addr);
        }
        let json = match self {
            HostValue::Null => Json::Null,
            HostValue::Bool(b) => Json::Bool(*b),
            HostValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            HostValue::String(s) => Json::String(s.clone()),
            HostValue::Object(o) => {
                let props = o.props_snapshot();
                let mut map = serde_json::Map::new();
                for (key, value) in props {
                    map.insert(key, value.to_json_guarded(visiting));
                }
                Json::Object(map)
            }
            HostValue::Array(a) => {
                let elems = a.elements_snapshot();
                Json::Array(
                    elems
                        .iter()
                        .map(|value| value.to_json_guarded(visiting))
                        .collect(),
                )
            }
            HostValue::Function(_) => Json::Null,
        };
        if let Some(addr) = self.addr() {
            visiting.retain(|&a| a != addr);
        }
        json
    }

    /// Convert plain JSON into host data. Objects and arrays become fresh
    /// untracked handles.
    pub fn from_json(json: &Json) -> HostValue {
        match json {
            Json::Null => HostValue::Null,
            Json::Bool(b) => HostValue::Bool(*b),
            Json::Number(n) => HostValue::Number(n.as_f64().unwrap_or(0.0)),
            Json::String(s) => HostValue::String(s.clone()),
            Json::Array(items) => {
                let array = ArrayHandle::new();
                for item in items {
                    array.push(HostValue::from_json(item));
                }
                HostValue::Array(array)
            }
            Json::Object(map) => {
                let object = ObjectHandle::new();
                for (key, value) in map {
                    object.set(key.clone(), HostValue::from_json(value));
                }
                HostValue::Object(object)
            }
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Null => write!(f, "Null"),
            HostValue::Bool(b) => write!(f, "Bool({b})"),
            HostValue::Number(n) => write!(f, "Number({n})"),
            HostValue::String(s) => write!(f, "String({s:?})"),
            HostValue::Object(o) => write!(f, "Object(0x{:x})", Arc::as_ptr(&o.inner) as usize),
            HostValue::Array(a) => write!(f, "Array(0x{:x})", Arc::as_ptr(&a.inner) as usize),
            HostValue::Function(h) => {
                write!(f, "Function(0x{:x})", Arc::as_ptr(&h.inner) as usize)
            }
        }
    }
}

impl From<bool> for HostValue {
    fn from(v: bool) -> Self {
        HostValue::Bool(v)
    }
}

impl From<f64> for HostValue {
    fn from(v: f64) -> Self {
        HostValue::Number(v)
    }
}

impl From<i64> for HostValue {
    fn from(v: i64) -> Self {
        HostValue::Number(v as f64)
    }
}

impl From<i32> for HostValue {
    fn from(v: i32) -> Self {
        HostValue::Number(v as f64)
    }
}

impl From<&str> for HostValue {
    fn from(v: &str) -> Self {
        HostValue::String(v.to_string())
    }
}

impl From<String> for HostValue {
    fn from(v: String) -> Self {
        HostValue::String(v)
    }
}

impl From<ObjectHandle> for HostValue {
    fn from(v: ObjectHandle) -> Self {
        HostValue::Object(v)
    }
}

impl From<ArrayHandle> for HostValue {
    fn from(v: ArrayHandle) -> Self {
        HostValue::Array(v)
    }
}

impl From<FunctionHandle> for HostValue {
    fn from(v: FunctionHandle) -> Self {
        HostValue::Function(v)
    }
}

/// Shared method bodies for one class of instances. Instances carry the
/// table by `Arc`; the wire only ever carries the method *names*.
pub struct MethodTable {
    type_tag: String,
    methods: BTreeMap<String, MethodFn>,
}

impl MethodTable {
    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn method_names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    pub(crate) fn get(&self, name: &str) -> Option<MethodFn> {
        self.methods.get(name).cloned()
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("type_tag", &self.type_tag)
            .field("methods", &self.method_names())
            .finish()
    }
}

struct ObjectInner {
    props: Mutex<BTreeMap<String, HostValue>>,
    methods: Option<Arc<MethodTable>>,
    synchronized: AtomicBool,
    track_override: Mutex<Option<bool>>,
    observer: Mutex<Option<MutationObserver>>,
}

/// Handle to a plain data object or a class instance.
#[derive(Clone)]
pub struct ObjectHandle {
    inner: Arc<ObjectInner>,
}

impl ObjectHandle {
    /// A new plain object.
    pub fn new() -> Self {
        Self::with_methods(None)
    }

    /// A new instance bound to a class method table.
    pub fn instance(table: Arc<MethodTable>) -> Self {
        Self::with_methods(Some(table))
    }

    fn with_methods(methods: Option<Arc<MethodTable>>) -> Self {
        ObjectHandle {
            inner: Arc::new(ObjectInner {
                props: Mutex::new(BTreeMap::new()),
                methods,
                synchronized: AtomicBool::new(false),
                track_override: Mutex::new(None),
                observer: Mutex::new(None),
            }),
        }
    }

    /// Set a property. If the object is synchronized and tracked, the write
    /// is reported to the tracker's pending update bundle.
    pub fn set(&self, key: impl Into<String>, value: impl Into<HostValue>) {
        let key = key.into();
        let value = value.into();
        if self.inner.synchronized.load(Ordering::Relaxed) {
            value.mark_synchronized();
        }
        self.inner
            .props
            .lock()
            .unwrap()
            .insert(key.clone(), value.clone());
        self.notify_set(&key, &value);
    }

    /// Remove a property. Returns whether it existed.
    pub fn remove(&self, key: &str) -> bool {
        let existed = self.inner.props.lock().unwrap().remove(key).is_some();
        if existed {
            // The sink takes the tracker lock; the observer lock must be
            // released before notifying.
            let observer = self.inner.observer.lock().unwrap().clone();
            if let Some(observer) = observer {
                observer.deleted(key);
            }
        }
        existed
    }

    pub fn get(&self, key: &str) -> Option<HostValue> {
        self.inner.props.lock().unwrap().get(key).cloned()
    }

    pub fn props_snapshot(&self) -> BTreeMap<String, HostValue> {
        self.inner.props.lock().unwrap().clone()
    }

    /// The class method table, when this object is an instance.
    pub fn methods(&self) -> Option<Arc<MethodTable>> {
        self.inner.methods.clone()
    }

    /// Mark whether function-return tracking applies to this value,
    /// overriding the server default.
    pub fn set_tracked(&self, tracked: bool) {
        *self.inner.track_override.lock().unwrap() = Some(tracked);
    }

    pub fn same_identity(&self, other: &ObjectHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn notify_set(&self, key: &str, value: &HostValue) {
        // The sink takes the tracker lock; the observer lock must be
        // released before notifying.
        let observer = self.inner.observer.lock().unwrap().clone();
        if let Some(observer) = observer {
            observer.set(key, value);
        }
    }
}

impl Default for ObjectHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHandle(0x{:x})", Arc::as_ptr(&self.inner) as usize)
    }
}

struct ArrayInner {
    elements: Mutex<Vec<HostValue>>,
    props: Mutex<BTreeMap<String, HostValue>>,
    synchronized: AtomicBool,
    track_override: Mutex<Option<bool>>,
    observer: Mutex<Option<MutationObserver>>,
}

/// Handle to an ordered sequence with optional extra named properties.
#[derive(Clone)]
pub struct ArrayHandle {
    inner: Arc<ArrayInner>,
}

impl ArrayHandle {
    pub fn new() -> Self {
        ArrayHandle {
            inner: Arc::new(ArrayInner {
                elements: Mutex::new(Vec::new()),
                props: Mutex::new(BTreeMap::new()),
                synchronized: AtomicBool::new(false),
                track_override: Mutex::new(None),
                observer: Mutex::new(None),
            }),
        }
    }

    pub fn from_values(values: Vec<HostValue>) -> Self {
        let array = ArrayHandle::new();
        *array.inner.elements.lock().unwrap() = values;
        array
    }

    pub fn push(&self, value: impl Into<HostValue>) {
        let value = value.into();
        if self.inner.synchronized.load(Ordering::Relaxed) {
            value.mark_synchronized();
        }
        let index = {
            let mut elements = self.inner.elements.lock().unwrap();
            elements.push(value.clone());
            elements.len() - 1
        };
        self.notify_set(&index.to_string(), &value);
    }

    /// Replace the element at `index` (or append when `index == len`).
    /// Element updates reach peers under the decimal index name.
    pub fn set_element(&self, index: usize, value: impl Into<HostValue>) -> bool {
        let value = value.into();
        if self.inner.synchronized.load(Ordering::Relaxed) {
            value.mark_synchronized();
        }
        let stored = {
            let mut elements = self.inner.elements.lock().unwrap();
            if index < elements.len() {
                elements[index] = value.clone();
                true
            } else if index == elements.len() {
                elements.push(value.clone());
                true
            } else {
                false
            }
        };
        if stored {
            self.notify_set(&index.to_string(), &value);
        }
        stored
    }

    pub fn element(&self, index: usize) -> Option<HostValue> {
        self.inner.elements.lock().unwrap().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.elements.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Set an extra named property on the sequence.
    pub fn set(&self, key: impl Into<String>, value: impl Into<HostValue>) {
        let key = key.into();
        let value = value.into();
        if self.inner.synchronized.load(Ordering::Relaxed) {
            value.mark_synchronized();
        }
        self.inner
            .props
            .lock()
            .unwrap()
            .insert(key.clone(), value.clone());
        self.notify_set(&key, &value);
    }

    pub fn remove(&self, key: &str) -> bool {
        let existed = self.inner.props.lock().unwrap().remove(key).is_some();
        if existed {
            let observer = self.inner.observer.lock().unwrap().clone();
            if let Some(observer) = observer {
                observer.deleted(key);
            }
        }
        existed
    }

    pub fn get(&self, key: &str) -> Option<HostValue> {
        self.inner.props.lock().unwrap().get(key).cloned()
    }

    pub fn props_snapshot(&self) -> BTreeMap<String, HostValue> {
        self.inner.props.lock().unwrap().clone()
    }

    pub fn elements_snapshot(&self) -> Vec<HostValue> {
        self.inner.elements.lock().unwrap().clone()
    }

    pub fn set_tracked(&self, tracked: bool) {
        *self.inner.track_override.lock().unwrap() = Some(tracked);
    }

    fn notify_set(&self, key: &str, value: &HostValue) {
        let observer = self.inner.observer.lock().unwrap().clone();
        if let Some(observer) = observer {
            observer.set(key, value);
        }
    }
}

impl Default for ArrayHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ArrayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArrayHandle(0x{:x})", Arc::as_ptr(&self.inner) as usize)
    }
}

struct FunctionInner {
    props: Mutex<BTreeMap<String, HostValue>>,
    call: Option<CallFn>,
    construct: Option<ConstructFn>,
    instance_methods: Option<Arc<MethodTable>>,
    track_override: Mutex<Option<bool>>,
}

/// Handle to an async callable. A callable may double as a constructor
/// (built through [`ClassBuilder`]) and as a namespace of static properties.
#[derive(Clone)]
pub struct FunctionHandle {
    inner: Arc<FunctionInner>,
}

impl FunctionHandle {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<HostValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        let call: CallFn = Arc::new(move |args| Box::pin(f(args)));
        FunctionHandle {
            inner: Arc::new(FunctionInner {
                props: Mutex::new(BTreeMap::new()),
                call: Some(call),
                construct: None,
                instance_methods: None,
                track_override: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn from_parts(
        statics: BTreeMap<String, HostValue>,
        call: Option<CallFn>,
        construct: Option<ConstructFn>,
        instance_methods: Option<Arc<MethodTable>>,
    ) -> Self {
        FunctionHandle {
            inner: Arc::new(FunctionInner {
                props: Mutex::new(statics),
                call,
                construct,
                instance_methods,
                track_override: Mutex::new(None),
            }),
        }
    }

    /// Invoke the callable, if there is one.
    pub(crate) fn callable(&self) -> Option<CallFn> {
        self.inner.call.clone()
    }

    pub(crate) fn constructor(&self) -> Option<ConstructFn> {
        self.inner.construct.clone()
    }

    pub fn instance_methods(&self) -> Option<Arc<MethodTable>> {
        self.inner.instance_methods.clone()
    }

    /// A fresh, empty, synchronized instance of this class. Useful in static
    /// factory functions. `None` when the callable has no method table.
    pub fn blank_instance(&self) -> Option<ObjectHandle> {
        let table = self.inner.instance_methods.clone()?;
        let instance = ObjectHandle::instance(table);
        HostValue::Object(instance.clone()).mark_synchronized();
        Some(instance)
    }

    /// Set a static property.
    pub fn set(&self, key: impl Into<String>, value: impl Into<HostValue>) {
        self.inner
            .props
            .lock()
            .unwrap()
            .insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<HostValue> {
        self.inner.props.lock().unwrap().get(key).cloned()
    }

    pub fn props_snapshot(&self) -> BTreeMap<String, HostValue> {
        self.inner.props.lock().unwrap().clone()
    }

    pub fn set_tracked(&self, tracked: bool) {
        *self.inner.track_override.lock().unwrap() = Some(tracked);
    }
}

impl fmt::Debug for FunctionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FunctionHandle(0x{:x})",
            Arc::as_ptr(&self.inner) as usize
        )
    }
}

/// Builder for a class-like callable: a constructor, shared instance
/// methods, and static values.
pub struct ClassBuilder {
    type_tag: String,
    methods: BTreeMap<String, MethodFn>,
    statics: BTreeMap<String, HostValue>,
    ctor: Option<CtorFn>,
}

impl ClassBuilder {
    pub fn new(type_tag: impl Into<String>) -> Self {
        ClassBuilder {
            type_tag: type_tag.into(),
            methods: BTreeMap::new(),
            statics: BTreeMap::new(),
            ctor: None,
        }
    }

    /// Register the constructor. It receives the freshly created instance
    /// and the call arguments, and populates the instance's state.
    pub fn constructor<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ObjectHandle, Vec<HostValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.ctor = Some(Arc::new(move |instance, args| Box::pin(f(instance, args))));
        self
    }

    /// Register an instance method shared by every instance of this class.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ObjectHandle, Vec<HostValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        let method: MethodFn = Arc::new(move |this, args| Box::pin(f(this, args)));
        self.methods.insert(name.into(), method);
        self
    }

    /// Register a static value on the class surface.
    pub fn static_value(mut self, name: impl Into<String>, value: impl Into<HostValue>) -> Self {
        self.statics.insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> FunctionHandle {
        let table = Arc::new(MethodTable {
            type_tag: self.type_tag,
            methods: self.methods,
        });
        let construct = self.ctor.map(|ctor| {
            let table = table.clone();
            let construct: ConstructFn = Arc::new(move |args| {
                let instance = ObjectHandle::instance(table.clone());
                // Instances are born synchronized so method-driven state
                // changes reach every peer that has seen them.
                HostValue::Object(instance.clone()).mark_synchronized();
                let fut = ctor(instance.clone(), args);
                Box::pin(async move {
                    fut.await?;
                    Ok(instance)
                })
            });
            construct
        });
        FunctionHandle::from_parts(self.statics, None, construct, Some(table))
    }
}

/// Opt a value (and, recursively, every composite reachable from it) into
/// mutation synchronization. Cycle-safe.
pub fn sync_value(value: &HostValue) {
    let mut visited = Vec::new();
    sync_recursive(value, &mut visited);
}

fn sync_recursive(value: &HostValue, visited: &mut Vec<usize>) {
    let Some(addr) = value.addr() else { return };
    if visited.contains(&addr) {
        return;
    }
    visited.push(addr);
    value.mark_synchronized();
    match value {
        HostValue::Object(o) => {
            for child in o.props_snapshot().values() {
                sync_recursive(child, visited);
            }
        }
        HostValue::Array(a) => {
            for child in a.props_snapshot().values() {
                sync_recursive(child, visited);
            }
            for child in a.elements_snapshot() {
                sync_recursive(&child, visited);
            }
        }
        HostValue::Function(f) => {
            for child in f.props_snapshot().values() {
                sync_recursive(child, visited);
            }
        }
        _ => {}
    }
}
