//! Client side: connects to a server and mirrors its object graph.
//!
//! [`Client::connect`] performs the init handshake and exposes the server's
//! root value. Mirrors are identity-preserving: the same server object ID
//! always maps to the same [`RemoteObject`] for the life of the connection.

mod base;
mod proxy;

pub use proxy::{ClientArg, ClientValue, RemoteKind, RemoteObject};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::{FunctionRef, PushBody, RequestBody, ResponseBody};
use crate::structure::{ObjectId, StructureMap, UpdateBundle, WireValue};
use crate::writer::spawn_writer_task;

use base::{read_loop, Base, PendingMap};

/// Client-allocated instance IDs start far above any tracker-assigned ID,
/// so the two spaces cannot collide inside a connection's instance table.
const CLIENT_INSTANCE_ID_BASE: u64 = 1 << 48;

pub(crate) struct ClientShared {
    base: Base,
    registry: Mutex<HashMap<ObjectId, RemoteObject>>,
    identity_property: Mutex<String>,
    next_instance_id: AtomicU64,
}

impl ClientShared {
    /// Create mirrors for every structure the server just sent. Two-phase:
    /// shells first so cyclic references resolve, then population.
    fn materialize(this: &Arc<Self>, new_objects: &StructureMap) {
        if new_objects.is_empty() {
            return;
        }
        let mut registry = this.registry.lock().unwrap();
        for (&id, structure) in new_objects {
            registry
                .entry(id)
                .or_insert_with(|| RemoteObject::shell(id, structure, Arc::downgrade(this)));
        }
        for (&id, structure) in new_objects {
            registry[&id].clone().populate(structure, &registry);
        }
        debug!(count = new_objects.len(), "materialized mirrors");
    }

    fn apply_bundle(this: &Arc<Self>, bundle: UpdateBundle) {
        Self::materialize(this, &bundle.new_objects);
        let registry = this.registry.lock().unwrap();
        for (id, update) in &bundle.updates {
            match registry.get(id) {
                Some(mirror) => mirror.apply_update(update, &registry),
                None => warn!(object_id = *id, "update for an unknown object"),
            }
        }
    }

    /// Resolve a response's top-level value. Unlike nested references, a
    /// dangling one here is a hard protocol error.
    fn resolve(&self, wire: &WireValue) -> Result<ClientValue> {
        match wire {
            WireValue::Simple { value } => Ok(ClientValue::Data(value.clone())),
            WireValue::Reference { object_id } => self
                .registry
                .lock()
                .unwrap()
                .get(object_id)
                .cloned()
                .map(ClientValue::Remote)
                .ok_or(Error::UnknownObject(*object_id)),
        }
    }

    pub(crate) async fn call_func(
        this: &Arc<Self>,
        function_ref: FunctionRef,
        args: Vec<ClientArg>,
    ) -> Result<ClientValue> {
        let args = args.iter().map(ClientArg::to_wire).collect();
        let body = this
            .base
            .request(RequestBody::CallFunc { function_ref, args })
            .await?;
        let ResponseBody::CallFuncResult {
            value,
            new_objects,
            update_bundle,
        } = body
        else {
            return Err(Error::InvalidResponseShape {
                expected: "call_func_result",
            });
        };
        Self::materialize(this, &new_objects);
        if let Some(bundle) = update_bundle {
            Self::apply_bundle(this, bundle);
        }
        this.resolve(&value)
    }

    pub(crate) async fn create_instance(
        this: &Arc<Self>,
        constructor_ref: FunctionRef,
        args: Vec<ClientArg>,
    ) -> Result<RemoteObject> {
        let args = args.iter().map(ClientArg::to_wire).collect();
        let instance_id = this.next_instance_id.fetch_add(1, Ordering::Relaxed);
        let body = this
            .base
            .request(RequestBody::CreateInstance {
                instance_id,
                constructor_ref,
                args,
            })
            .await?;
        let ResponseBody::CreateInstanceResult {
            value,
            new_objects,
            update_bundle,
        } = body
        else {
            return Err(Error::InvalidResponseShape {
                expected: "create_instance_result",
            });
        };
        Self::materialize(this, &new_objects);
        if let Some(bundle) = update_bundle {
            Self::apply_bundle(this, bundle);
        }
        match this.resolve(&value)? {
            ClientValue::Remote(remote) => Ok(remote),
            ClientValue::Data(_) => Err(Error::InvalidResponseShape {
                expected: "object reference",
            }),
        }
    }
}

/// A connected client.
pub struct Client {
    shared: Arc<ClientShared>,
    root: ClientValue,
}

impl Client {
    /// Connect over any byte stream: spawn the read and write tasks, run
    /// the init handshake, and mirror the root value.
    pub async fn connect<S>(stream: S) -> Result<Client>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer, _writer_task) = spawn_writer_task(write_half);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let shared = Arc::new(ClientShared {
            base: Base::new(writer, pending.clone()),
            registry: Mutex::new(HashMap::new()),
            identity_property: Mutex::new(String::new()),
            next_instance_id: AtomicU64::new(CLIENT_INSTANCE_ID_BASE),
        });

        let push_target = Arc::downgrade(&shared);
        tokio::spawn(read_loop(read_half, pending, move |push| {
            if let Some(shared) = push_target.upgrade() {
                match push {
                    PushBody::Update { update_bundle } => {
                        ClientShared::apply_bundle(&shared, update_bundle);
                    }
                }
            }
        }));

        let body = shared.base.request(RequestBody::Init).await?;
        let ResponseBody::Init {
            value,
            new_objects,
            identity_property_name,
        } = body
        else {
            return Err(Error::InvalidResponseShape { expected: "init" });
        };
        *shared.identity_property.lock().unwrap() = identity_property_name;
        ClientShared::materialize(&shared, &new_objects);
        let root = shared.resolve(&value)?;

        Ok(Client { shared, root })
    }

    /// The server's root value as mirrored at connect time.
    pub fn root(&self) -> ClientValue {
        self.root.clone()
    }

    /// The root, when it is a tracked object.
    pub fn root_object(&self) -> Option<RemoteObject> {
        self.root.as_remote().cloned()
    }

    /// Name of the reserved identity property announced by the server.
    pub fn identity_property(&self) -> String {
        self.shared.identity_property.lock().unwrap().clone()
    }

    /// The mirror for a server object ID, if this client has seen it.
    pub fn mirror(&self, id: ObjectId) -> Option<RemoteObject> {
        self.shared.registry.lock().unwrap().get(&id).cloned()
    }
}
