//! Server side: owns the tracker and serves peers over byte streams.
//!
//! One [`Server`] can serve any number of connections; each connection gets
//! a dedicated writer task and a sequential request loop. Requests on a
//! connection are handled in arrival order, so a peer that awaits each
//! response observes its own calls strictly ordered.
//!
//! Structures travel incrementally: a peer receives each object's structure
//! at most once, the first time a value reachable from a response needs it.
//! Later property mutations on synchronized objects travel as updates,
//! bundled onto the triggering caller's response and pushed to every other
//! peer that has seen the object.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, info, warn};

use crate::codec::JsonCodec;
use crate::error::{Error, Result};
use crate::protocol::{
    CallArg, FunctionRef, LineBuffer, PushBody, Request, RequestBody, Response, ResponseBody,
};
use crate::structure::{ObjectId, StructureMap, UpdateBundle, WireValue};
use crate::structurer::Structurer;
use crate::tracker::{Holder, Tracker};
use crate::value::HostValue;
use crate::writer::{spawn_writer_task, WriterHandle};

/// Default name of the reserved identity property.
pub const DEFAULT_IDENTITY_PROPERTY: &str = "_objwire_id";

/// Configures and builds a [`Server`].
pub struct ServerBuilder {
    root: HostValue,
    identity_property: String,
    include_marked: bool,
    track_by_default: bool,
}

impl ServerBuilder {
    pub fn new(root: impl Into<HostValue>) -> Self {
        ServerBuilder {
            root: root.into(),
            identity_property: DEFAULT_IDENTITY_PROPERTY.to_string(),
            include_marked: false,
            track_by_default: true,
        }
    }

    /// Rename the reserved identity property announced to clients.
    pub fn identity_property(mut self, name: impl Into<String>) -> Self {
        self.identity_property = name.into();
        self
    }

    /// Also reflect properties whose names start with the underscore marker.
    pub fn include_marked(mut self, include: bool) -> Self {
        self.include_marked = include;
        self
    }

    /// Whether composite function return values are tracked when the value
    /// carries no per-value override.
    pub fn track_by_default(mut self, track: bool) -> Self {
        self.track_by_default = track;
        self
    }

    pub fn build(self) -> Server {
        let structurer = Structurer::new(self.identity_property, self.include_marked);
        let tracker = Tracker::new(structurer, self.track_by_default);
        if self.root.is_composite() {
            // The root must outlive every connection.
            if let Ok(id) = tracker.get_or_track(&self.root) {
                tracker.add_holder(Holder::Persistent, id);
            }
        }
        Server {
            shared: Arc::new(ServerShared {
                tracker,
                root: self.root,
                connections: Mutex::new(HashMap::new()),
                next_conn_id: AtomicU64::new(0),
            }),
        }
    }
}

struct PeerState {
    writer: WriterHandle,
    /// Object IDs whose structures this peer has already received.
    synced: HashSet<ObjectId>,
}

struct ServerShared {
    tracker: Tracker,
    root: HostValue,
    connections: Mutex<HashMap<u64, PeerState>>,
    next_conn_id: AtomicU64,
}

/// Shares one tracked object graph across connections. Cheap to clone.
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    pub fn builder(root: impl Into<HostValue>) -> ServerBuilder {
        ServerBuilder::new(root)
    }

    pub fn tracker(&self) -> &Tracker {
        &self.shared.tracker
    }

    /// Sweep objects no peer or persistent holder can reach.
    pub fn reclaim(&self) {
        self.shared.tracker.reclaim();
    }

    /// Push pending mutations made outside any request to every connected
    /// peer. Request handling flushes automatically; embedders mutating
    /// synchronized objects on their own schedule call this.
    pub async fn flush_updates(&self) {
        // Connection IDs start at 1, so no peer matches and every slice is
        // pushed.
        let (_, pushes) = self.distribute_updates(0);
        Self::deliver_pushes(pushes).await;
    }

    /// Serve one peer until its stream closes or a framing error occurs.
    ///
    /// Requests are processed sequentially in arrival order. Per-request
    /// failures become error responses; framing and transport failures end
    /// the connection.
    pub async fn handle_connection<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn_id = self.shared.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (mut read_half, write_half) = tokio::io::split(stream);
        let (writer, writer_task) = spawn_writer_task(write_half);

        self.shared.connections.lock().unwrap().insert(
            conn_id,
            PeerState {
                writer: writer.clone(),
                synced: HashSet::new(),
            },
        );
        info!(conn_id, "peer connected");

        let mut framing = LineBuffer::new();
        let mut instance_map: HashMap<u64, ObjectId> = HashMap::new();
        let mut read_buf = vec![0u8; 8 * 1024];

        let result = 'session: loop {
            let n = match read_half.read(&mut read_buf).await {
                Ok(0) => break 'session Ok(()),
                Ok(n) => n,
                Err(e) => break 'session Err(Error::Io(e)),
            };
            let lines = match framing.push(&read_buf[..n]) {
                Ok(lines) => lines,
                Err(e) => {
                    warn!(conn_id, error = %e, "framing error, closing connection");
                    break 'session Err(e);
                }
            };
            for line in lines {
                let request: Request = match JsonCodec::decode(&line) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(conn_id, error = %e, "unparseable request, closing connection");
                        break 'session Err(e);
                    }
                };
                let msg_id = request.msg_id;
                debug!(conn_id, msg_id, "handling request");
                let body = match self
                    .handle_request(conn_id, &mut instance_map, request.body)
                    .await
                {
                    Ok(body) => body,
                    Err(e) => {
                        debug!(conn_id, msg_id, error = %e, "request failed");
                        ResponseBody::Error {
                            error: e.to_string(),
                        }
                    }
                };
                if writer.send(&Response { msg_id, body }).await.is_err() {
                    break 'session Err(Error::ConnectionClosed);
                }
            }
        };

        self.shared.connections.lock().unwrap().remove(&conn_id);
        self.shared
            .tracker
            .remove_all_holders_for(Holder::Peer(conn_id));
        drop(writer);
        let _ = writer_task.await;
        info!(conn_id, "peer disconnected");
        result
    }

    async fn handle_request(
        &self,
        conn_id: u64,
        instance_map: &mut HashMap<u64, ObjectId>,
        body: RequestBody,
    ) -> Result<ResponseBody> {
        match body {
            RequestBody::Init => {
                let value = self.shared.tracker.get_value(&self.shared.root);
                let new_objects = match value.object_id() {
                    Some(id) => self.sync_closure(conn_id, id)?,
                    None => StructureMap::new(),
                };
                Ok(ResponseBody::Init {
                    value,
                    new_objects,
                    identity_property_name: self.shared.tracker.identity_property(),
                })
            }
            RequestBody::CallFunc { function_ref, args } => {
                let args = self.resolve_args(instance_map, args)?;
                let result = self.invoke(instance_map, &function_ref, args).await?;
                let value = self.shared.tracker.function_return_value(&result);
                let new_objects = match value.object_id() {
                    Some(id) => self.sync_closure(conn_id, id)?,
                    None => StructureMap::new(),
                };
                let (update_bundle, pushes) = self.distribute_updates(conn_id);
                Self::deliver_pushes(pushes).await;
                Ok(ResponseBody::CallFuncResult {
                    value,
                    new_objects,
                    update_bundle,
                })
            }
            RequestBody::CreateInstance {
                instance_id,
                constructor_ref,
                args,
            } => {
                let args = self.resolve_args(instance_map, args)?;
                let class = self.resolve_function_handle(instance_map, &constructor_ref)?;
                let construct = class.constructor().ok_or_else(|| {
                    Error::NotConstructible("target has no constructor".to_string())
                })?;
                let instance = construct(args).await?;
                let host = HostValue::Object(instance);
                let id = self.shared.tracker.get_or_track(&host)?;
                instance_map.insert(instance_id, id);
                let new_objects = self.sync_closure(conn_id, id)?;
                let (update_bundle, pushes) = self.distribute_updates(conn_id);
                Self::deliver_pushes(pushes).await;
                Ok(ResponseBody::CreateInstanceResult {
                    value: WireValue::reference(id),
                    new_objects,
                    update_bundle,
                })
            }
        }
    }

    /// Map a wire object ID through the connection's instance table.
    /// Instance IDs are client-allocated; everything else is a tracker ID.
    fn resolve_id(instance_map: &HashMap<u64, ObjectId>, raw: ObjectId) -> ObjectId {
        instance_map.get(&raw).copied().unwrap_or(raw)
    }

    fn resolve_args(
        &self,
        instance_map: &HashMap<u64, ObjectId>,
        args: Vec<CallArg>,
    ) -> Result<Vec<HostValue>> {
        args.into_iter()
            .map(|arg| match arg {
                CallArg::Raw { arg } => Ok(HostValue::from_json(&arg)),
                CallArg::Reference { object_id } => self
                    .shared
                    .tracker
                    .live_value(Self::resolve_id(instance_map, object_id)),
            })
            .collect()
    }

    fn resolve_function_handle(
        &self,
        instance_map: &HashMap<u64, ObjectId>,
        function_ref: &FunctionRef,
    ) -> Result<crate::value::FunctionHandle> {
        let (target, name) = match function_ref {
            FunctionRef::Object { func_object_id } => {
                let id = Self::resolve_id(instance_map, *func_object_id);
                return match self.shared.tracker.live_value(id)? {
                    HostValue::Function(f) => Ok(f),
                    _ => Err(Error::NotCallable(format!("object {id} is not a function"))),
                };
            }
            FunctionRef::Property {
                object_id,
                func_name,
            } => {
                let id = Self::resolve_id(instance_map, *object_id);
                (self.shared.tracker.live_value(id)?, func_name.clone())
            }
        };
        let prop = match &target {
            HostValue::Object(object) => object.get(&name),
            HostValue::Function(function) => function.get(&name),
            HostValue::Array(array) => array.get(&name),
            _ => None,
        };
        match prop {
            Some(HostValue::Function(f)) => Ok(f),
            _ => Err(Error::NotCallable(name)),
        }
    }

    async fn invoke(
        &self,
        instance_map: &HashMap<u64, ObjectId>,
        function_ref: &FunctionRef,
        args: Vec<HostValue>,
    ) -> Result<HostValue> {
        // Instance methods dispatch through the shared method table; they
        // shadow same-named data properties.
        if let FunctionRef::Property {
            object_id,
            func_name,
        } = function_ref
        {
            let id = Self::resolve_id(instance_map, *object_id);
            if let HostValue::Object(object) = self.shared.tracker.live_value(id)? {
                if let Some(method) = object.methods().and_then(|table| table.get(func_name)) {
                    return method(object, args).await;
                }
            }
        }
        let function = self.resolve_function_handle(instance_map, function_ref)?;
        let call = function
            .callable()
            .ok_or_else(|| Error::NotCallable("function has no call body".to_string()))?;
        call(args).await
    }

    /// Send a peer every structure reachable from `root_id` that it has not
    /// seen yet, marking them synced and held.
    fn sync_closure(&self, conn_id: u64, root_id: ObjectId) -> Result<StructureMap> {
        let mut connections = self.shared.connections.lock().unwrap();
        let peer = connections
            .get_mut(&conn_id)
            .ok_or(Error::ConnectionClosed)?;
        let map = self
            .shared
            .tracker
            .dependency_closure(root_id, &peer.synced)?;
        for &id in map.keys() {
            peer.synced.insert(id);
            self.shared.tracker.add_holder(Holder::Peer(conn_id), id);
        }
        Ok(map)
    }

    /// Drain pending mutation updates and fan them out: each peer gets the
    /// slice touching objects it has synced, plus structures for objects the
    /// updates newly reference. The caller's slice rides on its response;
    /// the returned pushes go to everyone else via [`Self::deliver_pushes`].
    fn distribute_updates(
        &self,
        caller: u64,
    ) -> (Option<UpdateBundle>, Vec<(u64, WriterHandle, UpdateBundle)>) {
        let updates = self.shared.tracker.pop_updates();
        if updates.is_empty() {
            return (None, Vec::new());
        }

        let mut caller_bundle = None;
        let mut pushes = Vec::new();
        let mut connections = self.shared.connections.lock().unwrap();
        for (&conn_id, peer) in connections.iter_mut() {
            let relevant: std::collections::BTreeMap<_, _> = updates
                .iter()
                .filter(|(id, _)| peer.synced.contains(id))
                .map(|(id, update)| (*id, update.clone()))
                .collect();
            if relevant.is_empty() {
                continue;
            }

            let mut new_objects = StructureMap::new();
            for update in relevant.values() {
                for wire in update.map.values() {
                    let Some(ref_id) = wire.object_id() else {
                        continue;
                    };
                    if peer.synced.contains(&ref_id) {
                        continue;
                    }
                    let Ok(closure) = self
                        .shared
                        .tracker
                        .dependency_closure(ref_id, &peer.synced)
                    else {
                        continue;
                    };
                    for (id, structure) in closure {
                        peer.synced.insert(id);
                        self.shared.tracker.add_holder(Holder::Peer(conn_id), id);
                        new_objects.insert(id, structure);
                    }
                }
            }

            let bundle = UpdateBundle {
                updates: relevant,
                new_objects,
            };
            if conn_id == caller {
                caller_bundle = Some(bundle);
            } else {
                pushes.push((conn_id, peer.writer.clone(), bundle));
            }
        }
        (caller_bundle, pushes)
    }

    /// Deliver push bundles outside the connections lock. Sends wait on a
    /// full writer channel instead of dropping, so a slow peer still sees
    /// every update to an object in write order. Sends to peers that are
    /// already gone are swallowed.
    async fn deliver_pushes(pushes: Vec<(u64, WriterHandle, UpdateBundle)>) {
        for (conn_id, writer, update_bundle) in pushes {
            if writer
                .send(&PushBody::Update { update_bundle })
                .await
                .is_err()
            {
                debug!(conn_id, "push skipped, peer writer is gone");
            }
        }
    }
}
