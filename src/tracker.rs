//! Server-side object identity authority.
//!
//! The tracker is an arena of tracked objects keyed by integer IDs. It owns
//! the only globally shared mutable state in the core: the object table, the
//! holder sets, and the pending mutation-update bundle. All access goes
//! through one internal mutex; live user values reached through tracked
//! handles stay owned by the embedding application and are only re-reflected
//! at call/mutation time, never deep-copied.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::structure::{ComplexStructure, ObjectId, ObjectUpdate, StructureMap, WireValue};
use crate::structurer::{Structurer, TrackSink};
use crate::value::{HostValue, MutationSink};

/// An entity keeping a tracked object reachable.
///
/// `Dependency` holders exist only because another tracked object's
/// structure references this one; they are never reclamation roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Holder {
    Peer(u64),
    Persistent,
    Dependency(ObjectId),
}

struct TrackedObject {
    /// The live handle. Reclamation removes bookkeeping only; a caller that
    /// already cloned this handle keeps a valid value.
    value: HostValue,
    structure: ComplexStructure,
    holders: HashSet<Holder>,
}

#[derive(Default)]
struct TrackerInner {
    objects: HashMap<ObjectId, TrackedObject>,
    by_addr: HashMap<usize, ObjectId>,
    next_id: ObjectId,
    updates: BTreeMap<ObjectId, ObjectUpdate>,
}

/// Assigns IDs during reflection. New composites get a placeholder entry
/// immediately (so cyclic graphs terminate) and are queued for structure
/// computation by the drain loop.
struct ArenaSink<'a> {
    inner: &'a mut TrackerInner,
    pending: &'a mut Vec<(ObjectId, HostValue)>,
}

impl TrackSink for ArenaSink<'_> {
    fn track(&mut self, value: &HostValue) -> ObjectId {
        let addr = value.addr().expect("track called with a composite value");
        if let Some(&id) = self.inner.by_addr.get(&addr) {
            return id;
        }
        self.inner.next_id += 1;
        let id = self.inner.next_id;
        self.inner.by_addr.insert(addr, id);
        self.inner.objects.insert(
            id,
            TrackedObject {
                value: value.clone(),
                structure: ComplexStructure::Object {
                    map: BTreeMap::new(),
                    funcs: Vec::new(),
                    array: None,
                },
                holders: HashSet::new(),
            },
        );
        self.pending.push((id, value.clone()));
        id
    }
}

pub(crate) struct TrackerShared {
    structurer: Structurer,
    track_default: bool,
    inner: Mutex<TrackerInner>,
}

impl TrackerShared {
    fn reflect_locked(this: &Arc<Self>, inner: &mut TrackerInner, value: &HostValue) -> WireValue {
        let mut pending = Vec::new();
        let wire = {
            let mut sink = ArenaSink {
                inner: &mut *inner,
                pending: &mut pending,
            };
            this.structurer.value(value, &mut sink)
        };
        Self::drain_pending_locked(this, inner, &mut pending);
        wire
    }

    fn drain_pending_locked(
        this: &Arc<Self>,
        inner: &mut TrackerInner,
        pending: &mut Vec<(ObjectId, HostValue)>,
    ) {
        while let Some((id, value)) = pending.pop() {
            let structure = {
                let mut sink = ArenaSink {
                    inner: &mut *inner,
                    pending: &mut *pending,
                };
                match this.structurer.complex(&value, &mut sink) {
                    Ok(structure) => structure,
                    Err(_) => continue,
                }
            };
            for dep in structure.references() {
                if let Some(target) = inner.objects.get_mut(&dep) {
                    target.holders.insert(Holder::Dependency(id));
                }
            }
            if let Some(entry) = inner.objects.get_mut(&id) {
                entry.structure = structure;
            }
            if value.is_synchronized() {
                let sink: Arc<dyn MutationSink> = this.clone();
                value.install_observer(Arc::downgrade(&sink), id);
            }
        }
    }

    /// Recompute a tracked object's cached structure after a mutation and
    /// diff its dependency-holder edges.
    fn refresh_structure_locked(this: &Arc<Self>, inner: &mut TrackerInner, id: ObjectId) {
        let (value, old_deps) = match inner.objects.get(&id) {
            Some(entry) => (
                entry.value.clone(),
                entry
                    .structure
                    .references()
                    .into_iter()
                    .collect::<HashSet<_>>(),
            ),
            None => return,
        };
        let mut pending = Vec::new();
        let structure = {
            let mut sink = ArenaSink {
                inner: &mut *inner,
                pending: &mut pending,
            };
            match this.structurer.complex(&value, &mut sink) {
                Ok(structure) => structure,
                Err(_) => return,
            }
        };
        Self::drain_pending_locked(this, inner, &mut pending);

        let new_deps: HashSet<ObjectId> = structure.references().into_iter().collect();
        for removed in old_deps.difference(&new_deps) {
            if let Some(target) = inner.objects.get_mut(removed) {
                target.holders.remove(&Holder::Dependency(id));
            }
        }
        for added in new_deps.difference(&old_deps) {
            if let Some(target) = inner.objects.get_mut(added) {
                target.holders.insert(Holder::Dependency(id));
            }
        }
        if let Some(entry) = inner.objects.get_mut(&id) {
            entry.structure = structure;
        }
    }

    fn reclaim_locked(inner: &mut TrackerInner) {
        let mut stack: Vec<ObjectId> = inner
            .objects
            .iter()
            .filter(|(_, object)| {
                object
                    .holders
                    .iter()
                    .any(|holder| matches!(holder, Holder::Peer(_) | Holder::Persistent))
            })
            .map(|(&id, _)| id)
            .collect();
        let mut reachable = HashSet::new();
        while let Some(id) = stack.pop() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some(object) = inner.objects.get(&id) {
                stack.extend(object.structure.references());
            }
        }

        let dead: Vec<ObjectId> = inner
            .objects
            .keys()
            .copied()
            .filter(|id| !reachable.contains(id))
            .collect();
        for id in &dead {
            if let Some(object) = inner.objects.remove(id) {
                if let Some(addr) = object.value.addr() {
                    inner.by_addr.remove(&addr);
                }
                object.value.clear_observer();
            }
            inner.updates.remove(id);
        }
        // Dependency edges owned by reclaimed objects are stale now.
        for object in inner.objects.values_mut() {
            object.holders.retain(|holder| match holder {
                Holder::Dependency(owner) => reachable.contains(owner),
                _ => true,
            });
        }
    }
}

impl MutationSink for TrackerShared {
    fn property_set(self: Arc<Self>, object_id: ObjectId, prop: &str, value: &HostValue) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.objects.contains_key(&object_id) {
            return;
        }
        let wire = TrackerShared::reflect_locked(&self, &mut inner, value);
        let update = inner.updates.entry(object_id).or_default();
        update.map.insert(prop.to_string(), wire);
        update.deleted.retain(|name| name != prop);
        TrackerShared::refresh_structure_locked(&self, &mut inner, object_id);
    }

    fn property_deleted(self: Arc<Self>, object_id: ObjectId, prop: &str) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.objects.contains_key(&object_id) {
            return;
        }
        let update = inner.updates.entry(object_id).or_default();
        if !update.deleted.iter().any(|name| name == prop) {
            update.deleted.push(prop.to_string());
        }
        update.map.remove(prop);
        TrackerShared::refresh_structure_locked(&self, &mut inner, object_id);
    }
}

/// Cheaply cloneable facade over the shared tracker state.
#[derive(Clone)]
pub struct Tracker {
    shared: Arc<TrackerShared>,
}

impl Tracker {
    pub fn new(structurer: Structurer, track_default: bool) -> Self {
        Tracker {
            shared: Arc::new(TrackerShared {
                structurer,
                track_default,
                inner: Mutex::new(TrackerInner::default()),
            }),
        }
    }

    pub fn identity_property(&self) -> String {
        self.shared.structurer.identity_property().to_string()
    }

    /// Reflect a value: scalar passthrough or track-and-reference.
    /// Idempotent for a given live handle.
    pub fn get_value(&self, value: &HostValue) -> WireValue {
        let mut inner = self.shared.inner.lock().unwrap();
        TrackerShared::reflect_locked(&self.shared, &mut inner, value)
    }

    /// Track a composite value and return its ID.
    pub fn get_or_track(&self, value: &HostValue) -> Result<ObjectId> {
        match self.get_value(value) {
            WireValue::Reference { object_id } => Ok(object_id),
            WireValue::Simple { .. } => Err(Error::NotTrackable),
        }
    }

    /// Reflect a function's return value, honoring the per-value tracking
    /// override and the server-wide default. Untracked composites are
    /// snapshotted to plain inline JSON.
    pub fn function_return_value(&self, value: &HostValue) -> WireValue {
        let tracked = value
            .tracked_override()
            .unwrap_or(self.shared.track_default);
        if value.is_composite() && tracked {
            self.get_value(value)
        } else {
            WireValue::Simple {
                value: value.to_json(),
            }
        }
    }

    pub fn structure_of(&self, id: ObjectId) -> Result<ComplexStructure> {
        let inner = self.shared.inner.lock().unwrap();
        inner
            .objects
            .get(&id)
            .map(|object| object.structure.clone())
            .ok_or(Error::UnknownObject(id))
    }

    /// The live handle behind an ID, for resolving reference arguments.
    pub fn live_value(&self, id: ObjectId) -> Result<HostValue> {
        let inner = self.shared.inner.lock().unwrap();
        inner
            .objects
            .get(&id)
            .map(|object| object.value.clone())
            .ok_or(Error::UnknownObject(id))
    }

    /// The transitive structures reachable from `id`, skipping IDs in
    /// `excluding`. IDs that disappear mid-walk (a reclamation race) are
    /// silently skipped; only a missing root is an error.
    pub fn dependency_closure(
        &self,
        id: ObjectId,
        excluding: &HashSet<ObjectId>,
    ) -> Result<StructureMap> {
        let inner = self.shared.inner.lock().unwrap();
        if !inner.objects.contains_key(&id) {
            return Err(Error::UnknownObject(id));
        }
        let mut map = StructureMap::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if excluding.contains(&next) || map.contains_key(&next) {
                continue;
            }
            let Some(entry) = inner.objects.get(&next) else {
                continue;
            };
            map.insert(next, entry.structure.clone());
            stack.extend(entry.structure.references());
        }
        Ok(map)
    }

    pub fn add_holder(&self, holder: Holder, id: ObjectId) {
        let mut inner = self.shared.inner.lock().unwrap();
        if let Some(object) = inner.objects.get_mut(&id) {
            object.holders.insert(holder);
        }
    }

    pub fn remove_holder(&self, holder: Holder, id: ObjectId) {
        let mut inner = self.shared.inner.lock().unwrap();
        if let Some(object) = inner.objects.get_mut(&id) {
            object.holders.remove(&holder);
        }
    }

    /// Release every object held by `holder` and sweep. Invoked with
    /// `Holder::Peer(conn)` on disconnect.
    pub fn remove_all_holders_for(&self, holder: Holder) {
        let mut inner = self.shared.inner.lock().unwrap();
        for object in inner.objects.values_mut() {
            object.holders.remove(&holder);
        }
        TrackerShared::reclaim_locked(&mut inner);
    }

    /// Mark-and-sweep from Persistent and Peer holders.
    pub fn reclaim(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        TrackerShared::reclaim_locked(&mut inner);
    }

    /// Drain the pending mutation-update bundle.
    pub fn pop_updates(&self) -> BTreeMap<ObjectId, ObjectUpdate> {
        let mut inner = self.shared.inner.lock().unwrap();
        std::mem::take(&mut inner.updates)
    }

    pub fn tracked_count(&self) -> usize {
        self.shared.inner.lock().unwrap().objects.len()
    }
}
