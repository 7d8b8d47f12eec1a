//! Wire-side data model.
//!
//! Values never embed structure inline: a composite value travels as a
//! [`WireValue::Reference`] and its [`ComplexStructure`] travels out-of-band,
//! keyed by object ID. Property maps use `BTreeMap` so enumeration order is
//! deterministic on both ends.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Stable wire identity assigned by the tracker.
pub type ObjectId = u64;

/// A value as it appears on the wire: an inline scalar or an object
/// reference resolved through the out-of-band structure map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireValue {
    /// Inline scalar (string/number/boolean/null) or opaque plain data.
    Simple { value: Json },
    /// Reference to a tracked object.
    Reference {
        #[serde(rename = "objectID")]
        object_id: ObjectId,
    },
}

impl WireValue {
    /// Shorthand for an inline scalar.
    pub fn simple(value: impl Into<Json>) -> Self {
        WireValue::Simple {
            value: value.into(),
        }
    }

    /// Shorthand for an object reference.
    pub fn reference(object_id: ObjectId) -> Self {
        WireValue::Reference { object_id }
    }

    /// The referenced object ID, if any.
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            WireValue::Simple { .. } => None,
            WireValue::Reference { object_id } => Some(*object_id),
        }
    }
}

/// Named properties of an object or function surface.
pub type ObjectMap = BTreeMap<String, WireValue>;

/// Out-of-band description of a tracked composite value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComplexStructure {
    /// A callable: its static property surface plus the method names its
    /// constructed instances share.
    Function {
        map: ObjectMap,
        #[serde(rename = "instanceFuncs")]
        instance_funcs: Vec<String>,
    },
    /// A data object. `funcs` lists instance method names (names only, the
    /// bodies are shared per class); `array` holds positional elements when
    /// the object is an ordered sequence.
    Object {
        map: ObjectMap,
        funcs: Vec<String>,
        array: Option<Vec<WireValue>>,
    },
}

impl ComplexStructure {
    /// Object IDs directly referenced by this structure.
    pub fn references(&self) -> Vec<ObjectId> {
        let mut ids = Vec::new();
        let mut add = |values: &mut dyn Iterator<Item = &WireValue>| {
            for value in values {
                if let Some(id) = value.object_id() {
                    ids.push(id);
                }
            }
        };
        match self {
            ComplexStructure::Function { map, .. } => add(&mut map.values()),
            ComplexStructure::Object { map, array, .. } => {
                add(&mut map.values());
                if let Some(array) = array {
                    add(&mut array.iter());
                }
            }
        }
        ids
    }
}

/// Structures newly disclosed to a peer, keyed by object ID.
pub type StructureMap = BTreeMap<ObjectId, ComplexStructure>;

/// Explicit string-keyed (de)serialization for `ObjectId`-keyed maps.
///
/// JSON object keys are always strings on the wire; serde_json converts
/// `u64` keys transparently, but only on its direct path. Packets that pass
/// through `#[serde(flatten)]`/`#[serde(untagged)]` are buffered through
/// serde's internal `Content` representation, which hands the key to the
/// `u64` deserializer as a string and fails. Routing these maps through
/// string keys keeps the wire format identical while making both paths work.
pub mod string_keys {
    use std::collections::BTreeMap;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::ObjectId;

    pub fn serialize<V, S>(map: &BTreeMap<ObjectId, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        V: Serialize,
        S: Serializer,
    {
        serializer.collect_map(map.iter().map(|(id, value)| (id.to_string(), value)))
    }

    pub fn deserialize<'de, V, D>(deserializer: D) -> Result<BTreeMap<ObjectId, V>, D::Error>
    where
        V: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, V>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(key, value)| {
                key.parse::<ObjectId>()
                    .map(|id| (id, value))
                    .map_err(D::Error::custom)
            })
            .collect()
    }
}

/// Pending property changes for one tracked object. Deletions are listed by
/// name so peers can distinguish "set to null" from "field removed".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectUpdate {
    pub map: ObjectMap,
    pub deleted: Vec<String>,
}

/// A batch of per-object updates plus any structures the receiving peer has
/// not yet seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBundle {
    #[serde(with = "string_keys")]
    pub updates: BTreeMap<ObjectId, ObjectUpdate>,
    #[serde(with = "string_keys")]
    pub new_objects: StructureMap,
}

impl UpdateBundle {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}
