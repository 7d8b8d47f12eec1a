//! Structural reflection: turning a live [`HostValue`] into wire-safe
//! descriptions.
//!
//! The structurer is the leaf of the core: it never stores state of its own.
//! Identity assignment is delegated through [`TrackSink`], which the tracker
//! implements, so reflecting the same live handle twice always yields the
//! same object ID.

use serde_json::Value as Json;

use crate::error::{Error, Result};
use crate::structure::{ComplexStructure, ObjectId, ObjectMap, WireValue};
use crate::value::HostValue;

/// Reserved marker character: property names starting with it are excluded
/// from reflection unless the embedder opts in.
pub const PROP_MARKER: char = '_';

/// Callback used to assign/look up identities for composite values
/// discovered during reflection.
pub(crate) trait TrackSink {
    fn track(&mut self, value: &HostValue) -> ObjectId;
}

/// Reflects host values into [`WireValue`]s and [`ComplexStructure`]s.
#[derive(Debug, Clone)]
pub struct Structurer {
    identity_property: String,
    include_marked: bool,
}

impl Structurer {
    pub fn new(identity_property: impl Into<String>, include_marked: bool) -> Self {
        Structurer {
            identity_property: identity_property.into(),
            include_marked,
        }
    }

    pub fn identity_property(&self) -> &str {
        &self.identity_property
    }

    /// Reflect a value: scalars inline, composites as references.
    pub(crate) fn value(&self, value: &HostValue, sink: &mut dyn TrackSink) -> WireValue {
        match value {
            HostValue::Null => WireValue::simple(Json::Null),
            HostValue::Bool(b) => WireValue::simple(*b),
            HostValue::Number(n) => WireValue::Simple {
                value: serde_json::Number::from_f64(*n)
                    .map(Json::Number)
                    .unwrap_or(Json::Null),
            },
            HostValue::String(s) => WireValue::simple(s.clone()),
            composite => WireValue::reference(sink.track(composite)),
        }
    }

    /// Compute the out-of-band structure of a composite value.
    pub(crate) fn complex(
        &self,
        value: &HostValue,
        sink: &mut dyn TrackSink,
    ) -> Result<ComplexStructure> {
        match value {
            HostValue::Object(object) => {
                let funcs = match object.methods() {
                    Some(table) => self.filter_names(table.method_names()),
                    None => Vec::new(),
                };
                let mut map = ObjectMap::new();
                for (name, prop) in object.props_snapshot() {
                    if !self.include_prop(&name) || funcs.contains(&name) {
                        continue;
                    }
                    map.insert(name, self.value(&prop, sink));
                }
                Ok(ComplexStructure::Object {
                    map,
                    funcs,
                    array: None,
                })
            }
            HostValue::Array(array) => {
                let elements = array
                    .elements_snapshot()
                    .iter()
                    .map(|element| self.value(element, sink))
                    .collect();
                let mut map = ObjectMap::new();
                for (name, prop) in array.props_snapshot() {
                    // Numeric index names belong to the element list.
                    if !self.include_prop(&name) || name.parse::<usize>().is_ok() {
                        continue;
                    }
                    map.insert(name, self.value(&prop, sink));
                }
                Ok(ComplexStructure::Object {
                    map,
                    funcs: Vec::new(),
                    array: Some(elements),
                })
            }
            HostValue::Function(function) => {
                let instance_funcs = match function.instance_methods() {
                    Some(table) => self.filter_names(table.method_names()),
                    None => Vec::new(),
                };
                let mut map = ObjectMap::new();
                for (name, prop) in function.props_snapshot() {
                    if !self.include_prop(&name) {
                        continue;
                    }
                    map.insert(name, self.value(&prop, sink));
                }
                Ok(ComplexStructure::Function {
                    map,
                    instance_funcs,
                })
            }
            _ => Err(Error::NotTrackable),
        }
    }

    fn include_prop(&self, name: &str) -> bool {
        if name == self.identity_property {
            return false;
        }
        self.include_marked || !name.starts_with(PROP_MARKER)
    }

    fn filter_names(&self, names: Vec<String>) -> Vec<String> {
        names
            .into_iter()
            .filter(|name| self.include_prop(name))
            .collect()
    }
}
