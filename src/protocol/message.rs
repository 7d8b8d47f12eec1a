//! Request/response/push message types.
//!
//! Field names on the wire are camelCase. `msgID` correlation: responses
//! echo the request's ID; push packets carry none.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::structure::{ObjectId, StructureMap, UpdateBundle, WireValue};

/// Identifies the callable a peer wants invoked: either a named function
/// looked up on a tracked object, or a directly tracked function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FunctionRef {
    Property {
        #[serde(rename = "objectID")]
        object_id: ObjectId,
        #[serde(rename = "funcName")]
        func_name: String,
    },
    Object {
        #[serde(rename = "funcObjectID")]
        func_object_id: ObjectId,
    },
}

/// A call argument: inline data, or an object ID the peer already holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallArg {
    Raw {
        arg: Json,
    },
    Reference {
        #[serde(rename = "objectID")]
        object_id: ObjectId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestBody {
    Init,
    CallFunc {
        #[serde(rename = "functionRef")]
        function_ref: FunctionRef,
        args: Vec<CallArg>,
    },
    CreateInstance {
        #[serde(rename = "instanceID")]
        instance_id: u64,
        #[serde(rename = "constructorRef")]
        constructor_ref: FunctionRef,
        args: Vec<CallArg>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "msgID")]
    pub msg_id: u64,
    #[serde(flatten)]
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBody {
    Init {
        value: WireValue,
        #[serde(rename = "newObjects", with = "crate::structure::string_keys")]
        new_objects: StructureMap,
        #[serde(rename = "identityPropertyName")]
        identity_property_name: String,
    },
    CallFuncResult {
        value: WireValue,
        #[serde(rename = "newObjects", with = "crate::structure::string_keys")]
        new_objects: StructureMap,
        #[serde(rename = "updateBundle", skip_serializing_if = "Option::is_none")]
        update_bundle: Option<UpdateBundle>,
    },
    CreateInstanceResult {
        value: WireValue,
        #[serde(rename = "newObjects", with = "crate::structure::string_keys")]
        new_objects: StructureMap,
        #[serde(rename = "updateBundle", skip_serializing_if = "Option::is_none")]
        update_bundle: Option<UpdateBundle>,
    },
    Error {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "msgID")]
    pub msg_id: u64,
    #[serde(flatten)]
    pub body: ResponseBody,
}

/// Server-initiated packet, not correlated to any request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushBody {
    Update {
        #[serde(rename = "updateBundle")]
        update_bundle: UpdateBundle,
    },
}

/// Any packet a client can receive. Discriminated by the presence of
/// `msgID`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerPacket {
    Response(Response),
    Push(PushBody),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_request_shape() {
        let request = Request {
            msg_id: 1,
            body: RequestBody::Init,
        };
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"msgID":1,"type":"init"}"#
        );
    }

    #[test]
    fn call_func_request_shape() {
        let request = Request {
            msg_id: 2,
            body: RequestBody::CallFunc {
                function_ref: FunctionRef::Property {
                    object_id: 1,
                    func_name: "set".into(),
                },
                args: vec![
                    CallArg::Raw { arg: "x".into() },
                    CallArg::Reference { object_id: 9 },
                ],
            },
        };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(
            json,
            r#"{"msgID":2,"type":"call_func","functionRef":{"objectID":1,"funcName":"set"},"args":[{"type":"raw","arg":"x"},{"type":"reference","objectID":9}]}"#
        );
        let back: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn function_ref_variants_are_distinguished() {
        let by_prop: FunctionRef =
            serde_json::from_str(r#"{"objectID":3,"funcName":"get"}"#).unwrap();
        assert!(matches!(by_prop, FunctionRef::Property { .. }));

        let by_object: FunctionRef = serde_json::from_str(r#"{"funcObjectID":5}"#).unwrap();
        assert!(matches!(
            by_object,
            FunctionRef::Object { func_object_id: 5 }
        ));
    }

    #[test]
    fn create_instance_request_shape() {
        let request = Request {
            msg_id: 3,
            body: RequestBody::CreateInstance {
                instance_id: 281474976710657,
                constructor_ref: FunctionRef::Object { func_object_id: 2 },
                args: vec![],
            },
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains(r#""type":"create_instance""#));
        assert!(json.contains(r#""instanceID":281474976710657"#));
        assert!(json.contains(r#""constructorRef":{"funcObjectID":2}"#));
    }

    #[test]
    fn error_response_round_trip() {
        let response = Response {
            msg_id: 4,
            body: ResponseBody::Error {
                error: "Unknown object ID: 17".into(),
            },
        };
        let json = serde_json::to_string(&response).unwrap();
        assert_eq!(json, r#"{"msgID":4,"type":"error","error":"Unknown object ID: 17"}"#);
        let back: ServerPacket = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ServerPacket::Response(response));
    }

    #[test]
    fn push_packet_has_no_msg_id() {
        let json = r#"{"type":"update","updateBundle":{"updates":{},"newObjects":{}}}"#;
        let packet: ServerPacket = serde_json::from_str(json).unwrap();
        assert!(matches!(packet, ServerPacket::Push(PushBody::Update { .. })));
    }

    #[test]
    fn call_result_omits_empty_update_bundle() {
        let response = Response {
            msg_id: 5,
            body: ResponseBody::CallFuncResult {
                value: WireValue::simple("done"),
                new_objects: StructureMap::new(),
                update_bundle: None,
            },
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("updateBundle"));
        let back: ServerPacket = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ServerPacket::Response(response));
    }
}
