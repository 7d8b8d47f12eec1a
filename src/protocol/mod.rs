//! Wire protocol: message vocabulary and line framing.
//!
//! Every message is one newline-terminated JSON text. Requests carry a
//! `msgID` echoed by the matching response; a packet without `msgID` is a
//! server-initiated push.

mod framing;
mod message;

pub use framing::{LineBuffer, DEFAULT_MAX_LINE_BYTES};
pub use message::{
    CallArg, FunctionRef, PushBody, Request, RequestBody, Response, ResponseBody, ServerPacket,
};
