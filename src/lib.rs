//! Transparent remote-object protocol over any byte stream.
//!
//! A server exposes a graph of live values: plain objects, arrays, async
//! functions, and class-like constructors. Clients connect over any
//! `AsyncRead + AsyncWrite` transport and receive an identity-preserving
//! mirror of that graph. Composite values travel as integer object IDs with
//! their structures disclosed out-of-band, at most once per peer; scalars
//! travel inline.
//!
//! Calls are plain request/response: the client names a function by object
//! ID (or by property name on an object it holds), the server invokes the
//! live callable and reflects the result. Objects opted into mutation
//! synchronization with [`sync_value`] additionally broadcast property
//! changes, so every peer's mirror follows the server's state.
//!
//! # Wire format
//!
//! Newline-delimited JSON. Requests carry a `msgID` that the matching
//! response echoes; packets without `msgID` are server-initiated update
//! pushes. See the [`protocol`] module for the message vocabulary.
//!
//! # Example
//!
//! ```no_run
//! use objwire::{Client, HostValue, ObjectHandle, Server};
//!
//! #[tokio::main]
//! async fn main() -> objwire::Result<()> {
//!     let root = ObjectHandle::new();
//!     root.set(
//!         "greet",
//!         HostValue::function(|_args| async { Ok(HostValue::String("hi".into())) }),
//!     );
//!     let server = Server::builder(root).build();
//!
//!     let (peer, stream) = tokio::io::duplex(64 * 1024);
//!     tokio::spawn(async move { server.handle_connection(stream).await });
//!
//!     let client = Client::connect(peer).await?;
//!     let root = client.root_object().expect("root is an object");
//!     let reply = root.call("greet", vec![]).await?;
//!     assert_eq!(reply.as_str(), Some("hi"));
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod error;
pub mod protocol;
pub mod server;
pub mod structure;
pub mod structurer;
pub mod tracker;
pub mod value;
pub mod writer;

pub use client::{Client, ClientArg, ClientValue, RemoteKind, RemoteObject};
pub use error::{Error, Result};
pub use server::{Server, ServerBuilder, DEFAULT_IDENTITY_PROPERTY};
pub use structure::{
    ComplexStructure, ObjectId, ObjectUpdate, StructureMap, UpdateBundle, WireValue,
};
pub use structurer::{Structurer, PROP_MARKER};
pub use tracker::{Holder, Tracker};
pub use value::{
    sync_value, ArrayHandle, ClassBuilder, FunctionHandle, HostValue, MethodTable, ObjectHandle,
};
