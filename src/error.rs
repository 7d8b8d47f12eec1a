//! Error types for objwire.

use thiserror::Error;

use crate::structure::ObjectId;

/// Main error type for all objwire operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the underlying byte stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Framing-level protocol violation. Fatal to the connection.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An object ID that was reclaimed or never existed. Per-request.
    #[error("Unknown object ID: {0}")]
    UnknownObject(ObjectId),

    /// A scalar was used where a trackable object/function was required.
    #[error("Value is not trackable")]
    NotTrackable,

    /// A function reference did not resolve to a callable.
    #[error("Not callable: {0}")]
    NotCallable(String),

    /// A constructor reference did not resolve to a constructor.
    #[error("Not constructible: {0}")]
    NotConstructible(String),

    /// The invoked user function itself failed.
    #[error("Application error: {0}")]
    Application(String),

    /// An error response received from the remote side.
    #[error("Remote error: {0}")]
    Remote(String),

    /// A response packet did not match the pending request's expected kind.
    #[error("Invalid response shape: expected {expected}")]
    InvalidResponseShape { expected: &'static str },

    /// Connection closed while a request was in flight.
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
