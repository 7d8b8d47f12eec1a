//! Request/response plumbing shared by the client.
//!
//! Outbound requests get a fresh `msgID` and a oneshot slot; the read loop
//! routes each response to its slot by ID and hands pushes to a callback.
//! Responses may arrive in any order relative to other requests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::codec::JsonCodec;
use crate::error::{Error, Result};
use crate::protocol::{LineBuffer, PushBody, Request, RequestBody, ResponseBody, ServerPacket};

pub(crate) type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<ResponseBody>>>>;

/// Sender half of a client connection.
pub(crate) struct Base {
    writer: crate::writer::WriterHandle,
    pending: PendingMap,
    next_msg_id: AtomicU64,
}

impl Base {
    pub(crate) fn new(writer: crate::writer::WriterHandle, pending: PendingMap) -> Self {
        Base {
            writer,
            pending,
            next_msg_id: AtomicU64::new(0),
        }
    }

    /// Send one request and wait for its response.
    ///
    /// A remote `error` response comes back as [`Error::Remote`]. A dropped
    /// connection fails every in-flight request with
    /// [`Error::ConnectionClosed`].
    pub(crate) async fn request(&self, body: RequestBody) -> Result<ResponseBody> {
        let msg_id = self.next_msg_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(msg_id, tx);

        if let Err(e) = self.writer.send(&Request { msg_id, body }).await {
            self.pending.lock().unwrap().remove(&msg_id);
            return Err(e);
        }

        let body = rx.await.map_err(|_| Error::ConnectionClosed)?;
        match body {
            ResponseBody::Error { error } => Err(Error::Remote(error)),
            body => Ok(body),
        }
    }
}

/// Read loop for a client connection.
///
/// Runs until the stream ends or a framing error occurs, then drops every
/// pending slot so waiting requests fail fast.
pub(crate) async fn read_loop<R, F>(mut read: R, pending: PendingMap, on_push: F)
where
    R: AsyncRead + Unpin,
    F: Fn(PushBody),
{
    let mut framing = LineBuffer::new();
    let mut buf = vec![0u8; 8 * 1024];

    'connection: loop {
        let n = match read.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "client read failed");
                break;
            }
        };
        let lines = match framing.push(&buf[..n]) {
            Ok(lines) => lines,
            Err(e) => {
                warn!(error = %e, "client framing error");
                break;
            }
        };
        for line in lines {
            match JsonCodec::decode::<ServerPacket>(&line) {
                Ok(ServerPacket::Response(response)) => {
                    match pending.lock().unwrap().remove(&response.msg_id) {
                        // The requester may have given up; that is fine.
                        Some(tx) => {
                            let _ = tx.send(response.body);
                        }
                        None => warn!(msg_id = response.msg_id, "response with no waiter"),
                    }
                }
                Ok(ServerPacket::Push(push)) => on_push(push),
                Err(e) => {
                    warn!(error = %e, "unparseable packet from server");
                    break 'connection;
                }
            }
        }
    }

    pending.lock().unwrap().clear();
}
