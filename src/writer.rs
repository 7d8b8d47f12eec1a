//! Dedicated writer task owning the socket's write half.
//!
//! All outbound traffic for a connection funnels through one mpsc channel
//! into a single task, so responses and pushed updates from different
//! request handlers never interleave mid-line. The task batches lines that
//! are already queued into a single vectored write.

use std::io::IoSlice;

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::JsonCodec;
use crate::error::{Error, Result};

/// Default channel capacity. A full channel makes senders wait, which is
/// the backpressure story for a slow peer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Maximum lines to coalesce into a single vectored write.
const MAX_BATCH_SIZE: usize = 64;

/// Handle for queueing encoded lines onto a connection's writer task.
///
/// Cheaply cloneable; clones share the same channel.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
}

impl WriterHandle {
    /// Encode a message as one newline-terminated JSON line and queue it.
    ///
    /// Waits when the channel is full. Fails with [`Error::ConnectionClosed`]
    /// once the writer task has gone away.
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        let line = Bytes::from(JsonCodec::encode_line(message)?);
        self.tx
            .send(line)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

}

/// Spawn the writer task for a connection's write half.
///
/// Returns the sending handle and the task's join handle. The task exits
/// cleanly when every [`WriterHandle`] clone has been dropped.
pub fn spawn_writer_task<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
    let handle = WriterHandle { tx };
    let task = tokio::spawn(writer_loop(rx, writer));
    (handle, task)
}

async fn writer_loop<W>(mut rx: mpsc::Receiver<Bytes>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(line) => line,
            None => {
                // All handles dropped: close our direction so the peer
                // observes EOF.
                let _ = writer.shutdown().await;
                return Ok(());
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(line) => batch.push(line),
                Err(_) => break,
            }
        }

        write_batch(&mut writer, &batch).await?;
    }
}

/// Write a batch of lines with a vectored write, falling back to a
/// continuation loop on a partial write.
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total: usize = batch.iter().map(|line| line.len()).sum();
    let slices: Vec<IoSlice<'_>> = batch.iter().map(|line| IoSlice::new(line)).collect();

    let mut written = writer.write_vectored(&slices).await?;
    if written == 0 && total > 0 {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "write_vectored returned 0",
        )));
    }

    while written < total {
        let slices = remaining_slices(batch, written);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        written += n;
    }

    writer.flush().await?;
    Ok(())
}

fn remaining_slices(batch: &[Bytes], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;
    for line in batch {
        let end = offset + line.len();
        if skip_bytes < end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&line[start..]));
        }
        offset = end;
    }
    slices
}
