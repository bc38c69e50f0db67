use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use sluice_protocol::{frame, Packet};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

/// Handle to the connection with the player's current backend server.
///
/// Clones share one writer task, which is the link's single-threaded
/// execution context: frames reach the transport in the order `write` was
/// called, and each `write` resolves only once its frame has been flushed.
#[derive(Clone)]
pub struct ServerLink {
    sender: mpsc::UnboundedSender<WriteOp>,
    open: Arc<AtomicBool>,
}

struct WriteOp {
    frame: BytesMut,
    flushed: oneshot::Sender<()>,
}

impl ServerLink {
    /// Spawns the writer task over `io` and returns the link handle.
    ///
    /// The task ends when every handle is dropped or the transport fails;
    /// either way the link reads as closed afterwards.
    pub fn spawn<W>(io: W) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        let handle = tokio::spawn(write_loop(io, receiver, open.clone()));

        (Self { sender, open }, handle)
    }

    /// Whether the link still accepts writes.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.sender.is_closed()
    }

    /// Marks the link closed. Subsequent writes complete as no-ops.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Encodes `packet` and hands it to the writer task, resolving once the
    /// frame has been flushed to the transport.
    ///
    /// Writing on a closed link (including one that closes mid-write) is a
    /// successful no-op; only encoding itself can fail.
    pub async fn write(&self, packet: &dyn Packet) -> anyhow::Result<()> {
        if !self.is_open() {
            return Ok(());
        }

        let mut buf = BytesMut::new();
        frame::encode_packet(&mut buf, packet)?;

        let (flushed, done) = oneshot::channel();
        let op = WriteOp {
            frame: buf,
            flushed,
        };

        if self.sender.send(op).is_err() {
            // Writer already gone.
            return Ok(());
        }

        // A dropped sender means the link died mid-write; the packet is
        // gone, which still counts as completion.
        let _ = done.await;
        Ok(())
    }
}

async fn write_loop<W>(
    mut io: W,
    mut receiver: mpsc::UnboundedReceiver<WriteOp>,
    open: Arc<AtomicBool>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(op) = receiver.recv().await {
        let result = async {
            io.write_all(&op.frame).await?;
            io.flush().await
        }
        .await;

        if let Err(e) = result {
            debug!("backend link write failed: {e}");
            open.store(false, Ordering::Release);
            break;
        }

        let _ = op.flushed.send(());
    }

    open.store(false, Ordering::Release);
}

/// The slice of a player session the chat pipeline needs: access to the link
/// for whichever backend server the player is currently connected to.
///
/// The queue resolves the link when each task runs, not at enqueue time, so
/// queued tasks follow the player across server switches.
pub trait Player: Send + Sync {
    /// The link to the player's current backend server, if connected.
    fn current_server(&self) -> Option<ServerLink>;
}
