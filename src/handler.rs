use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error as ThisError;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::{FrameCodec, DEFAULT_MAX_FRAME_SIZE};
use crate::connection::Connection;
use crate::frame::{self, Frame};

#[derive(Debug, ThisError)]
pub enum HandlerError {
    #[error("handler already closed")]
    AlreadyClosed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Everything the server hands to a handler alongside an accepted connection.
#[derive(Debug, Clone)]
pub struct ConnContext {
    pub id: Uuid,
    pub peer: String,
    /// Cancelled when the server finishes shutting down.
    pub token: CancellationToken,
    /// Deadline for a single read or write.
    pub timeout: Duration,
    /// Read buffer limit for a single frame.
    pub max_frame_size: usize,
}

/// Business logic bound to a listener.
///
/// `handle` runs once per accepted connection, concurrently with every other connection of the
/// same listener, and owns the connection until it returns. `close` is called at most once by the
/// server, during shutdown, and must terminate every connection the handler still tracks.
pub trait Handler<C>: Send + Sync + 'static {
    fn handle(&self, ctx: ConnContext, conn: C) -> impl Future<Output = ()> + Send;

    fn close(&self) -> Result<(), HandlerError>;
}

/// Writes every frame it decodes back to the peer.
#[derive(Debug, Default)]
pub struct EchoHandler {
    closing: AtomicBool,
    conns: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl EchoHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections currently being served.
    pub fn connections(&self) -> usize {
        self.conns().len()
    }

    /// Cancels every tracked connection. New connections are dropped from now on.
    pub fn close(&self) -> Result<(), HandlerError> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Err(HandlerError::AlreadyClosed);
        }

        let conns = self.conns();
        info!(connections = conns.len(), "closing echo handler");
        for token in conns.values() {
            token.cancel();
        }

        Ok(())
    }

    fn conns(&self) -> MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.conns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers the connection and returns the token `close` cancels, or `None` when the handler
    /// is already closing.
    fn track(&self, ctx: &ConnContext) -> Option<CancellationToken> {
        let mut conns = self.conns();
        // Checked under the lock so a concurrent `close` cannot miss this connection.
        if self.closing.load(Ordering::SeqCst) {
            return None;
        }
        let token = ctx.token.child_token();
        conns.insert(ctx.id, token.clone());
        Some(token)
    }

    async fn echo<C>(
        &self,
        ctx: &ConnContext,
        token: &CancellationToken,
        stream: C,
    ) -> Result<(), frame::Error>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let codec = FrameCodec::with_max_frame_size(ctx.max_frame_size);
        let mut conn = Connection::with_codec(stream, codec);

        loop {
            let read = tokio::select! {
                _ = token.cancelled() => {
                    debug!("connection cancelled");
                    return Ok(());
                }
                read = time::timeout(ctx.timeout, conn.read_frame()) => read,
            };

            let frame = match read {
                Ok(frame) => frame?,
                Err(_) => {
                    debug!("connection idle for {:?}, closing", ctx.timeout);
                    return Ok(());
                }
            };

            let Some(frame) = frame else {
                return Ok(());
            };

            debug!("received frame: {}", frame);
            write_frame(&mut conn, &frame, ctx.timeout).await?;
        }
    }
}

async fn write_frame<C>(
    conn: &mut Connection<C>,
    frame: &Frame,
    timeout: Duration,
) -> Result<(), frame::Error>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    time::timeout(timeout, conn.write_frame(frame))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))?
}

impl<C> Handler<C> for EchoHandler
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn handle(&self, ctx: ConnContext, conn: C) -> impl Future<Output = ()> + Send {
        async move {
            let Some(token) = self.track(&ctx) else {
                debug!("handler is closing, dropping connection");
                return;
            };

            match self.echo(&ctx, &token, conn).await {
                Ok(()) => info!("connection closed"),
                Err(frame::Error::Io(err)) if err.kind() == io::ErrorKind::ConnectionReset => {
                    debug!("connection reset by peer")
                }
                Err(err) => warn!(error = %err, "connection error"),
            }

            self.conns().remove(&ctx.id);
        }
    }

    fn close(&self) -> Result<(), HandlerError> {
        EchoHandler::close(self)
    }
}
