use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use uuid::Uuid;

use crate::codec::FrameCodec;
use crate::frame::{self, Frame};

/// A frame-oriented view of a byte stream.
///
/// Data is read from the stream into the codec's read buffer. When a frame is parsed, the
/// corresponding bytes are removed from the buffer, anything after them stays there for the next
/// call.
pub struct Connection<S = TcpStream> {
    pub id: Uuid,
    framed: Framed<S, FrameCodec>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Connection<S> {
        Self::with_codec(stream, FrameCodec::new())
    }

    pub fn with_codec(stream: S, codec: FrameCodec) -> Connection<S> {
        Connection {
            id: Uuid::new_v4(),
            framed: Framed::new(stream, codec),
        }
    }

    /// Reads exactly one top-level frame.
    ///
    /// `Ok(Some(frame))` means one message was fully parsed and the stream may carry more.
    /// `Ok(None)` means the peer closed the stream on a frame boundary. A stream that ends inside
    /// a frame is `frame::Error::Incomplete`; transport failures come back as `frame::Error::Io`.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, frame::Error> {
        self.framed.next().await.transpose()
    }

    /// Encodes the frame and flushes it to the stream.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), frame::Error> {
        self.framed.send(frame).await
    }
}
