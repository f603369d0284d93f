use bytes::{Buf, BytesMut};
use std::io::Cursor;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{self, Frame};

/// Default upper bound for the bytes a single frame may occupy in the read buffer.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// Turns a byte stream into frames and frames back into bytes.
///
/// `decode` yields `Ok(Some(frame))` once a complete top-level frame is buffered and `Ok(None)`
/// while it still needs bytes. When the stream ends between frames the framed stream yields
/// `None`; when it ends in the middle of one, `decode_eof` reports `frame::Error::Incomplete`.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = frame::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&src[..]);
        let frame = match Frame::parse(&mut cursor) {
            Ok(frame) => frame,
            // Not enough data to parse a frame. Refuse to keep buffering past the limit, a peer
            // could otherwise grow the buffer without ever finishing the frame.
            Err(frame::Error::Incomplete) => {
                if src.len() > self.max_frame_size {
                    return Err(frame::Error::FrameTooLarge(self.max_frame_size));
                }
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let position = cursor.position() as usize;

        // Remove the parsed frame from the buffer.
        src.advance(position);

        Ok(Some(frame))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(frame::Error::Incomplete),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = frame::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write_to(dst)
    }
}

impl<'a> Encoder<&'a Frame> for FrameCodec {
    type Error = frame::Error;

    fn encode(&mut self, item: &'a Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write_to(dst)
    }
}
