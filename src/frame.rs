// https://redis.io/docs/reference/protocol-spec

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;
use std::str::Utf8Error;
use thiserror::Error as ThisError;

static CRLF: &[u8; 2] = b"\r\n";

/// Upper bound for the capacity reserved up front when an array header is read. The declared
/// count comes from the peer, so it is not trusted for allocation.
const MAX_PREALLOCATED_ELEMENTS: usize = 1024;

/// Deepest array nesting accepted by the parser and the encoder. Parsing recurses once per level,
/// so the bound keeps a hostile peer from exhausting the stack.
pub const MAX_NESTING_DEPTH: usize = 512;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("not enough data is available to parse an entire frame")]
    Incomplete,
    #[error("invalid frame data type: {0}")]
    InvalidDataType(u8),
    #[error("protocol error; invalid integer {0:?}")]
    InvalidInteger(String),
    #[error("protocol error; invalid length {0:?}")]
    InvalidLength(String),
    #[error("protocol error; bulk string is not terminated by CRLF")]
    MissingTerminator,
    #[error("protocol error; invalid frame format")]
    InvalidFrameFormat,
    #[error("frame size exceeds limit of {0} bytes")]
    FrameTooLarge(usize),
    #[error("protocol error; arrays nested deeper than {0} levels")]
    NestingTooDeep(usize),
    #[error("protocol error; simple string or error contains CR or LF")]
    LineBreakInSimple,
    /// The underlying stream failed. Kept verbatim so callers can inspect the kind.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One RESP2 value.
///
/// Null bulk strings and null arrays are separate variants: `$-1` and `*-1` must stay
/// distinguishable from `$0` and `*0` after a decode/encode cycle.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    NullBulk,
    Array(Vec<Frame>),
    NullArray,
}

// Protocol specification: https://redis.io/docs/reference/protocol-spec/
impl Frame {
    /// Parses exactly one frame, nested frames included, starting at the cursor position.
    ///
    /// On success the cursor points right after the frame. `Error::Incomplete` means the buffer
    /// ends before the frame does; the cursor position is then meaningless and the caller should
    /// retry from the same start once more bytes are available.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Self, Error> {
        Self::parse_at(src, 0)
    }

    fn parse_at(src: &mut Cursor<&[u8]>, depth: usize) -> Result<Self, Error> {
        // The first byte in an RESP-serialized payload always identifies its type.
        // Subsequent bytes constitute the type's contents.
        let first_byte = get_byte(src)?;
        let data_type = DataType::try_from(first_byte)?;

        match data_type {
            DataType::SimpleString => {
                let line = get_line(src)?;
                Ok(Frame::Simple(std::str::from_utf8(line)?.to_string()))
            }
            DataType::SimpleError => {
                let line = get_line(src)?;
                Ok(Frame::Error(std::str::from_utf8(line)?.to_string()))
            }
            DataType::Integer => {
                let line = get_line(src)?;
                let integer = parse_decimal(line).map_err(Error::InvalidInteger)?;
                Ok(Frame::Integer(integer))
            }
            // $<length>\r\n<data>\r\n
            DataType::BulkString => {
                let length = parse_decimal(get_line(src)?).map_err(Error::InvalidLength)?;

                if length < 0 {
                    return Ok(Frame::NullBulk);
                }

                let length = usize::try_from(length)
                    .map_err(|_| Error::InvalidLength(length.to_string()))?;
                let data = Bytes::copy_from_slice(get_exact(src, length)?);

                if get_exact(src, CRLF.len())? != CRLF {
                    return Err(Error::MissingTerminator);
                }

                Ok(Frame::Bulk(data))
            }
            // *<number-of-elements>\r\n<element-1>...<element-n>
            DataType::Array => {
                let count = parse_decimal(get_line(src)?).map_err(Error::InvalidLength)?;

                if count < 0 {
                    return Ok(Frame::NullArray);
                }

                if depth >= MAX_NESTING_DEPTH {
                    return Err(Error::NestingTooDeep(MAX_NESTING_DEPTH));
                }

                let count = usize::try_from(count)
                    .map_err(|_| Error::InvalidLength(count.to_string()))?;
                let mut frames = Vec::with_capacity(count.min(MAX_PREALLOCATED_ELEMENTS));
                for _ in 0..count {
                    frames.push(Self::parse_at(src, depth + 1)?);
                }

                Ok(Frame::Array(frames))
            }
        }
    }

    /// Appends the canonical encoding of the frame to `dst`.
    ///
    /// Values the parser would read back differently are refused before anything is written:
    /// simple strings and errors carrying CR or LF, and arrays nested past [`MAX_NESTING_DEPTH`].
    pub fn write_to(&self, dst: &mut BytesMut) -> Result<(), Error> {
        self.check_encodable(0)?;
        self.put(dst);
        Ok(())
    }

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        let mut bytes = BytesMut::new();
        self.write_to(&mut bytes)?;
        Ok(bytes.to_vec())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Frame::NullBulk | Frame::NullArray)
    }

    fn check_encodable(&self, depth: usize) -> Result<(), Error> {
        match self {
            Frame::Simple(s) | Frame::Error(s) => {
                if s.bytes().any(|b| b == b'\r' || b == b'\n') {
                    return Err(Error::LineBreakInSimple);
                }
                Ok(())
            }
            Frame::Array(arr) => {
                if depth >= MAX_NESTING_DEPTH {
                    return Err(Error::NestingTooDeep(MAX_NESTING_DEPTH));
                }
                arr.iter()
                    .try_for_each(|frame| frame.check_encodable(depth + 1))
            }
            _ => Ok(()),
        }
    }

    fn put(&self, dst: &mut BytesMut) {
        match self {
            Frame::Simple(s) => {
                dst.put_u8(u8::from(DataType::SimpleString));
                dst.put_slice(s.as_bytes());
                dst.put_slice(CRLF);
            }
            Frame::Error(s) => {
                dst.put_u8(u8::from(DataType::SimpleError));
                dst.put_slice(s.as_bytes());
                dst.put_slice(CRLF);
            }
            Frame::Integer(i) => {
                dst.put_u8(u8::from(DataType::Integer));
                dst.put_slice(i.to_string().as_bytes());
                dst.put_slice(CRLF);
            }
            Frame::Bulk(bytes) => {
                dst.reserve(1 + 20 + CRLF.len() + bytes.len() + CRLF.len());
                dst.put_u8(u8::from(DataType::BulkString));
                dst.put_slice(bytes.len().to_string().as_bytes());
                dst.put_slice(CRLF);
                dst.put_slice(bytes);
                dst.put_slice(CRLF);
            }
            Frame::NullBulk => {
                dst.put_u8(u8::from(DataType::BulkString));
                dst.put_slice(b"-1");
                dst.put_slice(CRLF);
            }
            Frame::Array(arr) => {
                dst.put_u8(u8::from(DataType::Array));
                dst.put_slice(arr.len().to_string().as_bytes());
                dst.put_slice(CRLF);
                // The elements are the whole body; the decoder reads exactly `arr.len()` frames
                // and nothing after them.
                for frame in arr {
                    frame.put(dst);
                }
            }
            Frame::NullArray => {
                dst.put_u8(u8::from(DataType::Array));
                dst.put_slice(b"-1");
                dst.put_slice(CRLF);
            }
        }
    }

}

impl From<&str> for Frame {
    fn from(s: &str) -> Self {
        Frame::Bulk(Bytes::copy_from_slice(s.as_bytes()))
    }
}

// Meant for logs, so binary payloads are rendered lossily and nothing is escaped.
impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Simple(s) => write!(f, "+{}", s),
            Frame::Error(s) => write!(f, "-{}", s),
            Frame::Integer(i) => write!(f, ":{}", i),
            Frame::Bulk(bytes) => write!(f, "${}", String::from_utf8_lossy(bytes)),
            Frame::NullBulk => write!(f, "$-1"),
            Frame::Array(arr) => {
                write!(f, "*{}[", arr.len())?;
                for (i, frame) in arr.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", frame)?;
                }
                write!(f, "]")
            }
            Frame::NullArray => write!(f, "*-1"),
        }
    }
}

/// Returns the bytes up to the next CRLF and moves the cursor past it.
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;
    let buf: &'a [u8] = *src.get_ref();

    let line_end = buf[start..]
        .windows(2)
        .position(|window| window == CRLF)
        .map(|index| start + index)
        .ok_or(Error::Incomplete)?;

    src.set_position((line_end + CRLF.len()) as u64);

    Ok(&buf[start..line_end])
}

fn get_exact<'a>(src: &mut Cursor<&'a [u8]>, n: usize) -> Result<&'a [u8], Error> {
    if src.remaining() < n {
        return Err(Error::Incomplete);
    }

    let start = src.position() as usize;
    let buf: &'a [u8] = *src.get_ref();
    src.advance(n);

    Ok(&buf[start..start + n])
}

fn get_byte(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }
    Ok(src.get_u8())
}

fn parse_decimal(line: &[u8]) -> Result<i64, String> {
    let text = String::from_utf8_lossy(line);
    text.parse::<i64>().map_err(|_| text.into_owned())
}

#[derive(Debug)]
enum DataType {
    SimpleString, // '+'
    SimpleError,  // '-'
    Integer,      // ':'
    BulkString,   // '$'
    Array,        // '*'
}

impl TryFrom<u8> for DataType {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            b'+' => Ok(Self::SimpleString),
            b'-' => Ok(Self::SimpleError),
            b':' => Ok(Self::Integer),
            b'$' => Ok(Self::BulkString),
            b'*' => Ok(Self::Array),
            _ => Err(Error::InvalidDataType(byte)),
        }
    }
}

impl From<DataType> for u8 {
    fn from(value: DataType) -> Self {
        match value {
            DataType::SimpleString => b'+',
            DataType::SimpleError => b'-',
            DataType::Integer => b':',
            DataType::BulkString => b'$',
            DataType::Array => b'*',
        }
    }
}

impl From<Utf8Error> for Error {
    fn from(_src: Utf8Error) -> Error {
        Error::InvalidFrameFormat
    }
}
