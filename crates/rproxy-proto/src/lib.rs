//! Wire format for the reverse SOCKS5 proxy's control and data channels.
//!
//! Every channel between a client and the server — control or data — speaks
//! the same length-prefixed frame:
//!
//! ```text
//! +----------+------+--------------+--------+-----+------+
//! | Length   | Type | SerialNumber | UriLen | Uri | Data |
//! | 4B BE    | 1B   | 8B BE        | 1B     | ... | ...  |
//! +----------+------+--------------+--------+-----+------+
//! ```
//!
//! `Length` counts every byte that follows it (`Type` through `Data`).

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use core::fmt;
use tokio_util::codec::{Decoder, Encoder};

/// Bytes preceding `Data` in an encoded frame: 1 (Type) + 8 (SerialNumber) + 1 (UriLen).
const HEADER_SIZE: usize = 1 + 8 + 1;
const LENGTH_FIELD_SIZE: usize = 4;

/// Control-direction frames (the persistent client↔server control channel) may be up to 2 MiB.
pub const MAX_CONTROL_FRAME_SIZE: usize = 2 * 1024 * 1024;
/// Data-direction frames (data channels carrying TRANSFER payload) may be up to 1 MiB.
pub const MAX_DATA_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug)]
pub enum Error {
    PacketOversized { size: usize, max: usize },
    NotEnoughBytes { name: &'static str, received: usize, expected: usize },
    InvalidPacket { field: &'static str, reason: &'static str },
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::PacketOversized { size, max } => {
                write!(f, "frame oversized: max is {max}, got {size}")
            }
            Error::NotEnoughBytes { name, received, expected } => {
                write!(f, "not enough bytes to decode {name}: received {received}, expected {expected}")
            }
            Error::InvalidPacket { field, reason } => {
                write!(f, "invalid `{field}` in frame: {reason}")
            }
        }
    }
}

macro_rules! ensure_size {
    ($buf:ident[$expected:expr] for $name:expr) => {{
        let received = $buf.len();
        let expected = $expected;
        if received < expected {
            return Err(Error::NotEnoughBytes { name: $name, received, expected });
        }
    }};
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Auth,
    Connect,
    Disconnect,
    Transfer,
    Heartbeat,
}

impl FrameType {
    fn as_u8(self) -> u8 {
        match self {
            FrameType::Auth => 0x01,
            FrameType::Connect => 0x03,
            FrameType::Disconnect => 0x04,
            FrameType::Transfer => 0x05,
            FrameType::Heartbeat => 0x07,
        }
    }
}

impl TryFrom<u8> for FrameType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::Auth),
            0x03 => Ok(FrameType::Connect),
            0x04 => Ok(FrameType::Disconnect),
            0x05 => Ok(FrameType::Transfer),
            0x07 => Ok(FrameType::Heartbeat),
            _ => Err(Error::InvalidPacket { field: "type", reason: "unknown frame type" }),
        }
    }
}

/// One length-prefixed protocol unit.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub ty: FrameType,
    pub serial: u64,
    pub uri: String,
    pub data: Bytes,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("ty", &self.ty)
            .field("serial", &self.serial)
            .field("uri", &self.uri)
            .field("data_len", &self.data.len())
            .finish()
    }
}

impl Frame {
    pub fn new(ty: FrameType, uri: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self { ty, serial: 0, uri: uri.into(), data: data.into() }
    }

    pub fn with_serial(ty: FrameType, serial: u64, uri: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self { ty, serial, uri: uri.into(), data: data.into() }
    }

    pub fn heartbeat(serial: u64) -> Self {
        Self { ty: FrameType::Heartbeat, serial, uri: String::new(), data: Bytes::new() }
    }

    pub fn auth(client_key: impl Into<String>) -> Self {
        Self::new(FrameType::Auth, client_key, Bytes::new())
    }

    pub fn disconnect(user_id: impl Into<String>) -> Self {
        Self::new(FrameType::Disconnect, user_id, Bytes::new())
    }

    pub fn transfer(user_id: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Transfer, user_id, data)
    }

    /// Number of bytes this frame occupies on the wire, including the length field itself.
    pub fn wire_size(&self) -> usize {
        LENGTH_FIELD_SIZE + HEADER_SIZE + self.uri.len() + self.data.len()
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        let uri_len = u8::try_from(self.uri.len()).map_err(|_| Error::InvalidPacket {
            field: "uri",
            reason: "longer than 255 bytes",
        })?;

        let body_len = HEADER_SIZE + self.uri.len() + self.data.len();
        let total_len = LENGTH_FIELD_SIZE + body_len;
        buf.reserve(total_len);

        buf.put_u32(u32::try_from(body_len).map_err(|_| Error::PacketOversized { size: body_len, max: u32::MAX as usize })?);
        buf.put_u8(self.ty.as_u8());
        buf.put_u64(self.serial);
        buf.put_u8(uri_len);
        buf.put_slice(self.uri.as_bytes());
        buf.put_slice(&self.data);

        Ok(())
    }

    /// Decode a frame body (everything after the length field, exactly `body_len` bytes).
    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(buf[HEADER_SIZE] for "frame header");

        let ty = FrameType::try_from(buf.get_u8())?;
        let serial = buf.get_u64();
        let uri_len = usize::from(buf.get_u8());

        ensure_size!(buf[uri_len] for "uri");
        let uri_bytes = buf.split_to(uri_len);
        let uri = String::from_utf8(uri_bytes.to_vec()).map_err(|_| Error::InvalidPacket {
            field: "uri",
            reason: "not valid UTF-8",
        })?;

        let data = buf;

        Ok(Self { ty, serial, uri, data })
    }
}

/// Stream codec enforcing a direction-specific maximum frame size.
///
/// Construct [`FrameCodec::control`] for the persistent control channel (2 MiB cap)
/// and [`FrameCodec::data`] for data channels carrying TRANSFER payload (1 MiB cap).
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn control() -> Self {
        Self { max_frame_size: MAX_CONTROL_FRAME_SIZE }
    }

    pub fn data() -> Self {
        Self { max_frame_size: MAX_DATA_FRAME_SIZE }
    }

    /// Re-caps an already-constructed codec once the socket's role is known. Every client-facing
    /// listener accepts a connection before it can tell a control channel from a data channel
    /// (the distinguishing signal is the first frame's type), so it starts out capped at the
    /// control size and narrows to the data size once classified.
    pub fn set_max_frame_size(&mut self, max: usize) {
        self.max_frame_size = max;
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_FIELD_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; LENGTH_FIELD_SIZE];
        length_bytes.copy_from_slice(&src[..LENGTH_FIELD_SIZE]);
        let body_len = u32::from_be_bytes(length_bytes) as usize;

        if body_len > self.max_frame_size {
            return Err(Error::PacketOversized { size: body_len, max: self.max_frame_size });
        }

        let total_len = LENGTH_FIELD_SIZE + body_len;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_FIELD_SIZE);
        let body = src.split_to(body_len).freeze();

        Frame::decode(body).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.wire_size() - LENGTH_FIELD_SIZE > self.max_frame_size {
            return Err(Error::PacketOversized { size: item.wire_size(), max: self.max_frame_size });
        }

        item.encode(dst)
    }
}
