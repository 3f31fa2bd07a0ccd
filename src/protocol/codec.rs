use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;
use crate::protocol::packet::{Frame, Magic, PacketType, ARG_SEPARATOR, HEADER_LEN};

/// Largest argument block accepted by default (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Longest admin text command accepted on a broker connection.
pub const MAX_ADMIN_LINE: usize = 4096;

/// Binary frame codec.
///
/// Decoding never consumes bytes until a whole frame is buffered, so a
/// frame may arrive split across any number of reads.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_frame_len: usize,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl PacketCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Append the wire form of `frame` to `dst`.
    pub fn encode_into(&self, frame: &Frame, dst: &mut BytesMut) {
        let body_len = frame.body_len();
        dst.reserve(HEADER_LEN + body_len);
        dst.put_slice(frame.magic().as_bytes());
        dst.put_u32(frame.packet().code());
        dst.put_u32(body_len as u32);
        for (i, arg) in frame.args().iter().enumerate() {
            if i > 0 {
                dst.put_u8(ARG_SEPARATOR);
            }
            dst.put_slice(arg);
        }
    }

    /// Take one complete frame off the front of `src`, if there is one.
    /// An unknown type code is a framing error.
    pub fn try_decode(&self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        match self.try_decode_any(src)? {
            Some(Decoded::Frame(frame)) => Ok(Some(frame)),
            Some(Decoded::Unknown { code, .. }) => Err(CodecError::UnknownPacketType(code)),
            None => Ok(None),
        }
    }

    /// Like [`PacketCodec::try_decode`], but a well-framed packet with an
    /// unknown type code is consumed whole and handed back as
    /// [`Decoded::Unknown`], leaving the stream in sync.
    pub fn try_decode_any(&self, src: &mut BytesMut) -> Result<Option<Decoded>, CodecError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let magic = Magic::from_bytes(&src[0..4]).ok_or_else(|| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&src[0..4]);
            CodecError::BadMagic(raw)
        })?;
        let code = u32::from_be_bytes([src[4], src[5], src[6], src[7]]);
        let body_len = u32::from_be_bytes([src[8], src[9], src[10], src[11]]) as usize;
        if body_len > self.max_frame_len {
            return Err(CodecError::FrameTooLarge {
                len: body_len,
                max: self.max_frame_len,
            });
        }

        let total = HEADER_LEN + body_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut raw = src.split_to(total).freeze();
        let Some(packet) = PacketType::from_code(code) else {
            return Ok(Some(Decoded::Unknown { magic, code }));
        };
        raw.advance(HEADER_LEN);
        Ok(Some(Decoded::Frame(Frame::new(magic, packet, split_args(raw)))))
    }
}

/// One whole frame taken off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame(Frame),
    /// Header and body were intact but the type code means nothing to us.
    Unknown { magic: Magic, code: u32 },
}

/// Split an argument block on NUL without copying. An empty block has no
/// arguments.
fn split_args(body: Bytes) -> Vec<Bytes> {
    if body.is_empty() {
        return Vec::new();
    }
    let mut args = Vec::new();
    let mut start = 0;
    for (i, byte) in body.iter().enumerate() {
        if *byte == ARG_SEPARATOR {
            args.push(body.slice(start..i));
            start = i + 1;
        }
    }
    args.push(body.slice(start..));
    args
}

impl Decoder for PacketCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        self.try_decode(src)
    }
}

impl Encoder<Frame> for PacketCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        self.encode_into(&frame, dst);
        Ok(())
    }
}

/// Wire bytes for a single frame.
pub fn encode_frame(frame: &Frame) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + frame.body_len());
    PacketCodec::default().encode_into(frame, &mut buf);
    buf.freeze()
}

/// Accumulates raw chunks from a byte stream and hands back whole frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
    codec: PacketCodec,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            codec: PacketCodec::new(max_frame_len),
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// `Ok(None)` means more bytes are needed; the buffer is left as it was.
    pub fn try_extract_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        self.codec.try_decode(&mut self.buf)
    }

    /// Bytes buffered but not yet part of an extracted frame.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// What a broker connection can receive: binary frames, or admin text
/// commands (any line whose first byte is not NUL).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Packet(Frame),
    /// A well-framed packet with a type code we do not know.
    Unknown { magic: Magic, code: u32 },
    Admin(String),
}

/// What the broker writes back to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Packet(Frame),
    Text(String),
}

/// Broker-side codec: binary frames plus the admin text protocol.
#[derive(Debug, Clone, Default)]
pub struct ServerCodec {
    packets: PacketCodec,
}

impl ServerCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            packets: PacketCodec::new(max_frame_len),
        }
    }
}

impl Decoder for ServerCodec {
    type Item = Inbound;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, CodecError> {
        match src.first() {
            None => Ok(None),
            Some(&0) => Ok(self.packets.try_decode_any(src)?.map(|decoded| match decoded {
                Decoded::Frame(frame) => Inbound::Packet(frame),
                Decoded::Unknown { magic, code } => Inbound::Unknown { magic, code },
            })),
            Some(_) => match src.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    let line = src.split_to(pos + 1);
                    let text = String::from_utf8_lossy(&line).trim().to_string();
                    Ok(Some(Inbound::Admin(text)))
                }
                None if src.len() > MAX_ADMIN_LINE => {
                    Err(CodecError::AdminLineTooLong(MAX_ADMIN_LINE))
                }
                None => Ok(None),
            },
        }
    }
}

impl Encoder<Outbound> for ServerCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<(), CodecError> {
        match item {
            Outbound::Packet(frame) => self.packets.encode_into(&frame, dst),
            Outbound::Text(text) => dst.extend_from_slice(text.as_bytes()),
        }
        Ok(())
    }
}
