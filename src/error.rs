use thiserror::Error;

use crate::protocol::PacketType;

/// Framing failures. Any of these is fatal to the connection that produced it.
///
/// `UnknownPacketType` only arises on the client side; the broker answers an
/// unknown type code with [`ProtocolError::UnknownPacketType`] instead.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Bad packet magic: {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("Unknown packet type code {0}")]
    UnknownPacketType(u32),

    #[error("Frame argument block of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Admin command line exceeds {0} bytes")]
    AdminLineTooLong(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A well-framed packet that makes no sense in context.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("{packet} expects {expected} arguments, got {got}")]
    WrongArgumentCount {
        packet: PacketType,
        expected: usize,
        got: usize,
    },

    #[error("Invalid argument for {packet}: {detail}")]
    InvalidArgument { packet: PacketType, detail: String },

    #[error("No handler claimed {0}")]
    Unclaimed(PacketType),

    #[error("Unexpected {0} packet")]
    UnexpectedPacket(PacketType),

    #[error("Unknown packet type code {0}")]
    UnknownPacketType(u32),
}

impl ProtocolError {
    /// Error code carried in the first argument of an ERROR frame.
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::WrongArgumentCount { .. } => "ERR_WRONG_ARGS",
            ProtocolError::InvalidArgument { .. } => "ERR_INVALID_ARG",
            ProtocolError::Unclaimed(_)
            | ProtocolError::UnexpectedPacket(_)
            | ProtocolError::UnknownPacketType(_) => "ERR_UNKNOWN_COMMAND",
        }
    }
}

#[derive(Error, Debug)]
pub enum GearlineError {
    #[error("Framing error: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed before the exchange finished")]
    ConnectionClosed,

    #[error("Server error {code}: {message}")]
    Server { code: String, message: String },

    #[error("Job store error: {0}")]
    Store(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GearlineError>;
