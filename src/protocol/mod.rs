//! Binary wire protocol.
//!
//! Every frame is a fixed 12-byte header followed by an argument block:
//!
//! ```text
//! ┌────────────┬──────────────┬──────────────┬───────────────────────────┐
//! │   Magic    │  Type code   │ Block length │ Arguments (NUL separated) │
//! │  (4 bytes) │ (4 bytes BE) │ (4 bytes BE) │    (variable length)      │
//! └────────────┴──────────────┴──────────────┴───────────────────────────┘
//! ```
//!
//! The magic is `"\0REQ"` for frames sent to the broker and `"\0RES"` for
//! frames sent by it. There is no request id: replies are correlated by the
//! job handle they carry, or by order for connection-scoped exchanges.

pub mod codec;
pub mod packet;

pub use codec::{
    encode_frame, Decoded, FrameBuffer, Inbound, Outbound, PacketCodec, ServerCodec,
    DEFAULT_MAX_FRAME_LEN,
};
pub use packet::{handle_arg, number_arg, text_arg, Frame, Magic, PacketType, HEADER_LEN};
