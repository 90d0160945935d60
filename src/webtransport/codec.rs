//! Stream framing: a 4-byte big-endian length, then the payload.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

/// First frame on every server-opened topic stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHeader {
    pub topic: String,
}

/// Codec for frames read from the client. Frames over `max_frame_size` fail
/// with `io::ErrorKind::InvalidData`.
pub fn inbound(max_frame_size: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_size)
        .new_codec()
}

/// Codec for frames the gateway writes; only the length field bounds them
pub fn outbound() -> LengthDelimitedCodec {
    inbound(u32::MAX as usize)
}

pub fn header_frame(topic: &str) -> Result<Bytes, serde_json::Error> {
    let header = StreamHeader {
        topic: topic.to_string(),
    };
    serde_json::to_vec(&header).map(Bytes::from)
}
