//! The `grpc.health.v1.Health` messages, see
//! https://github.com/grpc/grpc/blob/master/src/proto/grpc/health/v1/health.proto, and the
//! length-prefixed framing gRPC wraps each message in.

use hyper::body::Bytes;
use prost::Message;

#[derive(Clone, PartialEq, prost::Message)]
pub struct HealthCheckRequest {
    #[prost(string, tag = "1")]
    pub service: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HealthCheckResponse {
    #[prost(enumeration = "ServingStatus", tag = "1")]
    pub status: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ServingStatus {
    Unknown = 0,
    Serving = 1,
    NotServing = 2,
    ServiceUnknown = 3,
}

/// Length of the prefix: a compression flag and a big-endian message length.
const FRAME_HEADER_LEN: usize = 5;

pub fn encode_frame(message: &impl Message) -> Bytes {
    let encoded = message.encode_to_vec();
    let mut buffer = Vec::with_capacity(FRAME_HEADER_LEN + encoded.len());
    buffer.push(0);
    // Messages are far below 4 GiB.
    buffer.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
    buffer.extend_from_slice(&encoded);
    Bytes::from(buffer)
}

/// Decodes the single uncompressed message of a unary request body.
pub fn decode_frame<M: Message + Default>(body: &[u8]) -> Result<M, String> {
    let Some((header, message)) = body.split_first_chunk::<FRAME_HEADER_LEN>() else {
        return Err(format!("frame of {} bytes is too short", body.len()));
    };
    let [compressed, len @ ..] = *header;
    if compressed != 0 {
        return Err("compressed messages are not supported".to_owned());
    }
    let len = u32::from_be_bytes(len) as usize;
    if message.len() != len {
        return Err(format!(
            "frame announces {len} bytes, but carries {}",
            message.len()
        ));
    }
    M::decode(message).map_err(|error| error.to_string())
}
