//! Wire protocol constants and framing.
//!
//! Two layers of framing travel over a sandbox transport:
//!
//! - Inner framing (always): 4-byte big-endian length + UTF-8 JSON message.
//! - Outer framing (multiplexed transports only): 8-byte header = 1-byte
//!   stream tag (1 = stdout, 2 = stderr) + 3 reserved zero bytes + 4-byte
//!   big-endian payload length, followed by the payload. Prefixes that do
//!   not match this shape are treated as raw content, so non-multiplexed
//!   transports share the demux path with no adapter.

use crate::error::SandboxError;

/// Maximum bytes held in either executor buffer.
pub const MAX_BUFFER_SIZE: usize = 10 * 1024 * 1024;
/// Maximum declared length of one inbound message.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;
/// Maximum encoded size of one outbound message.
pub const MAX_PAYLOAD_SIZE: usize = 50 * 1024 * 1024;
/// Absolute ceiling on a single read, regardless of the caller's timeout.
pub const MAX_READ_DURATION: std::time::Duration = std::time::Duration::from_secs(300);
/// Default timeout for send operations.
pub const DEFAULT_SEND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
/// Concurrency cap for batched sub-LLM dispatch in fast mode.
pub const MAX_BATCH_WORKERS: usize = 32;

/// Stream tags recognized by the demultiplexer.
const MUX_STREAM_TAGS: [u8; 2] = [1, 2];

/// Encode one message as a length-prefixed JSON frame.
///
/// Fails without producing any bytes when the encoded payload exceeds
/// [`MAX_PAYLOAD_SIZE`].
pub fn encode_message(value: &serde_json::Value) -> Result<Vec<u8>, SandboxError> {
    let payload = serde_json::to_vec(value)
        .map_err(|e| SandboxError::Protocol(format!("Failed to encode message: {e}")))?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(SandboxError::Protocol(format!(
            "Payload size {} exceeds maximum {}",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// A recognized multiplex frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxHeader {
    pub stream: u8,
    pub payload_len: usize,
}

/// Recognize an 8-byte multiplex header.
///
/// A header matches when byte 0 is a known stream tag AND bytes 1..4 are
/// zero. Anything else is raw content.
pub fn parse_mux_header(header: &[u8; 8]) -> Option<MuxHeader> {
    if !MUX_STREAM_TAGS.contains(&header[0]) || header[1..4] != [0, 0, 0] {
        return None;
    }
    let payload_len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    Some(MuxHeader {
        stream: header[0],
        payload_len,
    })
}

/// Wrap a payload in a multiplex frame (test transports and fixtures).
pub fn mux_frame(stream: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.push(stream);
    frame.extend_from_slice(&[0, 0, 0]);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}
