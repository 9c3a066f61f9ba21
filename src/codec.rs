//! Wire framing and command encoding for the NSQ protocol.
//!
//! Grounded in `broker/protocol.rs` and `socket/framing.rs`: a small set of
//! byte-packing helpers, a tagged `Frame` enum, and a decoder that `feed()`s
//! off a growing `BytesMut` and yields zero or more complete frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::{HEARTBEAT, MAX_FRAME_SIZE, NL};
use crate::error::{NsqError, Result};

/// Wire frame types, per spec §3.
mod frame_type {
    pub const RESPONSE: i32 = 0;
    pub const ERROR: i32 = 1;
    pub const MESSAGE: i32 = 2;
}

/// A decoded NSQ message body: `[i64 timestamp][u16 attempts][16-byte id][body]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub timestamp: i64,
    pub attempts: u16,
    pub id: [u8; 16],
    pub body: Bytes,
}

impl Message {
    pub fn id_str(&self) -> String {
        String::from_utf8_lossy(&self.id).trim_end().to_string()
    }
}

/// One decoded frame off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Bytes),
    Error(Bytes),
    Message(Message),
}

impl Frame {
    /// True for a RESPONSE frame whose payload is the literal heartbeat marker.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Frame::Response(payload) if payload.as_ref() == HEARTBEAT)
    }
}

/// Packs a single byte string as `[i32 len][bytes]`.
pub fn pack(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + data.len());
    buf.put_i32(data.len() as i32);
    buf.put_slice(data);
    buf.freeze()
}

/// Packs a sequence of byte strings as `[i32 total_len][i32 count]([i32 len][bytes])*`,
/// used by MPUB. The total length excludes itself but includes the count field.
///
/// Nested sequences aren't representable by this signature (`&[&[u8]]` is one
/// level deep) so the "reject nested sequences" requirement is enforced by
/// construction rather than at runtime.
pub fn pack_iterable(items: &[&[u8]]) -> Bytes {
    let mut body = BytesMut::new();
    body.put_i32(items.len() as i32);
    for item in items {
        body.put_i32(item.len() as i32);
        body.put_slice(item);
    }
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_i32(body.len() as i32);
    buf.extend_from_slice(&body);
    buf.freeze()
}

fn verb_line(verb: &str, args: &[&str]) -> Vec<u8> {
    let mut line = Vec::with_capacity(verb.len() + 1);
    line.extend_from_slice(verb.as_bytes());
    for arg in args {
        line.push(b' ');
        line.extend_from_slice(arg.as_bytes());
    }
    line.push(NL);
    line
}

/// `NOP\n`
pub fn nop() -> Vec<u8> {
    verb_line("NOP", &[])
}

/// `CLS\n`
pub fn cls() -> Vec<u8> {
    verb_line("CLS", &[])
}

/// `SUB <topic> <channel>\n`
pub fn sub(topic: &str, channel: &str) -> Vec<u8> {
    verb_line("SUB", &[topic, channel])
}

/// `RDY <n>\n`
pub fn rdy(n: u32) -> Vec<u8> {
    verb_line("RDY", &[&n.to_string()])
}

/// `FIN <id>\n`
pub fn fin(id: &str) -> Vec<u8> {
    verb_line("FIN", &[id])
}

/// `REQ <id> <timeout_ms>\n`
pub fn req(id: &str, timeout_ms: u64) -> Vec<u8> {
    verb_line("REQ", &[id, &timeout_ms.to_string()])
}

/// `TOUCH <id>\n`
pub fn touch(id: &str) -> Vec<u8> {
    verb_line("TOUCH", &[id])
}

/// `IDENTIFY\n[i32 len][json bytes]`
pub fn identify(body: &[u8]) -> Vec<u8> {
    let mut out = verb_line("IDENTIFY", &[]);
    out.extend_from_slice(&pack(body));
    out
}

/// `AUTH\n[i32 len][bytes]`
pub fn auth(secret: &[u8]) -> Vec<u8> {
    let mut out = verb_line("AUTH", &[]);
    out.extend_from_slice(&pack(secret));
    out
}

/// `PUB <topic>\n[i32 len][bytes]`
pub fn publish(topic: &str, body: &[u8]) -> Vec<u8> {
    let mut out = verb_line("PUB", &[topic]);
    out.extend_from_slice(&pack(body));
    out
}

/// `MPUB <topic>\n[i32 total_len][i32 count]([i32 msg_len][msg_bytes])*`
pub fn mpub(topic: &str, bodies: &[&[u8]]) -> Vec<u8> {
    let mut out = verb_line("MPUB", &[topic]);
    out.extend_from_slice(&pack_iterable(bodies));
    out
}

/// Incrementally decodes frames out of a byte stream fed in arbitrary chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    /// Appends freshly-read bytes to the internal buffer.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pulls every complete frame currently buffered. The remainder (a
    /// partial frame, or nothing) stays buffered for the next call.
    pub fn decode_all(&mut self) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        while let Some(frame) = self.decode_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn decode_one(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < 8 {
            return Ok(None);
        }
        let size = i32::from_be_bytes(self.buf[0..4].try_into().unwrap());
        if size < 4 {
            return Err(NsqError::Decode(format!("frame size {size} smaller than frameType field")));
        }
        let size = size as u32;
        if size > MAX_FRAME_SIZE {
            return Err(NsqError::Decode(format!("frame size {size} exceeds max {MAX_FRAME_SIZE}")));
        }
        let total = 4 + size as usize;
        if self.buf.len() < total {
            return Ok(None);
        }

        self.buf.advance(4);
        let frame_type = i32::from_be_bytes(self.buf[0..4].try_into().unwrap());
        self.buf.advance(4);
        let payload_len = size as usize - 4;
        let payload = self.buf.split_to(payload_len).freeze();

        let frame = match frame_type {
            frame_type::RESPONSE => Frame::Response(payload),
            frame_type::ERROR => Frame::Error(payload),
            frame_type::MESSAGE => Frame::Message(decode_message(payload)?),
            other => return Err(NsqError::Decode(format!("unknown frame type {other}"))),
        };
        Ok(Some(frame))
    }
}

fn decode_message(mut payload: Bytes) -> Result<Message> {
    if payload.len() < 8 + 2 + 16 {
        return Err(NsqError::Decode(format!(
            "message payload too short: {} bytes",
            payload.len()
        )));
    }
    let timestamp = payload.get_i64();
    let attempts = payload.get_u16();
    let mut id = [0u8; 16];
    payload.copy_to_slice(&mut id);
    let body = payload;
    Ok(Message { timestamp, attempts, id, body })
}

/// Splits an `E_CODE reason text` error payload into its code token and the
/// (possibly empty) remainder.
pub fn split_error_payload(payload: &[u8]) -> (String, String) {
    let text = String::from_utf8_lossy(payload);
    match text.split_once(' ') {
        Some((code, reason)) => (code.to_string(), reason.to_string()),
        None => (text.to_string(), String::new()),
    }
}
