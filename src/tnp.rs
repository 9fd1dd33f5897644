//! TNP (Wahoo BLE-over-TCP) frame codec.
//!
//! Every message is a 6-byte header followed by a variable body:
//! version(1) + message id(1) + sequence(1) + response code(1) +
//! body length(2, big-endian) + body. UUIDs travel the wire with all
//! 16 bytes reversed relative to their canonical textual order; that
//! reversal lives here and nowhere else.

use uuid::Uuid;

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 6;

/// Only protocol version in the wild.
pub const PROTOCOL_VERSION: u8 = 1;

/// Message identifiers (header byte 1).
pub mod msg {
    pub const DISCOVER_SERVICES: u8 = 0x01;
    pub const DISCOVER_CHARACTERISTICS: u8 = 0x02;
    pub const READ_CHARACTERISTIC: u8 = 0x03;
    pub const WRITE_CHARACTERISTIC: u8 = 0x04;
    pub const ENABLE_NOTIFICATIONS: u8 = 0x05;
    pub const NOTIFICATION: u8 = 0x06;
}

/// Response codes (header byte 3).
pub mod resp {
    pub const SUCCESS: u8 = 0x00;
    pub const UNKNOWN_MESSAGE_TYPE: u8 = 0x01;
    pub const UNEXPECTED_ERROR: u8 = 0x02;
    pub const SERVICE_NOT_FOUND: u8 = 0x03;
    pub const CHARACTERISTIC_NOT_FOUND: u8 = 0x04;
    pub const OPERATION_NOT_SUPPORTED: u8 = 0x05;
    pub const WRITE_FAILED: u8 = 0x06;
    pub const UNKNOWN_PROTOCOL: u8 = 0x07;
}

/// A parsed or to-be-encoded TNP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub message_id: u8,
    pub sequence: u8,
    pub response_code: u8,
    pub body: Vec<u8>,
}

impl Frame {
    /// Successful response carrying `body`, echoing the request's sequence.
    pub fn response(message_id: u8, sequence: u8, body: Vec<u8>) -> Self {
        Frame {
            version: PROTOCOL_VERSION,
            message_id,
            sequence,
            response_code: resp::SUCCESS,
            body,
        }
    }

    /// Error response with an empty body, echoing the request's sequence.
    pub fn error(message_id: u8, sequence: u8, response_code: u8) -> Self {
        Frame {
            version: PROTOCOL_VERSION,
            message_id,
            sequence,
            response_code,
            body: Vec::new(),
        }
    }

    /// Unsolicited characteristic notification. Always sequence 0.
    pub fn notification(uuid: &Uuid, value: &[u8]) -> Self {
        Frame {
            version: PROTOCOL_VERSION,
            message_id: msg::NOTIFICATION,
            sequence: 0,
            response_code: resp::SUCCESS,
            body: uuid_value_body(uuid, value),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.body.len());
        out.push(self.version);
        out.push(self.message_id);
        out.push(self.sequence);
        out.push(self.response_code);
        out.extend_from_slice(&(self.body.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

/// Result of a decode attempt over a receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Not enough bytes yet; caller keeps the buffer and reads more.
    Incomplete,
    /// One complete frame; `consumed` bytes may be dropped from the buffer.
    Frame { frame: Frame, consumed: usize },
}

/// Pull one frame off the front of `buf` if it is fully buffered.
///
/// Header fields are not validated here; the dispatcher decides how to
/// answer bad versions, identifiers, and body shapes so it can echo the
/// offending sequence.
pub fn decode(buf: &[u8]) -> Decoded {
    if buf.len() < HEADER_LEN {
        return Decoded::Incomplete;
    }
    let body_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    if buf.len() < HEADER_LEN + body_len {
        return Decoded::Incomplete;
    }
    Decoded::Frame {
        frame: Frame {
            version: buf[0],
            message_id: buf[1],
            sequence: buf[2],
            response_code: buf[3],
            body: buf[HEADER_LEN..HEADER_LEN + body_len].to_vec(),
        },
        consumed: HEADER_LEN + body_len,
    }
}

/// Canonical UUID → wire bytes (reversed across all 16 bytes).
pub fn uuid_to_wire(uuid: &Uuid) -> [u8; 16] {
    let src = uuid.as_bytes();
    let mut out = [0u8; 16];
    for (i, b) in src.iter().rev().enumerate() {
        out[i] = *b;
    }
    out
}

/// Wire bytes → canonical UUID. Returns `None` for short input.
pub fn uuid_from_wire(bytes: &[u8]) -> Option<Uuid> {
    if bytes.len() < 16 {
        return None;
    }
    let mut out = [0u8; 16];
    for (i, b) in bytes[..16].iter().rev().enumerate() {
        out[i] = *b;
    }
    Some(Uuid::from_bytes(out))
}

/// Body of a discover-services response: concatenated wire UUIDs.
pub fn services_body(uuids: &[Uuid]) -> Vec<u8> {
    let mut body = Vec::with_capacity(uuids.len() * 16);
    for uuid in uuids {
        body.extend_from_slice(&uuid_to_wire(uuid));
    }
    body
}

/// Body of a discover-characteristics response: service UUID then
/// (characteristic UUID, property mask) entries.
pub fn characteristics_body(service: &Uuid, characteristics: &[(Uuid, u8)]) -> Vec<u8> {
    let mut body = Vec::with_capacity(16 + characteristics.len() * 17);
    body.extend_from_slice(&uuid_to_wire(service));
    for (uuid, props) in characteristics {
        body.extend_from_slice(&uuid_to_wire(uuid));
        body.push(*props);
    }
    body
}

/// Body carrying a UUID followed by value bytes (read responses, writes,
/// notifications).
pub fn uuid_value_body(uuid: &Uuid, value: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(16 + value.len());
    body.extend_from_slice(&uuid_to_wire(uuid));
    body.extend_from_slice(value);
    body
}

/// Body carrying just a UUID (acknowledgment echoes, read requests).
pub fn uuid_body(uuid: &Uuid) -> Vec<u8> {
    uuid_to_wire(uuid).to_vec()
}
