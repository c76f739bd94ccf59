//! Session protocol messages and wire encoding
//!
//! Every routed message travels as one tagged frame (see [`crate::frame`])
//! whose body begins with a big-endian opcode. Gather requests append the
//! routing mask, the information kind, and the target object id; gather
//! replies come back as `[length:i32][length bytes]` with a non-positive
//! length meaning the remote root failed.

use conclave_core::Location;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Frame tag for routed-message broadcasts (push/invoke/gather/close).
pub const MESSAGE_RMI_TAG: u32 = 55624;

/// Frame tag for gather replies from a group's root.
pub const GATHER_REPLY_TAG: u32 = 55626;

/// Frame tag for the handshake exchange at connection time.
pub const HANDSHAKE_TAG: u32 = 55600;

/// Operation carried by a routed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    Push = 1,
    Invoke = 2,
    GatherInformation = 3,
    CloseSession = 4,
}

impl Opcode {
    pub fn from_u32(value: u32) -> Result<Opcode> {
        match value {
            1 => Ok(Opcode::Push),
            2 => Ok(Opcode::Invoke),
            3 => Ok(Opcode::GatherInformation),
            4 => Ok(Opcode::CloseSession),
            other => Err(Error::Protocol(format!("Unknown opcode: {other}"))),
        }
    }
}

/// A state-update or operation message addressed by a location mask. The
/// payload is opaque to routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutedMessage {
    pub location: Location,
    pub payload: Vec<u8>,
}

impl RoutedMessage {
    pub fn new(location: Location, payload: Vec<u8>) -> Self {
        RoutedMessage { location, payload }
    }
}

/// Encode a push/invoke/close body: `[opcode:u32][payload bytes]`.
pub fn encode_message(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + payload.len());
    body.extend((opcode as u32).to_be_bytes());
    body.extend_from_slice(payload);
    body
}

/// Decode a push/invoke/close body produced by [`encode_message`].
pub fn decode_message(body: &[u8]) -> Result<(Opcode, &[u8])> {
    if body.len() < 4 {
        return Err(Error::Protocol("Truncated message body".into()));
    }
    let opcode = Opcode::from_u32(u32::from_be_bytes([body[0], body[1], body[2], body[3]]))?;
    Ok((opcode, &body[4..]))
}

/// Encode a gather request body:
/// `[opcode:u32][location:u32][kind len:u32][kind][target:u32][params]`.
pub fn encode_gather_request(
    location: Location,
    kind: &str,
    target_object_id: u32,
    parameters: &[u8],
) -> Vec<u8> {
    let kind_bytes = kind.as_bytes();
    let mut body = Vec::with_capacity(16 + kind_bytes.len() + parameters.len());
    body.extend((Opcode::GatherInformation as u32).to_be_bytes());
    body.extend(location.bits().to_be_bytes());
    body.extend((kind_bytes.len() as u32).to_be_bytes());
    body.extend_from_slice(kind_bytes);
    body.extend(target_object_id.to_be_bytes());
    body.extend_from_slice(parameters);
    body
}

/// A decoded gather request, as seen by a peer-group participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatherRequest {
    pub location: Location,
    pub kind: String,
    pub target_object_id: u32,
    pub parameters: Vec<u8>,
}

/// Decode a gather request body produced by [`encode_gather_request`].
pub fn decode_gather_request(body: &[u8]) -> Result<GatherRequest> {
    let (opcode, rest) = decode_message(body)?;
    if opcode != Opcode::GatherInformation {
        return Err(Error::Protocol(format!(
            "Expected gather request, got {opcode:?}"
        )));
    }
    if rest.len() < 8 {
        return Err(Error::Protocol("Truncated gather request".into()));
    }
    let location = Location::from_bits(u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]));
    let kind_len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
    let rest = &rest[8..];
    if rest.len() < kind_len + 4 {
        return Err(Error::Protocol("Truncated gather request".into()));
    }
    let kind = std::str::from_utf8(&rest[..kind_len])
        .map_err(|_| Error::Protocol("Gather kind is not UTF-8".into()))?
        .to_string();
    let rest = &rest[kind_len..];
    let target_object_id = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
    Ok(GatherRequest {
        location,
        kind,
        target_object_id,
        parameters: rest[4..].to_vec(),
    })
}

/// Encode the gather reply length prefix a root sends before the payload.
pub fn encode_reply_length(len: i32) -> [u8; 4] {
    len.to_be_bytes()
}

/// Decode the gather reply length prefix.
pub fn decode_reply_length(bytes: &[u8]) -> Result<i32> {
    let bytes: [u8; 4] = bytes
        .try_into()
        .map_err(|_| Error::Protocol("Short gather reply length".into()))?;
    Ok(i32::from_be_bytes(bytes))
}
