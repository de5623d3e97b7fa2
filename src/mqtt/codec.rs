//! Byte-level MQTT 3.1.1 packet construction and parsing.
//!
//! Only the packet subset the monitor actually speaks is implemented:
//! CONNECT, CONNACK, SUBSCRIBE and PUBLISH. Remaining length is restricted
//! to a single byte (0-127); packets that would need the multi-byte
//! encoding are rejected with [`CodecError::PacketTooLarge`] instead of
//! emitting a corrupt length field.

use thiserror::Error;

use crate::persistence::ConnectionSettings;

/// MQTT CONNECT packet type identifier.
pub const CONNECT: u8 = 0x10;
/// MQTT CONNACK packet type identifier.
pub const CONNACK: u8 = 0x20;
/// MQTT PUBLISH packet type identifier.
pub const PUBLISH: u8 = 0x30;
/// MQTT SUBSCRIBE packet type identifier (flags nibble fixed to 0b0010).
pub const SUBSCRIBE: u8 = 0x82;

const PROTOCOL_NAME: &[u8] = b"MQTT";
const PROTOCOL_LEVEL: u8 = 4; // MQTT 3.1.1
const KEEP_ALIVE_SECS: u16 = 60;

/// Largest remaining length expressible in the single-byte encoding.
pub const MAX_REMAINING_LENGTH: usize = 127;

/// Errors produced while encoding or decoding packets.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The packet body would not fit the single-byte remaining-length field.
    #[error("packet body of {0} bytes exceeds the single-byte remaining-length limit of 127")]
    PacketTooLarge(usize),

    /// The bytes do not form a valid packet of the expected type.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),
}

/// Decoded fixed header of an incoming packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    /// Raw first byte (type in the high nibble, flags in the low nibble).
    pub packet_byte: u8,
    /// Number of bytes following the fixed header.
    pub remaining_length: usize,
    /// Size of the fixed header itself, always 2 with single-byte lengths.
    pub header_len: usize,
}

impl FixedHeader {
    /// Packet type, the high nibble of the first byte.
    pub fn message_type(&self) -> u8 {
        self.packet_byte >> 4
    }
}

/// Builds the CONNECT packet for the given settings.
///
/// Clean session is always requested; the username and password flags are
/// set only when the respective field is non-empty. Keep-alive is fixed at
/// 60 seconds.
pub fn encode_connect(settings: &ConnectionSettings) -> Result<Vec<u8>, CodecError> {
    let client_id = settings.client_id();

    let mut body = Vec::with_capacity(32);
    body.extend_from_slice(&(PROTOCOL_NAME.len() as u16).to_be_bytes());
    body.extend_from_slice(PROTOCOL_NAME);
    body.push(PROTOCOL_LEVEL);

    let mut connect_flags: u8 = 0x02; // clean session
    if !settings.username.is_empty() {
        connect_flags |= 0x80;
    }
    if !settings.password.is_empty() {
        connect_flags |= 0x40;
    }
    body.push(connect_flags);
    body.extend_from_slice(&KEEP_ALIVE_SECS.to_be_bytes());

    push_utf8_field(&mut body, client_id.as_bytes());
    if !settings.username.is_empty() {
        push_utf8_field(&mut body, settings.username.as_bytes());
    }
    if !settings.password.is_empty() {
        push_utf8_field(&mut body, settings.password.as_bytes());
    }

    finish_packet(CONNECT, body)
}

/// Builds a SUBSCRIBE packet for a single topic filter at QoS 0.
pub fn encode_subscribe(topic_filter: &str, packet_id: u16) -> Result<Vec<u8>, CodecError> {
    let mut body = Vec::with_capacity(topic_filter.len() + 5);
    body.extend_from_slice(&packet_id.to_be_bytes());
    push_utf8_field(&mut body, topic_filter.as_bytes());
    body.push(0x00); // requested QoS

    finish_packet(SUBSCRIBE, body)
}

/// Builds a PUBLISH packet, optionally with the retain bit set.
pub fn encode_publish(topic: &str, payload: &[u8], retain: bool) -> Result<Vec<u8>, CodecError> {
    let mut body = Vec::with_capacity(topic.len() + payload.len() + 2);
    push_utf8_field(&mut body, topic.as_bytes());
    body.extend_from_slice(payload);

    let first_byte = if retain { PUBLISH | 0x01 } else { PUBLISH };
    finish_packet(first_byte, body)
}

/// Parses the two-byte fixed header at the start of `bytes`.
pub fn decode_fixed_header(bytes: &[u8]) -> Result<FixedHeader, CodecError> {
    if bytes.len() < 2 {
        return Err(CodecError::MalformedPacket("fixed header needs 2 bytes"));
    }
    let length_byte = bytes[1];
    if length_byte & 0x80 != 0 {
        // Continuation bit: the peer used the multi-byte encoding we do
        // not support.
        return Err(CodecError::PacketTooLarge(length_byte as usize));
    }
    Ok(FixedHeader {
        packet_byte: bytes[0],
        remaining_length: length_byte as usize,
        header_len: 2,
    })
}

/// Extracts the return code from a complete CONNACK packet.
pub fn decode_connack(bytes: &[u8]) -> Result<u8, CodecError> {
    if bytes.len() < 4 {
        return Err(CodecError::MalformedPacket("CONNACK needs 4 bytes"));
    }
    if bytes[0] >> 4 != CONNACK >> 4 {
        return Err(CodecError::MalformedPacket("not a CONNACK packet"));
    }
    Ok(bytes[3])
}

/// Splits a complete PUBLISH packet into topic and payload.
pub fn decode_publish(bytes: &[u8]) -> Result<(String, Vec<u8>), CodecError> {
    let header = decode_fixed_header(bytes)?;
    if header.message_type() != PUBLISH >> 4 {
        return Err(CodecError::MalformedPacket("not a PUBLISH packet"));
    }
    if bytes.len() < 4 {
        return Err(CodecError::MalformedPacket("PUBLISH too short for topic length"));
    }

    let topic_len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    if 2 + topic_len > header.remaining_length || 4 + topic_len > bytes.len() {
        return Err(CodecError::MalformedPacket("topic length exceeds remaining length"));
    }

    let topic = String::from_utf8_lossy(&bytes[4..4 + topic_len]).into_owned();
    let payload = bytes[4 + topic_len..].to_vec();
    Ok((topic, payload))
}

fn push_utf8_field(buf: &mut Vec<u8>, field: &[u8]) {
    buf.extend_from_slice(&(field.len() as u16).to_be_bytes());
    buf.extend_from_slice(field);
}

fn finish_packet(first_byte: u8, body: Vec<u8>) -> Result<Vec<u8>, CodecError> {
    if body.len() > MAX_REMAINING_LENGTH {
        return Err(CodecError::PacketTooLarge(body.len()));
    }
    let mut packet = Vec::with_capacity(body.len() + 2);
    packet.push(first_byte);
    packet.push(body.len() as u8);
    packet.extend_from_slice(&body);
    Ok(packet)
}
