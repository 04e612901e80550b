//! Codec for encoding and decoding hub messages.
//!
//! Two framings are supported:
//!
//! - JSON: each message is a JSON object followed by the `0x1E` record separator.
//! - MessagePack: each message is a MessagePack array preceded by its length
//!   as a 7-bit varint (little-endian groups, at most 5 bytes).
//!
//! The handshake is always JSON, regardless of the negotiated protocol.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use thiserror::Error;

use crate::frames::{HubMessage, MessageType};
use crate::version::{HubProtocol, PROTOCOL_VERSION};

/// Maximum message size (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Terminates every JSON record.
pub const RECORD_SEPARATOR: u8 = 0x1E;

/// Maximum length of the MessagePack varint prefix.
pub const MAX_VARINT_SIZE: usize = 5;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message exceeds maximum size.
    #[error("Message size {0} exceeds maximum {MAX_MESSAGE_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode a message.
    #[error("Incomplete message: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The hub rejected the handshake.
    #[error("Handshake rejected: {0}")]
    Handshake(String),

    /// Malformed identity string.
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// Invalid message data.
    #[error("Invalid message: {0}")]
    Invalid(String),
}

/// Encode a message to bytes.
///
/// # Errors
///
/// Returns an error if the message is too large or encoding fails.
pub fn encode(message: &HubMessage, protocol: HubProtocol) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(message, protocol, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a message into an existing buffer.
///
/// # Errors
///
/// Returns an error if the message is too large or encoding fails.
pub fn encode_into(
    message: &HubMessage,
    protocol: HubProtocol,
    buf: &mut BytesMut,
) -> Result<(), ProtocolError> {
    match protocol {
        HubProtocol::Json => {
            let payload = serde_json::to_vec(&to_json(message))?;
            if payload.len() > MAX_MESSAGE_SIZE {
                return Err(ProtocolError::FrameTooLarge(payload.len()));
            }
            buf.reserve(payload.len() + 1);
            buf.extend_from_slice(&payload);
            buf.put_u8(RECORD_SEPARATOR);
        }
        HubProtocol::MessagePack => {
            let payload = to_msgpack(message)?;
            if payload.len() > MAX_MESSAGE_SIZE {
                return Err(ProtocolError::FrameTooLarge(payload.len()));
            }
            buf.reserve(MAX_VARINT_SIZE + payload.len());
            put_varint(buf, payload.len());
            buf.extend_from_slice(&payload);
        }
    }
    Ok(())
}

/// Decode exactly one message from bytes.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8], protocol: HubProtocol) -> Result<HubMessage, ProtocolError> {
    let mut buf = BytesMut::from(data);
    match decode_from(&mut buf, protocol)? {
        Some(message) => Ok(message),
        None => Err(ProtocolError::Incomplete(missing_bytes(data, protocol))),
    }
}

/// Try to decode a message from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(message))` if a complete message was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the message is too large or invalid.
pub fn decode_from(
    buf: &mut BytesMut,
    protocol: HubProtocol,
) -> Result<Option<HubMessage>, ProtocolError> {
    match protocol {
        HubProtocol::Json => {
            let Some(end) = buf.iter().position(|b| *b == RECORD_SEPARATOR) else {
                if buf.len() > MAX_MESSAGE_SIZE {
                    return Err(ProtocolError::FrameTooLarge(buf.len()));
                }
                return Ok(None);
            };

            let record = buf.split_to(end);
            buf.advance(1);
            let value: Value = serde_json::from_slice(&record)?;
            from_json(value).map(Some)
        }
        HubProtocol::MessagePack => {
            let Some((length, prefix)) = read_varint(buf)? else {
                return Ok(None);
            };

            if length > MAX_MESSAGE_SIZE {
                return Err(ProtocolError::FrameTooLarge(length));
            }
            if buf.len() < prefix + length {
                return Ok(None);
            }

            buf.advance(prefix);
            let payload = buf.split_to(length);
            let values: Vec<Value> = rmp_serde::from_slice(&payload)?;
            from_msgpack(values).map(Some)
        }
    }
}

/// Encode the handshake request announcing `protocol`.
#[must_use]
pub fn encode_handshake(protocol: HubProtocol) -> Bytes {
    let mut buf = BytesMut::new();
    let request = json!({ "protocol": protocol.name(), "version": PROTOCOL_VERSION });
    buf.extend_from_slice(request.to_string().as_bytes());
    buf.put_u8(RECORD_SEPARATOR);
    buf.freeze()
}

/// Try to decode the handshake response, advancing the buffer if complete.
///
/// Returns `Ok(Some(()))` once the hub accepted the handshake and
/// `Ok(None)` if more data is needed. Any bytes after the response belong to
/// the negotiated protocol and stay in the buffer.
///
/// # Errors
///
/// Returns [`ProtocolError::Handshake`] if the hub reported an error.
pub fn decode_handshake(buf: &mut BytesMut) -> Result<Option<()>, ProtocolError> {
    let Some(end) = buf.iter().position(|b| *b == RECORD_SEPARATOR) else {
        return Ok(None);
    };

    let record = buf.split_to(end);
    buf.advance(1);
    let value: Value = serde_json::from_slice(&record)?;

    match value.get("error").and_then(Value::as_str) {
        Some(error) => Err(ProtocolError::Handshake(error.to_string())),
        None => Ok(Some(())),
    }
}

/// Encode the handshake response (used by hub-side test doubles).
#[must_use]
pub fn encode_handshake_response(error: Option<&str>) -> Bytes {
    let mut buf = BytesMut::new();
    let response = match error {
        Some(error) => json!({ "error": error }),
        None => json!({}),
    };
    buf.extend_from_slice(response.to_string().as_bytes());
    buf.put_u8(RECORD_SEPARATOR);
    buf.freeze()
}

/// Codec bound to one negotiated protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct HubCodec {
    protocol: HubProtocol,
}

impl HubCodec {
    /// Create a new codec instance.
    #[must_use]
    pub fn new(protocol: HubProtocol) -> Self {
        Self { protocol }
    }

    /// Get the negotiated protocol.
    #[must_use]
    pub fn protocol(&self) -> HubProtocol {
        self.protocol
    }

    /// Encode a message to bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self, message: &HubMessage) -> Result<Bytes, ProtocolError> {
        encode(message, self.protocol)
    }

    /// Try to decode a message from a buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is invalid.
    pub fn decode_from(&self, buf: &mut BytesMut) -> Result<Option<HubMessage>, ProtocolError> {
        decode_from(buf, self.protocol)
    }
}

fn to_json(message: &HubMessage) -> Value {
    match message {
        HubMessage::Invocation {
            invocation_id,
            target,
            arguments,
        } => {
            let mut object = Map::new();
            object.insert("type".into(), json!(u8::from(MessageType::Invocation)));
            if let Some(id) = invocation_id {
                object.insert("invocationId".into(), json!(id));
            }
            object.insert("target".into(), json!(target));
            object.insert("arguments".into(), Value::Array(arguments.clone()));
            Value::Object(object)
        }
        HubMessage::Ping => json!({ "type": u8::from(MessageType::Ping) }),
        HubMessage::Close {
            error,
            allow_reconnect,
        } => {
            let mut object = Map::new();
            object.insert("type".into(), json!(u8::from(MessageType::Close)));
            if let Some(error) = error {
                object.insert("error".into(), json!(error));
            }
            object.insert("allowReconnect".into(), json!(allow_reconnect));
            Value::Object(object)
        }
        HubMessage::Other { message_type } => json!({ "type": message_type }),
    }
}

fn from_json(value: Value) -> Result<HubMessage, ProtocolError> {
    let Value::Object(mut object) = value else {
        return Err(ProtocolError::Invalid("hub message is not an object".into()));
    };

    let type_id = object
        .get("type")
        .and_then(Value::as_u64)
        .ok_or_else(|| ProtocolError::Invalid("missing message type".into()))?;

    let message = match u8::try_from(type_id).ok().map(MessageType::try_from) {
        Some(Ok(MessageType::Invocation)) => HubMessage::Invocation {
            invocation_id: object
                .get("invocationId")
                .and_then(Value::as_str)
                .map(str::to_string),
            target: object
                .get("target")
                .and_then(Value::as_str)
                .ok_or_else(|| ProtocolError::Invalid("invocation without target".into()))?
                .to_string(),
            arguments: match object.remove("arguments") {
                Some(Value::Array(arguments)) => arguments,
                _ => Vec::new(),
            },
        },
        Some(Ok(MessageType::Ping)) => HubMessage::Ping,
        Some(Ok(MessageType::Close)) => HubMessage::Close {
            error: object
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string),
            allow_reconnect: object
                .get("allowReconnect")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        },
        _ => HubMessage::Other {
            message_type: u8::try_from(type_id).unwrap_or(u8::MAX),
        },
    };

    Ok(message)
}

fn to_msgpack(message: &HubMessage) -> Result<Vec<u8>, ProtocolError> {
    let encoded = match message {
        HubMessage::Invocation {
            invocation_id,
            target,
            arguments,
        } => rmp_serde::to_vec(&(
            u8::from(MessageType::Invocation),
            HashMap::<String, String>::new(),
            invocation_id,
            target,
            arguments,
        ))?,
        HubMessage::Ping => rmp_serde::to_vec(&(u8::from(MessageType::Ping),))?,
        HubMessage::Close {
            error,
            allow_reconnect,
        } => rmp_serde::to_vec(&(u8::from(MessageType::Close), error, allow_reconnect))?,
        HubMessage::Other { message_type } => rmp_serde::to_vec(&(message_type,))?,
    };
    Ok(encoded)
}

fn from_msgpack(mut values: Vec<Value>) -> Result<HubMessage, ProtocolError> {
    let type_id = values
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| ProtocolError::Invalid("missing message type".into()))?;

    let message = match u8::try_from(type_id).ok().map(MessageType::try_from) {
        Some(Ok(MessageType::Invocation)) => {
            // [type, headers, invocationId, target, arguments, streamIds?]
            if values.len() < 5 {
                return Err(ProtocolError::Invalid(format!(
                    "invocation has {} elements, expected at least 5",
                    values.len()
                )));
            }
            let arguments = match values.swap_remove(4) {
                Value::Array(arguments) => arguments,
                _ => Vec::new(),
            };
            HubMessage::Invocation {
                invocation_id: values[2].as_str().map(str::to_string),
                target: values[3]
                    .as_str()
                    .ok_or_else(|| ProtocolError::Invalid("invocation without target".into()))?
                    .to_string(),
                arguments,
            }
        }
        Some(Ok(MessageType::Ping)) => HubMessage::Ping,
        Some(Ok(MessageType::Close)) => HubMessage::Close {
            error: values.get(1).and_then(Value::as_str).map(str::to_string),
            allow_reconnect: values.get(2).and_then(Value::as_bool).unwrap_or(false),
        },
        _ => HubMessage::Other {
            message_type: u8::try_from(type_id).unwrap_or(u8::MAX),
        },
    };

    Ok(message)
}

fn put_varint(buf: &mut BytesMut, mut value: usize) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Returns `(value, prefix_len)` or `None` if the prefix is incomplete.
fn read_varint(buf: &[u8]) -> Result<Option<(usize, usize)>, ProtocolError> {
    let mut value = 0usize;
    for (i, byte) in buf.iter().take(MAX_VARINT_SIZE).enumerate() {
        value |= usize::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }

    if buf.len() >= MAX_VARINT_SIZE {
        return Err(ProtocolError::Invalid("length prefix too long".into()));
    }
    Ok(None)
}

fn missing_bytes(data: &[u8], protocol: HubProtocol) -> usize {
    match protocol {
        HubProtocol::Json => 1,
        HubProtocol::MessagePack => match read_varint(data) {
            Ok(Some((length, prefix))) => (prefix + length).saturating_sub(data.len()),
            _ => 1,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::Envelope;

    fn sample_messages() -> Vec<HubMessage> {
        vec![
            HubMessage::signal(&Envelope::new("mac1|a+s/c/t", "HELLO", r#"["15","Online"]"#)),
            HubMessage::Invocation {
                invocation_id: Some("7".into()),
                target: "Echo".into(),
                arguments: vec![json!(1), json!("two")],
            },
            HubMessage::ping(),
            HubMessage::close(Some("server shutting down".into())),
        ]
    }

    #[test]
    fn test_encode_decode_both_protocols() {
        for protocol in [HubProtocol::Json, HubProtocol::MessagePack] {
            for message in sample_messages() {
                let encoded = encode(&message, protocol).unwrap();
                let decoded = decode(&encoded, protocol).unwrap();
                assert_eq!(message, decoded, "protocol {protocol}");
            }
        }
    }

    #[test]
    fn test_json_wire_format() {
        let encoded = encode(&HubMessage::ping(), HubProtocol::Json).unwrap();
        assert_eq!(&encoded[..], b"{\"type\":6}\x1e");

        let mut buf = BytesMut::from(
            &b"{\"type\":1,\"target\":\"SIGNAL\",\"arguments\":[\"a\",\"b\",\"c\"]}\x1e"[..],
        );
        let message = decode_from(&mut buf, HubProtocol::Json).unwrap().unwrap();
        assert_eq!(message.as_signal(), Some(Envelope::new("a", "b", "c")));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unknown_types_are_preserved() {
        let mut buf = BytesMut::from(&b"{\"type\":3,\"invocationId\":\"1\"}\x1e"[..]);
        let message = decode_from(&mut buf, HubProtocol::Json).unwrap().unwrap();
        assert_eq!(message, HubMessage::Other { message_type: 3 });
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode(&sample_messages()[0], HubProtocol::MessagePack).unwrap();
        match decode(&encoded[..encoded.len() - 2], HubProtocol::MessagePack) {
            Err(ProtocolError::Incomplete(2)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }

        let mut partial = BytesMut::from(&b"{\"type\":6}"[..]);
        assert!(decode_from(&mut partial, HubProtocol::Json).unwrap().is_none());
    }

    #[test]
    fn test_varint_prefix() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 300);
        assert_eq!(&buf[..], &[0xAC, 0x02]);
        assert_eq!(read_varint(&buf).unwrap(), Some((300, 2)));
        assert_eq!(read_varint(&[0x80]).unwrap(), None);
        assert!(read_varint(&[0xFF; 6]).is_err());
    }

    #[test]
    fn test_streaming_decode() {
        for protocol in [HubProtocol::Json, HubProtocol::MessagePack] {
            let mut buf = BytesMut::new();
            for message in sample_messages() {
                encode_into(&message, protocol, &mut buf).unwrap();
            }

            for expected in sample_messages() {
                let decoded = decode_from(&mut buf, protocol).unwrap().unwrap();
                assert_eq!(expected, decoded);
            }
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_handshake() {
        let request = encode_handshake(HubProtocol::MessagePack);
        assert_eq!(
            &request[..],
            b"{\"protocol\":\"messagepack\",\"version\":1}\x1e"
        );

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_handshake_response(None));
        buf.extend_from_slice(&encode(&HubMessage::ping(), HubProtocol::Json).unwrap());
        assert_eq!(decode_handshake(&mut buf).unwrap(), Some(()));
        assert_eq!(
            decode_from(&mut buf, HubProtocol::Json).unwrap(),
            Some(HubMessage::Ping)
        );

        let mut rejected = BytesMut::from(&encode_handshake_response(Some("bad protocol"))[..]);
        assert!(matches!(
            decode_handshake(&mut rejected),
            Err(ProtocolError::Handshake(_))
        ));
    }
}
