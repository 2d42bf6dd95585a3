use std::collections::BTreeMap;
use std::fmt;
use std::io::Cursor;

use rmpv::{Integer, Value};

use crate::config::AppConfig;

pub const FRAME_HEADER_SIZE_BYTES: usize = 4;

pub type MessageEnvelope = BTreeMap<String, Value>;

#[derive(Debug)]
pub enum CodecError {
    InvalidConfiguredLimit { value: usize },
    PayloadTooLarge { size: usize, limit: usize },
    FrameTooShort { size: usize },
    FrameLengthMismatch { declared: usize, actual_payload: usize },
    ProtocolZeroLength,
    ProtocolLengthTooLarge { length: usize, limit: usize },
    MessagePackEncode(rmpv::encode::Error),
    MessagePackDecode(rmpv::decode::Error),
    TrailingDataInPayload,
    EnvelopeMustBeMap,
    MapKeyMustBeUtf8String,
    FloatNotAllowed,
    ExtensionTypeNotAllowed,
    IntegerOutOfRange,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfiguredLimit { value } => write!(
                f,
                "wire.max_envelope_size_bytes must be between 1 and {}, got {value}",
                u32::MAX
            ),
            Self::PayloadTooLarge { size, limit } => {
                write!(f, "payload size {size} exceeds limit {limit}")
            }
            Self::FrameTooShort { size } => write!(f, "frame size {size} is smaller than 4-byte header"),
            Self::FrameLengthMismatch {
                declared,
                actual_payload,
            } => write!(
                f,
                "frame length mismatch: declared {declared} bytes, actual payload {actual_payload} bytes"
            ),
            Self::ProtocolZeroLength => {
                write!(f, "protocol error: frame length cannot be zero")
            }
            Self::ProtocolLengthTooLarge { length, limit } => write!(
                f,
                "protocol error: frame length {length} exceeds max {limit}"
            ),
            Self::MessagePackEncode(source) => write!(f, "messagepack encode error: {source}"),
            Self::MessagePackDecode(source) => write!(f, "messagepack decode error: {source}"),
            Self::TrailingDataInPayload => write!(f, "payload contains trailing MessagePack data"),
            Self::EnvelopeMustBeMap => write!(f, "message envelope must be a map"),
            Self::MapKeyMustBeUtf8String => write!(f, "map keys must be UTF-8 strings"),
            Self::FloatNotAllowed => write!(f, "floats are not allowed in message envelope"),
            Self::ExtensionTypeNotAllowed => {
                write!(f, "MessagePack extension values are not allowed")
            }
            Self::IntegerOutOfRange => write!(f, "integer value must fit in signed int64"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Length-prefixed MessagePack framing with a configurable envelope limit.
#[derive(Clone, Copy, Debug)]
pub struct WireCodec {
    max_envelope_size_bytes: usize,
}

impl WireCodec {
    pub fn new(max_envelope_size_bytes: usize) -> Result<Self, CodecError> {
        if max_envelope_size_bytes == 0 || max_envelope_size_bytes > u32::MAX as usize {
            return Err(CodecError::InvalidConfiguredLimit {
                value: max_envelope_size_bytes,
            });
        }
        Ok(Self {
            max_envelope_size_bytes,
        })
    }

    pub fn from_app_config(app_config: &AppConfig) -> Result<Self, CodecError> {
        Self::new(app_config.wire.max_envelope_size_bytes)
    }

    pub fn max_envelope_size_bytes(&self) -> usize {
        self.max_envelope_size_bytes
    }

    pub fn encode_frame(&self, envelope: &MessageEnvelope) -> Result<Vec<u8>, CodecError> {
        let payload = self.encode_payload(envelope)?;

        if payload.is_empty() {
            return Err(CodecError::ProtocolZeroLength);
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE_BYTES + payload.len());
        let len = payload.len() as u32;
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    pub fn decode_frame(&self, frame: &[u8]) -> Result<MessageEnvelope, CodecError> {
        let Some(declared_len) = self.declared_length(frame)? else {
            return Err(CodecError::FrameTooShort { size: frame.len() });
        };

        let payload = &frame[FRAME_HEADER_SIZE_BYTES..];
        if payload.len() != declared_len {
            return Err(CodecError::FrameLengthMismatch {
                declared: declared_len,
                actual_payload: payload.len(),
            });
        }

        self.decode_payload(payload)
    }

    pub fn encode_payload(&self, envelope: &MessageEnvelope) -> Result<Vec<u8>, CodecError> {
        let mut map_pairs = Vec::with_capacity(envelope.len());

        for (key, value) in envelope {
            validate_value(value)?;
            map_pairs.push((Value::String(key.as_str().into()), value.clone()));
        }

        let value = Value::Map(map_pairs);

        let mut encoded = Vec::new();
        rmpv::encode::write_value(&mut encoded, &value).map_err(CodecError::MessagePackEncode)?;

        if encoded.len() > self.max_envelope_size_bytes {
            return Err(CodecError::PayloadTooLarge {
                size: encoded.len(),
                limit: self.max_envelope_size_bytes,
            });
        }

        Ok(encoded)
    }

    pub fn decode_payload(&self, payload: &[u8]) -> Result<MessageEnvelope, CodecError> {
        if payload.is_empty() {
            return Err(CodecError::ProtocolZeroLength);
        }
        if payload.len() > self.max_envelope_size_bytes {
            return Err(CodecError::PayloadTooLarge {
                size: payload.len(),
                limit: self.max_envelope_size_bytes,
            });
        }

        let mut cursor = Cursor::new(payload);
        let value = rmpv::decode::read_value(&mut cursor).map_err(CodecError::MessagePackDecode)?;
        if cursor.position() as usize != payload.len() {
            return Err(CodecError::TrailingDataInPayload);
        }

        parse_envelope(value)
    }

    /// Reads the length header, `None` while fewer than four bytes are
    /// available.
    fn declared_length(&self, bytes: &[u8]) -> Result<Option<usize>, CodecError> {
        if bytes.len() < FRAME_HEADER_SIZE_BYTES {
            return Ok(None);
        }

        let declared_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if declared_len == 0 {
            return Err(CodecError::ProtocolZeroLength);
        }
        if declared_len > self.max_envelope_size_bytes {
            return Err(CodecError::ProtocolLengthTooLarge {
                length: declared_len,
                limit: self.max_envelope_size_bytes,
            });
        }
        Ok(Some(declared_len))
    }
}

/// Accumulates bytes read from a non-blocking stream and yields complete
/// frames as they become available.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Pops the next complete envelope. A decode error leaves the stream
    /// unsynchronized, so callers should drop the connection.
    pub fn next_envelope(
        &mut self,
        codec: &WireCodec,
    ) -> Result<Option<MessageEnvelope>, CodecError> {
        let Some(declared_len) = codec.declared_length(&self.pending)? else {
            return Ok(None);
        };
        let frame_len = FRAME_HEADER_SIZE_BYTES + declared_len;
        if self.pending.len() < frame_len {
            return Ok(None);
        }

        let frame: Vec<u8> = self.pending.drain(..frame_len).collect();
        codec.decode_frame(&frame).map(Some)
    }
}

fn parse_envelope(value: Value) -> Result<MessageEnvelope, CodecError> {
    let Value::Map(entries) = value else {
        return Err(CodecError::EnvelopeMustBeMap);
    };

    let mut envelope = MessageEnvelope::new();
    for (key, value) in entries {
        let key = parse_key(key)?;
        validate_value(&value)?;
        envelope.insert(key, value);
    }

    Ok(envelope)
}

fn parse_key(key: Value) -> Result<String, CodecError> {
    let Value::String(text) = key else {
        return Err(CodecError::MapKeyMustBeUtf8String);
    };

    let Some(text) = text.as_str() else {
        return Err(CodecError::MapKeyMustBeUtf8String);
    };

    Ok(text.to_owned())
}

fn validate_value(value: &Value) -> Result<(), CodecError> {
    match value {
        Value::Nil | Value::Boolean(_) | Value::String(_) | Value::Binary(_) => Ok(()),
        Value::Integer(number) => validate_integer(number),
        Value::Array(values) => {
            for value in values {
                validate_value(value)?;
            }
            Ok(())
        }
        Value::Map(entries) => {
            for (key, value) in entries {
                parse_key(key.clone())?;
                validate_value(value)?;
            }
            Ok(())
        }
        Value::F32(_) | Value::F64(_) => Err(CodecError::FloatNotAllowed),
        Value::Ext(_, _) => Err(CodecError::ExtensionTypeNotAllowed),
    }
}

fn validate_integer(number: &Integer) -> Result<(), CodecError> {
    if number.as_i64().is_some() {
        return Ok(());
    }

    match number.as_u64() {
        Some(value) if value <= i64::MAX as u64 => Ok(()),
        _ => Err(CodecError::IntegerOutOfRange),
    }
}

#[cfg(test)]
mod tests {
    use super::{CodecError, FRAME_HEADER_SIZE_BYTES, FrameBuffer, MessageEnvelope, WireCodec};
    use crate::config::AppConfig;
    use rmpv::Value;

    const LIMIT: usize = 1024;

    fn codec() -> WireCodec {
        WireCodec::new(LIMIT).expect("limit should be valid")
    }

    fn raise_envelope(id: &str) -> MessageEnvelope {
        let mut payload = Vec::new();
        payload.push((Value::String("id".into()), Value::String(id.into())));
        payload.push((
            Value::String("topic".into()),
            Value::String("lifetimes".into()),
        ));

        let mut envelope = MessageEnvelope::new();
        envelope.insert("v".to_owned(), Value::Integer(1.into()));
        envelope.insert("t".to_owned(), Value::Integer(10.into()));
        envelope.insert("rid".to_owned(), Value::String("r-1".into()));
        envelope.insert("p".to_owned(), Value::Map(payload));
        envelope
    }

    #[test]
    fn frame_encode_decode_keeps_fields() {
        let codec = codec();
        let frame = codec
            .encode_frame(&raise_envelope("ada"))
            .expect("frame should encode");
        let decoded = codec.decode_frame(&frame).expect("frame should decode");

        assert_eq!(decoded.get("t"), Some(&Value::Integer(10.into())));
        assert_eq!(decoded.get("rid"), Some(&Value::String("r-1".into())));
        assert!(matches!(decoded.get("p"), Some(Value::Map(_))));
    }

    #[test]
    fn limit_comes_from_app_config() {
        let mut app_config = AppConfig::default();
        app_config.wire.max_envelope_size_bytes = 2048;
        let codec = WireCodec::from_app_config(&app_config).expect("codec should build");
        assert_eq!(codec.max_envelope_size_bytes(), 2048);

        app_config.wire.max_envelope_size_bytes = 0;
        let error = WireCodec::from_app_config(&app_config).expect_err("zero limit is invalid");
        assert!(matches!(error, CodecError::InvalidConfiguredLimit { value: 0 }));
    }

    #[test]
    fn rejects_float_values() {
        let mut envelope = MessageEnvelope::new();
        envelope.insert("ratio".to_owned(), Value::F64(1.5));

        let error = codec()
            .encode_frame(&envelope)
            .expect_err("float should be rejected");
        assert!(matches!(error, CodecError::FloatNotAllowed));
    }

    #[test]
    fn rejects_extension_values() {
        let mut envelope = MessageEnvelope::new();
        envelope.insert("ext".to_owned(), Value::Ext(1, vec![1, 2, 3]));

        let error = codec()
            .encode_frame(&envelope)
            .expect_err("ext should be rejected");
        assert!(matches!(error, CodecError::ExtensionTypeNotAllowed));
    }

    #[test]
    fn rejects_unsigned_integers_above_i64() {
        let mut envelope = MessageEnvelope::new();
        envelope.insert(
            "position".to_owned(),
            Value::Integer((i64::MAX as u64 + 1).into()),
        );

        let error = codec()
            .encode_frame(&envelope)
            .expect_err("out-of-range int should be rejected");
        assert!(matches!(error, CodecError::IntegerOutOfRange));
    }

    #[test]
    fn rejects_zero_length_frame() {
        let frame = [0_u8, 0, 0, 0];
        let error = codec()
            .decode_frame(&frame)
            .expect_err("zero-length frame should fail");

        assert!(matches!(error, CodecError::ProtocolZeroLength));
    }

    #[test]
    fn rejects_frame_larger_than_limit() {
        let frame = ((LIMIT + 1) as u32).to_be_bytes().to_vec();
        let error = codec()
            .decode_frame(&frame)
            .expect_err("oversized frame should fail");

        assert!(matches!(error, CodecError::ProtocolLengthTooLarge { .. }));
    }

    #[test]
    fn rejects_payload_larger_than_limit_on_encode() {
        let mut envelope = MessageEnvelope::new();
        envelope.insert(
            "topic".to_owned(),
            Value::String("x".repeat(LIMIT + 1).into()),
        );

        let error = codec()
            .encode_frame(&envelope)
            .expect_err("oversized payload should fail");
        assert!(matches!(error, CodecError::PayloadTooLarge { .. }));
    }

    #[test]
    fn rejects_non_string_map_keys() {
        let value = Value::Map(vec![(Value::Integer(1.into()), Value::String("x".into()))]);
        let mut payload = Vec::new();
        rmpv::encode::write_value(&mut payload, &value).expect("test payload should encode");

        let mut frame = Vec::new();
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);

        let error = codec()
            .decode_frame(&frame)
            .expect_err("non-string key should fail");
        assert!(matches!(error, CodecError::MapKeyMustBeUtf8String));
    }

    #[test]
    fn rejects_trailing_data_in_payload() {
        let mut payload = Vec::new();
        rmpv::encode::write_value(&mut payload, &Value::Map(vec![]))
            .expect("first object should encode");
        rmpv::encode::write_value(&mut payload, &Value::Nil).expect("second object should encode");

        let error = codec()
            .decode_payload(&payload)
            .expect_err("trailing data should fail");
        assert!(matches!(error, CodecError::TrailingDataInPayload));
    }

    #[test]
    fn frame_buffer_reassembles_split_and_coalesced_frames() {
        let codec = codec();
        let first = codec.encode_frame(&raise_envelope("ada")).expect("encode");
        let second = codec.encode_frame(&raise_envelope("bo")).expect("encode");

        let mut buffer = FrameBuffer::new();
        buffer.extend(&first[..FRAME_HEADER_SIZE_BYTES + 2]);
        assert!(buffer.next_envelope(&codec).expect("partial read").is_none());

        buffer.extend(&first[FRAME_HEADER_SIZE_BYTES + 2..]);
        buffer.extend(&second);

        let ids: Vec<Value> = std::iter::from_fn(|| buffer.next_envelope(&codec).expect("decode"))
            .filter_map(|envelope| match envelope.get("p") {
                Some(Value::Map(entries)) => Some(entries[0].1.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![Value::String("ada".into()), Value::String("bo".into())]);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn frame_buffer_fails_fast_on_oversized_header() {
        let codec = codec();
        let mut buffer = FrameBuffer::new();
        buffer.extend(&((LIMIT * 4) as u32).to_be_bytes());

        let error = buffer
            .next_envelope(&codec)
            .expect_err("oversized declared length should fail before payload arrives");
        assert!(matches!(error, CodecError::ProtocolLengthTooLarge { .. }));
    }
}
