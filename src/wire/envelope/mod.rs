use std::collections::BTreeMap;
use std::fmt;

use rmpv::Value;

use crate::wire::codec::MessageEnvelope;

pub const PROTOCOL_VERSION: i64 = 1;
pub const SERVER_PUSH_REQUEST_ID: &str = "0";
pub const OK_MESSAGE_TYPE: i64 = 101;
pub const ERR_MESSAGE_TYPE: i64 = 102;
pub const NOTIFY_MESSAGE_TYPE: i64 = 103;
pub const UNKNOWN_MESSAGE_TYPE_CODE: &str = "UNKNOWN_MESSAGE_TYPE";

pub type PayloadMap = BTreeMap<String, Value>;

#[derive(Clone, Debug, PartialEq)]
pub struct WireEnvelope {
    pub version: i64,
    pub message_type: i64,
    pub request_id: String,
    pub payload: PayloadMap,
}

#[derive(Debug, PartialEq)]
pub enum EnvelopeError {
    MissingField { field: &'static str },
    InvalidFieldType { field: &'static str, expected: &'static str },
    InvalidProtocolVersion { expected: i64, actual: i64 },
    IntegerOutOfRange { field: &'static str },
    PayloadMapKeyMustBeUtf8String,
    RequestIdRequired,
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField { field } => write!(f, "missing envelope field '{field}'"),
            Self::InvalidFieldType { field, expected } => {
                write!(f, "invalid field type for '{field}', expected {expected}")
            }
            Self::InvalidProtocolVersion { expected, actual } => {
                write!(f, "invalid protocol version {actual}, expected {expected}")
            }
            Self::IntegerOutOfRange { field } => {
                write!(f, "integer field '{field}' must fit signed int64")
            }
            Self::PayloadMapKeyMustBeUtf8String => {
                write!(f, "payload map keys must be UTF-8 strings")
            }
            Self::RequestIdRequired => write!(f, "request id must be non-empty"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// Payload key holding a value of the wrong shape.
#[derive(Debug, PartialEq, Eq)]
pub struct PayloadTypeError {
    pub key: String,
    pub expected: &'static str,
}

impl fmt::Display for PayloadTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "payload key '{}' must be {}", self.key, self.expected)
    }
}

impl std::error::Error for PayloadTypeError {}

impl WireEnvelope {
    pub fn new(message_type: i64, request_id: impl Into<String>, payload: PayloadMap) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type,
            request_id: request_id.into(),
            payload,
        }
    }

    pub fn from_raw(raw: &MessageEnvelope) -> Result<Self, EnvelopeError> {
        let version = parse_i64(raw.get("v"), "v")?;
        if version != PROTOCOL_VERSION {
            return Err(EnvelopeError::InvalidProtocolVersion {
                expected: PROTOCOL_VERSION,
                actual: version,
            });
        }

        let message_type = parse_i64(raw.get("t"), "t")?;
        let request_id = parse_string(raw.get("rid"), "rid")?;
        let payload = parse_payload_map(raw.get("p"))?;

        Ok(Self {
            version,
            message_type,
            request_id,
            payload,
        })
    }

    pub fn into_raw(self) -> MessageEnvelope {
        let mut raw = MessageEnvelope::new();
        raw.insert("v".to_owned(), Value::Integer(self.version.into()));
        raw.insert("t".to_owned(), Value::Integer(self.message_type.into()));
        raw.insert("rid".to_owned(), Value::String(self.request_id.into()));

        let payload_map = self
            .payload
            .into_iter()
            .map(|(k, v)| (Value::String(k.into()), v))
            .collect::<Vec<_>>();
        raw.insert("p".to_owned(), Value::Map(payload_map));

        raw
    }

    pub fn validate_client_to_server(&self) -> Result<(), EnvelopeError> {
        if self.request_id.is_empty() {
            return Err(EnvelopeError::RequestIdRequired);
        }

        Ok(())
    }

    /// Text under `key`. Absent keys and nil read as `None`.
    pub fn payload_str(&self, key: &str) -> Result<Option<&str>, PayloadTypeError> {
        match self.payload.get(key) {
            None | Some(Value::Nil) => Ok(None),
            Some(value) => value.as_str().map(Some).ok_or_else(|| PayloadTypeError {
                key: key.to_owned(),
                expected: "string or nil",
            }),
        }
    }

    /// Identities listed under `key`, e.g. a requester's buddies. Absent keys
    /// and nil read as an empty list.
    pub fn payload_str_list(&self, key: &str) -> Result<Vec<String>, PayloadTypeError> {
        let not_a_list = || PayloadTypeError {
            key: key.to_owned(),
            expected: "an array of strings",
        };
        let values = match self.payload.get(key) {
            None | Some(Value::Nil) => return Ok(Vec::new()),
            Some(Value::Array(values)) => values,
            Some(_) => return Err(not_a_list()),
        };

        values
            .iter()
            .map(|value| value.as_str().map(str::to_owned).ok_or_else(not_a_list))
            .collect()
    }

    /// Successful reply echoing the request id.
    pub fn ok(request_id: impl Into<String>, payload: PayloadMap) -> Self {
        Self::new(OK_MESSAGE_TYPE, request_id, payload)
    }

    /// Error reply. Protocol failures that happen before a request id is
    /// known are answered with the push id.
    pub fn err(request_id: impl Into<String>, code: &str, message: &str) -> Self {
        let mut payload = PayloadMap::new();
        payload.insert("code".to_owned(), Value::String(code.into()));
        payload.insert("message".to_owned(), Value::String(message.into()));
        Self::new(ERR_MESSAGE_TYPE, request_id, payload)
    }

    /// Unsolicited notice for the identity bound to a connection.
    pub fn notify(payload: PayloadMap) -> Self {
        Self::new(NOTIFY_MESSAGE_TYPE, SERVER_PUSH_REQUEST_ID, payload)
    }

    pub fn unknown_type_error(request_id: impl Into<String>, unsupported_type: i64) -> Self {
        let mut envelope = Self::err(
            request_id,
            UNKNOWN_MESSAGE_TYPE_CODE,
            "message type is not supported",
        );
        envelope.payload.insert(
            "unsupported_t".to_owned(),
            Value::Integer(unsupported_type.into()),
        );
        envelope
    }
}

fn parse_i64(value: Option<&Value>, field: &'static str) -> Result<i64, EnvelopeError> {
    let value = value.ok_or(EnvelopeError::MissingField { field })?;
    let Value::Integer(integer) = value else {
        return Err(EnvelopeError::InvalidFieldType {
            field,
            expected: "int",
        });
    };

    if let Some(v) = integer.as_i64() {
        return Ok(v);
    }

    match integer.as_u64() {
        Some(v) if v <= i64::MAX as u64 => Ok(v as i64),
        _ => Err(EnvelopeError::IntegerOutOfRange { field }),
    }
}

fn parse_string(value: Option<&Value>, field: &'static str) -> Result<String, EnvelopeError> {
    let value = value.ok_or(EnvelopeError::MissingField { field })?;
    let Value::String(text) = value else {
        return Err(EnvelopeError::InvalidFieldType {
            field,
            expected: "string",
        });
    };

    let Some(text) = text.as_str() else {
        return Err(EnvelopeError::InvalidFieldType {
            field,
            expected: "string",
        });
    };

    Ok(text.to_owned())
}

fn parse_payload_map(value: Option<&Value>) -> Result<PayloadMap, EnvelopeError> {
    let value = value.ok_or(EnvelopeError::MissingField { field: "p" })?;
    let Value::Map(entries) = value else {
        return Err(EnvelopeError::InvalidFieldType {
            field: "p",
            expected: "map",
        });
    };

    let mut payload = PayloadMap::new();
    for (key, value) in entries {
        let Value::String(text) = key else {
            return Err(EnvelopeError::PayloadMapKeyMustBeUtf8String);
        };
        let Some(text) = text.as_str() else {
            return Err(EnvelopeError::PayloadMapKeyMustBeUtf8String);
        };

        payload.insert(text.to_owned(), value.clone());
    }

    Ok(payload)
}
