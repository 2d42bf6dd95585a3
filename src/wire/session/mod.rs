use std::fmt;

use rmpv::Value;

use crate::intake::{Action, IntakeError, Reply, Signal};
use crate::orchestrator::Lane;
use crate::orchestrator::desk::DispatchOutcome;
use crate::platform::{Location, Notice};
use crate::wire::codec::{CodecError, MessageEnvelope, WireCodec};
use crate::wire::envelope::{EnvelopeError, PayloadMap, WireEnvelope};

pub const RAISE_MESSAGE_TYPE: i64 = 1;
pub const JOIN_MESSAGE_TYPE: i64 = 2;
pub const READY_MESSAGE_TYPE: i64 = 3;
pub const DEGRADE_MESSAGE_TYPE: i64 = 4;
pub const WITHDRAW_MESSAGE_TYPE: i64 = 5;
pub const POSITION_MESSAGE_TYPE: i64 = 6;
pub const SIZE_MESSAGE_TYPE: i64 = 7;
pub const PRESENCE_MESSAGE_TYPE: i64 = 8;
pub const PROTOCOL_VIOLATION_CODE: &str = "PROTOCOL_VIOLATION";
pub const IDENTITY_MISMATCH_CODE: &str = "IDENTITY_MISMATCH";

/// A decoded client message, attributed to the identity it speaks for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientRequest {
    Signal {
        request_id: String,
        signal: Signal,
    },
    Presence {
        request_id: String,
        identity: String,
        location: Option<Location>,
    },
}

impl ClientRequest {
    pub fn request_id(&self) -> &str {
        match self {
            Self::Signal { request_id, .. } | Self::Presence { request_id, .. } => request_id,
        }
    }

    pub fn identity(&self) -> &str {
        match self {
            Self::Signal { signal, .. } => &signal.source,
            Self::Presence { identity, .. } => identity,
        }
    }
}

#[derive(Debug)]
pub enum SessionError {
    Codec(CodecError),
    Envelope(EnvelopeError),
    UnknownMessageType {
        request_id: String,
        message_type: i64,
    },
    ProtocolViolation {
        request_id: Option<String>,
        code: String,
        message: String,
    },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(source) => write!(f, "session codec error: {source}"),
            Self::Envelope(source) => write!(f, "session envelope error: {source}"),
            Self::UnknownMessageType {
                request_id,
                message_type,
            } => write!(
                f,
                "unsupported message type {message_type} (rid={request_id})"
            ),
            Self::ProtocolViolation {
                request_id,
                code,
                message,
            } => write!(
                f,
                "session protocol violation (rid={:?}, code={}): {}",
                request_id, code, message
            ),
        }
    }
}

impl std::error::Error for SessionError {}

fn violation(request_id: &str, message: impl Into<String>) -> SessionError {
    SessionError::ProtocolViolation {
        request_id: Some(request_id.to_owned()),
        code: PROTOCOL_VIOLATION_CODE.to_owned(),
        message: message.into(),
    }
}

/// Translates one client envelope. `bound_identity` is the identity the
/// connection already speaks for, if any; a message for another identity is
/// rejected.
pub fn evaluate_client_envelope(
    raw: &MessageEnvelope,
    bound_identity: Option<&str>,
) -> Result<ClientRequest, SessionError> {
    let envelope = WireEnvelope::from_raw(raw).map_err(SessionError::Envelope)?;
    envelope
        .validate_client_to_server()
        .map_err(SessionError::Envelope)?;

    let request_id = envelope.request_id.as_str();
    let label = match envelope.message_type {
        RAISE_MESSAGE_TYPE => "RAISE",
        JOIN_MESSAGE_TYPE => "JOIN",
        READY_MESSAGE_TYPE => "READY",
        DEGRADE_MESSAGE_TYPE => "DEGRADE",
        WITHDRAW_MESSAGE_TYPE => "WITHDRAW",
        POSITION_MESSAGE_TYPE => "POSITION",
        SIZE_MESSAGE_TYPE => "SIZE",
        PRESENCE_MESSAGE_TYPE => "PRESENCE",
        other => {
            return Err(SessionError::UnknownMessageType {
                request_id: envelope.request_id,
                message_type: other,
            });
        }
    };
    let identity = required_string(&envelope, "id", label)?;
    if identity.trim().is_empty() {
        return Err(violation(request_id, format!("{label} payload key 'id' must not be blank")));
    }
    if let Some(bound) = bound_identity {
        if bound != identity {
            return Err(SessionError::ProtocolViolation {
                request_id: Some(request_id.to_owned()),
                code: IDENTITY_MISMATCH_CODE.to_owned(),
                message: format!("connection speaks for '{bound}', not '{identity}'"),
            });
        }
    }

    if envelope.message_type == PRESENCE_MESSAGE_TYPE {
        let location = optional_string(&envelope, "location", label)?
            .filter(|location| !location.is_empty())
            .map(Location::new);
        return Ok(ClientRequest::Presence {
            request_id: envelope.request_id.clone(),
            identity,
            location,
        });
    }

    let lane = if envelope.message_type == JOIN_MESSAGE_TYPE {
        Lane::Booth
    } else {
        lane_field(&envelope, label)?
    };

    let action = match envelope.message_type {
        RAISE_MESSAGE_TYPE | JOIN_MESSAGE_TYPE => Action::Enqueue {
            display_name: optional_string(&envelope, "name", label)?
                .unwrap_or_else(|| identity.clone()),
            group_members: string_list(&envelope, "buddies", label)?,
            topic: optional_string(&envelope, "topic", label)?
                .filter(|topic| !topic.trim().is_empty()),
        },
        READY_MESSAGE_TYPE => Action::HelperReady,
        DEGRADE_MESSAGE_TYPE => Action::Degrade,
        WITHDRAW_MESSAGE_TYPE => Action::Withdraw {
            requester_id: required_string(&envelope, "target", label)?,
        },
        POSITION_MESSAGE_TYPE => Action::QueryPosition,
        _ => Action::QuerySize,
    };

    Ok(ClientRequest::Signal {
        request_id: envelope.request_id.clone(),
        signal: Signal::new(identity, lane, action),
    })
}

pub fn build_reply_frame(
    codec: &WireCodec,
    request_id: &str,
    reply: &Reply,
) -> Result<Vec<u8>, SessionError> {
    codec
        .encode_frame(&WireEnvelope::ok(request_id, reply_payload(reply)).into_raw())
        .map_err(SessionError::Codec)
}

pub fn build_presence_ack_frame(codec: &WireCodec, request_id: &str) -> Result<Vec<u8>, SessionError> {
    let mut payload = PayloadMap::new();
    insert_str(&mut payload, "status", "presence_recorded");
    codec
        .encode_frame(&WireEnvelope::ok(request_id, payload).into_raw())
        .map_err(SessionError::Codec)
}

pub fn build_intake_error_frame(
    codec: &WireCodec,
    request_id: &str,
    error: &IntakeError,
) -> Result<Vec<u8>, SessionError> {
    build_protocol_error_frame(codec, request_id, error.code(), &error.to_string())
}

pub fn build_protocol_error_frame(
    codec: &WireCodec,
    request_id: &str,
    code: &str,
    message: &str,
) -> Result<Vec<u8>, SessionError> {
    codec
        .encode_frame(&WireEnvelope::err(request_id, code, message).into_raw())
        .map_err(SessionError::Codec)
}

pub fn build_unknown_type_frame(
    codec: &WireCodec,
    request_id: &str,
    message_type: i64,
) -> Result<Vec<u8>, SessionError> {
    codec
        .encode_frame(&WireEnvelope::unknown_type_error(request_id, message_type).into_raw())
        .map_err(SessionError::Codec)
}

pub fn build_notice_frame(codec: &WireCodec, notice: &Notice) -> Result<Vec<u8>, SessionError> {
    let mut payload = PayloadMap::new();
    insert_str(&mut payload, "code", notice.code());
    insert_str(&mut payload, "message", &notice.message());
    match notice {
        Notice::Enqueued { position, mode } => {
            insert_int(&mut payload, "position", *position);
            insert_str(&mut payload, "mode", mode.as_str());
        }
        Notice::AlreadyWaiting { position } => insert_int(&mut payload, "position", *position),
        _ => {}
    }

    codec
        .encode_frame(&WireEnvelope::notify(payload).into_raw())
        .map_err(SessionError::Codec)
}

/// OK payload for an intake reply; `status` names the result.
pub fn reply_payload(reply: &Reply) -> PayloadMap {
    let mut payload = PayloadMap::new();
    match reply {
        Reply::Enqueued { position } => {
            insert_str(&mut payload, "status", "enqueued");
            insert_int(&mut payload, "position", *position);
        }
        Reply::AlreadyWaiting { position } => {
            insert_str(&mut payload, "status", "already_waiting");
            insert_int(&mut payload, "position", *position);
        }
        Reply::Dispatched(outcome) => dispatch_payload(&mut payload, outcome),
        Reply::Mode { changed, mode } => {
            insert_str(&mut payload, "status", "mode");
            payload.insert("changed".to_owned(), Value::Boolean(*changed));
            insert_str(&mut payload, "mode", mode.as_str());
        }
        Reply::Withdrawn { removed } => {
            insert_str(&mut payload, "status", "withdrawn");
            payload.insert("removed".to_owned(), Value::Boolean(*removed));
        }
        Reply::Position(position) => {
            insert_str(&mut payload, "status", "position");
            match position {
                Some(position) => insert_int(&mut payload, "position", *position),
                None => {
                    payload.insert("position".to_owned(), Value::Nil);
                }
            }
        }
        Reply::Size(size) => {
            insert_str(&mut payload, "status", "size");
            insert_int(&mut payload, "size", *size);
        }
        Reply::Duplicate => insert_str(&mut payload, "status", "duplicate"),
    }
    payload
}

fn dispatch_payload(payload: &mut PayloadMap, outcome: &DispatchOutcome) {
    insert_str(payload, "status", outcome.code());
    if let Some(entry) = outcome.entry() {
        insert_str(payload, "requester_id", &entry.requester_id);
        insert_str(payload, "display_name", &entry.display_name);
        payload.insert(
            "topic".to_owned(),
            entry
                .topic
                .as_deref()
                .map_or(Value::Nil, |topic| Value::String(topic.into())),
        );
    }

    match outcome {
        DispatchOutcome::Connected { location, .. } => {
            insert_str(payload, "location", location.as_str());
        }
        DispatchOutcome::ConnectionFailed { requeued, .. } => {
            payload.insert("requeued".to_owned(), Value::Boolean(*requeued));
        }
        DispatchOutcome::GroupServed {
            connected,
            failed,
            next_up,
            requeued,
            ..
        } => {
            payload.insert("connected".to_owned(), string_array(connected));
            payload.insert("failed".to_owned(), string_array(failed));
            payload.insert(
                "next_up".to_owned(),
                next_up
                    .as_deref()
                    .map_or(Value::Nil, |lead| Value::String(lead.into())),
            );
            payload.insert("requeued".to_owned(), Value::Boolean(*requeued));
        }
        _ => {}
    }
}

fn insert_str(payload: &mut PayloadMap, key: &str, value: &str) {
    payload.insert(key.to_owned(), Value::String(value.into()));
}

fn insert_int(payload: &mut PayloadMap, key: &str, value: usize) {
    payload.insert(key.to_owned(), Value::Integer((value as i64).into()));
}

fn string_array(values: &[String]) -> Value {
    Value::Array(
        values
            .iter()
            .map(|value| Value::String(value.as_str().into()))
            .collect(),
    )
}

fn required_string(
    envelope: &WireEnvelope,
    key: &str,
    label: &str,
) -> Result<String, SessionError> {
    optional_string(envelope, key, label)?.ok_or_else(|| {
        violation(
            &envelope.request_id,
            format!("{label} payload must contain string key '{key}'"),
        )
    })
}

fn optional_string(
    envelope: &WireEnvelope,
    key: &str,
    label: &str,
) -> Result<Option<String>, SessionError> {
    envelope
        .payload_str(key)
        .map(|text| text.map(str::to_owned))
        .map_err(|error| violation(&envelope.request_id, format!("{label} {error}")))
}

fn string_list(envelope: &WireEnvelope, key: &str, label: &str) -> Result<Vec<String>, SessionError> {
    envelope
        .payload_str_list(key)
        .map_err(|error| violation(&envelope.request_id, format!("{label} {error}")))
}

fn lane_field(envelope: &WireEnvelope, label: &str) -> Result<Lane, SessionError> {
    match optional_string(envelope, "lane", label)? {
        None => Ok(Lane::Session),
        Some(raw) => raw.parse().map_err(|()| {
            violation(
                &envelope.request_id,
                format!("{label} payload key 'lane' must be 'session' or 'booth', got '{raw}'"),
            )
        }),
    }
}
