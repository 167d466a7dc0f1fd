//! Transport encoding for batches crossing the network.
//!
//! Every HTTP body is a versioned JSON frame wrapped in standard base64:
//!
//! ```text
//! base64( {"v":1,"msg":{"kind":"batch","batch_id":"…","items":[…],…}} )
//! ```
//!
//! `kind` is one of `batch` (served by `GET /get_batch`), `empty` (the
//! "no work" sentinel) or `result` (posted to `/finish_batch`). Binary
//! fields are base64 strings inside the JSON.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::models::{ResultBatch, WorkBatch};

/// Current frame version. Decoding rejects any other value.
pub const WIRE_VERSION: u16 = 1;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("body is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported frame version {found} (expected {expected})")]
    Version { found: u16, expected: u16 },
    #[error("expected a {expected} frame, got {found}")]
    UnexpectedKind {
        expected: &'static str,
        found: &'static str,
    },
}

/// Decoded frame payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    Batch(WorkBatch),
    Empty,
    Result(ResultBatch),
}

impl Message {
    fn kind(&self) -> &'static str {
        match self {
            Message::Batch(_) => "batch",
            Message::Empty => "empty",
            Message::Result(_) => "result",
        }
    }
}

/// Borrowed twin of [`Message`] so encoding never clones a batch.
#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Outgoing<'a> {
    Batch(&'a WorkBatch),
    Empty,
    Result(&'a ResultBatch),
}

#[derive(Serialize)]
struct OutFrame<'a> {
    v: u16,
    msg: Outgoing<'a>,
}

#[derive(Deserialize)]
struct InFrame {
    v: u16,
    msg: Message,
}

fn encode(msg: Outgoing<'_>) -> Result<String, WireError> {
    let json = serde_json::to_vec(&OutFrame {
        v: WIRE_VERSION,
        msg,
    })?;
    Ok(STANDARD.encode(json))
}

pub fn encode_batch(batch: &WorkBatch) -> Result<String, WireError> {
    encode(Outgoing::Batch(batch))
}

pub fn encode_result(result: &ResultBatch) -> Result<String, WireError> {
    encode(Outgoing::Result(result))
}

/// The fixed "no work available" body returned by `GET /get_batch`.
pub fn empty_frame() -> String {
    STANDARD.encode(format!(
        r#"{{"v":{},"msg":{{"kind":"empty"}}}}"#,
        WIRE_VERSION
    ))
}

/// Decode any frame. Surrounding ASCII whitespace is ignored.
pub fn decode(body: &[u8]) -> Result<Message, WireError> {
    let raw = STANDARD.decode(body.trim_ascii())?;
    let frame: InFrame = serde_json::from_slice(&raw)?;
    if frame.v != WIRE_VERSION {
        return Err(WireError::Version {
            found: frame.v,
            expected: WIRE_VERSION,
        });
    }
    Ok(frame.msg)
}

/// Decode a `GET /get_batch` response: `None` for the empty sentinel.
pub fn decode_batch(body: &[u8]) -> Result<Option<WorkBatch>, WireError> {
    match decode(body)? {
        Message::Batch(batch) => Ok(Some(batch)),
        Message::Empty => Ok(None),
        other => Err(WireError::UnexpectedKind {
            expected: "batch",
            found: other.kind(),
        }),
    }
}

/// Decode a `POST /finish_batch` body.
pub fn decode_result(body: &[u8]) -> Result<ResultBatch, WireError> {
    match decode(body)? {
        Message::Result(result) => Ok(result),
        other => Err(WireError::UnexpectedKind {
            expected: "result",
            found: other.kind(),
        }),
    }
}

/// Serde adapter storing `Vec<u8>` as a base64 string.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
