//! Core data models that flow through the dispatch pipeline.
//!
//! A [`Record`] is read from the input stream, preprocessed into a
//! [`WorkItem`], grouped into an immutable [`WorkBatch`], and answered by a
//! worker with a [`ResultBatch`] carrying one [`ResultItem`] per surviving
//! record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Separates the source-dataset prefix from the local id (`getty_3273331`).
pub const ID_DELIMITER: char = '_';

/// Errors raised while decoding one input line into a [`Record`].
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("line is not valid UTF-8")]
    Utf8,
    #[error("line has no tab separating content hash and JSON")]
    MissingTab,
    #[error("content hash is not hex: {0:?}")]
    BadHash(String),
    #[error("invalid JSON object: {0}")]
    Json(#[from] serde_json::Error),
    #[error("JSON object has no string `_id` field")]
    MissingId,
    #[error("record id {0:?} has no dataset prefix")]
    BadId(String),
}

/// Raw input record decoded from `<hex-content-hash>\t<JSON object>`.
#[derive(Debug, Clone)]
pub struct Record {
    pub id: String,
    pub content_hash: String,
    pub payload: Map<String, Value>,
}

impl Record {
    /// Decode one line (terminator already stripped).
    pub fn parse_line(line: &[u8]) -> Result<Self, RecordError> {
        let line = std::str::from_utf8(line).map_err(|_| RecordError::Utf8)?;
        let line = line.strip_suffix('\r').unwrap_or(line);
        let (hash, json) = line.split_once('\t').ok_or(RecordError::MissingTab)?;

        if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(RecordError::BadHash(hash.to_string()));
        }

        let payload: Map<String, Value> = serde_json::from_str(json)?;
        let id = payload
            .get("_id")
            .and_then(Value::as_str)
            .ok_or(RecordError::MissingId)?
            .to_string();
        validate_id(&id)?;

        Ok(Self {
            id,
            content_hash: hash.to_ascii_lowercase(),
            payload,
        })
    }

    /// Source dataset prefix of the id (`"getty"` for `"getty_3273331"`).
    pub fn dataset(&self) -> &str {
        self.id
            .split_once(ID_DELIMITER)
            .map(|(prefix, _)| prefix)
            .unwrap_or(&self.id)
    }
}

/// Checks the `<dataset>_<local id>` shape every record id must have.
pub fn validate_id(id: &str) -> Result<(), RecordError> {
    if id.is_empty() || !id.contains(ID_DELIMITER) {
        return Err(RecordError::BadId(id.to_string()));
    }
    Ok(())
}

/// A preprocessed record, ready to ship to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    #[serde(with = "crate::wire::base64_bytes")]
    pub data: Vec<u8>,
}

/// A bounded group of work items dispatched and acknowledged as one unit.
///
/// Never mutated after construction; the scheduler shares it behind an `Arc`
/// and re-queues the very same value on timeout, so `batch_id` survives
/// redelivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkBatch {
    pub batch_id: String,
    pub task_id: String,
    pub items: Vec<WorkItem>,
    pub created_at: DateTime<Utc>,
}

impl WorkBatch {
    pub fn new(task_id: impl Into<String>, items: Vec<WorkItem>) -> Self {
        Self {
            batch_id: new_batch_id(),
            task_id: task_id.into(),
            items,
            created_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Fresh random 128-bit token in simple hex form.
pub fn new_batch_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Derived fields computed for one record by a processing function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultItem {
    pub id: String,
    pub fields: Map<String, Value>,
}

impl ResultItem {
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Numeric `score` field, if the processing function produced one.
    pub fn score(&self) -> Option<f64> {
        self.fields.get("score").and_then(Value::as_f64)
    }
}

/// Companion of a [`WorkBatch`] carrying the computed results.
///
/// May hold fewer items than the originating batch: records the processing
/// function could not handle are simply absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultBatch {
    pub batch_id: String,
    pub task_id: String,
    pub items: Vec<ResultItem>,
}

impl ResultBatch {
    pub fn for_batch(batch: &WorkBatch, items: Vec<ResultItem>) -> Self {
        Self {
            batch_id: batch.batch_id.clone(),
            task_id: batch.task_id.clone(),
            items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_line_decodes_hash_and_payload() {
        let rec = Record::parse_line(b"ABC123\t{\"_id\":\"getty_42\",\"img_data\":\"x\"}").unwrap();
        assert_eq!(rec.id, "getty_42");
        assert_eq!(rec.content_hash, "abc123");
        assert_eq!(rec.dataset(), "getty");
        assert_eq!(rec.payload["img_data"], "x");
    }

    #[test]
    fn parse_line_rejects_malformed_input() {
        assert!(matches!(
            Record::parse_line(b"no tab here"),
            Err(RecordError::MissingTab)
        ));
        assert!(matches!(
            Record::parse_line(b"zz\t{\"_id\":\"a_1\"}"),
            Err(RecordError::BadHash(_))
        ));
        assert!(matches!(
            Record::parse_line(b"ab\t{not json"),
            Err(RecordError::Json(_))
        ));
        assert!(matches!(
            Record::parse_line(b"ab\t{\"id\":\"a_1\"}"),
            Err(RecordError::MissingId)
        ));
        assert!(matches!(
            Record::parse_line(b"ab\t{\"_id\":\"noprefix\"}"),
            Err(RecordError::BadId(_))
        ));
    }

    #[test]
    fn parse_line_tolerates_crlf() {
        let rec = Record::parse_line(b"ab\t{\"_id\":\"src_1\"}\r").unwrap();
        assert_eq!(rec.id, "src_1");
    }

    #[test]
    fn batch_ids_are_unique() {
        let a = WorkBatch::new("t", vec![]);
        let b = WorkBatch::new("t", vec![]);
        assert_ne!(a.batch_id, b.batch_id);
        assert_eq!(a.batch_id.len(), 32);
    }

    #[test]
    fn result_batch_inherits_identity() {
        let batch = WorkBatch::new("image_stats", vec![]);
        let result = ResultBatch::for_batch(&batch, vec![]);
        assert_eq!(result.batch_id, batch.batch_id);
        assert_eq!(result.task_id, "image_stats");
    }
}
