//! Bulk document updates against an Elasticsearch-compatible index.
//!
//! Each result item becomes one `update` action on the document whose id is
//! sha256(record id). All actions of a batch go out in one `_bulk` request.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

use super::ResultSink;
use crate::config::SearchIndexConfig;
use crate::models::{ResultBatch, ResultItem};
use crate::skip::{id_hash, MarkDone};
use crate::tasks::{IndexUpdate, TaskDescriptor};

pub const PLACEHOLDER: &str = "PLACEHOLDER";

/// Flush the mark-done buffer once it holds this many updates.
const MARK_DONE_FLUSH_AT: usize = 100;

/// The partial document written for one item.
pub fn update_doc(mode: IndexUpdate, field_name: &str, item: &ResultItem) -> Option<Value> {
    let mut doc = Map::new();
    match mode {
        IndexUpdate::None => return None,
        IndexUpdate::Placeholder => {
            doc.insert(field_name.to_string(), json!(PLACEHOLDER));
        }
        IndexUpdate::Fields => {
            doc.insert(field_name.to_string(), Value::Object(item.fields.clone()));
            if let Some(score) = item.score() {
                doc.insert(format!("score_{}", field_name), json!(score));
            }
        }
    }
    Some(Value::Object(doc))
}

/// NDJSON body for a `_bulk` request of `update` actions.
fn bulk_body<'a>(index: &str, docs: impl Iterator<Item = (&'a str, Value)>) -> Result<String> {
    let mut body = String::new();
    for (id, doc) in docs {
        let action = json!({ "update": { "_index": index, "_id": id_hash(id) } });
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(&json!({ "doc": doc }))?);
        body.push('\n');
    }
    Ok(body)
}

/// Fail on a non-2xx status or a bulk response reporting item errors.
fn check_bulk_response(status: reqwest::StatusCode, body: &str) -> Result<()> {
    if !status.is_success() {
        bail!("search index error {}: {}", status, body);
    }
    let parsed: Value = serde_json::from_str(body).context("Invalid _bulk response")?;
    if parsed.get("errors").and_then(Value::as_bool).unwrap_or(false) {
        let first = parsed
            .get("items")
            .and_then(Value::as_array)
            .and_then(|items| {
                items
                    .iter()
                    .find_map(|i| i.get("update").and_then(|u| u.get("error")).cloned())
            })
            .unwrap_or(Value::Null);
        bail!("search index rejected part of the batch: {}", first);
    }
    Ok(())
}

pub struct SearchIndexSink {
    client: reqwest::Client,
    bulk_url: String,
    index: String,
    field_name: String,
    mode: IndexUpdate,
}

impl SearchIndexSink {
    pub fn new(config: &SearchIndexConfig, task: &TaskDescriptor) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            bulk_url: format!("{}/_bulk", config.url.trim_end_matches('/')),
            index: config.index.clone(),
            field_name: task.field_name.clone(),
            mode: task.index_update,
        })
    }
}

#[async_trait]
impl ResultSink for SearchIndexSink {
    fn name(&self) -> &str {
        "search_index"
    }

    async fn persist(&self, batch: &ResultBatch) -> Result<usize> {
        let docs: Vec<(&str, Value)> = batch
            .items
            .iter()
            .filter_map(|item| {
                update_doc(self.mode, &self.field_name, item).map(|d| (item.id.as_str(), d))
            })
            .collect();
        if docs.is_empty() {
            return Ok(0);
        }
        let count = docs.len();
        let body = bulk_body(&self.index, docs.into_iter())?;

        let resp = self
            .client
            .post(&self.bulk_url)
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.bulk_url))?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        check_bulk_response(status, &text)?;
        debug!(index = %self.index, count, "bulk update committed");
        Ok(count)
    }
}

/// Writes placeholders for records the producer skipped, so an index that
/// never saw their result stops offering them for work.
///
/// Runs on the producer thread, hence the blocking client.
pub struct IndexMarker {
    // Built on first flush: a blocking client must not be created or
    // dropped inside the async runtime that constructs the marker.
    client: Option<reqwest::blocking::Client>,
    timeout: Duration,
    bulk_url: String,
    index: String,
    field_name: String,
    buffer: Vec<String>,
}

impl IndexMarker {
    /// The marker for `task`, if skipped records of it should be marked.
    ///
    /// Only placeholder tasks qualify: for any other mode the index already
    /// holds the real result of a skipped record, and a placeholder would
    /// overwrite it.
    pub fn for_task(config: &SearchIndexConfig, task: &TaskDescriptor) -> Option<Self> {
        if !config.mark_done_on_skip || task.index_update != IndexUpdate::Placeholder {
            return None;
        }
        Some(Self::new(config, task))
    }

    fn new(config: &SearchIndexConfig, task: &TaskDescriptor) -> Self {
        Self {
            client: None,
            timeout: Duration::from_secs(config.timeout_secs),
            bulk_url: format!("{}/_bulk", config.url.trim_end_matches('/')),
            index: config.index.clone(),
            field_name: task.field_name.clone(),
            buffer: Vec::new(),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn client(&mut self) -> Result<&reqwest::blocking::Client> {
        if self.client.is_none() {
            self.client = Some(
                reqwest::blocking::Client::builder()
                    .timeout(self.timeout)
                    .build()?,
            );
        }
        self.client
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("index client unavailable"))
    }
}

impl MarkDone for IndexMarker {
    fn mark_done(&mut self, id: &str) -> Result<()> {
        self.buffer.push(id.to_string());
        if self.buffer.len() >= MARK_DONE_FLUSH_AT {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let ids = std::mem::take(&mut self.buffer);
        let mut doc = Map::new();
        doc.insert(self.field_name.clone(), json!(PLACEHOLDER));
        let doc = Value::Object(doc);
        let body = bulk_body(&self.index, ids.iter().map(|id| (id.as_str(), doc.clone())))?;

        let bulk_url = self.bulk_url.clone();
        let resp = self
            .client()?
            .post(&bulk_url)
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .with_context(|| format!("Failed to reach {}", bulk_url))?;
        let status = resp.status();
        let text = resp.text().unwrap_or_default();
        if let Err(e) = check_bulk_response(status, &text) {
            warn!(error = %e, count = ids.len(), "mark-done update failed");
            return Err(e);
        }
        debug!(count = ids.len(), "marked skipped records done");
        Ok(())
    }
}
