//! Result sinks.
//!
//! `FinishBatch` hands each decoded [`ResultBatch`] to every sink configured
//! for the task, in order:
//!
//! | Sink | When | Key |
//! |------|------|-----|
//! | [`FileSink`] | always | sharded path of sha256(id) |
//! | [`SearchIndexSink`] | `[search_index]` set and the task's `index_update` is not `none` | sha256(id) |
//! | [`VectorSink`] | the task has `vectors = true` and `[vector_store]` is set | sha256(id) |
//!
//! Every write is keyed by record id and replaces what was there, so a
//! batch delivered twice (a redelivered batch whose first worker also
//! finished) leaves the same state as one delivery. When two submissions
//! race, the last one persisted wins.

pub mod file;
pub mod search_index;
pub mod vector_store;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::Config;
use crate::models::ResultBatch;
use crate::tasks::{IndexUpdate, TaskDescriptor};

pub use file::FileSink;
pub use search_index::{IndexMarker, SearchIndexSink};
pub use vector_store::{VectorSink, VectorStore};

/// A destination for completed results.
#[async_trait]
pub trait ResultSink: Send + Sync {
    fn name(&self) -> &str;

    /// Write every item of `batch`. Returns how many were written.
    ///
    /// Must be idempotent per item id.
    async fn persist(&self, batch: &ResultBatch) -> Result<usize>;
}

#[derive(Default)]
pub struct SinkSet {
    sinks: Vec<Box<dyn ResultSink>>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: Box<dyn ResultSink>) {
        self.sinks.push(sink);
    }

    pub fn names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Persist to each sink in turn; the first failure aborts.
    pub async fn persist_all(&self, batch: &ResultBatch) -> Result<()> {
        for sink in &self.sinks {
            let written = sink
                .persist(batch)
                .await
                .with_context(|| format!("{} sink failed for batch {}", sink.name(), batch.batch_id))?;
            debug!(sink = sink.name(), batch_id = %batch.batch_id, written, "persisted");
        }
        Ok(())
    }
}

/// Build the sinks `task` writes to under `config`.
pub async fn build_sinks(config: &Config, task: &TaskDescriptor) -> Result<SinkSet> {
    let mut set = SinkSet::new();
    set.push(Box::new(FileSink::new(&config.output, &task.task_id)));

    if let Some(index) = &config.search_index {
        if task.index_update != IndexUpdate::None {
            set.push(Box::new(SearchIndexSink::new(index, task)?));
        }
    }

    if task.vectors {
        match &config.vector_store {
            Some(store_cfg) => {
                let store = VectorStore::open(
                    &store_cfg.path,
                    store_cfg.initial_capacity_mb * 1024 * 1024,
                )
                .await?;
                set.push(Box::new(VectorSink::new(store)));
            }
            None => warn!(
                task_id = %task.task_id,
                "task produces vectors but no [vector_store] is configured"
            ),
        }
    }

    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResultItem;
    use crate::tasks::TaskRegistry;
    use serde_json::json;
    use tempfile::TempDir;

    fn config(tmp: &TempDir, extra: &str) -> Config {
        let text = format!(
            "[output]\nroot = {:?}\n{}",
            tmp.path().join("out").display().to_string(),
            extra
        );
        toml::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn file_sink_only_by_default() {
        let tmp = TempDir::new().unwrap();
        let reg = TaskRegistry::with_builtins();
        let sinks = build_sinks(&config(&tmp, ""), reg.resolve("order_model_3").unwrap())
            .await
            .unwrap();
        assert_eq!(sinks.names(), vec!["file"]);
    }

    #[tokio::test]
    async fn vector_task_gets_vector_sink_and_index_respects_mode() {
        let tmp = TempDir::new().unwrap();
        let extra = format!(
            "[search_index]\nurl = \"http://127.0.0.1:1\"\nindex = \"images\"\n[vector_store]\npath = {:?}\n",
            tmp.path().join("vectors.db").display().to_string()
        );
        let cfg = config(&tmp, &extra);
        let reg = TaskRegistry::with_builtins();

        let sinks = build_sinks(&cfg, reg.resolve("byte_histogram").unwrap()).await.unwrap();
        assert_eq!(sinks.names(), vec!["file", "search_index", "vector_store"]);

        let sinks = build_sinks(&cfg, reg.resolve("aes_unsplash_out_v1").unwrap())
            .await
            .unwrap();
        assert_eq!(sinks.names(), vec!["file"]);
    }

    #[tokio::test]
    async fn persist_all_writes_each_sink() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp, "");
        let reg = TaskRegistry::with_builtins();
        let sinks = build_sinks(&cfg, reg.resolve("image_stats").unwrap()).await.unwrap();

        let mut fields = serde_json::Map::new();
        fields.insert("format".into(), json!("png"));
        let batch = ResultBatch {
            batch_id: "b1".into(),
            task_id: "image_stats".into(),
            items: vec![ResultItem::new("src_1", fields)],
        };
        sinks.persist_all(&batch).await.unwrap();

        let path = crate::skip::output_path(&cfg.output.root, "image_stats", "src_1", 3);
        assert!(path.exists());
    }
}
