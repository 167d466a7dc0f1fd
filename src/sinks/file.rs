//! One JSON file per record under the sharded output tree.
//!
//! Each file lands at the same path the skip filter checks, so writing it is
//! what marks the record done for the next run.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};

use super::ResultSink;
use crate::config::OutputConfig;
use crate::models::{ResultBatch, ResultItem};
use crate::skip::output_path;

pub struct FileSink {
    root: PathBuf,
    task_id: String,
    shard_len: usize,
}

impl FileSink {
    pub fn new(output: &OutputConfig, task_id: &str) -> Self {
        Self {
            root: output.root.clone(),
            task_id: task_id.to_string(),
            shard_len: output.shard_len,
        }
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        output_path(&self.root, &self.task_id, id, self.shard_len)
    }

    /// Write one item. The temp-file rename makes the replacement atomic.
    pub async fn write_item(&self, item: &ResultItem) -> Result<PathBuf> {
        let path = self.path_for(&item.id);
        let doc = json!({
            "_id": item.id,
            "task_id": self.task_id,
            "fields": item.fields,
        });
        let bytes = serde_json::to_vec(&doc)?;
        write_atomic(&path, &bytes).await?;
        Ok(path)
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e).with_context(|| format!("Failed to rename into {}", path.display()));
    }
    Ok(())
}

#[async_trait]
impl ResultSink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn persist(&self, batch: &ResultBatch) -> Result<usize> {
        for item in &batch.items {
            self.write_item(item).await?;
        }
        Ok(batch.items.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use tempfile::TempDir;

    fn sink(tmp: &TempDir) -> FileSink {
        let output = OutputConfig {
            root: tmp.path().to_path_buf(),
            shard_len: 2,
            force: false,
        };
        FileSink::new(&output, "image_stats")
    }

    fn batch(score: f64) -> ResultBatch {
        let mut fields = Map::new();
        fields.insert("score".into(), json!(score));
        ResultBatch {
            batch_id: "b1".into(),
            task_id: "image_stats".into(),
            items: vec![
                ResultItem::new("src_1", fields.clone()),
                ResultItem::new("src_2", fields),
            ],
        }
    }

    fn snapshot(tmp: &TempDir) -> Vec<(PathBuf, String)> {
        let mut files: Vec<_> = walkdir::WalkDir::new(tmp.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let body = std::fs::read_to_string(e.path()).unwrap();
                (e.path().to_path_buf(), body)
            })
            .collect();
        files.sort();
        files
    }

    #[tokio::test]
    async fn writes_one_file_per_item_at_skip_path() {
        let tmp = TempDir::new().unwrap();
        let sink = sink(&tmp);
        assert_eq!(sink.persist(&batch(0.5)).await.unwrap(), 2);

        let path = output_path(tmp.path(), "image_stats", "src_1", 2);
        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(doc["_id"], "src_1");
        assert_eq!(doc["fields"]["score"], 0.5);
    }

    #[tokio::test]
    async fn duplicate_submission_leaves_identical_state() {
        let tmp = TempDir::new().unwrap();
        let sink = sink(&tmp);
        sink.persist(&batch(0.5)).await.unwrap();
        let once = snapshot(&tmp);
        sink.persist(&batch(0.5)).await.unwrap();
        assert_eq!(snapshot(&tmp), once);
        assert_eq!(once.len(), 2);
    }

    #[tokio::test]
    async fn last_write_wins() {
        let tmp = TempDir::new().unwrap();
        let sink = sink(&tmp);
        sink.persist(&batch(0.1)).await.unwrap();
        sink.persist(&batch(0.9)).await.unwrap();
        let body = std::fs::read_to_string(sink.path_for("src_2")).unwrap();
        assert!(body.contains("0.9"));
    }
}
