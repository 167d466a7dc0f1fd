//! Skip/resume filter.
//!
//! Every record id maps to a deterministic, sharded output path:
//!
//! ```text
//! <output_root>/<task_id>/<h[..shard_len]>/<h>.json     h = hex(sha256(id))
//! ```
//!
//! A record whose output already exists is skipped, which makes restarting
//! the producer from the beginning of its input idempotent. The check is
//! read-only; the file itself is written by the file sink after the worker
//! reports back.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Lowercase hex SHA-256 of a record id.
///
/// Used for output file names, search-index document ids and vector-store
/// keys, so all three sinks agree on the identity of a record.
pub fn id_hash(id: &str) -> String {
    hex::encode(Sha256::digest(id.as_bytes()))
}

/// Sharded output path of `id` for `task_id` under `root`.
pub fn output_path(root: &Path, task_id: &str, id: &str, shard_len: usize) -> PathBuf {
    let hash = id_hash(id);
    let shard = &hash[..shard_len.min(hash.len())];
    root.join(task_id)
        .join(shard)
        .join(format!("{}.json", hash))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Not processed yet; the output will land at this path.
    Process(PathBuf),
    Skip,
}

/// Cheap "already done" write for records skipped here but still unmarked in
/// an external index.
///
/// Failures are logged by the filter and never stop the producer.
pub trait MarkDone: Send {
    fn mark_done(&mut self, id: &str) -> Result<()>;

    /// Push out anything buffered. Called at end of input.
    fn flush(&mut self) -> Result<()>;
}

pub struct SkipFilter {
    root: PathBuf,
    task_id: String,
    shard_len: usize,
    force: bool,
    marker: Option<Box<dyn MarkDone>>,
}

impl SkipFilter {
    pub fn new(root: impl Into<PathBuf>, task_id: impl Into<String>, shard_len: usize) -> Self {
        Self {
            root: root.into(),
            task_id: task_id.into(),
            shard_len,
            force: false,
            marker: None,
        }
    }

    /// Process every record regardless of existing output.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_marker(mut self, marker: Box<dyn MarkDone>) -> Self {
        self.marker = Some(marker);
        self
    }

    pub fn output_path(&self, id: &str) -> PathBuf {
        output_path(&self.root, &self.task_id, id, self.shard_len)
    }

    pub fn should_process(&mut self, id: &str) -> Result<Decision> {
        let path = self.output_path(id);
        if self.force || !path.exists() {
            return Ok(Decision::Process(path));
        }

        debug!(id, path = %path.display(), "skip: output exists");
        if let Some(marker) = self.marker.as_mut() {
            if let Err(e) = marker.mark_done(id) {
                warn!(id, error = %e, "mark-done failed; will retry on next run");
            }
        }
        Ok(Decision::Skip)
    }

    pub fn finish(&mut self) -> Result<()> {
        if let Some(marker) = self.marker.as_mut() {
            if let Err(e) = marker.flush() {
                warn!(error = %e, "final mark-done flush failed");
            }
        }
        Ok(())
    }
}
