//! Task table and processing-function registry.
//!
//! A task id names everything a server/client pair needs to agree on: the
//! port they meet on, the processing function the worker runs, the field the
//! results are stored under, and which sinks receive them. The table is
//! resolved once at startup and never changes afterwards.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 TaskRegistry                 │
//! │  tasks:      task_id   → TaskDescriptor      │
//! │  processors: processor → ProcessorFactory    │
//! └──────────────┬───────────────────────────────┘
//!                ▼
//!   start_server: resolve(task_id)   start_client: processor_for(task)
//! ```
//!
//! Built-in tasks can be overridden, and new ones added, through
//! `[tasks.<id>]` tables in the config file.

use anyhow::{bail, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::models::{ResultItem, WorkBatch};

/// How results are written to the search index, when one is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexUpdate {
    /// Not written to the index at all.
    None,
    /// `doc[field] = fields`, plus `doc["score_<field>"]` when scored.
    Fields,
    /// `doc[field] = "PLACEHOLDER"`; the payload lives in another sink.
    Placeholder,
}

/// Static per-task configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDescriptor {
    pub task_id: String,
    pub port: u16,
    pub processor: String,
    pub field_name: String,
    pub index_update: IndexUpdate,
    /// Also append each result's vector to the vector store.
    pub vectors: bool,
}

impl TaskDescriptor {
    pub fn new(task_id: &str, port: u16, processor: &str, field_name: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            port,
            processor: processor.to_string(),
            field_name: field_name.to_string(),
            index_update: IndexUpdate::Fields,
            vectors: false,
        }
    }

    fn index_update(mut self, mode: IndexUpdate) -> Self {
        self.index_update = mode;
        self
    }

    fn with_vectors(mut self) -> Self {
        self.vectors = true;
        self
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("unknown task '{task_id}' (valid tasks: {})", .valid.join(", "))]
    UnknownTask { task_id: String, valid: Vec<String> },
    #[error("task '{task_id}' uses processor '{processor}', which is not available in this build (available: {})", .available.join(", "))]
    UnknownProcessor {
        task_id: String,
        processor: String,
        available: Vec<String>,
    },
}

/// What a processing function can see besides the batch itself.
#[derive(Debug, Clone)]
pub struct ProcessContext {
    pub task_id: String,
    pub field_name: String,
    shutdown: CancellationToken,
}

impl ProcessContext {
    pub fn new(task: &TaskDescriptor, shutdown: CancellationToken) -> Self {
        Self {
            task_id: task.task_id.clone(),
            field_name: task.field_name.clone(),
            shutdown,
        }
    }

    /// Ask the worker to stop once the current batch has been submitted.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// A task-specific computation run by the worker on its processing thread.
///
/// Gets each [`WorkBatch`] in arrival order and returns one [`ResultItem`]
/// per item it could handle. Items it cannot handle (corrupt data, for
/// instance) are simply left out of the returned list.
///
/// An `Err` means the whole batch failed; the worker does not submit
/// anything for it and the server re-dispatches it after its deadline.
pub trait ProcessingFunction: Send {
    fn name(&self) -> &str;

    fn process(&mut self, batch: &WorkBatch, ctx: &ProcessContext) -> Result<Vec<ResultItem>>;
}

/// Builds a processing function for a task. Called once, on the worker.
pub type ProcessorFactory = fn(&TaskDescriptor) -> Result<Box<dyn ProcessingFunction>>;

pub struct TaskRegistry {
    tasks: BTreeMap<String, TaskDescriptor>,
    processors: BTreeMap<String, ProcessorFactory>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: BTreeMap::new(),
            processors: BTreeMap::new(),
        }
    }

    /// The built-in task table and the processing functions compiled into
    /// this crate.
    ///
    /// The 60xx tasks name model-inference processors that are supplied by
    /// the deployment; only `image_stats` and `byte_histogram` ship here.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for task in [
            TaskDescriptor::new("aes_out", 6008, "mlb", "aesthetics"),
            TaskDescriptor::new("aes_unsplash_out_v1", 6009, "tf_unsplash", "aes_unsplash_v1")
                .index_update(IndexUpdate::None),
            TaskDescriptor::new("order_model", 6010, "order_embedding", "order_model"),
            TaskDescriptor::new("order_model_2", 6011, "order_embedding", "order_model_2"),
            TaskDescriptor::new("order_model_3", 6012, "order_embedding", "order_model_3")
                .index_update(IndexUpdate::Placeholder)
                .with_vectors(),
            TaskDescriptor::new("aesthetics_2", 6013, "finetune", "aesthetics_2"),
            TaskDescriptor::new("aesthetics_3", 6014, "finetune", "aesthetics_3"),
            TaskDescriptor::new("image_stats", 6020, "image_stats", "image_stats"),
            TaskDescriptor::new("byte_histogram", 6021, "byte_histogram", "byte_histogram")
                .with_vectors(),
        ] {
            registry.register_task(task);
        }
        crate::processors::register_builtin(&mut registry);
        registry
    }

    pub fn register_task(&mut self, task: TaskDescriptor) {
        self.tasks.insert(task.task_id.clone(), task);
    }

    pub fn register_processor(&mut self, name: &str, factory: ProcessorFactory) {
        self.processors.insert(name.to_string(), factory);
    }

    /// Merge the `[tasks.<id>]` tables of `config` into the table.
    ///
    /// Known ids are patched field by field; new ids need `port` and
    /// `processor`.
    pub fn apply_config(&mut self, config: &Config) -> Result<()> {
        for (task_id, ov) in &config.tasks {
            let mut task = match self.tasks.get(task_id) {
                Some(existing) => existing.clone(),
                None => {
                    let (Some(port), Some(processor)) = (ov.port, ov.processor.as_deref()) else {
                        bail!("tasks.{}: a new task needs both `port` and `processor`", task_id);
                    };
                    TaskDescriptor::new(task_id, port, processor, task_id)
                }
            };

            if let Some(port) = ov.port {
                task.port = port;
            }
            if let Some(processor) = &ov.processor {
                task.processor = processor.clone();
            }
            if let Some(field) = &ov.field_name {
                task.field_name = field.clone();
            }
            if let Some(mode) = ov.index_update {
                task.index_update = mode;
            }
            if let Some(vectors) = ov.vectors {
                task.vectors = vectors;
            }
            if task.port == 0 {
                bail!("tasks.{}: port must be > 0", task_id);
            }
            self.register_task(task);
        }
        Ok(())
    }

    pub fn resolve(&self, task_id: &str) -> Result<&TaskDescriptor, TaskError> {
        self.tasks.get(task_id).ok_or_else(|| TaskError::UnknownTask {
            task_id: task_id.to_string(),
            valid: self.tasks.keys().cloned().collect(),
        })
    }

    /// Instantiate the processing function for `task`.
    pub fn processor_for(&self, task: &TaskDescriptor) -> Result<Box<dyn ProcessingFunction>> {
        let factory = self
            .processors
            .get(&task.processor)
            .ok_or_else(|| TaskError::UnknownProcessor {
                task_id: task.task_id.clone(),
                processor: task.processor.clone(),
                available: self.processors.keys().cloned().collect(),
            })?;
        factory(task)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskDescriptor> {
        self.tasks.values()
    }

    pub fn has_processor(&self, name: &str) -> bool {
        self.processors.contains_key(name)
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_has_original_ports() {
        let reg = TaskRegistry::with_builtins();
        assert_eq!(reg.resolve("aes_out").unwrap().port, 6008);
        assert_eq!(reg.resolve("aesthetics_3").unwrap().port, 6014);
        let vec_task = reg.resolve("order_model_3").unwrap();
        assert_eq!(vec_task.index_update, IndexUpdate::Placeholder);
        assert!(vec_task.vectors);
    }

    #[test]
    fn unknown_task_lists_valid_ids() {
        let reg = TaskRegistry::with_builtins();
        let err = reg.resolve("nope").unwrap_err().to_string();
        assert!(err.contains("unknown task 'nope'"));
        assert!(err.contains("aes_out"));
        assert!(err.contains("image_stats"));
    }

    #[test]
    fn external_processor_is_reported_not_panicked() {
        let reg = TaskRegistry::with_builtins();
        let task = reg.resolve("aes_out").unwrap();
        let err = reg.processor_for(task).err().unwrap().to_string();
        assert!(err.contains("'mlb'"));
        assert!(err.contains("image_stats"));
    }

    #[test]
    fn builtin_processor_instantiates() {
        let reg = TaskRegistry::with_builtins();
        let task = reg.resolve("image_stats").unwrap();
        assert_eq!(reg.processor_for(task).unwrap().name(), "image_stats");
    }

    #[test]
    fn config_overrides_and_adds_tasks() {
        let config: Config = toml::from_str(
            r#"
            [tasks.aes_out]
            port = 7008

            [tasks.my_stats]
            port = 7100
            processor = "image_stats"
            index_update = "none"
            "#,
        )
        .unwrap();
        let mut reg = TaskRegistry::with_builtins();
        reg.apply_config(&config).unwrap();

        let aes = reg.resolve("aes_out").unwrap();
        assert_eq!(aes.port, 7008);
        assert_eq!(aes.processor, "mlb");

        let mine = reg.resolve("my_stats").unwrap();
        assert_eq!(mine.field_name, "my_stats");
        assert_eq!(mine.index_update, IndexUpdate::None);
    }

    #[test]
    fn new_task_without_port_is_rejected() {
        let config: Config = toml::from_str(
            r#"
            [tasks.half]
            processor = "image_stats"
            "#,
        )
        .unwrap();
        assert!(TaskRegistry::with_builtins().apply_config(&config).is_err());
    }

    #[test]
    fn shutdown_request_is_visible() {
        let reg = TaskRegistry::with_builtins();
        let token = CancellationToken::new();
        let ctx = ProcessContext::new(reg.resolve("image_stats").unwrap(), token.clone());
        assert!(!ctx.is_shutting_down());
        ctx.request_shutdown();
        assert!(token.is_cancelled());
    }
}
