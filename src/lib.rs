//! # Media Dispatch
//!
//! Batch work distribution for offline media feature extraction.
//!
//! A dispatch server tails line-delimited record files, preprocesses each
//! record, groups them into fixed-size batches, and hands the batches to
//! remote workers over a long-poll HTTP protocol. Workers run a pluggable
//! processing function and post results back; the server persists them to
//! one or more sinks. Delivery is at-least-once: a batch not acknowledged
//! within its deadline is handed out again under the same id.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────┐  ┌──────┐  ┌──────────┐  ┌───────────┐  ┌────────┐       ┌────────┐
//! │ Tailer │─▶│ Skip │─▶│ Producer │─▶│ Scheduler │◀▶│ Server │◀─────▶│ Client │
//! └────────┘  └──────┘  │  + pool  │  │ queue +   │  └───┬────┘ HTTP  │ + proc │
//!                       └──────────┘  │ pending   │      ▼            └────────┘
//!                                     └───────────┘  ┌───────┐
//!                                                    │ Sinks │
//!                                                    └───────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! mdispatch tasks                                   # list the task table
//! mdispatch start_server image_stats ./data/in/     # serve batches on :6020
//! mdispatch start_client image_stats --server http://10.0.0.5
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Records, batches and results |
//! | [`wire`] | Versioned transport frames |
//! | [`tailer`] | Fault-tolerant line tailing |
//! | [`skip`] | Skip/resume filter |
//! | [`preprocess`] | Per-record preprocessing |
//! | [`pool`] | Preprocessing thread pool |
//! | [`producer`] | Work batch producer |
//! | [`scheduler`] | Dispatch queue and pending tracker |
//! | [`server`] | Dispatch protocol server |
//! | [`client`] | Worker client loop |
//! | [`tasks`] | Task table and processing functions |
//! | [`processors`] | Built-in processing functions |
//! | [`sinks`] | Result persistence |

pub mod client;
pub mod config;
pub mod logging;
pub mod models;
pub mod pool;
pub mod preprocess;
pub mod processors;
pub mod producer;
pub mod progress;
pub mod scheduler;
pub mod server;
pub mod sinks;
pub mod skip;
pub mod tailer;
pub mod tasks;
pub mod wire;
