//! Dispatch protocol server.
//!
//! Remote workers pull work and push results over plain HTTP. One server
//! instance serves exactly one task.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/get_batch` | Next queued batch as an encoded frame, or the "empty" frame. Never blocks. |
//! | `POST` | `/finish_batch` | Encoded result frame; persisted to every sink, then acknowledged. |
//! | `GET`  | `/health` | Status, version and scheduler counters. |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "unsupported frame version 2 (expected 1)" } }
//! ```
//!
//! Error codes: `bad_request` (400) for undecodable frames or a task
//! mismatch, `sink_error` (500) when persisting fails (the batch stays
//! unacknowledged and the worker retries), `internal` (500).
//!
//! # Lifetime
//!
//! [`run_server`] exits on its own once the producer has consumed all input
//! and every batch has been acknowledged, or on Ctrl-C. A producer failure
//! takes the server down with a non-zero exit.

use anyhow::{bail, Context, Result};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::{Config, DispatchConfig};
use crate::pool::{default_pool_size, PrepPool};
use crate::preprocess::DataUrlImage;
use crate::producer::{Producer, ProducerSettings};
use crate::progress::{ProducerProgress, ProgressMode};
use crate::scheduler::{AckOutcome, Scheduler, SchedulerStats};
use crate::sinks::{build_sinks, IndexMarker, SinkSet};
use crate::skip::SkipFilter;
use crate::tailer::{open_inputs, RecordStream, TailSettings};
use crate::tasks::{TaskDescriptor, TaskRegistry};
use crate::wire::{decode_result, empty_frame, encode_batch};

/// Per-task server state shared by every handler.
pub struct Dispatcher {
    task: TaskDescriptor,
    scheduler: Arc<Scheduler>,
    sinks: SinkSet,
    dispatch: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        task: TaskDescriptor,
        scheduler: Arc<Scheduler>,
        sinks: SinkSet,
        dispatch: DispatchConfig,
    ) -> Self {
        Self {
            task,
            scheduler,
            sinks,
            dispatch,
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn task(&self) -> &TaskDescriptor {
        &self.task
    }
}

type AppState = Arc<Dispatcher>;

/// The HTTP surface, without binding it.
pub fn router(dispatcher: Arc<Dispatcher>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/get_batch", get(handle_get_batch))
        .route("/finish_batch", post(handle_finish_batch))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(dispatcher)
}

/// Options `start_server` takes from the command line.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub inputs: Vec<PathBuf>,
    pub force: bool,
    pub batch_size: Option<usize>,
    pub progress: ProgressMode,
}

/// Run the dispatch server for `task_id` until the input is drained.
pub async fn run_server(config: &Config, registry: &TaskRegistry, task_id: &str, opts: ServerOptions) -> Result<()> {
    let task = registry.resolve(task_id)?.clone();

    let mut dispatch = config.dispatch.clone();
    if let Some(n) = opts.batch_size {
        if n == 0 {
            bail!("--batch-size must be > 0");
        }
        dispatch.batch_size = n;
    }

    let sinks = build_sinks(config, &task).await?;
    let scheduler = Arc::new(Scheduler::new());

    let records = if opts.inputs.is_empty() {
        warn!("no input paths given; nothing will be dispatched");
        RecordStream::new(Vec::new())
    } else {
        open_inputs(&opts.inputs, &TailSettings::from(&config.tailer))?
    };

    let mut skip = SkipFilter::new(&config.output.root, &task.task_id, config.output.shard_len)
        .force(opts.force || config.output.force);
    if let Some(marker) = config
        .search_index
        .as_ref()
        .and_then(|index| IndexMarker::for_task(index, &task))
    {
        skip = skip.with_marker(Box::new(marker));
    }

    let pool = PrepPool::new(dispatch.pool_size.unwrap_or_else(default_pool_size))?;
    let producer = Producer::new(
        ProducerSettings::from_config(&task.task_id, &dispatch),
        scheduler.clone(),
        pool,
        Arc::new(DataUrlImage::from_config(&config.preprocess)),
        skip,
    )
    .with_progress(opts.progress.reporter());

    let (done_tx, done_rx) = oneshot::channel();
    producer.spawn(records, done_tx)?;

    let bind_addr = format!("{}:{}", config.server.host, task.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;

    info!(
        task_id = %task.task_id,
        addr = %bind_addr,
        sinks = ?sinks.names(),
        batch_size = dispatch.batch_size,
        "dispatch server listening"
    );

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; shutting down");
            ctrl_c.cancel();
        }
    });

    let dispatcher = Arc::new(Dispatcher::new(task, scheduler, sinks, dispatch));
    serve(listener, dispatcher, config.server.max_body_bytes, shutdown, Some(done_rx)).await
}

/// Serve on `listener` until `shutdown` fires or, when a producer handle is
/// given, until it finishes and the scheduler drains.
pub async fn serve(
    listener: tokio::net::TcpListener,
    dispatcher: Arc<Dispatcher>,
    max_body_bytes: usize,
    shutdown: CancellationToken,
    producer: Option<oneshot::Receiver<Result<ProducerProgress>>>,
) -> Result<()> {
    let sweeper = tokio::spawn(run_sweeper(
        dispatcher.scheduler.clone(),
        dispatcher.dispatch.sweep_interval(),
        dispatcher.dispatch.stale_after(),
        shutdown.clone(),
    ));

    let watcher = producer.map(|rx| {
        tokio::spawn(watch_producer(
            rx,
            dispatcher.scheduler.clone(),
            shutdown.clone(),
        ))
    });

    let app = router(dispatcher, max_body_bytes);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    shutdown.cancel();
    let _ = sweeper.await;
    if let Some(watcher) = watcher {
        watcher.await.context("producer watcher panicked")??;
    }
    info!("dispatch server stopped");
    Ok(())
}

/// Re-queue overdue batches every `interval` until cancelled.
async fn run_sweeper(scheduler: Arc<Scheduler>, interval: Duration, stale_after: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {
                scheduler.sweep_stale(stale_after);
            }
        }
    }
}

/// Wait for the producer, then for the queue and tracker to empty.
async fn watch_producer(
    rx: oneshot::Receiver<Result<ProducerProgress>>,
    scheduler: Arc<Scheduler>,
    token: CancellationToken,
) -> Result<()> {
    let outcome = tokio::select! {
        _ = token.cancelled() => return Ok(()),
        outcome = rx => outcome,
    };

    match outcome {
        Ok(Ok(summary)) => {
            info!(batches = summary.batches, items = summary.items, "input exhausted; draining");
        }
        Ok(Err(e)) => {
            error!(error = %e, "producer failed");
            token.cancel();
            return Err(e.context("producer failed"));
        }
        Err(_) => {
            error!("producer thread died");
            token.cancel();
            bail!("producer thread terminated unexpectedly");
        }
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                if scheduler.is_drained() {
                    info!("every batch acknowledged; shutting down");
                    token.cancel();
                    return Ok(());
                }
            }
        }
    }
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn sink_error(err: anyhow::Error) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "sink_error",
        message: format!("{:#}", err),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: message.into(),
    }
}

// ============ GET /get_batch ============

async fn handle_get_batch(State(state): State<AppState>) -> Result<String, AppError> {
    let Some(batch) = state.scheduler.next_batch() else {
        return Ok(empty_frame());
    };
    // A batch that fails to encode stays pending and is re-queued by the sweep.
    let frame = encode_batch(&batch).map_err(|e| internal(e.to_string()))?;
    info!(batch_id = %batch.batch_id, items = batch.len(), "batch dispatched");
    Ok(frame)
}

// ============ POST /finish_batch ============

async fn handle_finish_batch(State(state): State<AppState>, body: Bytes) -> Result<StatusCode, AppError> {
    let result = decode_result(&body).map_err(|e| bad_request(e.to_string()))?;
    if result.task_id != state.task.task_id {
        return Err(bad_request(format!(
            "result for task '{}' sent to the '{}' server",
            result.task_id, state.task.task_id
        )));
    }

    state.sinks.persist_all(&result).await.map_err(|e| {
        warn!(batch_id = %result.batch_id, error = %e, "persisting results failed");
        sink_error(e)
    })?;

    match state.scheduler.on_ack(&result.batch_id) {
        AckOutcome::Acked => info!(batch_id = %result.batch_id, items = result.items.len(), "batch finished"),
        AckOutcome::Dequeued => info!(
            batch_id = %result.batch_id,
            "late result for a re-queued batch; redelivery cancelled"
        ),
        AckOutcome::Unknown => debug!(batch_id = %result.batch_id, "duplicate result absorbed"),
    }
    Ok(StatusCode::OK)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    task_id: String,
    #[serde(flatten)]
    stats: SchedulerStats,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        task_id: state.task.task_id.clone(),
        stats: state.scheduler.stats(),
    })
}
