//! Worker client loop.
//!
//! Runs next to a [`ProcessingFunction`] and keeps it fed:
//!
//! ```text
//!            GET /get_batch                      POST /finish_batch
//! server ───────────────────▶ network loop ◀─────────────────────────┐
//!                                 │  ▲                                │
//!                        input    │  │  output                        │
//!                     (crossbeam) ▼  │  (tokio mpsc)                  │
//!                          processing thread ── ResultBatch ──────────┘
//! ```
//!
//! The network loop only fetches when the input queue is empty, so at most
//! one batch waits while another is being processed. Transient HTTP
//! failures are retried forever with a fixed pause; results are never
//! dropped. A shutdown request (Ctrl-C, or the processing function itself)
//! stops fetching, then waits until every batch already taken has been
//! submitted.

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{unbounded, Receiver};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ClientConfig, Config};
use crate::models::{ResultBatch, WorkBatch};
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};
use crate::sinks::FileSink;
use crate::tasks::{ProcessContext, ProcessingFunction, TaskDescriptor, TaskRegistry};
use crate::wire::{decode_batch, encode_result};

/// Outcome of one batch on the processing thread.
enum Processed {
    Done(ResultBatch),
    Failed { batch_id: String, error: anyhow::Error },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientSummary {
    pub batches: u64,
    pub items: u64,
    pub failed: u64,
}

pub struct WorkerClient {
    task: TaskDescriptor,
    http: reqwest::Client,
    base_url: String,
    settings: ClientConfig,
    local: Option<FileSink>,
    progress: Box<dyn ProgressReporter>,
}

impl WorkerClient {
    pub fn new(config: &Config, task: TaskDescriptor) -> Result<Self> {
        let settings = config.client.clone();
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .build()?;
        let base_url = format!("{}:{}", settings.server_url.trim_end_matches('/'), task.port);
        let local = settings
            .save_locally
            .then(|| FileSink::new(&config.output, &task.task_id));
        Ok(Self {
            task,
            http,
            base_url,
            settings,
            local,
            progress: Box::new(NoProgress),
        })
    }

    /// Talk to `url` instead of `<server_url>:<task port>`.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Run until `shutdown` is cancelled and everything taken is submitted.
    pub async fn run(
        &self,
        processor: Box<dyn ProcessingFunction>,
        shutdown: CancellationToken,
    ) -> Result<ClientSummary> {
        let (in_tx, in_rx) = unbounded::<WorkBatch>();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Processed>();
        let ctx = ProcessContext::new(&self.task, shutdown.clone());

        let worker = std::thread::Builder::new()
            .name("processor".to_string())
            .spawn(move || processing_loop(processor, in_rx, out_tx, ctx))
            .context("Failed to spawn processing thread")?;

        info!(task_id = %self.task.task_id, server = %self.base_url, "worker started");

        let mut summary = ClientSummary::default();
        let mut in_flight = 0usize;
        let started = Instant::now();
        let mut last_report = Instant::now();

        loop {
            // Submit whatever the processing thread has finished.
            loop {
                match out_rx.try_recv() {
                    Ok(done) => {
                        in_flight -= 1;
                        self.complete(done, &mut summary).await;
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => bail!("processing thread exited unexpectedly"),
                }
            }

            if last_report.elapsed() >= Duration::from_secs(5) {
                last_report = Instant::now();
                self.report(&summary, started);
            }

            if shutdown.is_cancelled() {
                if in_flight == 0 {
                    break;
                }
                let done = out_rx
                    .recv()
                    .await
                    .ok_or_else(|| anyhow!("processing thread exited with batches in flight"))?;
                in_flight -= 1;
                self.complete(done, &mut summary).await;
                continue;
            }

            if !in_tx.is_empty() {
                self.pause(
                    Duration::from_millis(self.settings.idle_poll_ms),
                    &shutdown,
                    &mut out_rx,
                    &mut in_flight,
                    &mut summary,
                )
                .await?;
                continue;
            }

            match self.fetch_batch().await {
                Ok(Some(batch)) => {
                    debug!(batch_id = %batch.batch_id, items = batch.len(), "batch received");
                    in_tx
                        .send(batch)
                        .map_err(|_| anyhow!("processing thread is gone"))?;
                    in_flight += 1;
                }
                Ok(None) => {
                    self.pause(
                        Duration::from_millis(self.settings.empty_backoff_ms),
                        &shutdown,
                        &mut out_rx,
                        &mut in_flight,
                        &mut summary,
                    )
                    .await?;
                }
                Err(e) => {
                    warn!(error = %e, "get_batch failed; retrying");
                    self.pause(
                        Duration::from_millis(self.settings.retry_ms),
                        &shutdown,
                        &mut out_rx,
                        &mut in_flight,
                        &mut summary,
                    )
                    .await?;
                }
            }
        }

        drop(in_tx);
        tokio::task::spawn_blocking(move || worker.join())
            .await?
            .map_err(|_| anyhow!("processing thread panicked"))?;

        self.report(&summary, started);
        info!(
            batches = summary.batches,
            items = summary.items,
            failed = summary.failed,
            "worker stopped"
        );
        Ok(summary)
    }

    /// Sleep for `dur`, waking early to submit a finished batch or to notice
    /// a shutdown request.
    async fn pause(
        &self,
        dur: Duration,
        shutdown: &CancellationToken,
        out_rx: &mut UnboundedReceiver<Processed>,
        in_flight: &mut usize,
        summary: &mut ClientSummary,
    ) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(dur) => {}
            _ = shutdown.cancelled() => {}
            done = out_rx.recv(), if *in_flight > 0 => {
                let done = done.ok_or_else(|| anyhow!("processing thread exited with batches in flight"))?;
                *in_flight -= 1;
                self.complete(done, summary).await;
            }
        }
        Ok(())
    }

    async fn complete(&self, done: Processed, summary: &mut ClientSummary) {
        match done {
            Processed::Done(result) => {
                self.save_locally(&result).await;
                self.submit(&result).await;
                summary.batches += 1;
                summary.items += result.items.len() as u64;
            }
            Processed::Failed { batch_id, error } => {
                // Nothing is submitted; the server re-dispatches after its deadline.
                summary.failed += 1;
                error!(batch_id = %batch_id, error = %format!("{:#}", error), "processing failed");
            }
        }
    }

    /// One `GET /get_batch`. `Ok(None)` is the server's "no work" answer.
    pub async fn fetch_batch(&self) -> Result<Option<WorkBatch>> {
        let resp = self
            .http
            .get(format!("{}/get_batch", self.base_url))
            .timeout(Duration::from_secs(self.settings.get_timeout_secs))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("get_batch returned {}: {}", status, body);
        }
        let body = resp.bytes().await?;
        Ok(decode_batch(&body)?)
    }

    /// `POST /finish_batch` until the server takes it.
    ///
    /// Network errors and 5xx answers are retried forever. A 4xx means the
    /// server will never accept this frame, so it is logged and dropped; the
    /// batch is re-dispatched after its deadline.
    pub async fn submit(&self, result: &ResultBatch) {
        let frame = match encode_result(result) {
            Ok(f) => f,
            Err(e) => {
                error!(batch_id = %result.batch_id, error = %e, "cannot encode result");
                return;
            }
        };
        let url = format!("{}/finish_batch", self.base_url);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let sent = self
                .http
                .post(&url)
                .timeout(Duration::from_secs(self.settings.finish_timeout_secs))
                .body(frame.clone())
                .send()
                .await;
            match sent {
                Ok(resp) if resp.status().is_success() => {
                    info!(batch_id = %result.batch_id, items = result.items.len(), attempt, "results submitted");
                    return;
                }
                Ok(resp) if resp.status().is_client_error() => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    error!(batch_id = %result.batch_id, %status, body = %body, "server rejected results");
                    return;
                }
                Ok(resp) => {
                    warn!(batch_id = %result.batch_id, status = %resp.status(), attempt, "finish_batch failed; retrying");
                }
                Err(e) => {
                    warn!(batch_id = %result.batch_id, error = %e, attempt, "finish_batch failed; retrying");
                }
            }
            tokio::time::sleep(Duration::from_millis(self.settings.retry_ms)).await;
        }
    }

    async fn save_locally(&self, result: &ResultBatch) {
        let Some(local) = &self.local else {
            return;
        };
        for item in &result.items {
            if let Err(e) = local.write_item(item).await {
                warn!(id = %item.id, error = %e, "local copy failed");
            }
        }
    }

    fn report(&self, summary: &ClientSummary, started: Instant) {
        let secs = started.elapsed().as_secs_f64().max(1e-3);
        self.progress.report(ProgressEvent::Working {
            task_id: self.task.task_id.clone(),
            batches: summary.batches,
            items: summary.items,
            items_per_sec: summary.items as f64 / secs,
        });
    }
}

/// Body of the processing thread: one batch at a time, in arrival order.
fn processing_loop(
    mut processor: Box<dyn ProcessingFunction>,
    input: Receiver<WorkBatch>,
    output: UnboundedSender<Processed>,
    ctx: ProcessContext,
) {
    debug!(processor = processor.name(), "processing thread started");
    for batch in input.iter() {
        let started = Instant::now();
        let processed = match processor.process(&batch, &ctx) {
            Ok(items) => {
                debug!(
                    batch_id = %batch.batch_id,
                    kept = items.len(),
                    of = batch.len(),
                    ms = started.elapsed().as_millis() as u64,
                    "batch processed"
                );
                Processed::Done(ResultBatch::for_batch(&batch, items))
            }
            Err(error) => Processed::Failed {
                batch_id: batch.batch_id.clone(),
                error,
            },
        };
        if output.send(processed).is_err() {
            return;
        }
    }
}

/// `start_client`: resolve the task, build its processor, work until Ctrl-C.
pub async fn run_client(
    config: &Config,
    registry: &TaskRegistry,
    task_id: &str,
    server_url: Option<&str>,
    progress: Box<dyn ProgressReporter>,
) -> Result<ClientSummary> {
    let task = registry.resolve(task_id)?.clone();
    let processor = registry.processor_for(&task)?;

    let mut config = config.clone();
    if let Some(url) = server_url {
        config.client.server_url = url.to_string();
    }
    let client = WorkerClient::new(&config, task)?.with_progress(progress);

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; finishing in-flight work");
            ctrl_c.cancel();
        }
    });

    client.run(processor, shutdown).await
}
