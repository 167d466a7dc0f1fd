//! Work batch producer.
//!
//! Runs on a dedicated OS thread: draws records from the tailer, drops the
//! ones whose output already exists, fans the rest out to the preprocessing
//! pool, and turns every `batch_size` results into one [`WorkBatch`].
//!
//! Two limits keep it in check before each batch is enqueued:
//!
//! - while the dispatch queue holds `max_queued` batches, it waits for a
//!   worker to take one;
//! - while `max_pending` batches are unacknowledged, it runs a staleness
//!   sweep instead and re-checks after a short pause.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::DispatchConfig;
use crate::models::{WorkBatch, WorkItem};
use crate::pool::{Pending, PrepPool};
use crate::preprocess::Preprocess;
use crate::progress::{NoProgress, ProducerProgress, ProgressEvent, ProgressReporter};
use crate::scheduler::Scheduler;
use crate::skip::{Decision, SkipFilter};
use crate::tailer::Decoded;

#[derive(Debug, Clone)]
pub struct ProducerSettings {
    pub task_id: String,
    pub batch_size: usize,
    pub max_queued: usize,
    pub max_pending: usize,
    pub stale_after: Duration,
    pub pending_retry: Duration,
    pub progress_interval: Duration,
}

impl ProducerSettings {
    pub fn from_config(task_id: &str, cfg: &DispatchConfig) -> Self {
        Self {
            task_id: task_id.to_string(),
            batch_size: cfg.batch_size,
            max_queued: cfg.max_queued,
            max_pending: cfg.max_pending,
            stale_after: cfg.stale_after(),
            pending_retry: Duration::from_millis(cfg.pending_retry_ms),
            progress_interval: Duration::from_secs(cfg.progress_interval_secs),
        }
    }
}

pub struct Producer {
    settings: ProducerSettings,
    scheduler: Arc<Scheduler>,
    pool: PrepPool,
    preprocess: Arc<dyn Preprocess>,
    skip: SkipFilter,
    progress: Box<dyn ProgressReporter>,
    counters: ProducerProgress,
    started: Instant,
    last_report: Instant,
}

impl Producer {
    pub fn new(
        settings: ProducerSettings,
        scheduler: Arc<Scheduler>,
        pool: PrepPool,
        preprocess: Arc<dyn Preprocess>,
        skip: SkipFilter,
    ) -> Self {
        let now = Instant::now();
        Self {
            settings,
            scheduler,
            pool,
            preprocess,
            skip,
            progress: Box::new(NoProgress),
            counters: ProducerProgress::default(),
            started: now,
            last_report: now,
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Run on a new thread named `producer`.
    ///
    /// The result is delivered through `done`; a panic drops the sender,
    /// which the receiving side treats as fatal.
    pub fn spawn<I>(
        self,
        records: I,
        done: tokio::sync::oneshot::Sender<Result<ProducerProgress>>,
    ) -> Result<JoinHandle<()>>
    where
        I: Iterator<Item = std::io::Result<Decoded>> + Send + 'static,
    {
        std::thread::Builder::new()
            .name("producer".to_string())
            .spawn(move || {
                let _ = done.send(self.run(records));
            })
            .context("Failed to spawn producer thread")
    }

    /// Consume `records` to the end, then mark the scheduler's input done.
    pub fn run<I>(mut self, records: I) -> Result<ProducerProgress>
    where
        I: Iterator<Item = std::io::Result<Decoded>>,
    {
        info!(
            task_id = %self.settings.task_id,
            batch_size = self.settings.batch_size,
            pool = self.pool.size(),
            "producer started"
        );

        let mut buf: Vec<Pending<Result<WorkItem>>> = Vec::with_capacity(self.settings.batch_size);

        for entry in records {
            let record = match entry.context("Failed to read input")? {
                Ok(record) => record,
                Err(_) => {
                    self.counters.malformed += 1;
                    continue;
                }
            };
            self.counters.seen += 1;

            match self.skip.should_process(&record.id)? {
                Decision::Skip => {
                    self.counters.skipped += 1;
                    continue;
                }
                Decision::Process(_) => {}
            }

            let pre = Arc::clone(&self.preprocess);
            buf.push(self.pool.submit(move || pre.prepare(&record)));

            if buf.len() >= self.settings.batch_size {
                self.flush(&mut buf);
            }
            self.maybe_report();
        }

        if !buf.is_empty() {
            self.flush(&mut buf);
        }
        self.skip.finish()?;
        self.scheduler.mark_producer_done();

        let summary = self.snapshot();
        self.progress.report(ProgressEvent::Producing {
            task_id: self.settings.task_id.clone(),
            progress: summary.clone(),
        });
        info!(
            seen = summary.seen,
            skipped = summary.skipped,
            malformed = summary.malformed,
            failed = summary.failed,
            batches = summary.batches,
            "producer finished"
        );
        Ok(summary)
    }

    fn flush(&mut self, buf: &mut Vec<Pending<Result<WorkItem>>>) {
        let mut items = Vec::with_capacity(buf.len());
        for pending in buf.drain(..) {
            match pending.wait() {
                Some(Ok(item)) => items.push(item),
                Some(Err(e)) => {
                    self.counters.failed += 1;
                    debug!(error = %e, "preprocessing failed; record dropped");
                }
                None => self.counters.failed += 1,
            }
        }

        if items.is_empty() {
            warn!("every record in this batch failed preprocessing");
            return;
        }

        let batch = WorkBatch::new(self.settings.task_id.clone(), items);
        self.counters.items += batch.len() as u64;
        self.counters.batches += 1;
        self.submit(batch);
    }

    /// Enqueue `batch` once both backpressure limits allow it.
    fn submit(&self, batch: WorkBatch) {
        loop {
            if self.scheduler.queued() >= self.settings.max_queued {
                debug!(queued = self.scheduler.queued(), "dispatch queue full; waiting");
                self.scheduler
                    .wait_for_queue_below(self.settings.max_queued, Duration::from_secs(1));
                continue;
            }

            if self.scheduler.pending() >= self.settings.max_pending {
                let requeued = self.scheduler.sweep_stale(self.settings.stale_after);
                if requeued == 0 {
                    debug!(pending = self.scheduler.pending(), "too many unacknowledged batches; waiting");
                    self.scheduler.wait_for_change(self.settings.pending_retry);
                }
                continue;
            }

            break;
        }

        info!(batch_id = %batch.batch_id, items = batch.len(), "batch ready");
        self.scheduler.enqueue(batch);
    }

    fn snapshot(&self) -> ProducerProgress {
        let secs = self.started.elapsed().as_secs_f64().max(1e-3);
        ProducerProgress {
            seen_per_sec: self.counters.seen as f64 / secs,
            items_per_sec: self.counters.items as f64 / secs,
            ..self.counters.clone()
        }
    }

    fn maybe_report(&mut self) {
        if self.last_report.elapsed() < self.settings.progress_interval {
            return;
        }
        self.last_report = Instant::now();
        self.progress.report(ProgressEvent::Producing {
            task_id: self.settings.task_id.clone(),
            progress: self.snapshot(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Record;
    use crate::preprocess::tests::png_data_url;
    use crate::preprocess::DataUrlImage;
    use serde_json::json;
    use tempfile::TempDir;

    fn settings(batch_size: usize, max_queued: usize) -> ProducerSettings {
        ProducerSettings {
            task_id: "image_stats".into(),
            batch_size,
            max_queued,
            max_pending: 50,
            stale_after: Duration::from_secs(120),
            pending_retry: Duration::from_millis(10),
            progress_interval: Duration::from_secs(3600),
        }
    }

    fn record(id: &str, img: Option<String>) -> std::io::Result<Decoded> {
        let mut payload = json!({ "_id": id });
        if let Some(img) = img {
            payload["img_data"] = json!(img);
        }
        Ok(Ok(Record {
            id: id.to_string(),
            content_hash: "ab".into(),
            payload: payload.as_object().cloned().unwrap(),
        }))
    }

    fn producer(tmp: &TempDir, scheduler: Arc<Scheduler>, s: ProducerSettings) -> Producer {
        Producer::new(
            s,
            scheduler,
            PrepPool::new(2).unwrap(),
            Arc::new(DataUrlImage::default()),
            SkipFilter::new(tmp.path(), "image_stats", 3),
        )
    }

    #[test]
    fn two_records_make_one_batch() {
        let tmp = TempDir::new().unwrap();
        let scheduler = Arc::new(Scheduler::new());
        let records = vec![
            record("src_1", Some(png_data_url(b"one"))),
            record("src_2", Some(png_data_url(b"two"))),
        ];

        let summary = producer(&tmp, scheduler.clone(), settings(2, 10))
            .run(records.into_iter())
            .unwrap();

        assert_eq!(summary.batches, 1);
        assert_eq!(scheduler.queued(), 1);
        let batch = scheduler.next_batch().unwrap();
        let ids: Vec<&str> = batch.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["src_1", "src_2"]);
        assert!(scheduler.stats().producer_done);
    }

    #[test]
    fn corrupt_and_malformed_records_are_dropped_and_counted() {
        let tmp = TempDir::new().unwrap();
        let scheduler = Arc::new(Scheduler::new());
        let records = vec![
            record("src_1", Some(png_data_url(b"ok"))),
            record("src_2", Some("data:image/png;base64,AAAA".into())),
            record("src_3", None),
            Ok(Err(crate::models::RecordError::MissingTab)),
            record("src_4", Some(png_data_url(b"ok too"))),
        ];

        let summary = producer(&tmp, scheduler.clone(), settings(3, 10))
            .run(records.into_iter())
            .unwrap();

        assert_eq!(summary.seen, 4);
        assert_eq!(summary.malformed, 1);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.batches, 2);
        assert_eq!(summary.items, 2);
        assert_eq!(scheduler.next_batch().unwrap().items[0].id, "src_1");
        assert_eq!(scheduler.next_batch().unwrap().items[0].id, "src_4");
    }

    #[test]
    fn existing_outputs_are_not_reprocessed_after_restart() {
        let tmp = TempDir::new().unwrap();
        let done = SkipFilter::new(tmp.path(), "image_stats", 3).output_path("src_1");
        std::fs::create_dir_all(done.parent().unwrap()).unwrap();
        std::fs::write(&done, "{}").unwrap();

        let scheduler = Arc::new(Scheduler::new());
        let records = vec![
            record("src_1", Some(png_data_url(b"one"))),
            record("src_2", Some(png_data_url(b"two"))),
        ];
        let summary = producer(&tmp, scheduler.clone(), settings(10, 10))
            .run(records.into_iter())
            .unwrap();

        assert_eq!(summary.skipped, 1);
        let batch = scheduler.next_batch().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.items[0].id, "src_2");
    }

    #[test]
    fn producer_pauses_at_queue_limit_and_resumes_below_it() {
        let tmp = TempDir::new().unwrap();
        let scheduler = Arc::new(Scheduler::new());
        let records: Vec<_> = (0..5)
            .map(|i| record(&format!("src_{}", i), Some(png_data_url(b"x"))))
            .collect();

        let p = producer(&tmp, scheduler.clone(), settings(1, 2));
        let handle = std::thread::spawn(move || p.run(records.into_iter()));

        let wait_until = |cond: &dyn Fn() -> bool| {
            let start = Instant::now();
            while !cond() && start.elapsed() < Duration::from_secs(5) {
                std::thread::sleep(Duration::from_millis(5));
            }
        };

        wait_until(&|| scheduler.queued() == 2);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(scheduler.queued(), 2, "producer must not exceed max_queued");
        assert!(!handle.is_finished());

        // Taking one batch lets exactly one more in.
        let first = scheduler.next_batch().unwrap();
        scheduler.on_ack(&first.batch_id);
        wait_until(&|| scheduler.stats().enqueued == 3);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(scheduler.queued(), 2);
        assert_eq!(scheduler.stats().enqueued, 3);

        while scheduler.stats().enqueued < 5 || scheduler.queued() > 0 {
            if let Some(b) = scheduler.next_batch() {
                scheduler.on_ack(&b.batch_id);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let summary = handle.join().unwrap().unwrap();
        assert_eq!(summary.batches, 5);
    }

    #[test]
    fn pending_limit_triggers_stale_sweep() {
        let tmp = TempDir::new().unwrap();
        let scheduler = Arc::new(Scheduler::new());

        // One batch already in flight and overdue.
        scheduler.enqueue(WorkBatch::new("image_stats", vec![]));
        let stale = scheduler.next_batch().unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let mut s = settings(1, 10);
        s.max_pending = 1;
        s.stale_after = Duration::from_millis(5);
        producer(&tmp, scheduler.clone(), s)
            .run(vec![record("src_1", Some(png_data_url(b"x")))].into_iter())
            .unwrap();

        assert_eq!(scheduler.pending(), 0);
        assert_eq!(scheduler.queued(), 2);
        assert_eq!(scheduler.next_batch().unwrap().batch_id, stale.batch_id);
    }
}
