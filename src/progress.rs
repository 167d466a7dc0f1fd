//! Producer and worker progress reporting.
//!
//! Counters (records seen, skipped, dropped, batches built, throughput) are
//! emitted on **stderr** so stdout stays parseable for scripts. Diagnostic
//! logging goes through `tracing`; this module is only the periodic summary.

use serde::Serialize;
use std::io::Write;

/// Snapshot of the producer's counters.
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct ProducerProgress {
    pub seen: u64,
    pub skipped: u64,
    pub malformed: u64,
    pub failed: u64,
    pub batches: u64,
    pub items: u64,
    pub seen_per_sec: f64,
    pub items_per_sec: f64,
}

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    Producing {
        task_id: String,
        progress: ProducerProgress,
    },
    Working {
        task_id: String,
        batches: u64,
        items: u64,
        items_per_sec: f64,
    },
}

/// Reports progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "produce image_stats  seen 1,234  skipped 12 ...".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Producing { task_id, progress } => format!(
                "produce {}  seen {}  skipped {}  dropped {}  batches {}  ({:.1} rec/s, {:.1} items/s)\n",
                task_id,
                format_number(progress.seen),
                format_number(progress.skipped),
                format_number(progress.malformed + progress.failed),
                format_number(progress.batches),
                progress.seen_per_sec,
                progress.items_per_sec,
            ),
            ProgressEvent::Working {
                task_id,
                batches,
                items,
                items_per_sec,
            } => format!(
                "work {}  batches {}  items {}  ({:.1} items/s)\n",
                task_id,
                format_number(*batches),
                format_number(*items),
                items_per_sec,
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Producing { task_id, progress } => serde_json::json!({
                "event": "progress",
                "phase": "producing",
                "task_id": task_id,
                "counters": progress,
            }),
            ProgressEvent::Working {
                task_id,
                batches,
                items,
                items_per_sec,
            } => serde_json::json!({
                "event": "progress",
                "phase": "working",
                "task_id": task_id,
                "batches": batches,
                "items": items,
                "items_per_sec": items_per_sec,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn producer_counters_serialize_flat() {
        let p = ProducerProgress {
            seen: 3,
            skipped: 1,
            ..Default::default()
        };
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["seen"], 3);
        assert_eq!(v["skipped"], 1);
        assert_eq!(v["batches"], 0);
    }
}
