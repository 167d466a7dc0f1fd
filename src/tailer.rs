//! Fault-tolerant line tailing over append-only inputs.
//!
//! [`LineTailer`] turns a file that another process may still be writing
//! into a sequence of complete lines. A read that ends without `\n` is a
//! *partial* line: the reader rewinds to its first byte and retries after a
//! short sleep, so a half-written line is never yielded and no byte is
//! skipped or duplicated.
//!
//! At end of input the tailer keeps polling. It only gives up once a
//! confirmation window has passed in which **both** `confirm_time` has
//! elapsed and at least `confirm_min_attempts` reads came back empty. Any
//! new line resets the window.
//!
//! Restarting from offset 0 is always safe: downstream, the skip filter
//! drops records whose output already exists.

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::TailerConfig;
use crate::models::{Record, RecordError};

/// Lines taken from one source before moving to the next.
const LINES_PER_TURN: usize = 10;

#[derive(Debug, Clone)]
pub struct TailSettings {
    pub follow: bool,
    pub sleep_time: Duration,
    pub confirm_time: Duration,
    pub confirm_min_attempts: u32,
}

impl From<&TailerConfig> for TailSettings {
    fn from(cfg: &TailerConfig) -> Self {
        Self {
            follow: cfg.follow,
            sleep_time: Duration::from_millis(cfg.sleep_ms),
            confirm_time: Duration::from_secs(cfg.confirm_secs),
            confirm_min_attempts: cfg.confirm_min_attempts,
        }
    }
}

/// Iterator of complete lines (terminator stripped) from a growing source.
pub struct LineTailer<R> {
    reader: BufReader<R>,
    name: String,
    settings: TailSettings,
    /// Byte offset of the first unconsumed byte.
    offset: u64,
    eof_since: Option<Instant>,
    attempts: u32,
    done: bool,
}

impl<R: Read + Seek> LineTailer<R> {
    pub fn new(inner: R, name: impl Into<String>, settings: TailSettings) -> Self {
        Self {
            reader: BufReader::new(inner),
            name: name.into(),
            settings,
            offset: 0,
            eof_since: None,
            attempts: 0,
            done: false,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            let mut buf = Vec::new();
            let n = self.reader.read_until(b'\n', &mut buf)?;

            if n > 0 && buf.last() == Some(&b'\n') {
                self.offset += n as u64;
                self.eof_since = None;
                self.attempts = 0;
                buf.pop();
                return Ok(Some(buf));
            }

            if !self.settings.follow {
                self.done = true;
                if n > 0 {
                    self.offset += n as u64;
                    return Ok(Some(buf));
                }
                return Ok(None);
            }

            if n > 0 {
                // Writer is mid-line: give the bytes back and wait for the rest.
                debug!(
                    source = %self.name,
                    offset = self.offset,
                    partial_bytes = n,
                    "partial line; waiting for terminator"
                );
                self.reader.seek(SeekFrom::Start(self.offset))?;
                self.eof_since = None;
                self.attempts = 0;
                std::thread::sleep(self.settings.sleep_time);
                continue;
            }

            self.attempts += 1;
            let since = *self.eof_since.get_or_insert_with(Instant::now);
            let waited = since.elapsed();
            if waited >= self.settings.confirm_time
                && self.attempts >= self.settings.confirm_min_attempts
            {
                info!(
                    source = %self.name,
                    offset = self.offset,
                    waited_ms = waited.as_millis() as u64,
                    attempts = self.attempts,
                    "input exhausted"
                );
                self.done = true;
                return Ok(None);
            }

            debug!(
                source = %self.name,
                offset = self.offset,
                waited_ms = waited.as_millis() as u64,
                attempts = self.attempts,
                "confirming end of input"
            );
            std::thread::sleep(self.settings.sleep_time);
        }
    }
}

impl<R: Read + Seek> Iterator for LineTailer<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_line() {
            Ok(Some(line)) => Some(Ok(line)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// A line source inside a [`RecordStream`].
pub type LineSource = Box<dyn Iterator<Item = io::Result<Vec<u8>>> + Send>;

/// Result of decoding one line: malformed lines are reported, not fatal.
pub type Decoded = std::result::Result<Record, RecordError>;

/// Round-robin interleaving of several line sources, decoded into records.
pub struct RecordStream {
    sources: Vec<(String, LineSource)>,
    cursor: usize,
    taken_this_turn: usize,
}

impl RecordStream {
    pub fn new(sources: Vec<(String, LineSource)>) -> Self {
        Self {
            sources,
            cursor: 0,
            taken_this_turn: 0,
        }
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    fn advance(&mut self) {
        self.taken_this_turn = 0;
        if !self.sources.is_empty() {
            self.cursor = (self.cursor + 1) % self.sources.len();
        }
    }
}

impl Iterator for RecordStream {
    type Item = io::Result<Decoded>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.sources.is_empty() {
            if self.taken_this_turn >= LINES_PER_TURN {
                self.advance();
            }
            let idx = self.cursor;
            match self.sources[idx].1.next() {
                Some(Ok(line)) => {
                    self.taken_this_turn += 1;
                    let decoded = Record::parse_line(&line);
                    if let Err(e) = &decoded {
                        warn!(source = %self.sources[idx].0, error = %e, "dropping malformed line");
                    }
                    return Some(Ok(decoded));
                }
                Some(Err(e)) => return Some(Err(e)),
                None => {
                    let (name, _) = self.sources.remove(idx);
                    debug!(source = %name, remaining = self.sources.len(), "source finished");
                    self.taken_this_turn = 0;
                    if self.cursor >= self.sources.len() {
                        self.cursor = 0;
                    }
                }
            }
        }
        None
    }
}

/// Expand input paths (files or directories) into a tailing record stream.
pub fn open_inputs(paths: &[PathBuf], settings: &TailSettings) -> Result<RecordStream> {
    let mut sources: Vec<(String, LineSource)> = Vec::new();

    for path in paths {
        for file in expand_path(path)? {
            let handle = File::open(&file)
                .with_context(|| format!("Failed to open input: {}", file.display()))?;
            let name = file.display().to_string();
            let tailer = LineTailer::new(handle, name.clone(), settings.clone());
            sources.push((name, Box::new(tailer)));
        }
    }

    if sources.is_empty() {
        bail!("No input files found in {:?}", paths);
    }

    info!(sources = sources.len(), follow = settings.follow, "opened inputs");
    Ok(RecordStream::new(sources))
}

fn expand_path(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        bail!("Input path does not exist: {}", path.display());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", path.display()))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use std::sync::mpsc;
    use tempfile::TempDir;

    fn quick(follow: bool) -> TailSettings {
        TailSettings {
            follow,
            sleep_time: Duration::from_millis(5),
            confirm_time: Duration::from_millis(40),
            confirm_min_attempts: 3,
        }
    }

    fn collect<R: Read + Seek>(t: LineTailer<R>) -> Vec<String> {
        t.map(|l| String::from_utf8(l.unwrap()).unwrap()).collect()
    }

    #[test]
    fn fixed_source_yields_every_line_once() {
        let data = Cursor::new(b"a\nbb\n\nccc\n".to_vec());
        let lines = collect(LineTailer::new(data, "mem", quick(true)));
        assert_eq!(lines, vec!["a", "bb", "", "ccc"]);
    }

    #[test]
    fn termination_waits_for_time_and_attempts() {
        let settings = TailSettings {
            follow: true,
            sleep_time: Duration::from_millis(2),
            confirm_time: Duration::from_millis(60),
            confirm_min_attempts: 4,
        };
        let start = Instant::now();
        let lines = collect(LineTailer::new(Cursor::new(b"x\n".to_vec()), "mem", settings));
        assert_eq!(lines, vec!["x"]);
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn attempts_bound_applies_when_time_is_zero() {
        let settings = TailSettings {
            follow: true,
            sleep_time: Duration::from_millis(20),
            confirm_time: Duration::ZERO,
            confirm_min_attempts: 5,
        };
        let start = Instant::now();
        let lines = collect(LineTailer::new(Cursor::new(Vec::new()), "mem", settings));
        assert!(lines.is_empty());
        // Four sleeps happen between the five empty reads.
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn one_shot_mode_returns_trailing_line() {
        let data = Cursor::new(b"a\nlast".to_vec());
        let lines = collect(LineTailer::new(data, "mem", quick(false)));
        assert_eq!(lines, vec!["a", "last"]);
    }

    #[test]
    fn partial_line_waits_for_terminator() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("growing.tsv");
        let mut writer = File::create(&path).unwrap();
        writer.write_all(b"first\nsec").unwrap();
        writer.flush().unwrap();

        let settings = TailSettings {
            follow: true,
            sleep_time: Duration::from_millis(5),
            confirm_time: Duration::from_millis(150),
            confirm_min_attempts: 3,
        };
        let mut tailer = LineTailer::new(File::open(&path).unwrap(), "growing", settings);

        assert_eq!(tailer.next().unwrap().unwrap(), b"first");
        assert_eq!(tailer.offset(), 6);

        let (tx, rx) = mpsc::channel();
        let handle = std::thread::spawn(move || {
            let line = tailer.next().map(|l| l.unwrap());
            let offset = tailer.offset();
            let rest: Vec<Vec<u8>> = tailer.map(|l| l.unwrap()).collect();
            tx.send((line, offset, rest)).unwrap();
        });

        // Nothing may come out while the line is incomplete.
        std::thread::sleep(Duration::from_millis(60));
        assert!(rx.try_recv().is_err());

        writer.write_all(b"ond\nthird\n").unwrap();
        writer.flush().unwrap();

        let (line, offset, rest) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert_eq!(line.unwrap(), b"second");
        assert_eq!(offset, 13);
        assert_eq!(rest, vec![b"third".to_vec()]);
    }

    #[test]
    fn record_stream_interleaves_and_reports_malformed() {
        let a: Vec<u8> = (0..12)
            .map(|i| format!("aa\t{{\"_id\":\"a_{}\"}}\n", i))
            .collect::<String>()
            .into_bytes();
        let b = b"bb\t{\"_id\":\"b_0\"}\nnot a record\n".to_vec();

        let sources: Vec<(String, LineSource)> = vec![
            (
                "a".into(),
                Box::new(LineTailer::new(Cursor::new(a), "a", quick(false))),
            ),
            (
                "b".into(),
                Box::new(LineTailer::new(Cursor::new(b), "b", quick(false))),
            ),
        ];
        let decoded: Vec<Decoded> = RecordStream::new(sources).map(|r| r.unwrap()).collect();
        assert_eq!(decoded.len(), 14);

        let ids: Vec<String> = decoded
            .iter()
            .filter_map(|d| d.as_ref().ok())
            .map(|r| r.id.clone())
            .collect();
        // Ten from `a`, then everything from `b`, then the rest of `a`.
        assert_eq!(ids[9], "a_9");
        assert_eq!(ids[10], "b_0");
        assert_eq!(ids[11], "a_10");
        assert_eq!(decoded.iter().filter(|d| d.is_err()).count(), 1);
    }

    #[test]
    fn open_inputs_walks_directories() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("part");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("1.tsv"), "aa\t{\"_id\":\"x_1\"}\n").unwrap();
        std::fs::write(nested.join("2.tsv"), "bb\t{\"_id\":\"x_2\"}\n").unwrap();

        let stream = open_inputs(&[tmp.path().to_path_buf()], &quick(false)).unwrap();
        assert_eq!(stream.source_count(), 2);
        let ids: Vec<String> = stream.map(|r| r.unwrap().unwrap().id).collect();
        assert_eq!(ids, vec!["x_1", "x_2"]);
    }

    #[test]
    fn open_inputs_rejects_missing_paths() {
        let err = open_inputs(&[PathBuf::from("/no/such/input")], &quick(false));
        assert!(err.is_err());
    }
}
