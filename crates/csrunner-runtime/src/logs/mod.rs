//! Per-application log pipeline.
//!
//! Captures a child's stdout/stderr into `current.log`, rotates the file on
//! every new run, and serves tail and search queries over the current file
//! plus archives. Reader tasks do byte-based line reads with lossy UTF-8
//! decoding, so a child emitting non-UTF-8 cannot kill the capture.
//!
//! The pipeline deliberately drops rather than back-pressures: blocking a
//! chatty child's stderr can deadlock it. When the in-memory buffer is full
//! the oldest pending lines go away and a sentinel line with stream tag
//! `meta` records how many.

mod query;

pub use query::{LogEntry, RunInfo, SearchMatch};

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use csrunner_core::SupervisorError;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Pending lines held in memory before the writer drains them.
const MAX_PENDING_LINES: usize = 1024;

/// Which stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamTag {
    Stdout,
    Stderr,
    /// Pipeline-generated lines, e.g. the dropped-lines sentinel.
    Meta,
}

impl StreamTag {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Meta => "meta",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "stdout" => Some(Self::Stdout),
            "stderr" => Some(Self::Stderr),
            "meta" => Some(Self::Meta),
            _ => None,
        }
    }
}

impl std::fmt::Display for StreamTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct QueuedLine {
    ts: DateTime<Utc>,
    stream: StreamTag,
    text: String,
}

struct Inner {
    dir: PathBuf,
    retention: usize,
    queue: Mutex<VecDeque<QueuedLine>>,
    dropped: AtomicU64,
    notify: Notify,
    /// Serialises file writes against rotation.
    file_lock: tokio::sync::Mutex<()>,
    /// Last timestamp written; timestamps are clamped to be non-decreasing
    /// per file.
    last_ts: Mutex<DateTime<Utc>>,
}

/// Per-application singleton owning `current.log` and its archives.
pub struct LogPipeline {
    inner: Arc<Inner>,
}

impl LogPipeline {
    /// Create the pipeline, its directory, and the background writer task.
    pub fn new(dir: PathBuf, retention: usize) -> Result<Self, SupervisorError> {
        fs::create_dir_all(&dir).map_err(|e| {
            SupervisorError::internal(format!("cannot create log dir {}: {e}", dir.display()))
        })?;
        let inner = Arc::new(Inner {
            dir,
            retention,
            queue: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
            file_lock: tokio::sync::Mutex::new(()),
            last_ts: Mutex::new(DateTime::<Utc>::MIN_UTC),
        });

        let writer = inner.clone();
        tokio::spawn(async move {
            loop {
                writer.notify.notified().await;
                writer.drain().await;
            }
        });

        Ok(Self { inner })
    }

    /// Begin consuming a child's stdout and stderr concurrently.
    pub fn attach(
        &self,
        stdout: impl AsyncRead + Unpin + Send + 'static,
        stderr: impl AsyncRead + Unpin + Send + 'static,
    ) {
        self.spawn_reader(stdout, StreamTag::Stdout);
        self.spawn_reader(stderr, StreamTag::Stderr);
    }

    /// Append a line directly, e.g. build-step output captured separately.
    pub fn append(&self, stream: StreamTag, text: &str) {
        self.inner.push(stream, text.to_string());
    }

    /// Flush pending lines to `current.log`.
    pub async fn flush(&self) {
        self.inner.drain().await;
    }

    /// Rotate: flush, rename `current.log` to `<run_id>.log`, trim archives
    /// beyond the retention count. A missing `current.log` is fine; the next
    /// write recreates it.
    pub async fn archive(&self, run_id: &str) -> Result<(), SupervisorError> {
        self.inner.drain().await;
        let _guard = self.inner.file_lock.lock().await;

        let current = self.inner.dir.join("current.log");
        if current.exists() {
            // Run ids have second resolution; two runs in the same second
            // must not clobber each other's archive
            let mut target = self.inner.dir.join(format!("{run_id}.log"));
            let mut suffix = 2;
            while target.exists() {
                target = self.inner.dir.join(format!("{run_id}-{suffix}.log"));
                suffix += 1;
            }
            fs::rename(&current, &target).map_err(|e| {
                SupervisorError::internal(format!("cannot archive {}: {e}", current.display()))
            })?;
            debug!(run_id = %run_id, "Archived log run");
        }

        self.trim_archives();
        Ok(())
    }

    /// Trailing `lines` entries from `current` or a named run.
    pub async fn tail(
        &self,
        lines: usize,
        run_id: Option<&str>,
    ) -> Result<Vec<LogEntry>, SupervisorError> {
        self.inner.drain().await;
        let path = self.run_path(run_id)?;
        query::tail_file(&path, lines)
    }

    /// Regex search over current plus archives, newest file first. A pattern
    /// that fails to compile is retried as a literal.
    pub async fn search(
        &self,
        pattern: &str,
        max_results: usize,
        case_sensitive: bool,
    ) -> Result<Vec<SearchMatch>, SupervisorError> {
        self.inner.drain().await;
        let mut files = Vec::new();
        let current = self.inner.dir.join("current.log");
        if current.exists() {
            files.push(current);
        }
        for run in self.list_runs() {
            files.push(self.inner.dir.join(&run.file));
        }
        query::search_files(&files, pattern, max_results, case_sensitive)
    }

    /// Archive metadata, newest-first.
    pub fn list_runs(&self) -> Vec<RunInfo> {
        query::list_runs(&self.inner.dir)
    }

    fn spawn_reader(&self, stream: impl AsyncRead + Unpin + Send + 'static, tag: StreamTag) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            let mut buf: Vec<u8> = Vec::with_capacity(1024);
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break, // EOF
                    Ok(_) => {
                        if buf.last() == Some(&b'\n') {
                            buf.pop();
                            if buf.last() == Some(&b'\r') {
                                buf.pop();
                            }
                        }
                        let line = String::from_utf8_lossy(&buf).to_string();
                        inner.push(tag, line);
                    }
                    Err(e) => {
                        debug!(stream = %tag, error = %e, "log reader exiting on read error");
                        break;
                    }
                }
            }
            // Final flush so a short-lived child's output is visible
            inner.notify.notify_one();
            debug!(stream = %tag, "log reader task exiting");
        });
    }

    fn run_path(&self, run_id: Option<&str>) -> Result<PathBuf, SupervisorError> {
        match run_id {
            None | Some("current") => Ok(self.inner.dir.join("current.log")),
            Some(id) => {
                // Run ids are timestamp-shaped; reject anything path-like
                if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit() || c == '-') {
                    return Err(SupervisorError::NotFound(format!("log run {id}")));
                }
                let path = self.inner.dir.join(format!("{id}.log"));
                if path.exists() {
                    Ok(path)
                } else {
                    Err(SupervisorError::NotFound(format!("log run {id}")))
                }
            }
        }
    }

    fn trim_archives(&self) {
        let runs = self.list_runs();
        for stale in runs.iter().skip(self.inner.retention) {
            let path = self.inner.dir.join(&stale.file);
            if let Err(e) = fs::remove_file(&path) {
                warn!(file = %stale.file, error = %e, "Failed to remove stale log archive");
            } else {
                debug!(file = %stale.file, "Trimmed stale log archive");
            }
        }
    }
}

impl Inner {
    fn push(&self, stream: StreamTag, text: String) {
        {
            let mut queue = self.queue.lock().unwrap();
            while queue.len() >= MAX_PENDING_LINES {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(QueuedLine {
                ts: Utc::now(),
                stream,
                text,
            });
        }
        self.notify.notify_one();
    }

    async fn drain(&self) {
        let mut batch: VecDeque<QueuedLine> = {
            let mut queue = self.queue.lock().unwrap();
            std::mem::take(&mut *queue)
        };
        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            batch.push_front(QueuedLine {
                ts: Utc::now(),
                stream: StreamTag::Meta,
                text: format!("[log-pipeline: {dropped} lines dropped]"),
            });
        }
        if batch.is_empty() {
            return;
        }

        let _guard = self.file_lock.lock().await;
        let path = self.dir.join("current.log");
        let file = OpenOptions::new().create(true).append(true).open(&path);
        let mut file = match file {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot open current.log, dropping batch");
                return;
            }
        };

        let mut last_ts = self.last_ts.lock().unwrap();
        for line in batch {
            let ts = line.ts.max(*last_ts);
            *last_ts = ts;
            let rendered = format!(
                "{} {} {}\n",
                ts.to_rfc3339_opts(SecondsFormat::Millis, true),
                line.stream.as_str(),
                line.text
            );
            if let Err(e) = file.write_all(rendered.as_bytes()) {
                warn!(error = %e, "Log write failed");
                return;
            }
        }
    }
}

/// Parse one rendered log line back into its parts.
pub(crate) fn parse_line(line: &str) -> Option<(DateTime<Utc>, StreamTag, String)> {
    let mut parts = line.splitn(3, ' ');
    let ts = DateTime::parse_from_rfc3339(parts.next()?).ok()?.to_utc();
    let tag = StreamTag::parse(parts.next()?)?;
    let text = parts.next().unwrap_or("").to_string();
    Some((ts, tag, text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pipeline(temp: &TempDir) -> LogPipeline {
        LogPipeline::new(temp.path().join("logs"), 3).unwrap()
    }

    #[tokio::test]
    async fn append_then_tail() {
        let temp = TempDir::new().unwrap();
        let pipe = pipeline(&temp);

        pipe.append(StreamTag::Stdout, "hello");
        pipe.append(StreamTag::Stderr, "oh no");

        let entries = pipe.tail(10, None).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].text, "hello");
        assert_eq!(entries[0].stream, StreamTag::Stdout);
        assert_eq!(entries[1].stream, StreamTag::Stderr);
    }

    #[tokio::test]
    async fn attach_captures_both_streams_in_order() {
        let temp = TempDir::new().unwrap();
        let pipe = pipeline(&temp);

        let stdout: &[u8] = b"one\ntwo\nthree\n";
        let stderr: &[u8] = b"warn\n";
        pipe.attach(stdout, stderr);

        // Readers are background tasks; give them a beat
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let entries = pipe.tail(10, None).await.unwrap();
        let stdout_lines: Vec<&str> = entries
            .iter()
            .filter(|e| e.stream == StreamTag::Stdout)
            .map(|e| e.text.as_str())
            .collect();
        assert_eq!(stdout_lines, vec!["one", "two", "three"]);
        assert!(entries.iter().any(|e| e.stream == StreamTag::Stderr));
    }

    #[tokio::test]
    async fn non_utf8_output_is_decoded_lossily() {
        let temp = TempDir::new().unwrap();
        let pipe = pipeline(&temp);

        let stdout: &[u8] = b"ok \xff\xfe bytes\n";
        let stderr: &[u8] = b"";
        pipe.attach(stdout, stderr);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let entries = pipe.tail(10, None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].text.starts_with("ok "));
    }

    #[tokio::test]
    async fn timestamps_are_monotonic_non_decreasing() {
        let temp = TempDir::new().unwrap();
        let pipe = pipeline(&temp);
        for i in 0..50 {
            pipe.append(StreamTag::Stdout, &format!("line {i}"));
        }
        let entries = pipe.tail(100, None).await.unwrap();
        assert_eq!(entries.len(), 50);
        for pair in entries.windows(2) {
            assert!(pair[0].ts <= pair[1].ts);
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_emits_sentinel() {
        let temp = TempDir::new().unwrap();
        let pipe = pipeline(&temp);

        for i in 0..(MAX_PENDING_LINES + 100) {
            pipe.inner.push(StreamTag::Stdout, format!("line {i}"));
        }
        pipe.flush().await;

        let entries = pipe.tail(MAX_PENDING_LINES + 200, None).await.unwrap();
        let sentinel = entries
            .iter()
            .find(|e| e.stream == StreamTag::Meta)
            .expect("sentinel line");
        assert!(sentinel.text.contains("lines dropped"));
        // The oldest lines are the ones that went away
        assert!(!entries.iter().any(|e| e.text == "line 0"));
        assert!(entries.iter().any(|e| e.text == format!("line {}", MAX_PENDING_LINES + 99)));
    }

    #[tokio::test]
    async fn archive_rotates_and_trims() {
        let temp = TempDir::new().unwrap();
        let pipe = pipeline(&temp); // retention 3

        for run in ["2024-01-01-00-00-01", "2024-01-01-00-00-02", "2024-01-01-00-00-03", "2024-01-01-00-00-04"] {
            pipe.append(StreamTag::Stdout, &format!("run {run}"));
            pipe.archive(run).await.unwrap();
        }

        let runs = pipe.list_runs();
        assert_eq!(runs.len(), 3);
        // Newest-first, oldest trimmed
        assert_eq!(runs[0].run_id, "2024-01-01-00-00-04");
        assert!(!runs.iter().any(|r| r.run_id == "2024-01-01-00-00-01"));
    }

    #[tokio::test]
    async fn tail_of_archived_run() {
        let temp = TempDir::new().unwrap();
        let pipe = pipeline(&temp);

        pipe.append(StreamTag::Stdout, "old run line");
        pipe.archive("2024-02-02-10-00-00").await.unwrap();
        pipe.append(StreamTag::Stdout, "new run line");

        let old = pipe.tail(5, Some("2024-02-02-10-00-00")).await.unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].text, "old run line");

        let current = pipe.tail(5, None).await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].text, "new run line");
    }

    #[tokio::test]
    async fn tail_unknown_run_is_not_found() {
        let temp = TempDir::new().unwrap();
        let pipe = pipeline(&temp);
        let err = pipe.tail(5, Some("2030-01-01-00-00-00")).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
        // Path-shaped run ids are rejected outright
        let err = pipe.tail(5, Some("../escape")).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn search_spans_archives_newest_first() {
        let temp = TempDir::new().unwrap();
        let pipe = pipeline(&temp);

        pipe.append(StreamTag::Stdout, "oops-1");
        pipe.archive("2024-03-01-00-00-01").await.unwrap();
        pipe.append(StreamTag::Stdout, "oops-2");
        pipe.archive("2024-03-01-00-00-02").await.unwrap();
        pipe.append(StreamTag::Stdout, "oops-3");

        let matches = pipe.search(r"oops-\d+", 10, true).await.unwrap();
        assert_eq!(matches.len(), 3);
        assert_eq!(matches[0].text, "oops-3");
        assert!(matches[0].file.contains("current"));
        assert_eq!(matches[1].text, "oops-2");
        assert_eq!(matches[1].file, "2024-03-01-00-00-02.log");
        assert_eq!(matches[2].text, "oops-1");
    }

    #[tokio::test]
    async fn search_falls_back_to_literal_on_bad_regex() {
        let temp = TempDir::new().unwrap();
        let pipe = pipeline(&temp);
        pipe.append(StreamTag::Stdout, "weird [pattern");

        let matches = pipe.search("[pattern", 10, true).await.unwrap();
        assert_eq!(matches.len(), 1);
    }
}
