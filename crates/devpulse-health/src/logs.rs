//! Service log access for output-pattern health checks.
//!
//! ```text
//! LogSource ──get_buffer(service)──▶ LogBuffer ──contains_pattern──▶ bool
//!   ├── LogBook        in-process ring buffers fed by the orchestrator
//!   └── LogDirectory   tails <project>/.devpulse/logs/<service>.log
//! ```

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::debug;

use crate::keyed::KeyedMap;

/// Lines retained per service.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Only lines this recent are searched for patterns.
pub const DEFAULT_LOG_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Bytes read from the end of a log file.
const MAX_TAIL_BYTES: u64 = 256 * 1024;

/// Searchable recent output of one service.
pub trait LogBuffer: Send + Sync {
    fn contains_pattern(&self, pattern: &str) -> bool;
}

/// Looks up the log buffer of a service, if one exists.
pub trait LogSource: Send + Sync {
    fn get_buffer(&self, service: &str) -> Option<Arc<dyn LogBuffer>>;
}

/// Matches a literal substring first, then the pattern as a regex.
fn lines_match<'a>(mut lines: impl Iterator<Item = &'a str> + Clone, pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    if lines.clone().any(|line| line.contains(pattern)) {
        return true;
    }
    match Regex::new(pattern) {
        Ok(re) => lines.any(|line| re.is_match(line)),
        Err(_) => false,
    }
}

/// Bounded in-memory buffer of the most recent lines.
#[derive(Debug)]
pub struct RingLogBuffer {
    lines: RwLock<VecDeque<(Instant, String)>>,
    capacity: usize,
    window: Duration,
}

impl RingLogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self::with_window(capacity, DEFAULT_LOG_WINDOW)
    }

    pub fn with_window(capacity: usize, window: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
            window,
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        self.push_at(Instant::now(), line.into());
    }

    fn push_at(&self, at: Instant, line: String) {
        let mut lines = self.lines.write().unwrap_or_else(|e| e.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back((at, line));
    }

    pub fn len(&self) -> usize {
        self.lines.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RingLogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl LogBuffer for RingLogBuffer {
    fn contains_pattern(&self, pattern: &str) -> bool {
        let cutoff = Instant::now().checked_sub(self.window);
        let lines = self.lines.read().unwrap_or_else(|e| e.into_inner());
        let recent = lines
            .iter()
            .filter(|(at, _)| cutoff.is_none_or(|c| *at >= c))
            .map(|(_, line)| line.as_str());
        lines_match(recent, pattern)
    }
}

/// Ring buffers for every service this process captures output from.
#[derive(Debug, Default)]
pub struct LogBook {
    buffers: KeyedMap<String, RingLogBuffer>,
    capacity: usize,
}

impl LogBook {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: KeyedMap::new(),
            capacity,
        }
    }

    /// Buffer for a service, created on first use.
    pub fn buffer(&self, service: &str) -> Arc<RingLogBuffer> {
        let capacity = if self.capacity == 0 {
            DEFAULT_LOG_CAPACITY
        } else {
            self.capacity
        };
        self.buffers
            .get_or_insert_with(service, || RingLogBuffer::new(capacity))
    }

    pub fn append(&self, service: &str, line: impl Into<String>) {
        self.buffer(service).push(line);
    }
}

impl LogSource for LogBook {
    fn get_buffer(&self, service: &str) -> Option<Arc<dyn LogBuffer>> {
        let buffer: Arc<dyn LogBuffer> = self.buffers.get(service)?;
        Some(buffer)
    }
}

/// Log files written by the orchestrator, one per service.
#[derive(Debug, Clone)]
pub struct LogDirectory {
    dir: PathBuf,
}

impl LogDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<project>/.devpulse/logs`
    pub fn for_project(project_dir: &Path) -> Self {
        Self::new(project_dir.join(".devpulse").join("logs"))
    }

    pub fn path_for(&self, service: &str) -> PathBuf {
        self.dir.join(format!("{service}.log"))
    }
}

impl LogSource for LogDirectory {
    fn get_buffer(&self, service: &str) -> Option<Arc<dyn LogBuffer>> {
        let path = self.path_for(service);
        match read_tail(&path) {
            Ok(text) => Some(Arc::new(FileTail { text })),
            Err(e) => {
                debug!(%service, path = %path.display(), error = %e, "no log file");
                None
            }
        }
    }
}

fn read_tail(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(MAX_TAIL_BYTES);
    file.seek(SeekFrom::Start(start))?;
    let mut bytes = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut bytes)?;
    let mut text = String::from_utf8_lossy(&bytes).into_owned();
    // Drop a partial first line when starting mid-file.
    if start > 0 {
        if let Some(nl) = text.find('\n') {
            text.drain(..=nl);
        }
    }
    Ok(text)
}

/// Snapshot of the end of a log file.
#[derive(Debug)]
struct FileTail {
    text: String,
}

impl LogBuffer for FileTail {
    fn contains_pattern(&self, pattern: &str) -> bool {
        lines_match(self.text.lines(), pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_evicts_oldest() {
        let buf = RingLogBuffer::new(2);
        buf.push("compiling");
        buf.push("webpack compiled successfully");
        buf.push("watching for changes");
        assert_eq!(buf.len(), 2);
        assert!(!buf.contains_pattern("compiling"));
        assert!(buf.contains_pattern("compiled successfully"));
    }

    #[test]
    fn pattern_falls_back_to_regex() {
        let buf = RingLogBuffer::default();
        buf.push("Listening on port 5173");
        assert!(buf.contains_pattern(r"port \d+"));
        assert!(!buf.contains_pattern(r"port \d{5}"));
        assert!(!buf.contains_pattern(""));
        // Invalid regex with no literal match.
        assert!(!buf.contains_pattern("(unclosed"));
    }

    #[test]
    fn lines_outside_window_are_ignored() {
        let buf = RingLogBuffer::with_window(10, Duration::from_secs(60));
        if let Some(old) = Instant::now().checked_sub(Duration::from_secs(120)) {
            buf.push_at(old, "server started".to_string());
            assert!(!buf.contains_pattern("server started"));
        }
        buf.push("server started again");
        assert!(buf.contains_pattern("server started"));
    }

    #[test]
    fn log_book_only_reports_known_services() {
        let book = LogBook::default();
        assert!(book.get_buffer("web").is_none());

        book.append("web", "ready in 120ms");
        let buffer = book.get_buffer("web").unwrap();
        assert!(buffer.contains_pattern("ready"));
    }

    #[test]
    fn log_directory_reads_service_file() {
        let dir = tempfile::tempdir().unwrap();
        let logs = LogDirectory::for_project(dir.path());
        std::fs::create_dir_all(dir.path().join(".devpulse/logs")).unwrap();
        std::fs::write(logs.path_for("tsc"), "starting\nFound 0 errors. Watching for file changes.\n")
            .unwrap();

        let buffer = logs.get_buffer("tsc").unwrap();
        assert!(buffer.contains_pattern("Watching for file changes"));
        assert!(logs.get_buffer("missing").is_none());
    }
}
