//! Kernel console and log sink
//!
//! All kernel diagnostics go through the `log` facade. The sink keeps the
//! most recent lines in a fixed-size ring so a hosted test (or a debugger
//! attached to a real board) can inspect what the kernel reported without
//! any heap allocation on the logging path.

use alloc::vec::Vec;
use core::fmt::{self, Write};

use heapless::{Deque, String};
use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Longest line kept by the sink; longer messages are truncated
pub const LINE_MAX: usize = 160;

/// Number of lines retained
pub const LOG_LINES: usize = 128;

pub type LogLine = String<LINE_MAX>;

/// Writer that fills a line and silently drops what does not fit
struct LineWriter<'a> {
    line: &'a mut LogLine,
}

impl Write for LineWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.chars() {
            if self.line.push(c).is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// Ring-buffer logger
pub struct KernelLog {
    lines: Mutex<Deque<LogLine, LOG_LINES>>,
    level: LevelFilter,
}

impl KernelLog {
    pub const fn new(level: LevelFilter) -> Self {
        Self {
            lines: Mutex::new(Deque::new()),
            level,
        }
    }

    /// Append a line, evicting the oldest when full
    pub fn push(&self, line: LogLine) {
        let mut lines = self.lines.lock();
        if lines.is_full() {
            lines.pop_front();
        }
        let _ = lines.push_back(line);
    }

    /// Copy of the retained lines, oldest first
    pub fn snapshot(&self) -> Vec<LogLine> {
        self.lines.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|l| l.contains(needle))
    }
}

impl Log for KernelLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut line = LogLine::new();
        let mut w = LineWriter { line: &mut line };
        let _ = write!(w, "[{:<5} {}] {}", record.level(), record.target(), record.args());
        self.push(line);
    }

    fn flush(&self) {}
}

static KERNEL_LOG: KernelLog = KernelLog::new(LevelFilter::Trace);

/// Install the kernel sink as the global logger
///
/// Safe to call more than once; later calls only adjust the level.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&KERNEL_LOG);
    log::set_max_level(level);
}

/// Lines captured by the global sink
pub fn snapshot() -> Vec<LogLine> {
    KERNEL_LOG.snapshot()
}

/// True if any captured line contains `needle`
pub fn contains(needle: &str) -> bool {
    KERNEL_LOG.contains(needle)
}
