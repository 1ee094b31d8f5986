//! Per-subsystem file logging.
//!
//! Each subsystem (listener, routing store, pinger) appends to its own log
//! file. Records are timestamped and level-tagged; an internal mutex keeps
//! concurrent writers from interleaving.

use chrono::Local;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Log record severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Error,
    Debug,
    Warning,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Error => "ERROR",
            Level::Debug => "DEBUG",
            Level::Warning => "WARNING",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only file log sink.
///
/// Records look like `[2025-01-02 15:04:05] [INFO] message`. Write failures
/// are swallowed; a logger has nowhere left to report.
pub struct Logger {
    sink: Mutex<File>,
}

impl Logger {
    /// Open (creating if necessary) the log file at `path` for appending.
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Logger> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Logger {
            sink: Mutex::new(file),
        })
    }

    /// Append one record at the given level.
    pub fn log(&self, level: Level, message: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");

        let mut sink = self.sink.lock().unwrap();
        let _ = writeln!(sink, "[{timestamp}] [{level}] {message}");
    }

    pub fn info(&self, message: &str) {
        self.log(Level::Info, message);
    }

    pub fn error(&self, message: &str) {
        self.log(Level::Error, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(Level::Debug, message);
    }

    pub fn warning(&self, message: &str) {
        self.log(Level::Warning, message);
    }
}
