// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Boot log buffer
//!
//! Early boot has neither a clock nor a console we can rely on, so every
//! component records into a caller-owned [`LogBuffer`]. Entries are ordered by
//! a per-buffer sequence number. The buffer is passed explicitly to whoever
//! needs it; nothing in the core logs through global state. Host tools drain
//! the buffer into their own logger once the boot decision is made.
//!
//! Key material, signatures and digests are never logged. Rejections carry the
//! failing stage and the numeric error code only.

use core::fmt::{self, Write};
use heapless::String;

/// Maximum log message length
pub const MAX_LOG_MESSAGE_LEN: usize = 128;

/// Log buffer size (number of entries)
pub const LOG_BUFFER_SIZE: usize = 64;

/// Log level enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    /// Errors that end the boot attempt
    Error = 0,
    /// Rejected candidates and recoverable anomalies
    Warn = 1,
    /// Boot decisions
    Info = 2,
    /// Per-stage progress
    Debug = 3,
}

impl LogLevel {
    /// Get the log level name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
        }
    }

    /// Get a short prefix for the log level
    #[must_use]
    pub const fn prefix(&self) -> char {
        match self {
            Self::Error => 'E',
            Self::Warn => 'W',
            Self::Info => 'I',
            Self::Debug => 'D',
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Log entry structure
#[derive(Clone, Debug)]
pub struct LogEntry {
    /// Log level
    pub level: LogLevel,
    /// Sequence number within the owning buffer
    pub seq: u32,
    /// Component name
    pub module: &'static str,
    /// Log message, truncated to [`MAX_LOG_MESSAGE_LEN`]
    pub message: String<MAX_LOG_MESSAGE_LEN>,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:04}] {} [{}] {}",
            self.seq,
            self.level.prefix(),
            self.module,
            self.message
        )
    }
}

/// Writer that silently truncates at capacity instead of failing.
struct Truncating<'a>(&'a mut String<MAX_LOG_MESSAGE_LEN>);

impl Write for Truncating<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.chars() {
            if self.0.push(c).is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// Circular log buffer
pub struct LogBuffer {
    entries: [Option<LogEntry>; LOG_BUFFER_SIZE],
    write_index: usize,
    count: usize,
    next_seq: u32,
    dropped: u32,
    min_level: LogLevel,
}

impl LogBuffer {
    /// Create a new empty log buffer recording `Info` and above
    #[must_use]
    pub const fn new() -> Self {
        const NONE: Option<LogEntry> = None;
        Self {
            entries: [NONE; LOG_BUFFER_SIZE],
            write_index: 0,
            count: 0,
            next_seq: 0,
            dropped: 0,
            min_level: LogLevel::Info,
        }
    }

    /// Create a buffer with a given minimum level
    #[must_use]
    pub const fn with_level(min_level: LogLevel) -> Self {
        let mut buffer = Self::new();
        buffer.min_level = min_level;
        buffer
    }

    /// Set the minimum log level
    pub fn set_min_level(&mut self, level: LogLevel) {
        self.min_level = level;
    }

    /// Get the minimum log level
    #[must_use]
    pub const fn min_level(&self) -> LogLevel {
        self.min_level
    }

    /// Check if a log level should be recorded
    #[must_use]
    pub const fn should_log(&self, level: LogLevel) -> bool {
        (level as u8) <= (self.min_level as u8)
    }

    /// Record a formatted message
    pub fn log(&mut self, level: LogLevel, module: &'static str, args: fmt::Arguments<'_>) {
        if !self.should_log(level) {
            return;
        }

        let mut message = String::<MAX_LOG_MESSAGE_LEN>::new();
        let _ = Truncating(&mut message).write_fmt(args);

        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        if self.count == LOG_BUFFER_SIZE {
            self.dropped = self.dropped.saturating_add(1);
        }
        self.entries[self.write_index] = Some(LogEntry {
            level,
            seq,
            module,
            message,
        });
        self.write_index = (self.write_index + 1) % LOG_BUFFER_SIZE;
        if self.count < LOG_BUFFER_SIZE {
            self.count += 1;
        }
    }

    /// Get the number of entries
    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    /// Check if buffer is empty
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of entries overwritten because the buffer was full
    #[must_use]
    pub const fn dropped(&self) -> u32 {
        self.dropped
    }

    /// Clear all entries
    pub fn clear(&mut self) {
        for entry in &mut self.entries {
            *entry = None;
        }
        self.write_index = 0;
        self.count = 0;
        self.dropped = 0;
    }

    /// Iterate over entries (oldest first)
    pub fn iter(&self) -> LogBufferIter<'_> {
        LogBufferIter {
            buffer: self,
            index: 0,
            remaining: self.count,
        }
    }

    /// Whether any recorded message of `level` contains `needle`
    #[must_use]
    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.iter()
            .any(|e| e.level == level && e.message.as_str().contains(needle))
    }

    /// Hand every entry to `sink` (oldest first) and empty the buffer
    pub fn drain<F: FnMut(&LogEntry)>(&mut self, mut sink: F) {
        for entry in self.iter() {
            sink(entry);
        }
        self.clear();
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over log buffer entries
pub struct LogBufferIter<'a> {
    buffer: &'a LogBuffer,
    index: usize,
    remaining: usize,
}

impl<'a> Iterator for LogBufferIter<'a> {
    type Item = &'a LogEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        let start_index = if self.buffer.count < LOG_BUFFER_SIZE {
            0
        } else {
            self.buffer.write_index
        };

        let actual_index = (start_index + self.index) % LOG_BUFFER_SIZE;
        self.index += 1;
        self.remaining -= 1;

        self.buffer.entries[actual_index].as_ref()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

/// Log an error message
#[macro_export]
macro_rules! log_error {
    ($buffer:expr, $module:expr, $($arg:tt)*) => {
        $buffer.log($crate::log::LogLevel::Error, $module, format_args!($($arg)*))
    };
}

/// Log a warning message
#[macro_export]
macro_rules! log_warn {
    ($buffer:expr, $module:expr, $($arg:tt)*) => {
        $buffer.log($crate::log::LogLevel::Warn, $module, format_args!($($arg)*))
    };
}

/// Log an informational message
#[macro_export]
macro_rules! log_info {
    ($buffer:expr, $module:expr, $($arg:tt)*) => {
        $buffer.log($crate::log::LogLevel::Info, $module, format_args!($($arg)*))
    };
}

/// Log a debug message
#[macro_export]
macro_rules! log_debug {
    ($buffer:expr, $module:expr, $($arg:tt)*) => {
        $buffer.log($crate::log::LogLevel::Debug, $module, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter() {
        let mut buffer = LogBuffer::new();
        crate::log_debug!(buffer, "test", "hidden {}", 1);
        crate::log_warn!(buffer, "test", "shown {}", 2);
        assert_eq!(buffer.len(), 1);
        assert!(buffer.contains(LogLevel::Warn, "shown 2"));
    }

    #[test]
    fn test_wraps_oldest_first() {
        let mut buffer = LogBuffer::new();
        for i in 0..(LOG_BUFFER_SIZE + 3) {
            crate::log_info!(buffer, "test", "{}", i);
        }
        assert_eq!(buffer.len(), LOG_BUFFER_SIZE);
        assert_eq!(buffer.dropped(), 3);
        let first = buffer.iter().next().unwrap();
        assert_eq!(first.seq, 3);
        assert_eq!(first.message.as_str(), "3");
    }

    #[test]
    fn test_long_message_truncated() {
        let mut buffer = LogBuffer::new();
        let long = "é".repeat(MAX_LOG_MESSAGE_LEN);
        crate::log_info!(buffer, "test", "{}", long);
        let entry = buffer.iter().next().unwrap();
        assert!(entry.message.len() <= MAX_LOG_MESSAGE_LEN);
        assert!(!entry.message.is_empty());
    }

    #[test]
    fn test_drain_empties() {
        let mut buffer = LogBuffer::with_level(LogLevel::Debug);
        crate::log_debug!(buffer, "a", "x");
        crate::log_error!(buffer, "b", "y");
        let mut seen = 0;
        buffer.drain(|_| seen += 1);
        assert_eq!(seen, 2);
        assert!(buffer.is_empty());
    }
}
