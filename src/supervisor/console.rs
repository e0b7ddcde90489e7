//! Console history for one process role.
//!
//! Every clean output line is recorded here whether or not a classifier
//! rule matched it, along with `System` notices from the supervisor itself.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Default maximum number of lines kept per role.
pub const DEFAULT_CONSOLE_LINES: usize = 5_000;

/// A single line of console output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    /// Sequential ID for polling (`GET /api/console/:role?since=<id>`)
    pub id: u64,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    pub source: LogSource,
    pub content: String,
    pub level: LogLevel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    /// Merged stdout/stderr of the child
    Output,
    /// Notices from the supervisor itself
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

/// Ring buffer of recent lines with sequential IDs.
pub struct ConsoleBuffer {
    lines: VecDeque<LogLine>,
    next_id: u64,
    max_size: usize,
    level_pattern: Option<Regex>,
}

impl Default for ConsoleBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CONSOLE_LINES)
    }
}

impl ConsoleBuffer {
    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            next_id: 0,
            max_size: max_size.max(1),
            level_pattern: None,
        }
    }

    /// Set the regex used to extract a level from output lines.
    ///
    /// The pattern needs a named capture group `level`, e.g. Minecraft's
    /// `/(?P<level>INFO|WARN|ERROR|DEBUG|FATAL)\]`. An invalid pattern is
    /// logged and ignored.
    pub fn set_level_pattern(&mut self, pattern: Option<&str>) {
        self.level_pattern = pattern.and_then(|pat| match Regex::new(pat) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!("Invalid log_pattern '{}': {}, falling back to default", pat, e);
                None
            }
        });
    }

    /// Record a line of child output.
    pub fn push_output(&mut self, content: String) -> LogLine {
        let level = parse_log_level(&content, self.level_pattern.as_ref());
        self.push(LogSource::Output, content, level)
    }

    /// Record a supervisor notice.
    pub fn push_system(&mut self, content: impl Into<String>, level: LogLevel) -> LogLine {
        self.push(LogSource::System, content.into(), level)
    }

    fn push(&mut self, source: LogSource, content: String, level: LogLevel) -> LogLine {
        let line = LogLine {
            id: self.next_id,
            timestamp: current_timestamp(),
            source,
            content,
            level,
        };
        self.next_id += 1;

        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line.clone());
        line
    }

    /// All lines with `id > since_id`.
    pub fn get_since(&self, since_id: u64) -> Vec<LogLine> {
        self.lines.iter().filter(|l| l.id > since_id).cloned().collect()
    }

    /// The most recent `count` lines.
    pub fn get_recent(&self, count: usize) -> Vec<LogLine> {
        self.lines.iter().rev().take(count).rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

fn parse_log_level(line: &str, pattern: Option<&Regex>) -> LogLevel {
    if let Some(re) = pattern {
        if let Some(level_match) = re.captures(line).and_then(|caps| caps.name("level")) {
            return match level_match.as_str().to_uppercase().as_str() {
                "ERROR" | "FATAL" => LogLevel::Error,
                "WARN" | "WARNING" => LogLevel::Warn,
                "DEBUG" | "TRACE" => LogLevel::Debug,
                _ => LogLevel::Info,
            };
        }
    }
    LogLevel::Info
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_query() {
        let mut buffer = ConsoleBuffer::default();
        buffer.push_output("line 0".into());
        buffer.push_output("line 1".into());
        buffer.push_system("Process exited", LogLevel::Info);

        assert_eq!(buffer.len(), 3);
        // since_id = 0 → lines with id > 0
        assert_eq!(buffer.get_since(0).len(), 2);
        assert_eq!(buffer.get_recent(2).len(), 2);
        assert_eq!(buffer.get_recent(100).len(), 3);
        assert_eq!(buffer.get_recent(1)[0].source, LogSource::System);
    }

    #[test]
    fn ring_evicts_oldest() {
        let mut buffer = ConsoleBuffer::with_capacity(10);
        for i in 0..25 {
            buffer.push_output(format!("line {}", i));
        }
        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer.get_recent(1)[0].id, 24);
        assert_eq!(buffer.get_since(0)[0].id, 15);
    }

    #[test]
    fn level_pattern_applies_to_output() {
        let mut buffer = ConsoleBuffer::default();
        buffer.set_level_pattern(Some(r"/(?P<level>INFO|WARN|ERROR|DEBUG|FATAL)\]"));

        let warn = buffer.push_output("[12:00:00] [Server thread/WARN]: Can't keep up!".into());
        let err = buffer.push_output("[12:00:00] [Server thread/ERROR]: Encountered an unexpected exception".into());
        let plain = buffer.push_output("Some random output".into());

        assert_eq!(warn.level, LogLevel::Warn);
        assert_eq!(err.level, LogLevel::Error);
        assert_eq!(plain.level, LogLevel::Info);
    }

    #[test]
    fn invalid_pattern_falls_back_to_info() {
        let mut buffer = ConsoleBuffer::default();
        buffer.set_level_pattern(Some("(unclosed"));
        let line = buffer.push_output("[Server thread/ERROR]: boom".into());
        assert_eq!(line.level, LogLevel::Info);
    }
}
