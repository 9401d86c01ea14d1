//! Accumulates errors across retry attempts and collapses identical failures
//! into a single diagnostic.
//!
//! The first error is reported verbatim. Every later failure either bumps the
//! counter of an already-seen message or appends a new line, so ten timeouts
//! against the same host render as one line with a count and a time range.

use std::fmt;
use std::time::Instant;

#[derive(Debug)]
struct RetryItem {
    kind: String,
    message: String,
    total: u32,
    retry_first_ms: u64,
    retry_last_ms: u64,
}

/// Cross-attempt error accumulator.
#[derive(Debug)]
pub struct ErrorRetry {
    time_begin: Instant,
    /// Kind, message and time of the first error, reported verbatim on
    /// final failure.
    first: Option<(String, String, u64)>,
    items: Vec<RetryItem>,
    attempts: u32,
}

impl ErrorRetry {
    pub fn new() -> Self {
        ErrorRetry {
            time_begin: Instant::now(),
            first: None,
            items: Vec::new(),
            attempts: 0,
        }
    }

    /// Record one failed attempt. `kind` and `message` default to the first
    /// error's values when the caller has nothing better.
    pub fn add(&mut self, kind: Option<&str>, message: Option<&str>) {
        self.attempts += 1;

        let kind = kind
            .or(self.first.as_ref().map(|(k, _, _)| k.as_str()))
            .unwrap_or("UnknownError")
            .to_string();
        let message = message
            .or(self.first.as_ref().map(|(_, m, _)| m.as_str()))
            .unwrap_or("no message")
            .to_string();

        let retry_ms = self.time_begin.elapsed().as_millis() as u64;

        if self.first.is_none() {
            self.first = Some((kind, message, retry_ms));
            return;
        }

        match self.items.iter_mut().find(|i| i.message == message) {
            Some(item) => {
                item.total += 1;
                item.retry_last_ms = retry_ms;
            }
            None => self.items.push(RetryItem {
                kind,
                message,
                total: 1,
                retry_first_ms: retry_ms,
                retry_last_ms: retry_ms,
            }),
        }
    }

    /// Kind of the first recorded error, if any.
    pub fn kind(&self) -> Option<&str> {
        self.first.as_ref().map(|(k, _, _)| k.as_str())
    }

    /// Number of failed attempts recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    /// The aggregated diagnostic. Must not be called before the first `add`.
    pub fn message(&self) -> String {
        let (_, first_message, _) = self.first.as_ref().expect("no errors recorded");

        let mut result = first_message.clone();
        for item in &self.items {
            result.push('\n');
            result.push_str(&render_item(item));
        }
        result
    }

    /// Rendering for an operation that eventually succeeded: every failed
    /// attempt becomes a retry line, including the first.
    pub fn success_message(&self) -> String {
        let (first_kind, first_message, first_ms) =
            self.first.as_ref().expect("no errors recorded");

        let mut result = format!("[{first_kind}] on retry at {first_ms}ms: {first_message}");
        for item in &self.items {
            result.push('\n');
            result.push_str(render_item(item).trim_start());
        }
        result
    }
}

fn render_item(item: &RetryItem) -> String {
    let timing = if item.retry_first_ms == item.retry_last_ms {
        format!("on retry at {}", item.retry_first_ms)
    } else {
        format!(
            "on {} retries from {}-{}",
            item.total, item.retry_first_ms, item.retry_last_ms
        )
    };
    format!("    [{}] {timing}ms: {}", item.kind, item.message)
}

impl Default for ErrorRetry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ErrorRetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_reported_verbatim() {
        let mut retry = ErrorRetry::new();
        retry.add(Some("FileReadError"), Some("unable to open file"));
        assert_eq!(retry.message(), "unable to open file");
        assert_eq!(retry.kind(), Some("FileReadError"));
        assert_eq!(retry.attempts(), 1);
    }

    #[test]
    fn identical_messages_collapse() {
        let mut retry = ErrorRetry::new();
        retry.add(Some("FileReadError"), Some("message 1"));
        retry.add(Some("FileReadError"), Some("message 2"));
        retry.add(Some("FileReadError"), Some("message 2"));
        retry.add(Some("HostConnectError"), Some("message 3"));
        assert_eq!(retry.attempts(), 4);

        let rendered = retry.message();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "message 1");
        // message 2 seen twice: a range line with a count
        assert!(lines[1].starts_with("    [FileReadError] on 2 retries from "));
        assert!(lines[1].ends_with("ms: message 2"));
        // message 3 seen once: a single-retry line
        assert!(lines[2].starts_with("    [HostConnectError] on retry at "));
        assert!(lines[2].ends_with("ms: message 3"));
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn success_message_renders_every_failure_as_a_retry() {
        let mut retry = ErrorRetry::new();
        retry.add(Some("FileWriteError"), Some("HTTP 503"));
        // the operation then succeeded on the second attempt
        let rendered = retry.success_message();
        assert!(rendered.starts_with("[FileWriteError] on retry at "));
        assert!(rendered.contains("on retry at"));
        assert!(rendered.ends_with("ms: HTTP 503"));
    }

    #[test]
    fn missing_kind_and_message_default_to_first() {
        let mut retry = ErrorRetry::new();
        retry.add(Some("ProtocolError"), Some("worker terminated"));
        retry.add(None, None);
        assert_eq!(retry.attempts(), 2);

        let rendered = retry.message();
        assert!(rendered.starts_with("worker terminated\n    [ProtocolError] on retry at "));
        assert!(rendered.ends_with("ms: worker terminated"));
    }
}
