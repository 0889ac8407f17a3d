use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};

use crate::error::{CatalogError, SubscriptionError};
use crate::text::sanitize_message;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Identity of one tailable log source. Equal when identifiers are equal.
#[derive(Debug, Clone)]
pub struct LogSource {
    pub name: String,
    pub id: String,
    pub account_id: String,
    pub region: String,
    pub profile: String,
}

impl PartialEq for LogSource {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for LogSource {}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// An event as delivered by a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub timestamp_millis: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    timestamp: DateTime<FixedOffset>,
    message: String,
}

impl LogEvent {
    pub fn new(raw: &RawEvent, offset: FixedOffset) -> Self {
        let utc = DateTime::<Utc>::from_timestamp_millis(raw.timestamp_millis)
            .unwrap_or_default();
        Self {
            timestamp: utc.with_timezone(&offset),
            message: sanitize_message(&raw.message),
        }
    }

    pub fn formatted_timestamp(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn wrap(&self, width: usize) -> Vec<String> {
        wrap_text(&self.message, width)
    }
}

/// Breaks `text` into display lines at most `width` chars wide.
///
/// A newline directly after a width break is absorbed, and trailing blank
/// lines are dropped, so wrapping the newline-joined output again at the same
/// width yields the same lines.
pub fn wrap_text(text: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut lines = Vec::new();
    let mut line = String::new();
    let mut line_len = 0usize;
    let mut just_wrapped = false;

    for ch in text.chars() {
        if ch == '\n' {
            if !just_wrapped {
                lines.push(std::mem::take(&mut line));
                line_len = 0;
            }
            just_wrapped = false;
            continue;
        }
        if ch.is_control() {
            continue;
        }

        line.push(ch);
        line_len += 1;
        just_wrapped = false;
        if line_len >= width {
            lines.push(std::mem::take(&mut line));
            line_len = 0;
            just_wrapped = true;
        }
    }

    if !line.is_empty() {
        lines.push(line);
    }
    while lines.last().is_some_and(String::is_empty) {
        lines.pop();
    }

    lines
}

/// Lists the sources an operator can choose from.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Sorted by (account id, name), deduplicated by identifier.
    async fn list_sources(&self, excluded_profiles: &[String])
    -> Result<Vec<LogSource>, CatalogError>;
}

#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(&self, source: &LogSource)
    -> Result<Box<dyn Subscription>, SubscriptionError>;
}

/// A live-tail stream for one source.
#[async_trait]
pub trait Subscription: Send {
    /// Next batch of events, or `None` once the stream has closed.
    async fn receive(&mut self) -> Result<Option<Vec<RawEvent>>, SubscriptionError>;

    async fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use chrono::FixedOffset;

    use super::{LogEvent, LogSource, RawEvent, wrap_text};

    fn source(id: &str, name: &str) -> LogSource {
        LogSource {
            name: name.to_owned(),
            id: id.to_owned(),
            account_id: "acct".to_owned(),
            region: "local".to_owned(),
            profile: "default".to_owned(),
        }
    }

    #[test]
    fn sources_compare_by_identifier() {
        assert_eq!(source("a", "one"), source("a", "two"));
        assert_ne!(source("a", "one"), source("b", "one"));
    }

    #[test]
    fn event_normalizes_timestamp_and_message() {
        let raw = RawEvent {
            timestamp_millis: 0,
            message: "\tERROR\tboom\r\n".to_owned(),
        };
        let tokyo = FixedOffset::east_opt(9 * 3600).unwrap();
        let event = LogEvent::new(&raw, tokyo);

        assert_eq!(event.formatted_timestamp(), "1970-01-01 09:00:00");
        assert_eq!(event.message(), "ERROR boom");
    }

    #[test]
    fn wrap_breaks_at_width_and_newlines() {
        assert_eq!(wrap_text("abcdef", 4), vec!["abcd", "ef"]);
        assert_eq!(wrap_text("ab\ncd", 5), vec!["ab", "cd"]);
        assert_eq!(wrap_text("ab\n\ncd", 5), vec!["ab", "", "cd"]);
        assert_eq!(wrap_text("abcd\nef", 4), vec!["abcd", "ef"]);
        assert!(wrap_text("", 4).is_empty());
        assert_eq!(wrap_text("abc", 0), vec!["a", "b", "c"]);
    }

    #[test]
    fn wrap_is_idempotent_on_width() {
        let samples = [
            "a fairly long message that wraps over a few lines",
            "{\n  \"level\": \"INFO\",\n  \"msg\": \"hello world\"\n}",
            "\nleading\n\n\nblank lines\n\n",
            "abcdefgh\nijkl",
            "exactly8\n\nnext",
        ];

        for text in samples {
            for width in [1, 3, 4, 8, 13, 80] {
                let once = wrap_text(text, width);
                let twice = wrap_text(&once.join("\n"), width);
                assert_eq!(once, twice, "text {text:?} width {width}");
            }
        }
    }
}
