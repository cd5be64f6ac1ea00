//! Server-Sent Events support: incremental event parsing, endpoint URL
//! construction, and the reader task that feeds events to the bridge loop.

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::Result;
use crate::framing::LineBuffer;

/// One parsed event from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
}

impl SseEvent {
    /// Protocol traffic travels on unnamed events (or the explicit default
    /// name `message`). Anything else is ancillary.
    pub fn is_message(&self) -> bool {
        matches!(self.event_type.as_deref(), None | Some("message"))
    }
}

/// Incremental SSE field parser. Feed it one line at a time; an event is
/// emitted when the terminating blank line arrives.
#[derive(Debug, Default)]
pub struct SseParser {
    event_name: Option<String>,
    data: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed_line(&mut self, raw_line: &str) -> Option<SseEvent> {
        let line = raw_line.trim_end_matches(['\r', '\n']);

        if line.is_empty() {
            if self.event_name.is_none() && self.data.is_empty() {
                return None;
            }
            return Some(SseEvent {
                event_type: self.event_name.take(),
                data: std::mem::take(&mut self.data),
            });
        }

        // A leading colon marks a comment line.
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => {
                self.event_name = (!value.is_empty()).then(|| value.to_string());
            }
            "data" => {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(value);
            }
            // `id` and `retry` have no meaning here; last-event-id replay
            // and reconnection are not part of this transport.
            _ => {}
        }
        None
    }
}

/// Builds `{base}/{server}/{endpoint}`, tolerating a trailing slash on the
/// base and preserving any path the base already carries.
pub fn endpoint_url(base: &Url, server_identity: &str, endpoint: &str) -> Result<Url> {
    let base_str = base.as_str().trim_end_matches('/');
    Ok(Url::parse(&format!("{base_str}/{server_identity}/{endpoint}"))?)
}

/// Spawns the reader task for the persistent event stream and hands back
/// the receiving end of the channel it feeds. The connection attempt itself
/// happens inside the task: input handling must start immediately whether
/// or not the push channel ever comes up, since direct HTTP replies work
/// without it. A failed connect closes the channel and nothing more.
pub fn spawn_event_stream(client: reqwest::Client, sse_url: Url) -> mpsc::Receiver<SseEvent> {
    let (tx, rx) = mpsc::channel(100);
    tokio::spawn(async move {
        let request = client
            .get(sse_url.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream");
        let response = match request.send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(url = %sse_url, status = %response.status(), "event stream refused");
                return;
            }
            Err(error) => {
                warn!(url = %sse_url, %error, "event stream unavailable");
                return;
            }
        };
        info!(url = %sse_url, "event stream connected");

        let mut stream = response.bytes_stream();
        let mut lines = LineBuffer::new();
        let mut parser = SseParser::new();

        while let Some(item) = stream.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(error) => {
                    warn!(%error, "event stream read failed");
                    break;
                }
            };
            for line in lines.feed(&chunk) {
                if let Some(event) = parser.feed_line(&line)
                    && tx.send(event).await.is_err()
                {
                    // Receiver dropped: the bridge is shutting down.
                    return;
                }
            }
        }
        debug!(url = %sse_url, "event stream ended");
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_only_event() {
        let mut parser = SseParser::new();
        assert!(parser.feed_line("data: {\"jsonrpc\":\"2.0\"}").is_none());
        let event = parser.feed_line("").unwrap();
        assert!(event.event_type.is_none());
        assert_eq!(event.data, "{\"jsonrpc\":\"2.0\"}");
        assert!(event.is_message());
    }

    #[test]
    fn named_event_is_not_protocol_traffic() {
        let mut parser = SseParser::new();
        assert!(parser.feed_line("event: heartbeat").is_none());
        assert!(parser.feed_line("data: {}").is_none());
        let event = parser.feed_line("").unwrap();
        assert_eq!(event.event_type.as_deref(), Some("heartbeat"));
        assert!(!event.is_message());
    }

    #[test]
    fn explicit_message_name_is_protocol_traffic() {
        let mut parser = SseParser::new();
        assert!(parser.feed_line("event: message").is_none());
        assert!(parser.feed_line("data: {}").is_none());
        assert!(parser.feed_line("").unwrap().is_message());
    }

    #[test]
    fn comment_lines_are_ignored() {
        let mut parser = SseParser::new();
        assert!(parser.feed_line(": keepalive").is_none());
        assert!(parser.feed_line(":").is_none());
        // Nothing accumulated, so the blank line emits nothing either.
        assert!(parser.feed_line("").is_none());
    }

    #[test]
    fn multiline_data_joined_with_newlines() {
        let mut parser = SseParser::new();
        assert!(parser.feed_line("data: first").is_none());
        assert!(parser.feed_line("data: second").is_none());
        let event = parser.feed_line("").unwrap();
        assert_eq!(event.data, "first\nsecond");
    }

    #[test]
    fn crlf_terminators_are_stripped() {
        let mut parser = SseParser::new();
        assert!(parser.feed_line("data: x\r\n").is_none());
        let event = parser.feed_line("\r\n").unwrap();
        assert_eq!(event.data, "x");
    }

    #[test]
    fn only_one_space_after_colon_is_eaten() {
        let mut parser = SseParser::new();
        assert!(parser.feed_line("data:  two leading").is_none());
        let event = parser.feed_line("").unwrap();
        assert_eq!(event.data, " two leading");
    }

    #[test]
    fn field_without_colon_has_empty_value() {
        let mut parser = SseParser::new();
        assert!(parser.feed_line("data").is_none());
        let event = parser.feed_line("").unwrap();
        assert_eq!(event.data, "");
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let mut parser = SseParser::new();
        assert!(parser.feed_line("id: 7").is_none());
        assert!(parser.feed_line("retry: 3000").is_none());
        assert!(parser.feed_line("data: payload").is_none());
        let event = parser.feed_line("").unwrap();
        assert_eq!(event.data, "payload");
    }

    #[test]
    fn empty_event_name_resets_to_default() {
        let mut parser = SseParser::new();
        assert!(parser.feed_line("event:").is_none());
        assert!(parser.feed_line("data: x").is_none());
        let event = parser.feed_line("").unwrap();
        assert!(event.event_type.is_none());
    }

    #[test]
    fn parser_state_resets_between_events() {
        let mut parser = SseParser::new();
        parser.feed_line("event: a");
        parser.feed_line("data: 1");
        let first = parser.feed_line("").unwrap();
        assert_eq!(first.event_type.as_deref(), Some("a"));

        parser.feed_line("data: 2");
        let second = parser.feed_line("").unwrap();
        assert!(second.event_type.is_none());
        assert_eq!(second.data, "2");
    }

    #[test]
    fn consecutive_blank_lines_emit_once() {
        let mut parser = SseParser::new();
        parser.feed_line("data: x");
        assert!(parser.feed_line("").is_some());
        assert!(parser.feed_line("").is_none());
        assert!(parser.feed_line("").is_none());
    }

    #[test]
    fn endpoint_url_from_bare_origin() {
        let base = Url::parse("http://127.0.0.1:9090").unwrap();
        let url = endpoint_url(&base, "memory", "sse").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:9090/memory/sse");
    }

    #[test]
    fn endpoint_url_tolerates_trailing_slash() {
        let base = Url::parse("http://host:9090/").unwrap();
        let url = endpoint_url(&base, "memory", "message").unwrap();
        assert_eq!(url.as_str(), "http://host:9090/memory/message");
    }

    #[test]
    fn endpoint_url_keeps_base_path() {
        let base = Url::parse("https://gateway.example.com/mcp").unwrap();
        let url = endpoint_url(&base, "obsidian-tools", "sse").unwrap();
        assert_eq!(url.as_str(), "https://gateway.example.com/mcp/obsidian-tools/sse");
    }
}
