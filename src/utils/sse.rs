//! Incremental Server-Sent Events parser shared by the streaming LLM client
//! and the MCP SSE transport.

/// A parsed Server-Sent Event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field, `None` for the default `message` type.
    pub event_type: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    pub fn kind(&self) -> &str {
        self.event_type.as_deref().unwrap_or("message")
    }
}

#[derive(Debug, Default)]
struct PendingEvent {
    event_type: Option<String>,
    data_lines: Vec<String>,
    id: Option<String>,
}

impl PendingEvent {
    fn take(&mut self) -> Option<SseEvent> {
        if self.data_lines.is_empty() {
            self.event_type = None;
            return None;
        }
        let event = SseEvent {
            event_type: self.event_type.take(),
            data: self.data_lines.join("\n"),
            id: self.id.take(),
        };
        self.data_lines.clear();
        Some(event)
    }

    fn line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.take();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data_lines.push(value.to_string()),
            "event" => self.event_type = Some(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }
}

/// Feed raw byte chunks, collect complete events.
///
/// Bytes are buffered until a newline so multi-byte UTF-8 sequences split
/// across network chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseLineParser {
    buffer: Vec<u8>,
    pending: PendingEvent,
}

impl SseLineParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if let Some(event) = self.pending.line(line) {
                events.push(event);
            }
        }
        events
    }

    /// Emit whatever is buffered when the stream ends.
    pub fn flush(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            self.pending.line(line);
        }
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_split_across_chunks() {
        let mut parser = SseLineParser::new();
        assert!(parser.push(b"event: endpoint\nda").is_empty());
        let events = parser.push(b"ta: /messages?session_id=1\n\ndata: {\"a\":1}\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), "endpoint");
        assert_eq!(events[0].data, "/messages?session_id=1");
        assert_eq!(events[1].kind(), "message");
    }

    #[test]
    fn test_multibyte_split() {
        let mut parser = SseLineParser::new();
        let text = "data: 你好\n\n".as_bytes();
        let (a, b) = text.split_at(8);
        assert!(parser.push(a).is_empty());
        let events = parser.push(b);
        assert_eq!(events[0].data, "你好");
    }

    #[test]
    fn test_comments_crlf_and_done() {
        let mut parser = SseLineParser::new();
        let events = parser.push(b": keep-alive\r\ndata: line1\r\ndata: line2\r\n\r\ndata: [DONE]\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "line1\nline2");
        assert!(events[1].is_done());
    }

    #[test]
    fn test_flush_trailing_event() {
        let mut parser = SseLineParser::new();
        parser.push(b"id: 7\ndata: tail");
        let event = parser.flush().unwrap();
        assert_eq!(event.data, "tail");
        assert_eq!(event.id.as_deref(), Some("7"));
        assert!(parser.flush().is_none());
    }
}
