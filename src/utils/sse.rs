use bytes::{BufMut, Bytes, BytesMut};

const DONE_MARKER: &str = "[DONE]";
const BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

/// One server-sent event. Only the fields upstream providers actually send
/// are kept.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn done() -> Self {
        Self::data(DONE_MARKER)
    }

    pub fn is_done(&self) -> bool {
        self.data.trim() == DONE_MARKER
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(self.data.len() + 16);
        if let Some(event) = &self.event {
            buffer.put_slice(b"event: ");
            buffer.put_slice(event.as_bytes());
            buffer.put_u8(b'\n');
        }
        for line in self.data.split('\n') {
            buffer.put_slice(b"data: ");
            buffer.put_slice(line.as_bytes());
            buffer.put_u8(b'\n');
        }
        buffer.put_u8(b'\n');
        buffer.freeze()
    }
}

/// Incremental SSE decoder. Chunks may split lines, CRLF pairs or UTF-8
/// sequences anywhere.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    pending: SseEvent,
    started: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        if !self.started {
            if self.buffer.len() < BOM.len() && BOM.starts_with(&self.buffer) {
                return Vec::new();
            }
            if self.buffer.starts_with(&BOM) {
                self.buffer.drain(..BOM.len());
            }
            self.started = true;
        }

        let mut events = Vec::new();
        while let Some(line) = self.next_line() {
            if line.is_empty() {
                if self.pending != SseEvent::default() {
                    events.push(std::mem::take(&mut self.pending));
                }
            } else {
                self.apply(&line);
            }
        }
        events
    }

    /// Flushes a trailing event the upstream did not terminate with a blank
    /// line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
            if !line.is_empty() {
                self.apply(&line);
            }
        }
        if self.pending == SseEvent::default() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|b| *b == b'\n' || *b == b'\r')?;
        let skip = if self.buffer[pos] == b'\r' {
            match self.buffer.get(pos + 1) {
                Some(b'\n') => 2,
                Some(_) => 1,
                // a lone trailing CR may be the first half of CRLF
                None => return None,
            }
        } else {
            1
        };
        let line = String::from_utf8_lossy(&self.buffer[..pos]).into_owned();
        self.buffer.drain(..pos + skip);
        Some(line)
    }

    fn apply(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => self.pending.event = Some(value.to_string()),
            "data" => {
                if !self.pending.data.is_empty() {
                    self.pending.data.push('\n');
                }
                self.pending.data.push_str(value);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_chunks_split_anywhere() {
        let stream = "data: {\"id\":\"1\"}\n\ndata: {\"id\":\"2\"}\n\ndata: [DONE]\n\n";
        let mut parser = SseParser::new();
        let mut events = Vec::new();
        for piece in stream.as_bytes().chunks(7) {
            events.extend(parser.push(piece));
        }
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].data, "{\"id\":\"1\"}");
        assert_eq!(events[1].data, "{\"id\":\"2\"}");
        assert!(events[2].is_done());
    }

    #[test]
    fn anthropic_named_events() {
        let mut parser = SseParser::new();
        let events = parser.push(
            b"event: message_start\r\ndata: {\"type\":\"message_start\"}\r\n\r\n: ping\r\n\r\nevent: message_stop\ndata: {}\n\n",
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[1].event.as_deref(), Some("message_stop"));
    }

    #[test]
    fn crlf_split_between_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: a\r").is_empty());
        let events = parser.push(b"\n\r\n");
        assert_eq!(events, vec![SseEvent::data("a")]);
    }

    #[test]
    fn utf8_and_bom_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push(&[0xEF, 0xBB]).is_empty());
        assert!(parser.push(&[0xBF, b'd', b'a', b't', b'a', b':', b' ', 0xE4, 0xBD]).is_empty());
        let events = parser.push(&[0xA0, b'\n', b'\n']);
        assert_eq!(events[0].data, "\u{4F60}");
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: tail").is_empty());
        assert_eq!(parser.finish(), Some(SseEvent::data("tail")));
        assert_eq!(parser.finish(), None);
    }

    #[test]
    fn multiline_data_round_trips_through_bytes() {
        let event = SseEvent {
            event: Some("error".to_string()),
            data: "a\nb".to_string(),
        };
        assert_eq!(&event.to_bytes()[..], b"event: error\ndata: a\ndata: b\n\n");
        assert_eq!(&SseEvent::done().to_bytes()[..], b"data: [DONE]\n\n");
    }
}
