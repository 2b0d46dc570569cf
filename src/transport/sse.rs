//! Incremental decoding of streamed generation bodies.
//!
//! The generation endpoint answers either as Server-Sent Events (one JSON
//! chunk per `data:` field) or as newline-delimited JSON. Both are framed by
//! lines, so both decoders sit on [`LineBuffer`], which only splits on
//! complete lines and therefore never breaks a multi-byte character that
//! straddles two network reads.
//!
//! ```text
//! data: {"response":"Hi","done":false}
//!
//! data: {"response":"!","done":true}
//! ```

/// A parsed Server-Sent Event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field, if present.
    pub event_type: Option<String>,
    /// `data:` field(s) joined with `\n`.
    pub data: String,
}

impl SseEvent {
    /// Whether this event is the `[DONE]` sentinel.
    pub fn is_done_sentinel(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Accumulates raw bytes and yields complete lines without their terminator.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            lines.push(decode_line(&self.pending[start..end]));
            start = end + 1;
        }
        self.pending.drain(..start);
        lines
    }

    /// Return the unterminated tail, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let tail = std::mem::take(&mut self.pending);
        Some(decode_line(&tail))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Incrementally parse SSE bytes, yielding events as they become complete.
#[derive(Debug, Default)]
pub struct SseLineParser {
    lines: LineBuffer,
    event_type: Option<String>,
    data: Vec<String>,
}

impl SseLineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk of bytes; returns the events it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let lines = self.lines.push(chunk);
        lines
            .into_iter()
            .filter_map(|line| self.process_line(&line))
            .collect()
    }

    /// Emit the event still being built when the stream ends.
    pub fn flush(&mut self) -> Option<SseEvent> {
        if let Some(line) = self.lines.finish() {
            if let Some(event) = self.process_line(&line) {
                return Some(event);
            }
        }
        self.take_event()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.take_event();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_owned()),
            "event" => self.event_type = Some(value.to_owned()),
            _ => {}
        }
        None
    }

    fn take_event(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event_type = None;
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event_type: self.event_type.take(),
            data,
        })
    }
}

/// Line-delimited JSON: every non-blank line is one payload.
#[derive(Debug, Default)]
pub struct NdjsonParser {
    lines: LineBuffer,
}

impl NdjsonParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.lines
            .push(chunk)
            .into_iter()
            .filter(|l| !l.trim().is_empty())
            .collect()
    }

    pub fn flush(&mut self) -> Option<String> {
        self.lines.finish().filter(|l| !l.trim().is_empty())
    }
}

/// Framing chosen from the response content type.
#[derive(Debug)]
pub enum ChunkFraming {
    Sse(SseLineParser),
    Ndjson(NdjsonParser),
}

impl ChunkFraming {
    /// NDJSON for `application/x-ndjson` or `application/jsonl`, SSE otherwise.
    pub fn for_content_type(content_type: Option<&str>) -> Self {
        match content_type {
            Some(ct) if ct.contains("ndjson") || ct.contains("jsonl") => {
                Self::Ndjson(NdjsonParser::new())
            }
            _ => Self::Sse(SseLineParser::new()),
        }
    }

    /// Push bytes; returns complete JSON payloads (SSE sentinels removed).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        match self {
            Self::Sse(parser) => parser
                .push(chunk)
                .into_iter()
                .filter(|e| !e.is_done_sentinel())
                .map(|e| e.data)
                .collect(),
            Self::Ndjson(parser) => parser.push(chunk),
        }
    }

    pub fn flush(&mut self) -> Option<String> {
        match self {
            Self::Sse(parser) => parser
                .flush()
                .filter(|e| !e.is_done_sentinel())
                .map(|e| e.data),
            Self::Ndjson(parser) => parser.flush(),
        }
    }
}
