//! Line-buffered decoder for `data:`-framed completion streams.
//!
//! The transport hands over arbitrary byte chunks. Chunk boundaries carry no meaning:
//! a record can be split across chunks and one chunk can carry many records. The decoder
//! buffers bytes, cuts complete lines at `\n`, and only then decodes UTF-8, so multi-byte
//! characters split across chunks are reassembled before parsing.
//!
//! Output is incremental: each [`SseEvent::Delta`] carries only the newly produced text.
//! Accumulating deltas into the full message is the caller's job.

use serde::Deserialize;

pub const DATA_PREFIX: &str = "data:";
pub const DONE_SENTINEL: &str = "[DONE]";
/// Upper bound for a record that failed to parse and is waiting for continuation text.
pub const MAX_PENDING_BYTES: usize = 64 * 1024;
/// Upper bound for an unterminated line held in the byte buffer.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Newly produced content.
    Delta(String),
    /// The backend reported a failure inside the stream.
    Error(String),
    /// End-of-stream sentinel.
    Done,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    pending: Option<String>,
    /// Set while skipping the rest of an overlong line.
    discarding: bool,
    finished: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the sentinel was seen or [`SseDecoder::finish`] was called.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        self.buffer.extend_from_slice(chunk);
        while let Some(line_end) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let raw_line = self.buffer.drain(..=line_end).collect::<Vec<_>>();
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            let line = decode_line(&raw_line[..raw_line.len() - 1]);
            self.decode_line(&line, &mut events);

            if self.finished {
                self.buffer.clear();
                break;
            }
        }

        if self.buffer.len() > MAX_LINE_BYTES {
            tracing::warn!(
                discarded_bytes = self.buffer.len(),
                "stream line exceeded the buffer limit"
            );
            self.buffer.clear();
            self.discarding = true;
        }

        events
    }

    /// Flushes a trailing unterminated line once the body is exhausted.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.finished && !self.discarding && !self.buffer.is_empty() {
            let raw_line = std::mem::take(&mut self.buffer);
            let line = decode_line(&raw_line);
            self.decode_line(&line, &mut events);
        }

        if let Some(pending) = self.pending.take() {
            tracing::warn!(
                discarded_bytes = pending.len(),
                "stream ended with an unparseable record"
            );
        }

        self.finished = true;
        events
    }

    fn decode_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if let Some(pending) = self.pending.take() {
            if line.trim().is_empty() || line.starts_with(':') {
                self.pending = Some(pending);
                return;
            }

            let joined = format!("{pending}{line}");
            match parse_payload(&joined) {
                Ok(payload) => {
                    push_payload(payload, events);
                    return;
                }
                Err(_) if record_payload(line).is_some() => {
                    // A fresh record started, so the held text was never a split record.
                    tracing::warn!(
                        discarded_bytes = pending.len(),
                        "discarding unparseable stream record"
                    );
                }
                Err(_) => {
                    self.hold(joined);
                    return;
                }
            }
        }

        let Some(payload) = record_payload(line) else {
            return;
        };

        if payload.trim() == DONE_SENTINEL {
            events.push(SseEvent::Done);
            self.finished = true;
            return;
        }

        match parse_payload(payload) {
            Ok(payload) => push_payload(payload, events),
            Err(error) => {
                tracing::debug!(
                    error = %error,
                    payload_bytes = payload.len(),
                    "stream record did not parse; waiting for more data"
                );
                self.hold(payload.to_string());
            }
        }
    }

    fn hold(&mut self, text: String) {
        if text.len() > MAX_PENDING_BYTES {
            tracing::warn!(
                discarded_bytes = text.len(),
                "unparseable stream record exceeded the pending limit"
            );
            return;
        }
        self.pending = Some(text);
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

fn record_payload(line: &str) -> Option<&str> {
    let rest = line.strip_prefix(DATA_PREFIX)?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

fn parse_payload(payload: &str) -> Result<StreamPayload, serde_json::Error> {
    serde_json::from_str(payload.trim())
}

fn push_payload(payload: StreamPayload, events: &mut Vec<SseEvent>) {
    if let Some(error) = payload.error {
        events.push(SseEvent::Error(error.into_message()));
        return;
    }

    let content = payload
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta)
        .and_then(|delta| delta.content);

    if let Some(content) = content
        && !content.is_empty()
    {
        events.push(SseEvent::Delta(content));
    }
}

#[derive(Debug, Deserialize)]
struct StreamPayload {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<PayloadError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PayloadError {
    Detailed { message: String },
    Text(String),
}

impl PayloadError {
    fn into_message(self) -> String {
        match self {
            Self::Detailed { message } | Self::Text(message) => message,
        }
    }
}
